//! Per-channel reply collectors.
//!
//! A collector waits for the next message in a channel that passes its
//! filter. It ends exactly once: matched by [`ReplyWaiter::deliver`],
//! cancelled, or expired by its deadline timer. Delivery and the timer race
//! to write a single completion slot; the loser's write is dropped.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    neuron_common::InboundMessage,
    thiserror::Error,
    tokio::{sync::oneshot, task::AbortHandle},
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use neuron_metrics::{conversation as conv_metrics, counter, gauge};

/// Predicate a reply must satisfy. Must not call back into the waiter.
pub type ReplyFilter = Arc<dyn Fn(&InboundMessage) -> bool + Send + Sync>;

/// Why a wait ended without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("wait was cancelled")]
    Cancelled,
}

type Completion = Result<InboundMessage, WaitError>;

/// Identifies a collector within its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectorId(u64);

/// Single-use completion sink guarded by an exactly-once latch.
struct CompletionSlot {
    resolved: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<Completion>>>,
}

impl CompletionSlot {
    fn new(sender: oneshot::Sender<Completion>) -> Self {
        Self {
            resolved: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Returns false if the slot was already completed.
    fn complete(&self, value: Completion) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(sender) = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take() {
            // A dropped receiver means nobody is waiting any more.
            let _ = sender.send(value);
        }
        true
    }
}

struct Collector {
    id: CollectorId,
    filter: Option<ReplyFilter>,
    slot: Arc<CompletionSlot>,
    timer: Option<AbortHandle>,
}

impl Collector {
    /// Retire the collector: stop its timer and write `value` if nobody
    /// else has.
    fn finish(self, value: Completion) -> bool {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        self.slot.complete(value)
    }
}

struct Inner {
    collectors: Mutex<HashMap<String, Vec<Collector>>>,
    next_id: AtomicU64,
    default_timeout: Duration,
}

/// Registry of pending reply waits, keyed by channel.
///
/// Cloning shares the registry. Registering a wait spawns its deadline
/// timer, so it must happen inside a tokio runtime.
#[derive(Clone)]
pub struct ReplyWaiter {
    inner: Arc<Inner>,
}

impl ReplyWaiter {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                collectors: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                default_timeout,
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Register a collector for `channel_id` and start its deadline.
    ///
    /// `None` for `timeout` uses the waiter's default.
    pub fn register(
        &self,
        channel_id: &str,
        filter: Option<ReplyFilter>,
        timeout: impl Into<Option<Duration>>,
    ) -> PendingReply {
        let timeout = timeout.into().unwrap_or(self.inner.default_timeout);
        let id = CollectorId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(CompletionSlot::new(tx));

        // The collector must be visible before its timer can fire.
        self.with_collectors(|map| {
            map.entry(channel_id.to_string()).or_default().push(Collector {
                id,
                filter,
                slot,
                timer: None,
            });
        });
        #[cfg(feature = "metrics")]
        gauge!(conv_metrics::COLLECTORS_PENDING).increment(1.0);

        let timer = tokio::spawn({
            let waiter = self.clone();
            let channel_id = channel_id.to_string();
            async move {
                tokio::time::sleep(timeout).await;
                waiter.expire(&channel_id, id);
            }
        });
        self.with_collectors(|map| {
            if let Some(collector) = map
                .get_mut(channel_id)
                .and_then(|list| list.iter_mut().find(|c| c.id == id))
            {
                collector.timer = Some(timer.abort_handle());
            }
        });

        debug!(channel_id, ?timeout, "waiting for reply");
        PendingReply {
            waiter: self.clone(),
            channel_id: channel_id.to_string(),
            id,
            rx,
        }
    }

    /// Wait for the next message in `channel_id` accepted by `filter`.
    pub async fn wait_for_reply(
        &self,
        channel_id: &str,
        filter: Option<ReplyFilter>,
        timeout: impl Into<Option<Duration>>,
    ) -> Result<InboundMessage, WaitError> {
        self.register(channel_id, filter, timeout).wait().await
    }

    /// Offer an inbound message to the collectors of its channel.
    ///
    /// Collectors are tried in registration order; the first whose filter
    /// accepts the message receives it. Returns whether the message was
    /// consumed. A filter that panics counts as a non-match.
    pub fn deliver(&self, message: &InboundMessage) -> bool {
        let candidates: Vec<(CollectorId, Option<ReplyFilter>)> = self.with_collectors(|map| {
            map.get(&message.channel_id)
                .map(|list| list.iter().map(|c| (c.id, c.filter.clone())).collect())
                .unwrap_or_default()
        });

        for (id, filter) in candidates {
            if !filter_accepts(filter.as_ref(), message) {
                continue;
            }
            // Removal under the lock decides ownership; a timer or cancel
            // that got here first leaves nothing to take.
            let Some(collector) = self.take(&message.channel_id, id) else {
                continue;
            };
            if collector.finish(Ok(message.clone())) {
                #[cfg(feature = "metrics")]
                counter!(conv_metrics::REPLIES_DELIVERED_TOTAL).increment(1);
                debug!(channel_id = %message.channel_id, "reply delivered");
                return true;
            }
        }
        false
    }

    /// Cancel one collector. Returns false if it already finished.
    pub fn cancel(&self, channel_id: &str, id: CollectorId) -> bool {
        let Some(collector) = self.take(channel_id, id) else {
            return false;
        };
        let cancelled = collector.finish(Err(WaitError::Cancelled));
        #[cfg(feature = "metrics")]
        if cancelled {
            counter!(conv_metrics::CANCELLATIONS_TOTAL).increment(1);
        }
        cancelled
    }

    /// Cancel every collector in `channel_id`; returns how many were live.
    pub fn cancel_channel(&self, channel_id: &str) -> usize {
        let drained = self.with_collectors(|map| map.remove(channel_id).unwrap_or_default());
        #[cfg(feature = "metrics")]
        gauge!(conv_metrics::COLLECTORS_PENDING).decrement(drained.len() as f64);

        let cancelled = drained
            .into_iter()
            .map(|collector| collector.finish(Err(WaitError::Cancelled)))
            .filter(|done| *done)
            .count();
        #[cfg(feature = "metrics")]
        counter!(conv_metrics::CANCELLATIONS_TOTAL).increment(cancelled as u64);
        cancelled
    }

    pub fn has_pending(&self, channel_id: &str) -> bool {
        self.with_collectors(|map| map.get(channel_id).is_some_and(|list| !list.is_empty()))
    }

    /// Live collectors across all channels.
    pub fn pending_count(&self) -> usize {
        self.with_collectors(|map| map.values().map(Vec::len).sum())
    }

    fn expire(&self, channel_id: &str, id: CollectorId) {
        let Some(collector) = self.take(channel_id, id) else {
            return;
        };
        // The timer is the task running this; there is nothing to abort.
        if collector.slot.complete(Err(WaitError::Timeout)) {
            #[cfg(feature = "metrics")]
            counter!(conv_metrics::TIMEOUTS_TOTAL).increment(1);
            debug!(channel_id, "reply wait timed out");
        }
    }

    /// Remove a collector, dropping the channel entry once it is empty.
    fn take(&self, channel_id: &str, id: CollectorId) -> Option<Collector> {
        let taken = self.with_collectors(|map| {
            let list = map.get_mut(channel_id)?;
            let index = list.iter().position(|c| c.id == id)?;
            let collector = list.remove(index);
            if list.is_empty() {
                map.remove(channel_id);
            }
            Some(collector)
        });
        #[cfg(feature = "metrics")]
        if taken.is_some() {
            gauge!(conv_metrics::COLLECTORS_PENDING).decrement(1.0);
        }
        taken
    }

    fn with_collectors<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<Collector>>) -> T) -> T {
        let mut map = self
            .inner
            .collectors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut map)
    }
}

fn filter_accepts(filter: Option<&ReplyFilter>, message: &InboundMessage) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    catch_unwind(AssertUnwindSafe(|| filter(message))).unwrap_or_else(|_| {
        warn!(channel_id = %message.channel_id, "reply filter panicked; treating as no match");
        false
    })
}

/// A registered wait. Dropping it withdraws the collector.
pub struct PendingReply {
    waiter: ReplyWaiter,
    channel_id: String,
    id: CollectorId,
    rx: oneshot::Receiver<Completion>,
}

impl PendingReply {
    pub fn id(&self) -> CollectorId {
        self.id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub async fn wait(mut self) -> Result<InboundMessage, WaitError> {
        (&mut self.rx).await.unwrap_or(Err(WaitError::Cancelled))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(collector) = self.waiter.take(&self.channel_id, self.id) {
            collector.finish(Err(WaitError::Cancelled));
        }
    }
}
