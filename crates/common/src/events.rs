//! Dispatch lifecycle events and the bus that fans them out to listeners.
//!
//! Listeners are observers: whatever they return, the dispatch path carries
//! on. A failing or panicking listener is logged and counted, never
//! propagated.

use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    futures::FutureExt,
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

// ── EventKind ───────────────────────────────────────────────────────────────

/// Kinds of events a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    MessageRateLimited,
    CommandExecuted,
    CommandDenied,
    CommandFailed,
    MiddlewareFailed,
    DialogCompleted,
    DialogCancelled,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ── DispatchEvent ───────────────────────────────────────────────────────────

/// Typed payload carried with each event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    MessageRateLimited {
        channel_id: String,
        author_id: String,
    },
    CommandExecuted {
        command: String,
        channel_id: String,
        author_id: String,
    },
    CommandDenied {
        command: String,
        channel_id: String,
        author_id: String,
        missing: Vec<String>,
    },
    CommandFailed {
        command: String,
        channel_id: String,
        author_id: String,
        error: String,
    },
    MiddlewareFailed {
        middleware: String,
        channel_id: String,
        error: String,
    },
    DialogCompleted {
        flow: String,
        channel_id: String,
        author_id: String,
    },
    DialogCancelled {
        flow: String,
        channel_id: String,
        author_id: String,
        reason: String,
    },
}

impl DispatchEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageRateLimited { .. } => EventKind::MessageRateLimited,
            Self::CommandExecuted { .. } => EventKind::CommandExecuted,
            Self::CommandDenied { .. } => EventKind::CommandDenied,
            Self::CommandFailed { .. } => EventKind::CommandFailed,
            Self::MiddlewareFailed { .. } => EventKind::MiddlewareFailed,
            Self::DialogCompleted { .. } => EventKind::DialogCompleted,
            Self::DialogCancelled { .. } => EventKind::DialogCancelled,
        }
    }
}

// ── EventHandler ────────────────────────────────────────────────────────────

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Which events this listener subscribes to.
    fn events(&self) -> &[EventKind];

    /// Higher values run first. Default is 0.
    fn priority(&self) -> i32 {
        0
    }

    async fn handle(&self, event: &DispatchEvent) -> Result<()>;
}

// ── ListenerStats ───────────────────────────────────────────────────────────

/// Per-listener call accounting.
#[derive(Default)]
pub struct ListenerStats {
    pub call_count: AtomicU64,
    pub failure_count: AtomicU64,
    pub total_latency_us: AtomicU64,
}

impl ListenerStats {
    fn record(&self, latency: Duration, ok: bool) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn avg_latency(&self) -> Duration {
        let calls = self.call_count.load(Ordering::Relaxed);
        if calls == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_us.load(Ordering::Relaxed) / calls)
    }
}

struct ListenerEntry {
    handler: Arc<dyn EventHandler>,
    stats: Arc<ListenerStats>,
}

// ── EventBus ────────────────────────────────────────────────────────────────

/// Registry of listeners, keyed by event kind and ordered by priority.
#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<EventKind, Vec<ListenerEntry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a listener to every event kind it declares.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        let stats = Arc::new(ListenerStats::default());
        for &kind in handler.events() {
            let entries = self.listeners.entry(kind).or_default();
            entries.push(ListenerEntry {
                handler: Arc::clone(&handler),
                stats: Arc::clone(&stats),
            });
            entries.sort_by_key(|e| std::cmp::Reverse(e.handler.priority()));
        }
        info!(listener = handler.name(), "event listener registered");
    }

    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.listeners.get(&kind).is_some_and(|v| !v.is_empty())
    }

    pub fn listener_stats(&self, name: &str) -> Option<Arc<ListenerStats>> {
        self.listeners
            .values()
            .flatten()
            .find(|e| e.handler.name() == name)
            .map(|e| Arc::clone(&e.stats))
    }

    /// Deliver an event to its listeners, one after another.
    pub async fn emit(&self, event: &DispatchEvent) {
        let kind = event.kind();
        let Some(entries) = self.listeners.get(&kind) else {
            return;
        };
        debug!(event = %kind, count = entries.len(), "emitting dispatch event");

        for entry in entries {
            let start = Instant::now();
            let result = match AssertUnwindSafe(entry.handler.handle(event))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("listener panicked")),
            };
            entry.stats.record(start.elapsed(), result.is_ok());
            if let Err(e) = result {
                warn!(listener = entry.handler.name(), event = %kind, error = %e, "event listener failed");
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::sync::Mutex};

    struct Recorder {
        name: String,
        priority: i32,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn events(&self) -> &[EventKind] {
            &[EventKind::CommandDenied]
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn handle(&self, _event: &DispatchEvent) -> Result<()> {
            self.seen.lock().unwrap().push(self.name.clone());
            if self.fail {
                anyhow::bail!("listener exploded");
            }
            Ok(())
        }
    }

    fn denied() -> DispatchEvent {
        DispatchEvent::CommandDenied {
            command: "kick".into(),
            channel_id: "c1".into(),
            author_id: "u1".into(),
            missing: vec!["MODERATE".into()],
        }
    }

    #[tokio::test]
    async fn listeners_run_by_priority_and_failures_are_contained() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        for (name, priority, fail) in [("low", -1, false), ("high", 5, true), ("mid", 0, false)] {
            bus.register(Arc::new(Recorder {
                name: name.into(),
                priority,
                seen: Arc::clone(&seen),
                fail,
            }));
        }

        bus.emit(&denied()).await;

        assert_eq!(*seen.lock().unwrap(), vec!["high", "mid", "low"]);
        let stats = bus.listener_stats("high").unwrap();
        assert_eq!(stats.failure_count.load(Ordering::Relaxed), 1);
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn events(&self) -> &[EventKind] {
            &[EventKind::CommandDenied]
        }

        fn priority(&self) -> i32 {
            10
        }

        async fn handle(&self, _event: &DispatchEvent) -> Result<()> {
            if true {
                panic!("listener bug");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn panicking_listener_is_contained() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.register(Arc::new(Panicking));
        bus.register(Arc::new(Recorder {
            name: "after".into(),
            priority: 0,
            seen: Arc::clone(&seen),
            fail: false,
        }));

        bus.emit(&denied()).await;
        bus.emit(&denied()).await;

        assert_eq!(*seen.lock().unwrap(), vec!["after", "after"]);
        let stats = bus.listener_stats("panicking").unwrap();
        assert_eq!(stats.call_count.load(Ordering::Relaxed), 2);
        assert_eq!(stats.failure_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn unsubscribed_kinds_are_skipped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.register(Arc::new(Recorder {
            name: "only-denied".into(),
            priority: 0,
            seen: Arc::clone(&seen),
            fail: false,
        }));

        bus.emit(&DispatchEvent::CommandExecuted {
            command: "ping".into(),
            channel_id: "c1".into(),
            author_id: "u1".into(),
        })
        .await;

        assert!(seen.lock().unwrap().is_empty());
        assert!(!bus.has_listeners(EventKind::CommandExecuted));
    }

    #[test]
    fn event_serializes_with_tag() {
        let json = serde_json::to_value(denied()).unwrap();
        assert_eq!(json["event"], "command_denied");
        assert_eq!(denied().kind(), EventKind::CommandDenied);
    }
}
