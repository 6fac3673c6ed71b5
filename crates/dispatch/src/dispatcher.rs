use std::sync::Arc;

#[cfg(feature = "metrics")]
use std::time::Instant;

use {
    neuron_channels::{
        CapabilitySource, ChannelOutbound, MessageCapabilities, RequestContext, send_or_warn,
    },
    neuron_commands::{Command, CommandId, CommandRegistry, Invocation, Route},
    neuron_common::{
        InboundMessage,
        events::{DispatchEvent, EventBus},
    },
    neuron_config::{NeuronConfig, StorageConfig, StorageKind},
    neuron_conversation::{
        DialogEngine, DialogSettings, DialogStore, FileDialogStore, InMemoryDialogStore,
        ReplyWaiter,
    },
    neuron_middleware::{Middleware, MiddlewarePipeline, PipelineOutcome},
    neuron_ratelimit::{RateLimitConfig, RateLimiter},
    tokio::{sync::mpsc, task::JoinSet},
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use neuron_metrics::{counter, dispatch as dispatch_metrics, gauge, histogram, labels};

use crate::outcome::{DispatchOutcome, DispatchStats};

/// Open the dialog store `config` describes.
///
/// File stores opened on the same path share one lock, so several engines
/// may each open their own.
pub fn open_dialog_store(config: &StorageConfig) -> Arc<dyn DialogStore> {
    match config.kind {
        StorageKind::Memory => Arc::new(InMemoryDialogStore::new()),
        StorageKind::File => Arc::new(FileDialogStore::new(config.path.clone())),
    }
}

/// Assembles a [`Dispatcher`].
///
/// The reply waiter and event bus exist from the start so command handlers
/// can capture a [`DialogEngine`] before they are registered.
pub struct DispatcherBuilder {
    config: NeuronConfig,
    outbound: Arc<dyn ChannelOutbound>,
    events: Arc<EventBus>,
    waiter: ReplyWaiter,
    commands: CommandRegistry,
    middleware: MiddlewarePipeline,
    capabilities: Arc<dyn CapabilitySource>,
}

impl DispatcherBuilder {
    pub fn new(config: NeuronConfig, outbound: Arc<dyn ChannelOutbound>) -> Self {
        Self::with_events(config, outbound, EventBus::new())
    }

    /// Like [`DispatcherBuilder::new`] with listeners already registered.
    pub fn with_events(
        config: NeuronConfig,
        outbound: Arc<dyn ChannelOutbound>,
        events: EventBus,
    ) -> Self {
        let waiter = ReplyWaiter::new(config.conversation.reply_timeout());
        let commands = CommandRegistry::new(config.commands.prefix.clone());
        Self {
            config,
            outbound,
            events: Arc::new(events),
            waiter,
            commands,
            middleware: MiddlewarePipeline::new(),
            capabilities: Arc::new(MessageCapabilities),
        }
    }

    pub fn config(&self) -> &NeuronConfig {
        &self.config
    }

    pub fn waiter(&self) -> &ReplyWaiter {
        &self.waiter
    }

    pub fn outbound(&self) -> &Arc<dyn ChannelOutbound> {
        &self.outbound
    }

    /// A dialog engine sharing this dispatcher's waiter, outbound, and
    /// events, with notices and timeouts from the config.
    pub fn dialog_engine(&self, store: Arc<dyn DialogStore>) -> DialogEngine {
        let settings = DialogSettings {
            step_timeout: self.config.dialog.step_timeout(),
            retry_message: self.config.dialog.retry_message.clone(),
            timeout_message: self.config.dialog.timeout_message.clone(),
        };
        DialogEngine::new(
            self.waiter.clone(),
            store,
            Arc::clone(&self.outbound),
            settings,
        )
        .with_events(Arc::clone(&self.events))
    }

    pub fn register(&mut self, command: Command) -> neuron_commands::Result<CommandId> {
        self.commands.register(command)
    }

    pub fn middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    pub fn capabilities(&mut self, source: Arc<dyn CapabilitySource>) -> &mut Self {
        self.capabilities = source;
        self
    }

    pub fn build(self) -> Dispatcher {
        let limits = RateLimitConfig {
            capacity: self.config.rate_limit.capacity,
            refill_per_sec: self.config.rate_limit.refill_per_sec,
        };
        info!(
            prefix = self.commands.prefix(),
            commands = self.commands.commands().count(),
            middleware = self.middleware.len(),
            "dispatcher ready"
        );
        Dispatcher {
            rate_limiter: RateLimiter::new(limits),
            middleware: self.middleware,
            commands: self.commands,
            capabilities: self.capabilities,
            waiter: self.waiter,
            outbound: self.outbound,
            events: self.events,
            denied_message: self.config.commands.denied_message,
            stats: Arc::new(DispatchStats::default()),
        }
    }
}

/// Result of the ordered routing stage.
pub enum Routed {
    Done(DispatchOutcome),
    /// A command is ready to run. Running it may wait on later messages, so
    /// the serve loop spawns it instead of awaiting it inline.
    Execute(PendingExecution),
}

/// An authorized command waiting to run.
pub struct PendingExecution {
    invocation: Invocation,
    channel_id: String,
    author_id: String,
    events: Arc<EventBus>,
    stats: Arc<DispatchStats>,
}

impl PendingExecution {
    pub fn command(&self) -> &str {
        self.invocation.command()
    }

    pub async fn run(self) -> DispatchOutcome {
        let Self {
            invocation,
            channel_id,
            author_id,
            events,
            stats,
        } = self;
        let command = invocation.command().to_string();

        #[cfg(feature = "metrics")]
        gauge!(dispatch_metrics::HANDLERS_IN_FLIGHT).increment(1.0);
        let result = invocation.execute().await;
        #[cfg(feature = "metrics")]
        gauge!(dispatch_metrics::HANDLERS_IN_FLIGHT).decrement(1.0);

        let outcome = match result {
            Ok(()) => {
                events
                    .emit(&DispatchEvent::CommandExecuted {
                        command,
                        channel_id,
                        author_id,
                    })
                    .await;
                DispatchOutcome::Handled
            },
            Err(e) => {
                warn!(%command, %channel_id, %author_id, error = %e, "command failed");
                events
                    .emit(&DispatchEvent::CommandFailed {
                        command,
                        channel_id,
                        author_id,
                        error: e.to_string(),
                    })
                    .await;
                DispatchOutcome::Failed
            },
        };
        record(&stats, outcome);
        outcome
    }
}

fn record(stats: &DispatchStats, outcome: DispatchOutcome) {
    stats.record(outcome);
    #[cfg(feature = "metrics")]
    counter!(dispatch_metrics::MESSAGES_TOTAL, labels::OUTCOME => outcome.as_str()).increment(1);
}

/// Per-message orchestration: bot filter, rate limit, middleware, pending
/// replies, then command resolution and execution.
pub struct Dispatcher {
    rate_limiter: RateLimiter,
    middleware: MiddlewarePipeline,
    commands: CommandRegistry,
    capabilities: Arc<dyn CapabilitySource>,
    waiter: ReplyWaiter,
    outbound: Arc<dyn ChannelOutbound>,
    events: Arc<EventBus>,
    denied_message: String,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn builder(config: NeuronConfig, outbound: Arc<dyn ChannelOutbound>) -> DispatcherBuilder {
        DispatcherBuilder::new(config, outbound)
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn waiter(&self) -> &ReplyWaiter {
        &self.waiter
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Outcome counters plus current gauge values as `(name, value)` pairs.
    pub fn stats_snapshot(&self) -> Vec<(String, u64)> {
        let mut snapshot = self.stats.snapshot();
        snapshot.push(("collectors.pending".into(), self.waiter.pending_count() as u64));
        snapshot.push(("rate_limit.buckets".into(), self.rate_limiter.len() as u64));
        snapshot
    }

    /// Run the ordered routing stage for one message.
    ///
    /// Everything up to and including capability checks happens here, in
    /// arrival order. A resolved command comes back as
    /// [`Routed::Execute`] for the caller to run.
    pub async fn route(&self, message: InboundMessage) -> Routed {
        #[cfg(feature = "metrics")]
        let started = Instant::now();
        let routed = self.route_inner(message).await;
        #[cfg(feature = "metrics")]
        histogram!(dispatch_metrics::ROUTING_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        if let Routed::Done(outcome) = &routed {
            record(&self.stats, *outcome);
        }
        routed
    }

    async fn route_inner(&self, message: InboundMessage) -> Routed {
        if message.author_is_bot {
            return Routed::Done(DispatchOutcome::Ignored);
        }

        if !self.rate_limiter.try_consume(&message.author_id, 1.0) {
            debug!(author_id = %message.author_id, "message dropped by rate limit");
            self.events
                .emit(&DispatchEvent::MessageRateLimited {
                    channel_id: message.channel_id.clone(),
                    author_id: message.author_id.clone(),
                })
                .await;
            return Routed::Done(DispatchOutcome::RateLimited);
        }

        let channel_id = message.channel_id.clone();
        let author_id = message.author_id.clone();
        let mut ctx = RequestContext::new(message, Arc::clone(&self.outbound));

        match self.middleware.run(&mut ctx).await {
            Ok(PipelineOutcome::Completed) => {},
            Ok(PipelineOutcome::Halted) => return Routed::Done(DispatchOutcome::Blocked),
            Err(e) => {
                warn!(%channel_id, middleware = %e.middleware, error = %e.source, "middleware failed");
                self.events
                    .emit(&DispatchEvent::MiddlewareFailed {
                        middleware: e.middleware,
                        channel_id,
                        error: e.source.to_string(),
                    })
                    .await;
                return Routed::Done(DispatchOutcome::MiddlewareFailed);
            },
        }

        if self.waiter.has_pending(&channel_id) && self.waiter.deliver(&ctx.message) {
            return Routed::Done(DispatchOutcome::ReplyDelivered);
        }

        match self.commands.route(ctx, self.capabilities.as_ref()) {
            Route::NotACommand => Routed::Done(DispatchOutcome::Unhandled),
            Route::Denied(denial) => {
                self.events
                    .emit(&DispatchEvent::CommandDenied {
                        command: denial.command,
                        channel_id: channel_id.clone(),
                        author_id,
                        missing: denial.missing,
                    })
                    .await;
                send_or_warn(self.outbound.as_ref(), &channel_id, &self.denied_message).await;
                Routed::Done(DispatchOutcome::Denied)
            },
            Route::Ready(invocation) => Routed::Execute(PendingExecution {
                invocation,
                channel_id,
                author_id,
                events: Arc::clone(&self.events),
                stats: Arc::clone(&self.stats),
            }),
        }
    }

    /// Route one message and, if it resolves to a command, run it to
    /// completion before returning.
    ///
    /// A handler that waits for a later message will not see it until this
    /// returns; use [`Dispatcher::serve`] for live traffic.
    pub async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        match self.route(message).await {
            Routed::Done(outcome) => outcome,
            Routed::Execute(pending) => pending.run().await,
        }
    }

    /// Process messages from `inbound` until the sender side closes.
    ///
    /// Routing is sequential; command handlers run as spawned tasks so
    /// dialogs can receive the messages that follow. Handlers still running
    /// at shutdown are aborted.
    pub async fn serve(&self, mut inbound: mpsc::Receiver<InboundMessage>) {
        let mut handlers = JoinSet::new();
        info!("dispatcher serving");

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if let Routed::Execute(pending) = self.route(message).await {
                        debug!(command = pending.command(), "spawning command handler");
                        handlers.spawn(pending.run());
                    }
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "command task ended abnormally");
                    }
                },
            }
        }

        let cancelled = self.waiter.pending_count();
        handlers.shutdown().await;
        info!(aborted_waits = cancelled, "dispatcher stopped");
    }
}
