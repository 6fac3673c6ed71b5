//! Multi-step dialogs with a checkpoint after every step.
//!
//! A [`DialogFlow`] is an ordered list of [`DialogStep`]s. The
//! [`DialogEngine`] runs one flow for one user in one channel: it sends each
//! prompt, waits for that user's reply, validates and transforms it, and
//! persists `{step, data}` before moving on. The stored record is the
//! authority on progress, so a flow can be resumed from it.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use {
    neuron_channels::{ChannelOutbound, send_or_warn},
    neuron_common::{
        InboundMessage,
        events::{DispatchEvent, EventBus},
    },
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    thiserror::Error,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use neuron_metrics::{counter, dialog as dialog_metrics, gauge, labels};

use crate::{
    store::DialogStore,
    waiter::{ReplyFilter, ReplyWaiter, WaitError},
};

pub const DEFAULT_RETRY_MESSAGE: &str = "Invalid response, please try again.";
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "Timed out waiting for reply.";

/// Checkpoint of a running flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogState {
    /// Index of the next step to run.
    pub step: usize,
    /// Accepted values keyed by step id.
    pub data: Map<String, Value>,
}

/// Why a step refused a reply.
#[derive(Debug, Error)]
pub enum StepError {
    /// Ask again with the flow's retry notice.
    #[error("reply rejected")]
    Rejected,
    /// Ask again, telling the user this instead of the retry notice.
    #[error("reply rejected: {0}")]
    RejectedWith(String),
    /// Something broke; the dialog is cancelled.
    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

pub type Validator = Arc<dyn Fn(&InboundMessage) -> Result<(), StepError> + Send + Sync>;
pub type Transform = Arc<dyn Fn(&InboundMessage) -> Result<Value, StepError> + Send + Sync>;

/// One question in a flow.
#[derive(Clone)]
pub struct DialogStep {
    pub id: String,
    pub prompt: String,
    validator: Option<Validator>,
    transform: Option<Transform>,
}

impl DialogStep {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            validator: None,
            transform: None,
        }
    }

    #[must_use]
    pub fn validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&InboundMessage) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&InboundMessage) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    /// Validate, then transform. Without a transform the value is the
    /// message content.
    fn accept(&self, reply: &InboundMessage) -> Result<Value, StepError> {
        if let Some(validator) = &self.validator {
            validator(reply)?;
        }
        match &self.transform {
            Some(transform) => transform(reply),
            None => Ok(Value::String(reply.content.clone())),
        }
    }
}

impl fmt::Debug for DialogStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogStep")
            .field("id", &self.id)
            .field("prompt", &self.prompt)
            .field("validator", &self.validator.is_some())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// A named, ordered script of steps.
#[derive(Debug, Clone)]
pub struct DialogFlow {
    id: String,
    steps: Vec<DialogStep>,
    step_timeout: Option<Duration>,
}

impl DialogFlow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            step_timeout: None,
        }
    }

    #[must_use]
    pub fn step(mut self, step: DialogStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Override the engine's per-step timeout for this flow.
    #[must_use]
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn steps(&self) -> &[DialogStep] {
        &self.steps
    }

    /// Storage key of this flow's checkpoint for `user_id`.
    pub fn storage_key(&self, user_id: &str) -> String {
        format!("dialog:{}:{user_id}", self.id)
    }
}

/// How a flow ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogOutcome {
    Completed(Map<String, Value>),
    Cancelled,
}

impl DialogOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum DialogError {
    #[error("no dialog state stored under '{key}'")]
    StateMissing { key: String },

    #[error("dialog store failed: {0}")]
    Store(#[from] neuron_common::Error),

    #[error("dialog step '{step}' failed: {source}")]
    StepFault {
        step: String,
        #[source]
        source: anyhow::Error,
    },
}

/// User-facing notices and the default step timeout.
#[derive(Debug, Clone)]
pub struct DialogSettings {
    pub step_timeout: Duration,
    pub retry_message: String,
    pub timeout_message: String,
}

impl Default for DialogSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
            retry_message: DEFAULT_RETRY_MESSAGE.to_string(),
            timeout_message: DEFAULT_TIMEOUT_MESSAGE.to_string(),
        }
    }
}

/// Runs dialog flows on top of a [`ReplyWaiter`] and a [`DialogStore`].
///
/// Cheap to clone; handlers usually capture one.
#[derive(Clone)]
pub struct DialogEngine {
    waiter: ReplyWaiter,
    store: Arc<dyn DialogStore>,
    outbound: Arc<dyn ChannelOutbound>,
    settings: DialogSettings,
    events: Option<Arc<EventBus>>,
}

/// Identifies one run of a flow.
struct Run<'a> {
    flow: &'a DialogFlow,
    channel_id: &'a str,
    user_id: &'a str,
    key: String,
}

impl DialogEngine {
    pub fn new(
        waiter: ReplyWaiter,
        store: Arc<dyn DialogStore>,
        outbound: Arc<dyn ChannelOutbound>,
        settings: DialogSettings,
    ) -> Self {
        Self {
            waiter,
            store,
            outbound,
            settings,
            events: None,
        }
    }

    /// Report completions and cancellations on `events`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &Arc<dyn DialogStore> {
        &self.store
    }

    pub fn settings(&self) -> &DialogSettings {
        &self.settings
    }

    /// Start `flow` from step 0 for `user_id`, replacing any checkpoint the
    /// user already had for it.
    pub async fn start(
        &self,
        flow: &DialogFlow,
        channel_id: &str,
        user_id: &str,
    ) -> Result<DialogOutcome, DialogError> {
        let run = Run {
            flow,
            channel_id,
            user_id,
            key: flow.storage_key(user_id),
        };
        self.store.set(&run.key, &DialogState::default()).await?;

        info!(flow = flow.id(), channel_id, user_id, "dialog started");
        #[cfg(feature = "metrics")]
        counter!(dialog_metrics::STARTED_TOTAL, labels::FLOW => flow.id().to_string()).increment(1);

        self.drive(&run, DialogState::default()).await
    }

    /// Continue `flow` for `user_id` from its stored checkpoint.
    pub async fn resume(
        &self,
        flow: &DialogFlow,
        channel_id: &str,
        user_id: &str,
    ) -> Result<DialogOutcome, DialogError> {
        let key = flow.storage_key(user_id);
        let Some(state) = self.store.get(&key).await? else {
            return Err(DialogError::StateMissing { key });
        };
        info!(flow = flow.id(), channel_id, user_id, step = state.step, "dialog resumed");
        let run = Run {
            flow,
            channel_id,
            user_id,
            key,
        };
        self.drive(&run, state).await
    }

    async fn drive(&self, run: &Run<'_>, state: DialogState) -> Result<DialogOutcome, DialogError> {
        #[cfg(feature = "metrics")]
        gauge!(dialog_metrics::ACTIVE).increment(1.0);
        let result = self.steps(run, state).await;
        #[cfg(feature = "metrics")]
        gauge!(dialog_metrics::ACTIVE).decrement(1.0);

        match &result {
            Ok(DialogOutcome::Completed(_)) => {
                info!(flow = run.flow.id(), user_id = run.user_id, "dialog completed");
                #[cfg(feature = "metrics")]
                counter!(dialog_metrics::COMPLETED_TOTAL, labels::FLOW => run.flow.id().to_string())
                    .increment(1);
                self.emit(DispatchEvent::DialogCompleted {
                    flow: run.flow.id().to_string(),
                    channel_id: run.channel_id.to_string(),
                    author_id: run.user_id.to_string(),
                })
                .await;
            },
            Ok(DialogOutcome::Cancelled) => {},
            Err(e) => {
                warn!(flow = run.flow.id(), user_id = run.user_id, error = %e, "dialog failed");
                self.cancelled(run, "error").await;
            },
        }
        result
    }

    async fn steps(
        &self,
        run: &Run<'_>,
        mut state: DialogState,
    ) -> Result<DialogOutcome, DialogError> {
        let timeout = run.flow.step_timeout.unwrap_or(self.settings.step_timeout);
        let author = run.user_id.to_string();
        let from_user: ReplyFilter = Arc::new(move |m: &InboundMessage| m.author_id == author);

        while let Some(step) = run.flow.steps.get(state.step) {
            self.say(run.channel_id, &step.prompt).await;
            debug!(flow = run.flow.id(), step = %step.id, "awaiting dialog reply");

            let reply = match self
                .waiter
                .wait_for_reply(run.channel_id, Some(Arc::clone(&from_user)), timeout)
                .await
            {
                Ok(reply) => reply,
                Err(reason) => {
                    if reason == WaitError::Timeout {
                        self.say(run.channel_id, &self.settings.timeout_message).await;
                    }
                    self.discard(&run.key).await?;
                    let reason = match reason {
                        WaitError::Timeout => "timeout",
                        WaitError::Cancelled => "cancelled",
                    };
                    self.cancelled(run, reason).await;
                    return Ok(DialogOutcome::Cancelled);
                },
            };

            let accepted = panic::catch_unwind(AssertUnwindSafe(|| step.accept(&reply)))
                .unwrap_or_else(|_| {
                    Err(StepError::Fault(anyhow::anyhow!(
                        "step '{}' panicked",
                        step.id
                    )))
                });
            let value = match accepted {
                Ok(value) => value,
                Err(StepError::Rejected) => {
                    self.rejected(run, &step.id);
                    self.say(run.channel_id, &self.settings.retry_message).await;
                    continue;
                },
                Err(StepError::RejectedWith(notice)) => {
                    self.rejected(run, &step.id);
                    self.say(run.channel_id, &notice).await;
                    continue;
                },
                Err(StepError::Fault(source)) => {
                    // Best effort: the fault is the error worth reporting.
                    if let Err(e) = self.store.delete(&run.key).await {
                        warn!(key = %run.key, error = %e, "failed to clear dialog state");
                    }
                    return Err(DialogError::StepFault {
                        step: step.id.clone(),
                        source,
                    });
                },
            };

            state.data.insert(step.id.clone(), value);
            state.step += 1;
            if let Err(e) = self.store.set(&run.key, &state).await {
                if let Err(cleanup) = self.store.delete(&run.key).await {
                    warn!(key = %run.key, error = %cleanup, "failed to clear dialog state");
                }
                return Err(e.into());
            }
        }

        self.discard(&run.key).await?;
        Ok(DialogOutcome::Completed(state.data))
    }

    fn rejected(&self, run: &Run<'_>, step: &str) {
        debug!(flow = run.flow.id(), step, "dialog reply rejected");
        #[cfg(feature = "metrics")]
        counter!(dialog_metrics::VALIDATION_REJECTIONS_TOTAL, labels::FLOW => run.flow.id().to_string())
            .increment(1);
    }

    async fn cancelled(&self, run: &Run<'_>, reason: &str) {
        info!(flow = run.flow.id(), user_id = run.user_id, reason, "dialog cancelled");
        #[cfg(feature = "metrics")]
        counter!(dialog_metrics::CANCELLED_TOTAL, labels::REASON => reason.to_string())
            .increment(1);
        self.emit(DispatchEvent::DialogCancelled {
            flow: run.flow.id().to_string(),
            channel_id: run.channel_id.to_string(),
            author_id: run.user_id.to_string(),
            reason: reason.to_string(),
        })
        .await;
    }

    async fn discard(&self, key: &str) -> Result<(), DialogError> {
        self.store.delete(key).await.map_err(DialogError::from)
    }

    async fn say(&self, channel_id: &str, text: &str) {
        send_or_warn(self.outbound.as_ref(), channel_id, text).await;
    }

    async fn emit(&self, event: DispatchEvent) {
        if let Some(events) = &self.events {
            events.emit(&event).await;
        }
    }
}
