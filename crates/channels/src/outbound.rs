use std::sync::Mutex;

use {async_trait::async_trait, tracing::warn};

#[cfg(feature = "metrics")]
use neuron_metrics::{counter, outbound as outbound_metrics};

use crate::Result;

/// Send text to a channel.
///
/// Delivery is fire-and-forget from neuron's point of view: callers report
/// failures and never retry.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<()>;
}

/// Send `text` and log (rather than propagate) a delivery failure.
///
/// Returns whether the transport accepted the message.
pub async fn send_or_warn(outbound: &dyn ChannelOutbound, channel_id: &str, text: &str) -> bool {
    match outbound.send_text(channel_id, text).await {
        Ok(()) => {
            #[cfg(feature = "metrics")]
            counter!(outbound_metrics::SENT_TOTAL).increment(1);
            true
        },
        Err(e) => {
            #[cfg(feature = "metrics")]
            counter!(outbound_metrics::ERRORS_TOTAL).increment(1);
            warn!(channel_id, error = %e, "failed to send message");
            false
        },
    }
}

/// A message captured by [`RecordingOutbound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel_id: String,
    pub text: String,
}

/// Outbound that keeps everything it is asked to send, in order.
///
/// Used by tests and by embedders that drain replies themselves.
#[derive(Default)]
pub struct RecordingOutbound {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Texts sent to one channel, oldest first.
    pub fn texts_for(&self, channel_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .map(|m| m.text.clone())
            .collect()
    }

    pub fn take(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl ChannelOutbound for RecordingOutbound {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentMessage {
                channel_id: channel_id.to_string(),
                text: text.to_string(),
            });
        Ok(())
    }
}
