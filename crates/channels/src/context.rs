use std::{collections::HashMap, fmt, sync::Arc};

use {neuron_common::InboundMessage, serde_json::Value};

use crate::{ChannelOutbound, outbound::send_or_warn};

/// Everything a middleware or command handler sees about one inbound message.
///
/// Lives for a single dispatch. `state` is scratch space for middleware to
/// hand values to later interceptors and to the handler.
pub struct RequestContext {
    pub outbound: Arc<dyn ChannelOutbound>,
    pub message: InboundMessage,
    /// Tokens left after the command path was consumed.
    pub args: Vec<String>,
    /// Normalized names of the resolved command and its subcommands,
    /// e.g. `["config", "set"]`. Empty until resolution.
    pub command_path: Vec<String>,
    pub state: HashMap<String, Value>,
}

impl RequestContext {
    pub fn new(message: InboundMessage, outbound: Arc<dyn ChannelOutbound>) -> Self {
        Self {
            outbound,
            message,
            args: Vec::new(),
            command_path: Vec::new(),
            state: HashMap::new(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.message.channel_id
    }

    pub fn author_id(&self) -> &str {
        &self.message.author_id
    }

    /// Post `text` to the originating channel. Failures are logged.
    pub async fn reply(&self, text: &str) -> bool {
        send_or_warn(self.outbound.as_ref(), &self.message.channel_id, text).await
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("message", &self.message)
            .field("args", &self.args)
            .field("command_path", &self.command_path)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
