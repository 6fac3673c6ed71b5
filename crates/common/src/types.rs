//! Message and identity types shared by the transport, routing, and
//! conversation layers.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

/// Set of opaque capability tokens held by a requester.
///
/// Tokens are compared exactly; normalization (if any) is the transport's job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: impl Into<String>) -> bool {
        self.0.insert(capability.into())
    }

    #[must_use]
    pub fn contains(&self, capability: &str) -> bool {
        self.0.contains(capability)
    }

    /// Required capabilities that are not present in this set, in the
    /// order they were requested.
    #[must_use]
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|cap| !self.contains(cap))
            .map(String::as_str)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{}", joined.join(","))
    }
}

/// An inbound chat message as handed over by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport-assigned message id.
    pub message_id: String,
    /// Channel (chat/room/DM) the message was posted in.
    pub channel_id: String,
    /// Stable author identity; also the rate-limit key.
    pub author_id: String,
    /// Messages authored by bots are never routed.
    #[serde(default)]
    pub author_is_bot: bool,
    pub content: String,
    /// Capabilities the author holds in this channel, when the transport
    /// knows them. `None` means no capability source is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilitySet>,
}

impl InboundMessage {
    /// Build a user-authored message with no capability information.
    #[must_use]
    pub fn new(
        channel_id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: String::new(),
            channel_id: channel_id.into(),
            author_id: author_id.into(),
            author_is_bot: false,
            content: content.into(),
            capabilities: None,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    #[must_use]
    pub fn from_bot(mut self) -> Self {
        self.author_is_bot = true;
        self
    }
}
