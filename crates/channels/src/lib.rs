//! Transport collaborator contracts.
//!
//! The chat platform itself lives outside neuron. A transport hands inbound
//! messages to the dispatcher and implements [`ChannelOutbound`] so handlers,
//! dialogs, and notices can post text back to a channel.

pub mod capabilities;
pub mod context;
pub mod error;
pub mod outbound;

pub use {
    capabilities::{CapabilitySource, MessageCapabilities},
    context::RequestContext,
    error::{Error, Result},
    outbound::{ChannelOutbound, RecordingOutbound, SentMessage, send_or_warn},
};
