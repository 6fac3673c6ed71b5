use neuron_common::{CapabilitySet, InboundMessage};

/// Resolves the capabilities a requester currently holds.
///
/// `None` means there is no source of capability information for this
/// request; callers treat it as holding nothing.
pub trait CapabilitySource: Send + Sync {
    fn capabilities(&self, message: &InboundMessage) -> Option<CapabilitySet>;
}

/// Reads the capability set the transport attached to the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCapabilities;

impl CapabilitySource for MessageCapabilities {
    fn capabilities(&self, message: &InboundMessage) -> Option<CapabilitySet> {
        message.capabilities.clone()
    }
}

impl<F> CapabilitySource for F
where
    F: Fn(&InboundMessage) -> Option<CapabilitySet> + Send + Sync,
{
    fn capabilities(&self, message: &InboundMessage) -> Option<CapabilitySet> {
        self(message)
    }
}
