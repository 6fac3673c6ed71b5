//! Shared types, error definitions, and the dispatch event bus used across all
//! neuron crates.

pub mod error;
pub mod events;
pub mod types;

pub use {
    error::{Error, NeuronError, Result},
    types::{CapabilitySet, InboundMessage},
};
