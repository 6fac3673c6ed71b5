//! Configuration loading, validation, and env substitution.
//!
//! Config files: `neuron.toml`, `neuron.yaml`, or `neuron.json`
//! Searched in `./` then `~/.config/neuron/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{config_dir, discover_and_load, load_config},
    schema::{
        CommandsConfig, ConversationConfig, DialogConfig, MetricsConfig, NeuronConfig,
        RateLimitConfig, StorageConfig, StorageKind,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
