//! Config schema types.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuronConfig {
    pub commands: CommandsConfig,
    pub rate_limit: RateLimitConfig,
    pub conversation: ConversationConfig,
    pub dialog: DialogConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

/// Command routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Prefix a message must start with to be treated as a command.
    pub prefix: String,
    /// Notice sent when a requester lacks a required capability.
    pub denied_message: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            prefix: "!".into(),
            denied_message: "You don't have permission to use that command.".into(),
        }
    }
}

/// Per-author token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket holds (burst size).
    pub capacity: f64,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5.0,
            refill_per_sec: 1.0,
        }
    }
}

/// Reply collectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Deadline for a plain reply wait, in seconds.
    pub reply_timeout_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            reply_timeout_secs: 30,
        }
    }
}

impl ConversationConfig {
    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

/// Multi-step dialogs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogConfig {
    /// Deadline for each step's reply, in seconds.
    pub step_timeout_secs: u64,
    /// Sent when a reply fails a step's validator.
    pub retry_message: String,
    /// Sent when a step times out and the dialog is cancelled.
    pub timeout_message: String,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 60,
            retry_message: "Invalid response, please try again.".into(),
            timeout_message: "Timed out waiting for reply.".into(),
        }
    }
}

impl DialogConfig {
    #[must_use]
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Where dialog checkpoints are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// JSON file used by the `file` backend.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            path: PathBuf::from("neuron-store.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}
