//! Persistence for dialog checkpoints.

use async_trait::async_trait;

use {crate::dialog::DialogState, neuron_common::Result};

/// Key-value store for dialog checkpoints.
///
/// Operations on one key must observe program order; nothing is required
/// across keys.
#[async_trait]
pub trait DialogStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<DialogState>>;
    async fn set(&self, key: &str, state: &DialogState) -> Result<()>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
