//! Process-local dialog store.

use std::{collections::HashMap, sync::Mutex};

use {async_trait::async_trait, neuron_common::Result};

use crate::{dialog::DialogState, store::DialogStore};

/// Checkpoints held in a `HashMap`. Lost on restart.
#[derive(Default)]
pub struct InMemoryDialogStore {
    states: Mutex<HashMap<String, DialogState>>,
}

impl InMemoryDialogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = states.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl DialogStore for InMemoryDialogStore {
    async fn get(&self, key: &str) -> Result<Option<DialogState>> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Ok(states.get(key).cloned())
    }

    async fn set(&self, key: &str, state: &DialogState) -> Result<()> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(key);
        Ok(())
    }
}
