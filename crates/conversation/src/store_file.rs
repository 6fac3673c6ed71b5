//! JSON file-backed dialog store with atomic writes.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf, absolute},
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
};

use {
    async_trait::async_trait,
    neuron_common::{Error, Result},
    once_cell::sync::Lazy,
    tokio::{fs, sync::Mutex},
    tracing::debug,
};

use crate::{dialog::DialogState, store::DialogStore};

/// Live file locks, keyed by absolute store path.
static PATH_LOCKS: Lazy<StdMutex<HashMap<PathBuf, Weak<Mutex<()>>>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

/// The lock every store opened on `path` in this process shares.
fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let key = absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut locks = PATH_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
        return lock;
    }
    locks.retain(|_, lock| lock.strong_count() > 0);
    let lock = Arc::new(Mutex::new(()));
    locks.insert(key, Arc::downgrade(&lock));
    lock
}

/// All checkpoints in one JSON object keyed by storage key.
///
/// Every mutation rewrites the file: write a temp file, move the old file to
/// `.bak`, rename the temp file into place. Stores opened on the same path
/// share one lock, so their read-modify-write cycles never interleave.
pub struct FileDialogStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles on `path`.
    lock: Arc<Mutex<()>>,
}

impl FileDialogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = lock_for(&path);
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, DialogState>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(BTreeMap::new());
        }
        let data = fs::read_to_string(&self.path).await?;
        if data.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&data)
            .map_err(|e| Error::external(format!("failed to parse {}", self.path.display()), e))
    }

    async fn atomic_write(&self, states: &BTreeMap<String, DialogState>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(states)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;

        if fs::try_exists(&self.path).await.unwrap_or(false) {
            let bak = self.path.with_extension("json.bak");
            let _ = fs::rename(&self.path, &bak).await;
        }

        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), entries = states.len(), "dialog store written");
        Ok(())
    }
}

#[async_trait]
impl DialogStore for FileDialogStore {
    async fn get(&self, key: &str) -> Result<Option<DialogState>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, state: &DialogState) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut states = self.load().await?;
        states.insert(key.to_string(), state.clone());
        self.atomic_write(&states).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut states = self.load().await?;
        if states.remove(key).is_none() {
            return Ok(());
        }
        self.atomic_write(&states).await
    }
}
