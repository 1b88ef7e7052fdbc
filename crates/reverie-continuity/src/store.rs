//! Snapshot stores. Code writes here; the backend decides where it goes.

use reverie_core::PersistenceError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Pluggable snapshot backend. Holds exactly one snapshot: the latest.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot. Readers never see a partial write.
    async fn save(&self, bytes: &[u8]) -> Result<(), PersistenceError>;

    /// The latest snapshot, or `None` for a fresh store.
    async fn load(&self) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Where snapshots live (for humans).
    fn location(&self) -> String;
}

/// Local file store. Writes a sibling temp file, then renames over the target.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn in_dir(dir: impl AsRef<Path>, file_name: &str) -> Self {
        Self::new(dir.as_ref().join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        self.path.with_file_name(format!("{}.tmp", name))
    }
}

#[async_trait::async_trait]
impl SnapshotStore for FileStore {
    async fn save(&self, bytes: &[u8]) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!("wrote {} ({} bytes)", self.path.display(), bytes.len());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory store with failure injection, for tests and embedders without disk.
pub struct MemoryStore {
    data: Mutex<Option<Vec<u8>>>,
    available: AtomicBool,
    /// Artificial latency applied to every save, in milliseconds.
    delay_ms: AtomicU64,
    saves: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(None),
            available: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
            saves: AtomicU64::new(0),
        }
    }

    pub fn with_contents(bytes: Vec<u8>) -> Self {
        Self { data: Mutex::new(Some(bytes)), ..Self::new() }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn contents(&self) -> Option<Vec<u8>> {
        self.data.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, bytes: &[u8]) -> Result<(), PersistenceError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store switched off".to_string()));
        }
        *self.data.lock().await = Some(bytes.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store switched off".to_string()));
        }
        Ok(self.data.lock().await.clone())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_write_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::in_dir(tmp.path().join("nested"), "state.json");
        assert!(store.load().await.unwrap().is_none());

        store.save(b"{\"a\":1}").await.unwrap();
        store.save(b"{\"a\":2}").await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap(), b"{\"a\":2}");
        assert!(!store.tmp_path().exists(), "temp file should not persist after atomic rename");
        assert!(store.location().ends_with("state.json"));
    }

    #[tokio::test]
    async fn memory_store_can_be_switched_off() {
        let store = MemoryStore::new();
        store.save(b"one").await.unwrap();
        store.set_available(false);
        assert!(matches!(store.save(b"two").await, Err(PersistenceError::Unavailable(_))));
        store.set_available(true);
        assert_eq!(store.load().await.unwrap().unwrap(), b"one");
        assert_eq!(store.saves(), 1);
    }
}
