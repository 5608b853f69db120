//! Object storage for produced PDFs.

use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Storage failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    /// The store refused the write (permissions, bad key).
    #[error("storage rejected write: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    /// Store `bytes` under `path` and return a retrievable URL.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StorageError>;
}

/// Keys are relative paths; reject anything that could escape the root.
fn validate_key(path: &str) -> Result<&Path, StorageError> {
    let p = Path::new(path);
    let ok = !path.is_empty() && p.components().all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(p)
    } else {
        Err(StorageError::Rejected(format!("invalid object key '{path}'")))
    }
}

/// Files under a local root, served from `public_base_url`.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let key = validate_key(path)?;
        let target = self.root.join(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        // Write then rename so readers never see a partial file.
        let tmp = target.with_extension("pdf.partial");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &target).await.map_err(io_error)?;

        debug!(path, bytes = bytes.len(), "stored object");
        Ok(format!("{}/{}", self.public_base_url, path))
    }
}

fn io_error(e: std::io::Error) -> StorageError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => StorageError::Rejected(format!("permission denied: {e}")),
        _ => StorageError::Io(e.to_string()),
    }
}

/// Scripted failure for [`InMemoryObjectStorage`].
#[derive(Debug, Clone)]
pub enum StorageFault {
    Fail(StorageError),
    /// Stall before storing; used to trip upload timeouts.
    Stall(Duration),
}

/// In-memory object store for tests/dev.
#[derive(Debug)]
pub struct InMemoryObjectStorage {
    base_url: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    faults: Mutex<VecDeque<StorageFault>>,
}

impl Default for InMemoryObjectStorage {
    fn default() -> Self {
        Self::new("memory://pdfs")
    }
}

impl InMemoryObjectStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue faults consumed by the next `put` calls, in order.
    pub fn push_faults(&self, faults: impl IntoIterator<Item = StorageFault>) {
        if let Ok(mut q) = self.faults.lock() {
            q.extend(faults);
        }
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok().and_then(|o| o.get(path).cloned())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        validate_key(path)?;

        let fault = self.faults.lock().ok().and_then(|mut q| q.pop_front());
        match fault {
            Some(StorageFault::Fail(e)) => return Err(e),
            Some(StorageFault::Stall(d)) => tokio::time::sleep(d).await,
            None => {}
        }

        self.objects
            .lock()
            .map_err(|_| StorageError::Io("object map lock poisoned".to_string()))?
            .insert(path.to_string(), bytes);
        Ok(format!("{}/{}", self.base_url, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_keys() {
        assert!(validate_key("tenant/owner/job.pdf").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path.pdf").is_err());
        assert!(validate_key("").is_err());
    }

    #[tokio::test]
    async fn local_storage_writes_under_root() {
        let root = std::env::temp_dir().join(format!("offerdesk-store-{}", uuid::Uuid::now_v7()));
        let storage = LocalObjectStorage::new(&root, "https://files.example.com/");

        let url = storage.put("system/o/j.pdf", b"%PDF".to_vec()).await.unwrap();
        assert_eq!(url, "https://files.example.com/system/o/j.pdf");
        assert_eq!(tokio::fs::read(root.join("system/o/j.pdf")).await.unwrap(), b"%PDF");
        assert!(!root.join("system/o/j.pdf.partial").exists());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_storage_plays_faults_in_order() {
        let storage = InMemoryObjectStorage::default();
        storage.push_faults([StorageFault::Fail(StorageError::Io("reset".into()))]);

        assert!(storage.put("a.pdf", vec![1]).await.is_err());
        assert_eq!(storage.put("a.pdf", vec![1]).await.unwrap(), "memory://pdfs/a.pdf");
        assert_eq!(storage.get("a.pdf"), Some(vec![1]));
    }
}
