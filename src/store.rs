//! File-backed record store
//!
//! Every record lives in its own file, `<key>.txt`, inside the store's root
//! directory. The file holds the record content verbatim. Writers to the same
//! key are serialized, and each write lands through a temp file that is
//! renamed over the record, so readers see either the old or the new content
//! in full.

use crate::error::{Result, StoreError};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

const RECORD_SUFFIX: &str = ".txt";
const TEMP_SUFFIX: &str = ".tmp";

/// Trait defining the interface for record storage operations
pub trait Store: Send + Sync {
    /// Create or fully replace the record for `key`
    fn insert(
        &self,
        key: &str,
        content: &[u8],
    ) -> impl Future<Output = std::result::Result<(), StoreError>> + Send;

    /// Read the whole record for `key`
    fn select(&self, key: &str) -> impl Future<Output = std::result::Result<Vec<u8>, StoreError>> + Send;
}

/// File name backing a key
pub fn record_file_name(key: &str) -> String {
    format!("{}{}", key, RECORD_SUFFIX)
}

/// Record store keeping one file per key
pub struct FileStore {
    root: PathBuf,
    writers: KeyLocks,
    temp_seq: AtomicU64,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed and
    /// clearing temp files left behind by interrupted writes.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let removed = sweep_temp_files(&root).await?;
        if removed > 0 {
            warn!(dir = %root.display(), removed, "Removed temp files from interrupted writes");
        }
        debug!(dir = %root.display(), "Record store opened");

        Ok(Self {
            root,
            writers: KeyLocks::default(),
            temp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(record_file_name(key))
    }

    /// Write `content` to a fresh temp file, then rename it over the record.
    async fn write_replace(&self, key: &str, content: &[u8]) -> io::Result<()> {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .root
            .join(format!(".{}.{}{}", record_file_name(key), seq, TEMP_SUFFIX));

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, self.record_path(key)).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }

    #[cfg(test)]
    fn tracked_writers(&self) -> usize {
        self.writers.len()
    }
}

impl Store for FileStore {
    async fn insert(&self, key: &str, content: &[u8]) -> std::result::Result<(), StoreError> {
        let slot = self.writers.slot(key);
        let _writer = slot.lock().await;

        self.write_replace(key, content)
            .await
            .map_err(|source| StoreError::IoFailure {
                key: key.to_string(),
                source,
            })?;

        trace!(key, bytes = content.len(), "Record written");
        Ok(())
    }

    async fn select(&self, key: &str) -> std::result::Result<Vec<u8>, StoreError> {
        match fs::read(self.record_path(key)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(source) => Err(StoreError::IoFailure {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// Per-key writer locks. An entry exists only while some writer holds a
/// slot for its key.
#[derive(Default)]
struct KeyLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn slot<'a>(&'a self, key: &'a str) -> WriterSlot<'a> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(locks.entry(key.to_string()).or_default());
        WriterSlot {
            owner: self,
            key,
            lock,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct WriterSlot<'a> {
    owner: &'a KeyLocks,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl WriterSlot<'_> {
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for WriterSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .owner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map and this slot hold the lock: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(self.key);
        }
    }
}

/// Matches only names `write_replace` produces: `.<key>.txt.<seq>.tmp`
fn is_temp_file_name(name: &str) -> bool {
    let Some(inner) = name
        .strip_prefix('.')
        .and_then(|n| n.strip_suffix(TEMP_SUFFIX))
    else {
        return false;
    };
    let Some((record, seq)) = inner.rsplit_once('.') else {
        return false;
    };
    record.len() > RECORD_SUFFIX.len()
        && record.ends_with(RECORD_SUFFIX)
        && !seq.is_empty()
        && seq.bytes().all(|b| b.is_ascii_digit())
}

async fn sweep_temp_files(root: &Path) -> io::Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_temp_file_name(&name) {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}
