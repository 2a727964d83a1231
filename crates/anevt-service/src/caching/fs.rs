use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::store::{CacheStore, CacheValue, StoreError};
use super::CacheKey;

/// The on-disk envelope around a cache line.
#[derive(Debug, Serialize, Deserialize)]
struct StoredFile {
    /// Absolute expiry, milliseconds since the unix epoch.
    expires_at_ms: u64,
    value: CacheValue,
}

/// A filesystem [`CacheStore`] backend.
///
/// One file per key under the store directory, so the cache is shared by
/// every process pointing at the same path. Writes go through a temp file in
/// a sibling directory and are persisted atomically, so readers never
/// observe partial entries. Expired or undecodable entries are treated as
/// absent and removed on the next read.
#[derive(Debug)]
pub struct FilesystemStore {
    store_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl FilesystemStore {
    /// Opens (and creates, if needed) a store rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let store_dir = path.into();
        let tmp_dir = store_dir.join("tmp");
        std::fs::create_dir_all(&store_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;
        Ok(Self { store_dir, tmp_dir })
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.store_dir.join(key.path_segment())
    }
}

fn unix_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn persist_tempfile(temp_file: NamedTempFile, path: &Path) -> std::io::Result<()> {
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl CacheStore for FilesystemStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, StoreError> {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: StoredFile = match serde_json::from_slice(&bytes) {
            Ok(stored) => stored,
            Err(e) => {
                // We have observed truncated entries after hard reboots;
                // drop them and treat the line as absent.
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Removing undecodable cache entry",
                );
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(None);
            }
        };

        if unix_ms(SystemTime::now()) >= stored.expires_at_ms {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }

        Ok(Some(stored.value))
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let stored = StoredFile {
            expires_at_ms: unix_ms(SystemTime::now() + ttl),
            value,
        };
        let path = self.entry_path(key);

        let mut temp_file = NamedTempFile::new_in(&self.tmp_dir)?;
        temp_file.write_all(&serde_json::to_vec(&stored)?)?;
        persist_tempfile(temp_file, &path)?;
        Ok(())
    }
}
