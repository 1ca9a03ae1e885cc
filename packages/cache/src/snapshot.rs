//! Gzip-compressed payload snapshots on local disk.
//!
//! Snapshots live under a root directory as
//! `<namespace>/<version>/<relative path>.gz`. Every file is written to a
//! temporary sibling and renamed into place so readers never observe a
//! partial write. Files older than the configured maximum age are treated
//! as absent and deleted when encountered.

use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::CacheError;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A directory of compressed snapshot files.
#[derive(Debug, Clone)]
pub struct DiskSnapshotStore {
    root: PathBuf,
    max_age: Option<Duration>,
}

impl DiskSnapshotStore {
    /// Creates a store rooted at `root`. Snapshots older than `max_age`
    /// are ignored; `None` disables the age bound.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, max_age: Option<Duration>) -> Self {
        Self {
            root: root.into(),
            max_age,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, namespace: &str, version: &str, relative: &str) -> PathBuf {
        self.root
            .join(namespace)
            .join(version)
            .join(format!("{relative}.gz"))
    }

    /// Reads and decompresses a snapshot.
    ///
    /// Returns `Ok(None)` when the file is missing or older than the
    /// maximum age (expired files are removed).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] on read failures and
    /// [`CacheError::Corrupt`] when the file is not valid gzip. Corrupt
    /// files are deleted before returning. [`CacheError::Task`] if the
    /// decompression task fails.
    pub async fn read(
        &self,
        namespace: &str,
        version: &str,
        relative: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.file_path(namespace, version, relative);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let Some(max_age) = self.max_age {
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or_default();
            if age > max_age {
                log::debug!(
                    "Snapshot {} is {}s old (max {}s), discarding",
                    path.display(),
                    age.as_secs(),
                    max_age.as_secs()
                );
                remove_file_quietly(&path).await;
                return Ok(None);
            }
        }

        let compressed = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match tokio::task::spawn_blocking(move || gunzip(&compressed)).await? {
            Ok(decoded) => Ok(Some(decoded)),
            Err(e) => {
                remove_file_quietly(&path).await;
                Err(CacheError::Corrupt {
                    key: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Compresses and writes a snapshot atomically.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory cannot be created or
    /// the file cannot be written, [`CacheError::Task`] if the
    /// compression task fails.
    pub async fn write(
        &self,
        namespace: &str,
        version: &str,
        relative: &str,
        bytes: &[u8],
    ) -> Result<(), CacheError> {
        let path = self.file_path(namespace, version, relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let raw = bytes.to_vec();
        let compressed = tokio::task::spawn_blocking(move || gzip(&raw)).await??;

        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("gz.{}.{seq}.tmp", std::process::id()));
        tokio::fs::write(&tmp, &compressed).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Deletes one snapshot if present.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] for failures other than a missing file.
    pub async fn remove(
        &self,
        namespace: &str,
        version: &str,
        relative: &str,
    ) -> Result<(), CacheError> {
        let path = self.file_path(namespace, version, relative);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every version directory of `namespace` except `keep`.
    ///
    /// Returns the number of version directories removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the namespace directory cannot be
    /// listed or a stale directory cannot be removed.
    pub async fn prune_versions(&self, namespace: &str, keep: &str) -> Result<usize, CacheError> {
        let dir = self.root.join(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy() == keep {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("Pruned {removed} stale snapshot version(s) for {namespace}");
        }
        Ok(removed)
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn gunzip(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(compressed).read_to_end(&mut decoded)?;
    Ok(decoded)
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        log::debug!("Failed to remove snapshot {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ticket_map_snapshot_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn write_then_read() {
        let root = temp_root("write_read");
        let store = DiskSnapshotStore::new(&root, None);
        store.write("parking", "v1", "12/1/2", b"tile").await.unwrap();
        assert_eq!(
            store.read("parking", "v1", "12/1/2").await.unwrap(),
            Some(b"tile".to_vec())
        );
        assert_eq!(store.read("parking", "v2", "12/1/2").await.unwrap(), None);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn large_payloads_are_compressed_off_the_runtime() {
        let root = temp_root("large");
        let store = DiskSnapshotStore::new(&root, None);
        let payload = vec![7u8; 4 * 1024 * 1024];
        store.write("parking", "v1", "4/3/5", &payload).await.unwrap();

        let on_disk = std::fs::metadata(root.join("parking/v1/4/3/5.gz")).unwrap().len();
        assert!(on_disk < 64 * 1024, "{on_disk} bytes on disk");
        assert_eq!(store.read("parking", "v1", "4/3/5").await.unwrap(), Some(payload));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn corrupt_file_is_removed() {
        let root = temp_root("corrupt");
        let store = DiskSnapshotStore::new(&root, None);
        let path = root.join("parking/v1/1/0/0.gz");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not gzip").unwrap();

        let err = store.read("parking", "v1", "1/0/0").await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn expired_snapshot_is_ignored() {
        let root = temp_root("expired");
        let store = DiskSnapshotStore::new(&root, Some(Duration::ZERO));
        store.write("parking", "v1", "0/0/0", b"old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.read("parking", "v1", "0/0/0").await.unwrap(), None);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn prune_keeps_current_version() {
        let root = temp_root("prune");
        let store = DiskSnapshotStore::new(&root, None);
        store.write("parking", "v1", "0/0/0", b"a").await.unwrap();
        store.write("parking", "v2", "0/0/0", b"b").await.unwrap();
        assert_eq!(store.prune_versions("parking", "v2").await.unwrap(), 1);
        assert_eq!(store.read("parking", "v1", "0/0/0").await.unwrap(), None);
        assert!(store.read("parking", "v2", "0/0/0").await.unwrap().is_some());
        let _ = std::fs::remove_dir_all(&root);
    }
}
