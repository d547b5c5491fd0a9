//! Content-addressed cache of base VM artifacts.
//!
//! Entries live at `<cache_dir>/<base_hash><suffix>` and are written exactly
//! once. Downloads land in `<cache_dir>/.tmp` first and are renamed into place
//! so a reader never observes a partial file. Concurrent fetches of the same
//! key serialize on a per-key lock and the losers find the winner's entry.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cloudlet_id::{BaseHash, Ulid};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::descriptor::{ArtifactKind, BaseImageDescriptor, BaseImagePaths};
use crate::catalog::{ArtifactSource, CatalogError};

const TMP_DIR: &str = ".tmp";

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Artifact {key} unavailable: {reason}")]
    Unavailable { key: CacheKey, reason: String },

    #[error("Catalog error: {0}")]
    Source(CatalogError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the base image cache.
#[derive(Debug, Clone)]
pub struct BaseImageCacheConfig {
    /// Directory holding published entries.
    pub cache_dir: PathBuf,
}

impl Default for BaseImageCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/lib/cloudlet/_base"),
        }
    }
}

/// Content key of a cache entry: the base hash plus the artifact suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_artifact(base_hash: &BaseHash, kind: ArtifactKind) -> Self {
        Self(format!("{base_hash}{}", kind.suffix()))
    }

    /// Recover a key from a cache file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (hash, suffix) = name.split_at_checked(BaseHash::HEX_LEN)?;
        BaseHash::parse(hash).ok()?;
        ArtifactKind::from_suffix(suffix)?;
        Some(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct CacheEntry {
    path: PathBuf,
    size_bytes: u64,
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub fetches: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
}

/// Base image cache shared by every VM operation on the host.
pub struct BaseImageCache {
    config: BaseImageCacheConfig,
    source: Arc<dyn ArtifactSource>,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    /// Per-key locks so only one task downloads a given artifact.
    fetch_locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    stats: CacheStats,
}

impl BaseImageCache {
    pub fn new(config: BaseImageCacheConfig, source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            config,
            source,
            entries: RwLock::new(HashMap::new()),
            fetch_locks: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Create the cache directories, drop leftover partial downloads and load
    /// published entries from disk.
    pub async fn init(&self) -> std::io::Result<()> {
        self.ensure_dirs().await?;

        let tmp_dir = self.tmp_dir();
        let mut stale = tokio::fs::read_dir(&tmp_dir).await?;
        while let Some(entry) = stale.next_entry().await? {
            debug!(path = %entry.path().display(), "Removing stale partial download");
            tokio::fs::remove_file(entry.path()).await?;
        }

        let mut entries = self.entries.write().await;
        let mut dir = tokio::fs::read_dir(&self.config.cache_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Some(key) = entry.file_name().to_str().and_then(CacheKey::from_file_name) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            entries.insert(
                key,
                CacheEntry {
                    path: entry.path(),
                    size_bytes: metadata.len(),
                },
            );
        }
        info!(count = entries.len(), "Loaded base artifacts from cache");
        Ok(())
    }

    /// Local path where `key` is published.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.config.cache_dir.join(key.as_str())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.config.cache_dir.join(TMP_DIR)
    }

    fn tmp_path(&self, key: &CacheKey) -> PathBuf {
        self.tmp_dir().join(format!("{key}.{}.part", Ulid::new()))
    }

    async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.tmp_dir()).await
    }

    /// Ensure `key` is present locally, downloading `artifact_id` from the
    /// source if needed.
    ///
    /// When `size_hint` is given, a download of a different size is rejected.
    pub async fn fetch(
        &self,
        key: &CacheKey,
        size_hint: Option<u64>,
        artifact_id: &str,
    ) -> Result<PathBuf, CacheError> {
        if let Some(path) = self.lookup(key).await {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Base artifact cache hit");
            return Ok(path);
        }

        self.ensure_dirs().await?;

        let lock = self.fetch_lock(key).await;
        let result = {
            let _guard = lock.lock().await;
            self.fetch_locked(key, size_hint, artifact_id).await
        };
        self.release_fetch_lock(key, lock).await;
        result
    }

    async fn fetch_locked(
        &self,
        key: &CacheKey,
        size_hint: Option<u64>,
        artifact_id: &str,
    ) -> Result<PathBuf, CacheError> {
        // Another task may have published while we waited on the lock.
        if let Some(path) = self.lookup(key).await {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(path);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        info!(key = %key, artifact_id = %artifact_id, "Fetching base artifact");

        let tmp = self.tmp_path(key);
        let size = match self.download(key, size_hint, artifact_id, &tmp).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&tmp).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %tmp.display(), error = %rm, "Failed to remove partial download");
                    }
                }
                return Err(e);
            }
        };

        let path = self.publish(key, &tmp, size).await?;
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        info!(key = %key, size_bytes = size, "Base artifact cached");
        Ok(path)
    }

    async fn download(
        &self,
        key: &CacheKey,
        size_hint: Option<u64>,
        artifact_id: &str,
        tmp: &Path,
    ) -> Result<u64, CacheError> {
        let size = self
            .source
            .download(artifact_id, tmp)
            .await
            .map_err(|e| match e {
                CatalogError::NotFound(_) => CacheError::Unavailable {
                    key: key.clone(),
                    reason: e.to_string(),
                },
                CatalogError::Io(io) => CacheError::Io(io),
                other => CacheError::Source(other),
            })?;

        if let Some(expected) = size_hint {
            if expected != size {
                return Err(CacheError::Unavailable {
                    key: key.clone(),
                    reason: format!("expected {expected} bytes, received {size}"),
                });
            }
        }
        Ok(size)
    }

    /// Publish a file that already exists locally under `key`.
    ///
    /// The source file is moved into the cache. If the key is already
    /// published the existing entry wins and `src` is removed.
    pub async fn adopt(&self, key: &CacheKey, src: &Path) -> Result<PathBuf, CacheError> {
        self.ensure_dirs().await?;

        let lock = self.fetch_lock(key).await;
        let result = {
            let _guard = lock.lock().await;
            self.adopt_locked(key, src).await
        };
        self.release_fetch_lock(key, lock).await;
        result
    }

    async fn adopt_locked(&self, key: &CacheKey, src: &Path) -> Result<PathBuf, CacheError> {
        if let Some(path) = self.lookup(key).await {
            tokio::fs::remove_file(src).await?;
            return Ok(path);
        }

        // Copy into the cache filesystem first so the final rename is atomic.
        let tmp = self.tmp_path(key);
        let size = tokio::fs::copy(src, &tmp).await?;
        let path = self.publish(key, &tmp, size).await?;
        tokio::fs::remove_file(src).await?;
        debug!(key = %key, "Adopted local artifact");
        Ok(path)
    }

    async fn publish(&self, key: &CacheKey, tmp: &Path, size: u64) -> Result<PathBuf, CacheError> {
        let path = self.entry_path(key);
        tokio::fs::rename(tmp, &path).await?;
        self.entries.write().await.insert(
            key.clone(),
            CacheEntry {
                path: path.clone(),
                size_bytes: size,
            },
        );
        Ok(path)
    }

    /// Fetch all four artifacts of a base VM concurrently.
    pub async fn ensure_base(
        &self,
        descriptor: &BaseImageDescriptor,
    ) -> Result<BaseImagePaths, CacheError> {
        let fetch = |kind: ArtifactKind| {
            let key = CacheKey::for_artifact(&descriptor.base_hash, kind);
            async move { self.fetch(&key, None, descriptor.artifact_id(kind)).await }
        };

        let (disk, memory, disk_hash_index, memory_hash_index) = tokio::try_join!(
            fetch(ArtifactKind::Disk),
            fetch(ArtifactKind::Memory),
            fetch(ArtifactKind::DiskHashIndex),
            fetch(ArtifactKind::MemoryHashIndex),
        )?;

        Ok(BaseImagePaths {
            disk,
            memory,
            disk_hash_index,
            memory_hash_index,
        })
    }

    async fn lookup(&self, key: &CacheKey) -> Option<PathBuf> {
        if let Some(entry) = self.entries.read().await.get(key) {
            return Some(entry.path.clone());
        }

        // The entry may have been published by a previous process.
        let path = self.entry_path(key);
        let metadata = tokio::fs::metadata(&path).await.ok()?;
        if !metadata.is_file() {
            return None;
        }
        self.entries.write().await.insert(
            key.clone(),
            CacheEntry {
                path: path.clone(),
                size_bytes: metadata.len(),
            },
        );
        Some(path)
    }

    async fn fetch_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.fetch_locks.lock().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-key lock once no other task holds or waits on it.
    async fn release_fetch_lock(&self, key: &CacheKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.fetch_locks.lock().await;
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    /// Number of per-key locks currently tracked.
    pub async fn pending_fetches(&self) -> usize {
        self.fetch_locks.lock().await.len()
    }

    /// Whether `key` has been published.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.lookup(key).await.is_some()
    }

    /// Total bytes of published entries known to this process.
    pub async fn size_bytes(&self) -> u64 {
        self.entries
            .read()
            .await
            .values()
            .map(|entry| entry.size_bytes)
            .sum()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            fetches: self.stats.fetches.load(Ordering::Relaxed),
        }
    }
}
