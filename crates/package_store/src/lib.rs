//! Content-addressed local cache of deployed function packages, §4.5.
//!
//! A package is a gzipped tar containing at least `index.js`. The store
//! downloads via a [`BlobStore`], verifies length and SHA-256 against the
//! metadata's recorded `package_hash`, extracts to a fresh directory, and
//! atomically swaps it into the cache. Misses are serialized per
//! `function_id` so two concurrent callers never extract the same package
//! twice; cache hits are lock-free.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use rt_errors::RuntimeError;
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    sync::{Mutex as AsyncMutex, Mutex},
};
use tracing::{debug, warn};

/// Everything needed to fetch and verify one package, as served by the
/// configuration database's metadata rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageMetadata {
    pub function_id: String,
    pub version: i64,
    pub package_hash: String,
    pub file_size: u64,
    pub package_path: String,
}

/// Fetches package bytes by path. Implementations are responsible for
/// reporting transport errors; hash/length verification happens in
/// [`PackageStore`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn fetch(&self, package_path: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub package_dir: PathBuf,
    pub index_path: PathBuf,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    dir: PathBuf,
    hash: String,
    access_count: u64,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
}

/// On-disk, content-addressed package cache rooted at `cache_root`.
pub struct PackageStore<B: BlobStore> {
    cache_root: PathBuf,
    blob_store: Arc<B>,
    inner: Mutex<Inner>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<B: BlobStore> PackageStore<B> {
    pub fn new(cache_root: impl Into<PathBuf>, blob_store: Arc<B>) -> Self {
        Self {
            cache_root: cache_root.into(),
            blob_store,
            inner: Mutex::new(Inner { entries: HashMap::new() }),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn function_lock(&self, function_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(function_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Implements the §4.5 `get` algorithm.
    pub async fn get(&self, metadata: &PackageMetadata) -> Result<ResolvedPackage, RuntimeError> {
        let lock = self.function_lock(&metadata.function_id).await;
        let _guard = lock.lock().await;

        if let Some(entry) = self.inner.lock().await.entries.get(&metadata.function_id).cloned() {
            if entry.hash == metadata.package_hash && fs::try_exists(&entry.dir).await.unwrap_or(false) {
                self.bump_access_stats(&metadata.function_id).await;
                return Ok(ResolvedPackage {
                    index_path: entry.dir.join("index.js"),
                    package_dir: entry.dir,
                    from_cache: true,
                });
            }
            self.inner.lock().await.entries.remove(&metadata.function_id);
        }

        let dir = self.download_and_extract(metadata).await?;
        self.inner.lock().await.entries.insert(
            metadata.function_id.clone(),
            CacheEntry {
                dir: dir.clone(),
                hash: metadata.package_hash.clone(),
                access_count: 1,
            },
        );
        Ok(ResolvedPackage {
            index_path: dir.join("index.js"),
            package_dir: dir,
            from_cache: false,
        })
    }

    async fn bump_access_stats(&self, function_id: &str) {
        if let Some(entry) = self.inner.lock().await.entries.get_mut(function_id) {
            entry.access_count += 1;
        }
    }

    async fn download_and_extract(&self, metadata: &PackageMetadata) -> Result<PathBuf, RuntimeError> {
        debug!(function_id = %metadata.function_id, version = metadata.version, "downloading package");
        let bytes = self
            .blob_store
            .fetch(&metadata.package_path)
            .await
            .map_err(|e| RuntimeError::internal(format!("blob fetch failed: {e}")))?;

        if bytes.len() as u64 != metadata.file_size {
            warn!(
                function_id = %metadata.function_id,
                expected = metadata.file_size,
                got = bytes.len(),
                "package length mismatch"
            );
            return Err(RuntimeError::PackageIntegrityError {
                reason: format!(
                    "{}: length mismatch: expected {} got {}",
                    metadata.function_id,
                    metadata.file_size,
                    bytes.len()
                ),
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());
        if digest != metadata.package_hash {
            warn!(
                function_id = %metadata.function_id,
                expected = %metadata.package_hash,
                got = %digest,
                "package hash mismatch"
            );
            return Err(RuntimeError::PackageIntegrityError {
                reason: format!(
                    "{}: hash mismatch: expected {} got {digest}",
                    metadata.function_id, metadata.package_hash
                ),
            });
        }

        fs::create_dir_all(&self.cache_root)
            .await
            .map_err(|e| RuntimeError::internal(format!("create cache root: {e}")))?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.cache_root)
            .map_err(|e| RuntimeError::internal(format!("create staging dir: {e}")))?;

        extract_gzipped_tar(&bytes, staging.path())
            .map_err(|e| RuntimeError::PackageIntegrityError {
                reason: format!("{}: extraction failed: {e}", metadata.function_id),
            })?;

        if !staging.path().join("index.js").is_file() {
            return Err(RuntimeError::PackageIntegrityError {
                reason: format!("{}: archive missing index.js", metadata.function_id),
            });
        }

        let final_dir = self
            .cache_root
            .join(format!("{}-v{}", sanitize(&metadata.function_id), metadata.version));
        if fs::try_exists(&final_dir).await.unwrap_or(false) {
            fs::remove_dir_all(&final_dir)
                .await
                .map_err(|e| RuntimeError::internal(format!("remove stale dir: {e}")))?;
        }
        // into_path() leaks the TempDir guard so the atomic rename target
        // survives past this scope; orphaned staging dirs on crash are an
        // accepted cost, as on the grounding codebase's upload path.
        let staging_path = staging.into_path();
        fs::rename(&staging_path, &final_dir)
            .await
            .map_err(|e| RuntimeError::internal(format!("atomic swap failed: {e}")))?;

        debug!(function_id = %metadata.function_id, dir = %final_dir.display(), "package extracted");
        Ok(final_dir)
    }
}

fn sanitize(function_id: &str) -> String {
    function_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn extract_gzipped_tar(bytes: &[u8], dest: &Path) -> anyhow::Result<()> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}
