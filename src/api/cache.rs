//! Disk-backed response cache for idempotent read requests.
//!
//! A [`CachedRequest`] wraps a [`Request`] with an expiry duration. The
//! cache key is the SHA-256 of a canonical description string built from
//! the site identity, the authenticated-identity marker, and the sorted
//! normalized parameters. Entries carry the description verbatim so a
//! hash collision can never serve the wrong payload, plus a schema
//! version so format changes invalidate old entries cleanly. Writes go
//! through a temp file, fsync, and atomic rename under an `fd-lock` so
//! concurrent processes sharing the cache directory never observe a
//! partial entry.

use crate::api::{ApiResult, Request};
use chrono::Utc;
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current cache entry schema version.
const SCHEMA_VERSION: &str = "1.0.0";

/// Cache persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Filesystem operation failed.
    #[error("cache I/O error: {0}")]
    Io(String),

    /// Entry could not be serialized.
    #[error("cache serialization error: {0}")]
    Serialization(String),

    /// The cross-process lock could not be acquired.
    #[error("cache lock error: {0}")]
    Lock(String),
}

/// One persisted cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    schema_version: String,
    description: String,
    cached_at: i64,
    data: serde_json::Value,
}

/// A request whose successful payload is cached on disk.
pub struct CachedRequest {
    request: Request,
    expiry: chrono::Duration,
}

impl CachedRequest {
    /// Wrap a request with the given entry lifetime.
    pub fn new(request: Request, expiry: chrono::Duration) -> Self {
        Self { request, expiry }
    }

    /// Canonical description of this request: site identity, the
    /// authenticated-identity marker, and the sorted normalized
    /// parameters. Two requests share a cache entry only when their
    /// descriptions are byte-identical.
    async fn description(&mut self) -> ApiResult<String> {
        let maxlag = self.request.site().config().maxlag;
        self.request.params_mut().normalize(maxlag)?;
        let site_id = self.request.site().canonical_id();
        let user_key = self.request.site().identity_marker().await;
        let pairs = self.request.params().sorted_pairs();
        Ok(format!("{site_id}{user_key}{pairs:?}"))
    }

    fn entry_path(&self, description: &str) -> PathBuf {
        let digest = Sha256::digest(description.as_bytes());
        self.request
            .site()
            .config()
            .cache_dir
            .join(hex::encode(digest))
    }

    /// Load a valid entry, or `None` on miss, mismatch, or expiry.
    fn load(&self, path: &Path, description: &str) -> Option<serde_json::Value> {
        if !path.exists() {
            return None;
        }
        let entry = match read_entry(path) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Ignoring unreadable cache entry");
                return None;
            }
        };
        if entry.schema_version != SCHEMA_VERSION {
            debug!(
                found = %entry.schema_version,
                expected = SCHEMA_VERSION,
                "Ignoring cache entry with old schema"
            );
            return None;
        }
        if entry.description != description {
            // hash collision; the stored description is authoritative
            warn!(path = %path.display(), "Cache key collision detected; ignoring entry");
            return None;
        }
        let age = Utc::now().timestamp_millis() - entry.cached_at;
        if age < 0 || age > self.expiry.num_milliseconds() {
            debug!(path = %path.display(), age_ms = age, "Cache entry expired");
            return None;
        }
        Some(entry.data)
    }

    /// Submit through the cache: a valid entry short-circuits the
    /// network; a miss executes the wrapped request and persists the
    /// payload atomically.
    pub async fn submit(&mut self) -> ApiResult<serde_json::Value> {
        let description = self.description().await?;
        let path = self.entry_path(&description);
        if let Some(data) = self.load(&path, &description) {
            debug!(path = %path.display(), "Cache hit");
            return Ok(data);
        }
        let data = self.request.submit().await?;
        let entry = CacheEntry {
            schema_version: SCHEMA_VERSION.to_string(),
            description,
            cached_at: Utc::now().timestamp_millis(),
            data: data.clone(),
        };
        write_entry(&path, &entry)?;
        debug!(path = %path.display(), "Cached response");
        Ok(data)
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry, CacheError> {
    let lock_path = path.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| CacheError::Lock(format!("failed to open lock file: {e}")))?;
    let lock = RwLock::new(lock_file);
    let _guard = lock
        .read()
        .map_err(|e| CacheError::Lock(format!("failed to acquire read lock: {e}")))?;

    let contents = std::fs::read_to_string(path).map_err(|e| CacheError::Io(e.to_string()))?;
    serde_json::from_str(&contents).map_err(|e| CacheError::Serialization(e.to_string()))
}

fn write_entry(path: &Path, entry: &CacheEntry) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CacheError::Io(e.to_string()))?;
    }
    let json =
        serde_json::to_string(entry).map_err(|e| CacheError::Serialization(e.to_string()))?;

    let lock_path = path.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| CacheError::Lock(format!("failed to open lock file: {e}")))?;
    let mut lock = RwLock::new(lock_file);
    let _guard = lock
        .write()
        .map_err(|e| CacheError::Lock(format!("failed to acquire write lock: {e}")))?;

    let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
        .map_err(|e| CacheError::Io(format!("failed to create temp file: {e}")))?;
    temp_file
        .write_all(json.as_bytes())
        .map_err(|e| CacheError::Io(format!("failed to write temp file: {e}")))?;
    temp_file
        .flush()
        .map_err(|e| CacheError::Io(format!("failed to flush temp file: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| CacheError::Io(format!("failed to sync temp file: {e}")))?;
    temp_file
        .persist(path)
        .map_err(|e| CacheError::Io(format!("failed to persist temp file: {e}")))?;

    // make the rename itself durable
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
