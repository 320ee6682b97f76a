//! Integrity-verified artifact cache shared across processes.
//!
//! Layout under the cache root:
//!
//! ```text
//! modules/{group}/{name}/{version}/{file}          verified artifact
//! modules/{group}/{name}/{version}/{file}.digest   JSON verification record
//! locks/{blake3(key)}.lock                          per-key writer lock
//! tmp/                                              in-flight downloads
//! ```
//!
//! The `.digest` record is written last, so its presence marks the entry as
//! verified. Readers of verified entries take no lock. Writers hold the per-key
//! lock from the re-check until the record is in place.

pub mod lock;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use keel_schema::coordinate::check_path_segment;
use keel_schema::{ArtifactRef, Coordinate, Digest, DigestAlgorithm, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::future::Future;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::reporter::Reporter;
use crate::repository::Repository;
use crate::transport::{Cancelled, RetryPolicy, Retryable, TransportError, with_retry};

pub use lock::{LockGuard, LockOptions};

/// Artifact cache failure.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Downloaded or cached bytes do not hash to the expected digest.
    #[error("Digest mismatch for {}: expected {expected}, got {actual}", .path.display())]
    Integrity {
        /// Entry (or download target) path.
        path: PathBuf,
        /// Digest from the descriptor.
        expected: Digest,
        /// Digest found.
        actual: Digest,
    },

    /// Downloaded size differs from the descriptor.
    #[error("Size mismatch for {}: expected {expected} bytes, got {actual}", .path.display())]
    SizeMismatch {
        /// Download target path.
        path: PathBuf,
        /// Size from the descriptor.
        expected: u64,
        /// Bytes received.
        actual: u64,
    },

    /// Filesystem failure.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Another holder kept the lock for too long.
    #[error("Timed out after {}s waiting for lock {}", .waited.as_secs(), .path.display())]
    LockTimeout {
        /// Lock file.
        path: PathBuf,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The lock was reclaimed by another process mid-download.
    #[error("Lost lock {}", .path.display())]
    LockLost {
        /// Lock file.
        path: PathBuf,
    },

    /// The key's classifier or extension cannot be used as a file name part.
    #[error("Invalid cache key {key}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Download failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The fetch was cancelled.
    #[error("Download cancelled")]
    Cancelled,
}

impl Retryable for CacheError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_transient())
    }
}

impl From<Cancelled> for CacheError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Identity of one cached file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Module.
    pub coordinate: Coordinate,
    /// Version.
    pub version: Version,
    /// Classifier, `None` for the default artifact.
    pub classifier: Option<String>,
    /// File extension.
    pub extension: String,
}

impl CacheKey {
    /// Key for an artifact of `coordinate:version`.
    pub fn for_artifact(coordinate: &Coordinate, version: &Version, artifact: &ArtifactRef) -> Self {
        Self {
            coordinate: coordinate.clone(),
            version: version.clone(),
            classifier: artifact.classifier.clone(),
            extension: artifact.extension.clone(),
        }
    }

    /// Reject keys whose classifier or extension would leave the entry
    /// directory.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidKey`] naming the first unsafe part.
    pub fn validate(&self) -> Result<(), CacheError> {
        let parts = self.classifier.iter().chain(std::iter::once(&self.extension));
        for part in parts {
            check_path_segment(part).map_err(|reason| CacheError::InvalidKey {
                key: self.to_string(),
                reason,
            })?;
        }
        Ok(())
    }

    /// `{name}-{version}[-{classifier}].{ext}`
    pub fn file_name(&self) -> String {
        match &self.classifier {
            Some(classifier) => format!(
                "{}-{}-{classifier}.{}",
                self.coordinate.name(),
                self.version,
                self.extension
            ),
            None => format!(
                "{}-{}.{}",
                self.coordinate.name(),
                self.version,
                self.extension
            ),
        }
    }

    /// Entry path relative to the cache root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from("modules")
            .join(self.coordinate.group())
            .join(self.coordinate.name())
            .join(self.version.as_str())
            .join(self.file_name())
    }

    fn lock_name(&self) -> String {
        let hash = blake3::hash(self.to_string().as_bytes());
        format!("{}.lock", &hash.to_hex()[..32])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.coordinate, self.version)?;
        if let Some(classifier) = &self.classifier {
            write!(f, ":{classifier}")?;
        }
        write!(f, "@{}", self.extension)
    }
}

/// A verified file in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    /// Cache key.
    pub key: CacheKey,
    /// Absolute path of the verified file.
    pub path: PathBuf,
    /// Verified digest.
    pub digest: Digest,
    /// File size.
    pub size: u64,
    /// Served without a download.
    pub from_cache: bool,
}

/// Verification record stored next to each entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DigestRecord {
    digest: Digest,
    size: u64,
    source: String,
    verified_at: DateTime<Utc>,
}

/// Tuning of an [`ArtifactCache`].
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Re-hash entries on every hit instead of trusting the record.
    pub verify_hits: bool,
    /// Lock timing.
    pub lock: LockOptions,
    /// Retry budget for downloads.
    pub retry: RetryPolicy,
}

/// One artifact to fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Cache key.
    pub key: &'a CacheKey,
    /// Digest the bytes must hash to.
    pub expected: &'a Digest,
    /// Declared size, checked when present.
    pub size: Option<u64>,
    /// Repository serving the artifact.
    pub repository: &'a Repository,
    /// Artifact URL.
    pub url: &'a str,
}

/// Summary of [`ArtifactCache::verify_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Entries re-hashed.
    pub checked: usize,
    /// Entries whose file no longer matches its record.
    pub corrupt: Vec<PathBuf>,
    /// Files without a record, or records without a file.
    pub incomplete: Vec<PathBuf>,
}

/// Summary of [`ArtifactCache::clean`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanReport {
    /// Abandoned temporary files removed.
    pub temp_files: usize,
    /// Stale locks removed.
    pub locks: usize,
}

/// Handle to a cache directory.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
    options: CacheOptions,
}

impl ArtifactCache {
    /// Cache rooted at `root` with default options.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_options(root, CacheOptions::default())
    }

    /// Cache rooted at `root`.
    pub fn with_options(root: impl Into<PathBuf>, options: CacheOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Options in effect.
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Where the verified file for `key` lives.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    fn record_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".digest");
        path.with_file_name(name)
    }

    fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join("locks").join(key.lock_name())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Return a verified path for `request`, downloading it if needed.
    ///
    /// # Errors
    ///
    /// [`CacheError::Integrity`] if a cached entry is recorded with (or no
    /// longer hashes to) a different digest, or the download does not match.
    /// Transport, lock, I/O and cancellation errors otherwise.
    pub async fn fetch_artifact(
        &self,
        request: FetchRequest<'_>,
        reporter: &dyn Reporter,
        cancel: &CancellationToken,
    ) -> Result<CachedArtifact, CacheError> {
        request.key.validate()?;
        let path = self.path_for(request.key);
        if let Some(hit) = self.lookup(request.key, &path, request.expected).await? {
            debug!("Cache hit for {}", request.key);
            return Ok(hit);
        }

        let guard = LockGuard::acquire(&self.lock_path(request.key), &self.options.lock, cancel).await?;

        // Someone else may have finished while we waited.
        if let Some(hit) = self.lookup(request.key, &path, request.expected).await? {
            debug!("Cache hit for {} after waiting for lock", request.key);
            return Ok(hit);
        }
        if let Some(adopted) = self.adopt_unrecorded(request, &path).await? {
            return Ok(adopted);
        }

        let attempts = with_retry(&self.options.retry, cancel, request.url, || {
            self.download(request, &path, reporter, cancel)
        });
        let (digest, size) = keep_alive(&guard, self.options.lock.heartbeat, attempts).await?;

        info!("Cached {} ({size} bytes)", request.key);
        Ok(CachedArtifact {
            key: request.key.clone(),
            path,
            digest,
            size,
            from_cache: false,
        })
    }

    /// The verified entry for `key`, without touching the network.
    ///
    /// # Errors
    ///
    /// [`CacheError::Integrity`] if the entry is recorded with a different
    /// digest (or fails re-hashing when `verify_hits` is set).
    pub async fn get(
        &self,
        key: &CacheKey,
        expected: &Digest,
    ) -> Result<Option<CachedArtifact>, CacheError> {
        key.validate()?;
        self.lookup(key, &self.path_for(key), expected).await
    }

    async fn read_record(path: &Path) -> Result<Option<DigestRecord>, CacheError> {
        let record_path = Self::record_path(path);
        let bytes = match fs::read(&record_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&record_path)(e)),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| CacheError::Io {
            path: record_path,
            source: std::io::Error::new(ErrorKind::InvalidData, e),
        })
    }

    async fn lookup(
        &self,
        key: &CacheKey,
        path: &Path,
        expected: &Digest,
    ) -> Result<Option<CachedArtifact>, CacheError> {
        let Some(record) = Self::read_record(path).await? else {
            return Ok(None);
        };
        if record.digest != *expected {
            return Err(CacheError::Integrity {
                path: path.to_path_buf(),
                expected: expected.clone(),
                actual: record.digest,
            });
        }
        match fs::metadata(path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(path)(e)),
        }

        if self.options.verify_hits {
            let (actual, _) = hash_file(path, expected.algorithm()).await?;
            if actual != *expected {
                return Err(CacheError::Integrity {
                    path: path.to_path_buf(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(Some(CachedArtifact {
            key: key.clone(),
            path: path.to_path_buf(),
            digest: record.digest,
            size: record.size,
            from_cache: true,
        }))
    }

    /// Handle a file left without a record (crash before the record was
    /// written). Caller holds the lock.
    async fn adopt_unrecorded(
        &self,
        request: FetchRequest<'_>,
        path: &Path,
    ) -> Result<Option<CachedArtifact>, CacheError> {
        match fs::metadata(path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // A record without its file is useless.
                fs::remove_file(Self::record_path(path)).await.ok();
                return Ok(None);
            }
            Err(e) => return Err(io_error(path)(e)),
        }

        let (actual, size) = hash_file(path, request.expected.algorithm()).await?;
        if actual == *request.expected {
            debug!("Adopting unrecorded cache file {}", path.display());
            write_record(path, &actual, size, request.url).await?;
            return Ok(Some(CachedArtifact {
                key: request.key.clone(),
                path: path.to_path_buf(),
                digest: actual,
                size,
                from_cache: true,
            }));
        }

        warn!(
            "Discarding unverified cache file {} (digest {actual})",
            path.display()
        );
        fs::remove_file(path).await.map_err(io_error(path))?;
        Ok(None)
    }

    /// One download attempt into `tmp/`, verified, then moved into place.
    async fn download(
        &self,
        request: FetchRequest<'_>,
        dest: &Path,
        reporter: &dyn Reporter,
        cancel: &CancellationToken,
    ) -> Result<(Digest, u64), CacheError> {
        let key = request.key;
        let tmp_dir = self.tmp_dir();
        fs::create_dir_all(&tmp_dir).await.map_err(io_error(&tmp_dir))?;
        // Deleted on drop, so every early return and cancellation cleans up.
        let temp = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".part")
            .tempfile_in(&tmp_dir)
            .map_err(io_error(&tmp_dir))?
            .into_temp_path();

        let mut stream = tokio::select! {
            () = cancel.cancelled() => return Err(CacheError::Cancelled),
            stream = request.repository.fetch(request.url) => stream?,
        };

        let mut file = fs::File::create(&temp).await.map_err(io_error(&temp))?;
        let mut hasher = request.expected.algorithm().hasher();
        let mut written: u64 = 0;
        reporter.downloading(&key.coordinate, &key.version, 0, request.size);

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Err(CacheError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(io_error(&temp))?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
            reporter.downloading(&key.coordinate, &key.version, written, request.size);
        }
        file.flush().await.map_err(io_error(&temp))?;
        file.sync_all().await.map_err(io_error(&temp))?;
        drop(file);

        let actual = hasher.finalize();
        if actual != *request.expected {
            reporter.failed(&key.coordinate, &key.version, "digest mismatch");
            return Err(CacheError::Integrity {
                path: dest.to_path_buf(),
                expected: request.expected.clone(),
                actual,
            });
        }
        if let Some(expected) = request.size.filter(|&s| s != written) {
            return Err(CacheError::SizeMismatch {
                path: dest.to_path_buf(),
                expected,
                actual: written,
            });
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(io_error(parent))?;
        }
        temp.persist(dest).map_err(|e| CacheError::Io {
            path: dest.to_path_buf(),
            source: e.error,
        })?;
        write_record(dest, &actual, written, request.url).await?;
        Ok((actual, written))
    }

    /// Re-hash every recorded entry.
    ///
    /// # Errors
    ///
    /// Only on I/O failures that prevent reading the cache.
    pub async fn verify_all(&self) -> Result<VerifyReport, CacheError> {
        let modules = self.root.join("modules");
        let mut report = VerifyReport::default();
        if !modules.exists() {
            return Ok(report);
        }

        let files: Vec<PathBuf> = WalkDir::new(&modules)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .collect();

        for path in &files {
            let is_record = path.extension().is_some_and(|e| e == "digest");
            if is_record {
                let mut artifact = path.clone();
                artifact.set_extension("");
                if !artifact.exists() {
                    report.incomplete.push(artifact);
                }
                continue;
            }

            let Some(record) = Self::read_record(path).await? else {
                report.incomplete.push(path.clone());
                continue;
            };
            let (actual, _) = hash_file(path, record.digest.algorithm()).await?;
            report.checked += 1;
            if actual != record.digest {
                warn!("Corrupt cache entry {}", path.display());
                report.corrupt.push(path.clone());
            }
        }
        Ok(report)
    }

    /// Remove temporary files older than `max_age` and stale locks.
    ///
    /// # Errors
    ///
    /// On I/O failures listing the cache directories.
    pub async fn clean(&self, max_age: Duration) -> Result<CleanReport, CacheError> {
        let mut report = CleanReport::default();

        for path in list_dir(&self.tmp_dir()).await? {
            let Ok(metadata) = fs::metadata(&path).await else {
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or_default();
            if age >= max_age && fs::remove_file(&path).await.is_ok() {
                report.temp_files += 1;
            }
        }

        for path in list_dir(&self.root.join("locks")).await? {
            if path.extension().is_some_and(|e| e == "lock")
                && lock::reclaim_if_stale(&path, self.options.lock.stale_after).await?
                && !path.exists()
            {
                report.locks += 1;
            }
        }

        debug!(
            "Cache clean: {} temp file(s), {} lock(s)",
            report.temp_files, report.locks
        );
        Ok(report)
    }

    /// Delete the entry for `key` so the next fetch downloads it again.
    /// Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// On lock or I/O failures.
    pub async fn invalidate(
        &self,
        key: &CacheKey,
        cancel: &CancellationToken,
    ) -> Result<bool, CacheError> {
        key.validate()?;
        let _guard = LockGuard::acquire(&self.lock_path(key), &self.options.lock, cancel).await?;
        let path = self.path_for(key);
        let mut removed = false;
        // Record first: without it the file is no longer considered verified.
        for target in [Self::record_path(&path), path] {
            match fs::remove_file(&target).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&target)(e)),
            }
        }
        if removed {
            info!("Invalidated {key}");
        }
        Ok(removed)
    }
}

/// Drive `work` to completion while refreshing `guard` every `heartbeat`,
/// so connect waits and retry backoffs keep the lock alive too. Losing the
/// lock abandons the work.
async fn keep_alive<T>(
    guard: &LockGuard,
    heartbeat: Duration,
    work: impl Future<Output = Result<T, CacheError>>,
) -> Result<T, CacheError> {
    tokio::pin!(work);
    let mut ticker = tokio::time::interval(heartbeat.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and the lock was just taken.
    ticker.tick().await;
    loop {
        tokio::select! {
            result = &mut work => return result,
            _ = ticker.tick() => guard.refresh().await?,
        }
    }
}

async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(dir)(e)),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error(dir))? {
        paths.push(entry.path());
    }
    Ok(paths)
}

/// Stream a file through the digest algorithm.
async fn hash_file(path: &Path, algorithm: DigestAlgorithm) -> Result<(Digest, u64), CacheError> {
    let mut file = fs::File::open(path).await.map_err(io_error(path))?;
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size: u64 = 0;
    loop {
        let n = file.read(&mut buf).await.map_err(io_error(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize(), size))
}

/// Write the verification record next to `path` (temp file + rename).
async fn write_record(path: &Path, digest: &Digest, size: u64, source: &str) -> Result<(), CacheError> {
    let record = DigestRecord {
        digest: digest.clone(),
        size,
        source: source.to_string(),
        verified_at: Utc::now(),
    };
    let record_path = ArtifactCache::record_path(path);
    let bytes = serde_json::to_vec_pretty(&record).map_err(|e| CacheError::Io {
        path: record_path.clone(),
        source: std::io::Error::other(e),
    })?;

    let mut temp_name = record_path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(format!(".{:016x}.tmp", rand::random::<u64>()));
    let temp_path = record_path.with_file_name(temp_name);
    fs::write(&temp_path, &bytes).await.map_err(io_error(&temp_path))?;
    if let Err(e) = fs::rename(&temp_path, &record_path).await {
        fs::remove_file(&temp_path).await.ok();
        return Err(io_error(&record_path)(e));
    }
    Ok(())
}
