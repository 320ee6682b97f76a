//! Cross-process advisory lock files.
//!
//! A lock is a file created with `create_new` holding the owner's pid and a
//! random token. Holders refresh its mtime while they work; a lock whose mtime
//! is older than `stale_after` belongs to a dead or wedged process and is
//! reclaimed. A guard only ever deletes a lock file that still carries its
//! own token.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::CacheError;

/// Timing of lock acquisition and liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Age after which an unrefreshed lock is considered abandoned.
    pub stale_after: Duration,
    /// How often a holder refreshes its lock while downloading.
    pub heartbeat: Duration,
    /// Give up waiting for a live holder after this long.
    pub wait_timeout: Duration,
    /// Delay between acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(120),
            heartbeat: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(100),
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn owner_token(contents: &str) -> Option<&str> {
    contents.lines().nth(1).map(str::trim)
}

fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default()
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
}

impl LockGuard {
    /// Take the lock at `path`, waiting for a live holder and reclaiming a
    /// stale one.
    ///
    /// # Errors
    ///
    /// [`CacheError::LockTimeout`] after `wait_timeout`,
    /// [`CacheError::Cancelled`] if `cancel` fires while waiting, and
    /// [`CacheError::Io`] on filesystem failures.
    pub async fn acquire(
        path: &Path,
        options: &LockOptions,
        cancel: &CancellationToken,
    ) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error(parent))?;
        }

        let token = format!("{:016x}", rand::random::<u64>());
        let contents = format!("{}\n{token}\n", std::process::id());
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(contents.as_bytes()).await {
                        drop(file);
                        fs::remove_file(path).await.ok();
                        return Err(io_error(path)(e));
                    }
                    trace!("Acquired lock {}", path.display());
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if reclaim_if_stale(path, options.stale_after).await? {
                        continue;
                    }
                }
                Err(e) => return Err(io_error(path)(e)),
            }

            let waited = started.elapsed();
            if waited >= options.wait_timeout {
                return Err(CacheError::LockTimeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(CacheError::Cancelled),
                () = tokio::time::sleep(options.poll_interval) => {}
            }
        }
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bump the lock's mtime so waiters do not consider it stale.
    ///
    /// # Errors
    ///
    /// [`CacheError::LockLost`] if the file no longer carries this guard's
    /// token (it was reclaimed), [`CacheError::Io`] otherwise.
    pub async fn refresh(&self) -> Result<(), CacheError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CacheError::LockLost {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(io_error(&self.path)(e)),
        };
        if owner_token(&contents) != Some(self.token.as_str()) {
            return Err(CacheError::LockLost {
                path: self.path.clone(),
            });
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(io_error(&self.path))?
            .into_std()
            .await;
        file.set_modified(SystemTime::now())
            .map_err(io_error(&self.path))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Sync I/O: drop cannot await, and the file is tiny.
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if owner_token(&contents) == Some(self.token.as_str()) => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!("Failed to release lock {}: {e}", self.path.display());
                } else {
                    trace!("Released lock {}", self.path.display());
                }
            }
            Ok(_) => debug!("Lock {} was taken over; leaving it", self.path.display()),
            Err(_) => {}
        }
    }
}

/// Remove the lock at `path` if it is stale. Returns true when the caller
/// should retry acquisition immediately.
pub(crate) async fn reclaim_if_stale(path: &Path, stale_after: Duration) -> Result<bool, CacheError> {
    let metadata = match fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(io_error(path)(e)),
    };
    let modified = metadata.modified().map_err(io_error(path))?;
    if age_of(modified) < stale_after {
        return Ok(false);
    }

    // Move it aside first so two reclaimers cannot both delete a fresh lock
    // created in between.
    let aside = path.with_extension(format!("stale-{:016x}", rand::random::<u64>()));
    match fs::rename(path, &aside).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(io_error(path)(e)),
    }

    let moved = fs::metadata(&aside).await.map_err(io_error(&aside))?;
    let moved_modified = moved.modified().map_err(io_error(&aside))?;
    if age_of(moved_modified) < stale_after {
        // Raced with a new holder; put its lock back.
        match fs::hard_link(&aside, path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                fs::remove_file(&aside).await.ok();
                return Err(io_error(path)(e));
            }
        }
        fs::remove_file(&aside).await.ok();
        return Ok(false);
    }

    let owner = fs::read_to_string(&aside)
        .await
        .ok()
        .and_then(|c| c.lines().next().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    warn!(
        "Reclaiming stale lock {} (pid {owner}, idle {}s)",
        path.display(),
        age_of(moved_modified).as_secs()
    );
    fs::remove_file(&aside).await.ok();
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> LockOptions {
        LockOptions {
            stale_after: Duration::from_secs(60),
            heartbeat: Duration::from_millis(10),
            wait_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn backdate(path: &Path, by: Duration) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks/a.lock");
        let cancel = CancellationToken::new();

        let guard = LockGuard::acquire(&path, &fast(), &cancel).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents.lines().next().unwrap(),
            std::process::id().to_string()
        );
        guard.refresh().await.unwrap();
        drop(guard);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn live_lock_times_out_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let cancel = CancellationToken::new();

        let _held = LockGuard::acquire(&path, &fast(), &cancel).await.unwrap();
        let err = LockGuard::acquire(&path, &fast(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn waiter_gets_the_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let cancel = CancellationToken::new();
        let mut options = fast();
        options.wait_timeout = Duration::from_secs(5);

        let held = LockGuard::acquire(&path, &options, &cancel).await.unwrap();
        let waiter = {
            let path = path.clone();
            let options = options.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { LockGuard::acquire(&path, &options, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let second = waiter.await.unwrap().unwrap();
        assert!(second.path().exists());
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        std::fs::write(&path, "99999\ndeadbeef\n").unwrap();
        backdate(&path, Duration::from_secs(3600));

        let guard = LockGuard::acquire(&path, &fast(), &CancellationToken::new())
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_ne!(owner_token(&contents), Some("deadbeef"));
        drop(guard);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn taken_over_lock_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let guard = LockGuard::acquire(&path, &fast(), &CancellationToken::new())
            .await
            .unwrap();

        std::fs::write(&path, "1\nsomeone-else\n").unwrap();
        assert!(matches!(
            guard.refresh().await,
            Err(CacheError::LockLost { .. })
        ));
        drop(guard);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let mut options = fast();
        options.wait_timeout = Duration::from_secs(30);
        let _held = LockGuard::acquire(&path, &options, &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let err = LockGuard::acquire(&path, &options, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
    }
}
