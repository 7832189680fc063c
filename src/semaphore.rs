//! Cross-process file-based semaphore.
//!
//! A held lock is a file at a caller-chosen path containing the holder's
//! PID, acquisition timestamp, and optional tag. Acquisition publishes a
//! fully-written record atomically, so the lock file is the
//! linearization point: whichever process's publish lands first holds
//! the lock, and nobody ever reads a partial record.
//!
//! Guarantees hold on local filesystems only. On network filesystems
//! without atomic link/rename semantics all bets are off.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::atomic::{self, ExclusivePublish};
use crate::error::LockError;
use crate::lock_file::LockRecord;
use crate::path_guard;

/// Semaphore behavior knobs.
#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    /// Age past which a lock held by a dead process may be reclaimed.
    pub stale_timeout: Duration,
    /// Sleep between attempts inside a blocking acquire.
    pub retry_interval: Duration,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(3600),
            retry_interval: Duration::from_millis(100),
        }
    }
}

/// Snapshot of a lock's state, as reported by `status`.
#[derive(Debug, Clone)]
pub struct LockStatus {
    pub locked: bool,
    pub record: Option<LockRecord>,
    pub is_stale: bool,
    pub owned_by_current_process: bool,
}

/// A mutual-exclusion primitive keyed by a filesystem path.
#[derive(Debug)]
pub struct Semaphore {
    path: PathBuf,
    config: SemaphoreConfig,
}

impl Semaphore {
    /// Opens a semaphore at `path` after validating it.
    ///
    /// No filesystem state is created; the lock exists only while held.
    pub fn open(path: &Path, config: SemaphoreConfig) -> Result<Self, LockError> {
        let path = path_guard::resolve_lock_path(path)?;
        Ok(Self { path, config })
    }

    pub fn with_defaults(path: &Path) -> Result<Self, LockError> {
        Self::open(path, SemaphoreConfig::default())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempts to take the lock without blocking.
    ///
    /// A stale or corrupted existing lock is removed and the attempt
    /// retried once; a live holder surfaces `AlreadyLocked` with the
    /// holder's PID and tag.
    pub fn try_acquire(&self, tag: Option<&str>) -> Result<LockRecord, LockError> {
        let tag = tag.and_then(path_guard::sanitize_tag);
        let record = LockRecord::for_current_process(tag);
        let contents = record.serialize();

        match atomic::write_exclusive(&self.path, contents.as_bytes())? {
            ExclusivePublish::Published => {
                debug!(path = %self.path.display(), pid = record.pid, "lock acquired");
                return Ok(record);
            }
            ExclusivePublish::TargetExists => {}
        }

        // Contended. Inspect the holder before giving up.
        match self.read_record() {
            Ok(Some(existing)) => {
                if !existing.is_stale(self.config.stale_timeout.as_secs()) {
                    return Err(LockError::AlreadyLocked {
                        holder_pid: Some(existing.pid),
                        holder_tag: existing.tag,
                    });
                }
                warn!(
                    path = %self.path.display(),
                    holder_pid = existing.pid,
                    "removing stale lock"
                );
                self.remove_lock_file()?;
            }
            Ok(None) => {
                // Holder released between our publish attempt and the
                // read; fall through to the single retry.
            }
            Err(LockError::Parse { reason }) => {
                warn!(path = %self.path.display(), %reason, "removing corrupted lock");
                self.remove_lock_file()?;
            }
            Err(e) => return Err(e),
        }

        // One retry after reclaiming. The removal itself can race with
        // another acquirer, so a second conflict is surfaced as held.
        match atomic::write_exclusive(&self.path, contents.as_bytes())? {
            ExclusivePublish::Published => {
                debug!(path = %self.path.display(), pid = record.pid, "lock acquired after reclaim");
                Ok(record)
            }
            ExclusivePublish::TargetExists => {
                let holder = self.read_record().ok().flatten();
                Err(LockError::AlreadyLocked {
                    holder_pid: holder.as_ref().map(|r| r.pid),
                    holder_tag: holder.and_then(|r| r.tag),
                })
            }
        }
    }

    /// Acquires the lock, retrying until `timeout` elapses.
    ///
    /// A zero timeout degenerates to a single non-blocking attempt, so a
    /// contended lock surfaces `AlreadyLocked` rather than `Timeout`.
    /// The budget is checked both before the first sleep and after every
    /// sleep.
    pub fn acquire(&self, timeout: Duration, tag: Option<&str>) -> Result<LockRecord, LockError> {
        if timeout.is_zero() {
            return self.try_acquire(tag);
        }

        let start = Instant::now();
        loop {
            match self.try_acquire(tag) {
                Ok(record) => return Ok(record),
                Err(LockError::AlreadyLocked { .. }) => {
                    if start.elapsed() >= timeout {
                        return Err(self.timeout_error(start));
                    }
                    let remaining = timeout.saturating_sub(start.elapsed());
                    thread::sleep(self.config.retry_interval.min(remaining));
                    if start.elapsed() >= timeout {
                        return Err(self.timeout_error(start));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Releases the lock.
    ///
    /// Without `force`, only the recorded holder may release; a mismatch
    /// surfaces `PermissionDenied` with the holder's PID. `force`
    /// bypasses the ownership check but still removes exactly one file.
    pub fn release(&self, force: bool) -> Result<(), LockError> {
        match self.read_record() {
            Ok(Some(record)) => {
                if !force && !record.is_owned_by_current_process() {
                    return Err(LockError::PermissionDenied {
                        holder_pid: record.pid,
                    });
                }
            }
            Ok(None) => return Err(LockError::NotLocked),
            Err(LockError::Parse { reason }) => {
                if !force {
                    return Err(LockError::Parse { reason });
                }
                // Forced: an unreadable lock is removed like any other.
            }
            Err(e) => return Err(e),
        }
        self.remove_lock_file()?;
        debug!(path = %self.path.display(), force, "lock released");
        Ok(())
    }

    /// Reports the lock's current state. Never fails: an unreadable or
    /// unparsable lock file reports as locked with no record.
    pub fn status(&self) -> LockStatus {
        match self.read_record() {
            Ok(Some(record)) => LockStatus {
                locked: true,
                is_stale: record.is_stale(self.config.stale_timeout.as_secs()),
                owned_by_current_process: record.is_owned_by_current_process(),
                record: Some(record),
            },
            Ok(None) => LockStatus {
                locked: false,
                record: None,
                is_stale: false,
                owned_by_current_process: false,
            },
            Err(_) => LockStatus {
                locked: true,
                record: None,
                is_stale: false,
                owned_by_current_process: false,
            },
        }
    }

    /// Returns the current lock record, or `None` when the lock is free.
    pub fn lock_info(&self) -> Result<Option<LockRecord>, LockError> {
        self.read_record()
    }

    /// Removes the lock if it is stale, plus any orphaned temp files
    /// older than the stale timeout. Returns whether anything was
    /// removed.
    pub fn clean_stale(&self) -> Result<bool, LockError> {
        let mut removed = false;

        if let Ok(Some(record)) = self.read_record() {
            if record.is_stale(self.config.stale_timeout.as_secs()) {
                self.remove_lock_file()?;
                debug!(path = %self.path.display(), holder_pid = record.pid, "stale lock cleaned");
                removed = true;
            }
        }

        removed |= atomic::remove_stale_temps(&self.path, self.config.stale_timeout)? > 0;
        Ok(removed)
    }

    /// Blocking acquire that hands back an RAII guard owning this
    /// semaphore; the lock is released when the guard drops, on every
    /// exit path.
    pub fn acquire_guard(
        self,
        timeout: Duration,
        tag: Option<&str>,
    ) -> Result<SemaphoreGuard, LockError> {
        self.acquire(timeout, tag)?;
        Ok(SemaphoreGuard { semaphore: self })
    }

    fn timeout_error(&self, start: Instant) -> LockError {
        LockError::Timeout {
            waited_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn read_record(&self) -> Result<Option<LockRecord>, LockError> {
        // Open-and-interpret rather than exists-then-open: the holder
        // may release between the two steps.
        match fs::read_to_string(&self.path) {
            Ok(contents) => LockRecord::parse(&contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Err(LockError::Parse {
                reason: "lock file is not UTF-8".to_string(),
            }),
            Err(source) => Err(LockError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn remove_lock_file(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Releases the held lock on drop. Used by the registry to keep its
/// critical sections exception-safe.
#[derive(Debug)]
pub struct SemaphoreGuard {
    semaphore: Semaphore,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        if let Err(e) = self.semaphore.release(false) {
            warn!(path = %self.semaphore.path().display(), error = %e, "failed to release lock");
        }
    }
}
