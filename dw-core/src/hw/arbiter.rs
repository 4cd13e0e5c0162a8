//! Exclusive access to the physical SMBus
//!
//! Every multi-register sequence against the host controller runs under one
//! [`BusGuard`]. The arbiter combines an in-process mutex (so our own polling
//! threads never interleave) with an advisory `flock` on a well-known lock file
//! (so other processes that honor the same file do not either).
//!
//! Acquisition is always bounded. A contended or wedged bus degrades a single
//! reading to "unavailable" instead of stalling the polling loop.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::constants::{paths, timeouts};
use crate::error::{DimmwatchError, Result};

static GLOBAL_ARBITER: OnceLock<Arc<BusArbiter>> = OnceLock::new();

/// Cross-process lock backed by `flock(2)` on a lock file
#[derive(Debug)]
struct NamedLock {
    file: File,
    path: PathBuf,
}

enum TryLock {
    Acquired,
    Contended,
    Unusable(io::Error),
}

impl NamedLock {
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    fn try_lock(&self) -> TryLock {
        // SAFETY: the descriptor is owned by `self.file` and stays open for the call.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return TryLock::Acquired;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => TryLock::Contended,
            _ => TryLock::Unusable(err),
        }
    }

    fn unlock(&self) {
        // SAFETY: as above. Unlocking a lock we do not hold is harmless.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            debug!(
                "flock unlock on {} failed: {}",
                self.path.display(),
                io::Error::last_os_error()
            );
        }
    }
}

/// Process-wide (and optionally cross-process) SMBus lock
#[derive(Debug)]
pub struct BusArbiter {
    local: Mutex<()>,
    named: Option<NamedLock>,
}

impl Default for BusArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl BusArbiter {
    /// Arbiter with only the in-process lock
    pub fn new() -> Self {
        Self {
            local: Mutex::new(()),
            named: None,
        }
    }

    /// Arbiter that also takes the cross-process lock at `path`.
    ///
    /// If the lock file cannot be opened the arbiter still works with the
    /// in-process lock alone.
    pub fn with_lock_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let named = match NamedLock::open(path) {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!(
                    "Cannot open SMBus lock file {}: {} (continuing with in-process lock only)",
                    path.display(),
                    e
                );
                None
            }
        };
        Self {
            local: Mutex::new(()),
            named,
        }
    }

    /// The shared arbiter for this process, using the default lock file
    pub fn global() -> Arc<BusArbiter> {
        GLOBAL_ARBITER
            .get_or_init(|| Arc::new(BusArbiter::with_lock_file(paths::SMBUS_LOCK_FILE)))
            .clone()
    }

    /// Whether the cross-process lock is in use
    pub fn has_named_lock(&self) -> bool {
        self.named.is_some()
    }

    /// Wait at most `timeout` for exclusive bus access.
    pub fn acquire(&self, timeout: Duration) -> Result<BusGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let timed_out = || DimmwatchError::LockTimeout {
            timeout_ms: timeout.as_millis() as u64,
        };

        let local = self.local.try_lock_for(timeout).ok_or_else(|| {
            debug!("SMBus lock busy in-process for {:?}", timeout);
            timed_out()
        })?;

        let Some(named) = &self.named else {
            return Ok(BusGuard {
                _local: local,
                named: None,
            });
        };

        loop {
            match named.try_lock() {
                TryLock::Acquired => {
                    trace!("SMBus lock acquired");
                    return Ok(BusGuard {
                        _local: local,
                        named: Some(named),
                    });
                }
                TryLock::Unusable(e) => {
                    // Treat a broken lock file like a missing one.
                    debug!("flock on {} unusable: {}", named.path.display(), e);
                    return Ok(BusGuard {
                        _local: local,
                        named: None,
                    });
                }
                TryLock::Contended => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("SMBus lock held by another process for {:?}", timeout);
                        return Err(timed_out());
                    }
                    thread::sleep(timeouts::LOCK_POLL_STEP.min(deadline - now));
                }
            }
        }
    }
}

/// Proof of exclusive bus access. Released on drop.
#[derive(Debug)]
#[must_use = "the bus is released as soon as the guard is dropped"]
pub struct BusGuard<'a> {
    _local: MutexGuard<'a, ()>,
    named: Option<&'a NamedLock>,
}

impl BusGuard<'_> {
    /// Release the bus now instead of at end of scope
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        // The named lock goes first; the local guard is dropped after this body.
        if let Some(named) = self.named.take() {
            named.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let arbiter = BusArbiter::new();
        let guard = arbiter.acquire(Duration::from_millis(10)).unwrap();
        guard.release();
        assert!(arbiter.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_guard_is_debug() {
        let arbiter = BusArbiter::new();
        let guard = arbiter.acquire(Duration::from_millis(10)).unwrap();
        assert!(format!("{:?}", guard).starts_with("BusGuard"));
        let held = arbiter.acquire(Duration::from_millis(5));
        assert!(format!("{:?}", held).contains("LockTimeout"));
    }

    #[test]
    fn test_contended_acquire_times_out_within_bound() {
        let arbiter = Arc::new(BusArbiter::new());
        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let holder = {
            let arbiter = arbiter.clone();
            thread::spawn(move || {
                let _guard = arbiter.acquire(Duration::from_millis(100)).unwrap();
                locked_tx.send(()).unwrap();
                let _ = done_rx.recv_timeout(Duration::from_secs(5));
            })
        };

        locked_rx.recv().unwrap();
        let start = Instant::now();
        let err = arbiter.acquire(Duration::from_millis(50)).unwrap_err();
        let waited = start.elapsed();

        assert!(matches!(err, DimmwatchError::LockTimeout { timeout_ms: 50 }));
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(2));

        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(arbiter.acquire(Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_lock_file_is_used_when_available() {
        let dir = TempDir::new().unwrap();
        let arbiter = BusArbiter::with_lock_file(dir.path().join("smbus.lock"));
        assert!(arbiter.has_named_lock());
        let guard = arbiter.acquire(Duration::from_millis(10)).unwrap();
        drop(guard);
        assert!(arbiter.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_named_lock_excludes_second_holder() {
        // Two arbiters on one file stand in for two processes: flock locks are
        // per open file description.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("smbus.lock");
        let first = BusArbiter::with_lock_file(&path);
        let second = BusArbiter::with_lock_file(&path);

        let guard = first.acquire(Duration::from_millis(10)).unwrap();
        let err = second.acquire(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DimmwatchError::LockTimeout { .. }));

        drop(guard);
        assert!(second.acquire(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn test_abandoned_named_lock_is_acquirable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("smbus.lock");
        let second = BusArbiter::with_lock_file(&path);
        {
            let crashed = BusArbiter::with_lock_file(&path);
            let guard = crashed.acquire(Duration::from_millis(10)).unwrap();
            // The holder goes away without releasing; closing its descriptor drops the flock.
            std::mem::forget(guard);
        }
        assert!(second.acquire(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn test_unopenable_lock_file_falls_back_to_local_lock() {
        let arbiter = BusArbiter::with_lock_file("/proc/dimmwatch/denied/smbus.lock");
        assert!(!arbiter.has_named_lock());
        let guard = arbiter.acquire(Duration::from_millis(10)).unwrap();
        guard.release();
        assert!(arbiter.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    #[serial]
    fn test_global_is_shared() {
        let a = BusArbiter::global();
        let b = BusArbiter::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
