//! Device-local sync lock: at most one active cycle per device.
//!
//! The lock is a file holding the holder's pid. A stale file whose process is
//! gone is reclaimed; a live holder means this cycle is skipped. The guard
//! removes the file on drop, which covers every error path of a cycle.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

pub struct SyncLock {
    path: PathBuf,
}

/// Held for the duration of one cycle.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    // Signal 0 probes for existence. EPERM still means the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    // No cheap probe available; assume the holder is alive and skip.
    true
}

impl SyncLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn try_create(&self) -> io::Result<Option<LockGuard>> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())?;
                Ok(Some(LockGuard {
                    path: self.path.clone(),
                }))
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Acquire the lock, reclaiming it from a dead holder. `None` means
    /// another sync is running and this cycle should be skipped.
    pub fn acquire(&self) -> io::Result<Option<LockGuard>> {
        if let Some(guard) = self.try_create()? {
            return Ok(Some(guard));
        }

        let holder = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            // The holder finished in between; take over.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return self.try_create(),
            Err(err) => return Err(err),
        };

        match holder.trim().parse::<i32>() {
            Ok(pid) if pid_alive(pid) => Ok(None),
            _ => {
                tracing::warn!(path = %self.path.display(), holder = holder.trim(), "removing stale sync lock");
                let _ = fs::remove_file(&self.path);
                self.try_create()
            }
        }
    }
}
