//! lock_manager.rs
//! Named, file-backed locks for resources shared between controllers.
//!
//! A lock is a file created with `create_new`; whoever creates it holds the lock. The file
//! records the holder's pid and acquisition time so a lock left behind by a crashed holder
//! can be recognised as stale and broken.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant, SystemTime},
};

use crate::error::{ControlError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock files live in the manager's directory; `name` must be a plain file name.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ControlError::Lock(format!("invalid lock name '{}'", name)));
        }
        Ok(self.dir.join(name))
    }

    /// Polls for the lock until `timeout` seconds pass. `Ok(None)` means it timed out.
    pub fn acquire(&self, name: &str, timeout: f64) -> Result<Option<LockGuard>> {
        let path = self.path_for(name)?;
        let deadline = Instant::now() + Duration::from_secs_f64(timeout.max(0.0));
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339())?;
                    debug!("[Lock] Acquired {:?}", path);
                    return Ok(Some(LockGuard { path, released: false }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.exists()).unwrap_or(false)
    }

    /// Removes the lock regardless of holder.
    pub fn release(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// When the lock was taken, if it is held and readable.
    pub fn locked_since(&self, name: &str) -> Option<DateTime<Utc>> {
        let path = self.path_for(name).ok()?;
        let text = fs::read_to_string(path).ok()?;
        let stamp = text.split_whitespace().nth(1)?;
        DateTime::parse_from_rfc3339(stamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    fn file_age(&self, name: &str) -> Option<Duration> {
        let modified = fs::metadata(self.path_for(name).ok()?).ok()?.modified().ok()?;
        Some(SystemTime::now().duration_since(modified).unwrap_or_default())
    }

    /// Breaks the lock if it has been held longer than `max_age` seconds.
    /// A lock file without a readable timestamp is aged by its modification time, since
    /// its holder may not have written the stamp yet.
    pub fn break_if_stale(&self, name: &str, max_age: f64) -> Result<bool> {
        if !self.is_locked(name) {
            return Ok(false);
        }
        let stale = match self.locked_since(name) {
            Some(since) => (Utc::now() - since).num_milliseconds() as f64 / 1000.0 > max_age,
            None => match self.file_age(name) {
                Some(age) => age.as_secs_f64() > max_age,
                None => false,
            },
        };
        if stale {
            warn!("[Lock] Breaking stale lock '{}'", name);
            self.release(name)?;
        }
        Ok(stale)
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("[Lock] Failed to release {:?}: {}", self.path, e);
                }
            }
        }
    }
}
