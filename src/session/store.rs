//! Durable session store: one JSON file keyed by session name.
//!
//! Every read and write happens under an exclusive `flock` on a sidecar `.lock` file,
//! and writes go through [`atomic_write`]. A file that fails to parse is copied to
//! `<file>.corrupted` and treated as empty.

use crate::config::types::{Result, SandboxError, Session};
use libc::{flock, LOCK_EX};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub type SessionMap = BTreeMap<String, Session>;

/// Atomically write content to a file: write to temp → fsync → rename → fsync parent dir.
pub fn atomic_write(target: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent dir"))?;

    // Same directory so the rename stays on one filesystem
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        target.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));

    {
        let mut f = fs::File::create(&temp_path)?;
        f.write_all(content)?;
        f.sync_all()?;
    }

    fs::rename(&temp_path, target)?;

    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Sidecar lock path (`sessions.json` → `sessions.json.lock`)
pub fn lock_path_for(file_path: &Path) -> PathBuf {
    file_path.with_extension(
        file_path
            .extension()
            .map(|e| format!("{}.lock", e.to_string_lossy()))
            .unwrap_or_else(|| "lock".to_string()),
    )
}

/// Run `operation` while holding an exclusive lock on the sidecar lock file.
/// The lock file is never removed, so two processes can never lock different inodes.
pub fn with_file_lock<T, F>(file_path: &Path, operation: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let lock_path = lock_path_for(file_path);

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)?;

    let flock_result = unsafe { flock(lock_file.as_raw_fd(), LOCK_EX) };
    if flock_result != 0 {
        return Err(SandboxError::Registry(format!(
            "Failed to lock {}: {}",
            lock_path.display(),
            std::io::Error::last_os_error()
        )));
    }

    // Released when lock_file is closed
    operation()
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Unlocked read with corruption recovery; callers hold the lock.
    fn read_unlocked(&self) -> Result<SessionMap> {
        if !self.path.exists() {
            return Ok(SessionMap::new());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(SessionMap::new());
        }

        match serde_json::from_str(&content) {
            Ok(parsed) => Ok(parsed),
            Err(e) => {
                log::warn!(
                    "{} is corrupted ({}), backing up and starting fresh",
                    self.path.display(),
                    e
                );
                let backup_path = PathBuf::from(format!("{}.corrupted", self.path.display()));
                let _ = fs::copy(&self.path, &backup_path);
                Ok(SessionMap::new())
            }
        }
    }

    /// Snapshot of every record
    pub fn load(&self) -> Result<SessionMap> {
        self.ensure_parent()?;
        with_file_lock(&self.path, || self.read_unlocked())
    }

    /// Read-modify-write under the lock. The file is only rewritten when `update` succeeds.
    pub fn update<T, F>(&self, update: F) -> Result<T>
    where
        F: FnOnce(&mut SessionMap) -> Result<T>,
    {
        self.ensure_parent()?;
        with_file_lock(&self.path, || {
            let mut sessions = self.read_unlocked()?;
            let value = update(&mut sessions)?;

            let content = serde_json::to_string_pretty(&sessions).map_err(|e| {
                SandboxError::Registry(format!("Failed to serialize sessions: {}", e))
            })?;
            atomic_write(&self.path, content.as_bytes())?;

            Ok(value)
        })
    }
}
