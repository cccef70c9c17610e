//! Lock file that keeps state-mutating commands exclusive
//!
//! `scan`, `rollback`, `export` and `gc` all write the state database. Only
//! one of them may run against a workspace at a time.

use anyhow::{Context, Result};
use constellation_core::store::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "sync.lock";

/// Held for the lifetime of a mutating command
pub struct SyncLock {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
}

/// Lock file content
#[derive(Debug, Serialize, Deserialize)]
struct LockContent {
    pid: u32,
    started_at: u64,
    command: String,
}

impl SyncLock {
    /// Acquire the workspace lock without blocking
    ///
    /// A lock left behind by a process that no longer exists is removed and
    /// the acquisition retried once.
    pub fn acquire(locks_dir: &Path, command: &str) -> Result<Self> {
        Self::acquire_inner(locks_dir, command, true)
    }

    fn acquire_inner(locks_dir: &Path, command: &str, retry_stale: bool) -> Result<Self> {
        std::fs::create_dir_all(locks_dir).context("Failed to create locks directory")?;
        let lock_path = locks_dir.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .context("Failed to open lock file")?;

        if !try_flock_exclusive(&file)? {
            let holder = read_lock_content(&mut file).ok();
            let stale = holder.as_ref().map_or(true, |content| !is_process_alive(content.pid));
            if stale && retry_stale {
                tracing::warn!(path = %lock_path.display(), "removing stale sync lock");
                drop(file);
                std::fs::remove_file(&lock_path)?;
                return Self::acquire_inner(locks_dir, command, false);
            }
            match holder {
                Some(content) => anyhow::bail!(
                    "Another `cst {}` is running against this workspace (pid {})",
                    content.command,
                    content.pid
                ),
                None => anyhow::bail!("Workspace is locked by another cst process"),
            }
        }

        write_lock_content(&mut file, command)?;
        tracing::debug!(path = %lock_path.display(), command, "sync lock acquired");

        Ok(Self { path: lock_path, file })
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_lock_content(file: &mut File, command: &str) -> Result<()> {
    let content = LockContent {
        pid: std::process::id(),
        started_at: current_timestamp_ms(),
        command: command.to_string(),
    };
    let serialized = serde_json::to_string(&content).context("Failed to serialize lock content")?;

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serialized.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_lock_content(file: &mut File) -> Result<LockContent> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).context("Failed to deserialize lock content")
}

/// Try to acquire an exclusive file lock (non-blocking)
#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(target_os = "linux")]
fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Null signal: existence check only
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let locks = temp_dir.path().join("locks");

        let first = SyncLock::acquire(&locks, "scan")?;
        let second = SyncLock::acquire(&locks, "gc");
        let message = second.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("cst scan"), "unexpected: {message}");

        drop(first);
        assert!(SyncLock::acquire(&locks, "gc").is_ok());
        Ok(())
    }

    #[test]
    fn test_lock_file_removed_on_drop() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let locks = temp_dir.path().join("locks");

        let lock = SyncLock::acquire(&locks, "rollback")?;
        let path = lock.path.clone();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_lock_content() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(temp_dir.path().join("test.lock"))?;

        write_lock_content(&mut file, "export")?;
        let content = read_lock_content(&mut file)?;
        assert_eq!(content.pid, std::process::id());
        assert_eq!(content.command, "export");
        assert!(content.started_at > 0);
        Ok(())
    }

    #[test]
    fn test_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(999_999_999));
    }
}
