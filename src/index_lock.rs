//! Advisory multi-writer exclusion for the DAT index.
//!
//! A port of `index_lock.py`: a JSON lock file recording pid + process
//! start time, created with an exclusive-create open so two writers
//! racing for the same index both fail but one. A lock is considered
//! stale (and taken over) when its recorded pid is gone or its process
//! start time no longer matches, which survives pid reuse in a way a
//! bare pid check would not.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

use crate::error::{Result, RomSorterError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    process_start_time: u64,
    created_at_utc: DateTime<Utc>,
    hostname: String,
    user: String,
    index_path: PathBuf,
}

pub struct IndexLockGuard {
    lock_path: PathBuf,
}

impl Drop for IndexLockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn current_process_start_time(system: &System, pid: u32) -> Option<u64> {
    system.process(Pid::from_u32(pid)).map(|p| p.start_time())
}

fn is_lock_valid(info: &LockInfo) -> bool {
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    match current_process_start_time(&system, info.pid) {
        Some(start_time) => start_time == info.process_start_time,
        None => false,
    }
}

fn write_lock_info(lock_path: &Path, index_path: &Path) -> Result<LockInfo> {
    let pid = std::process::id();
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    let process_start_time = current_process_start_time(&system, pid).unwrap_or(0);

    Ok(LockInfo {
        pid,
        process_start_time,
        created_at_utc: Utc::now(),
        hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
        user: std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string()),
        index_path: index_path.to_path_buf(),
    })
}

/// Acquire the lock at `lock_path`, taking over a stale lock (dead pid or
/// mismatched process start time) at most once before giving up.
pub fn acquire_index_lock(lock_path: &Path, index_path: &Path) -> Result<IndexLockGuard> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(|e| RomSorterError::io(parent, e))?;
    }

    for attempt in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(mut file) => {
                let info = write_lock_info(lock_path, index_path)?;
                let json = serde_json::to_string_pretty(&info).map_err(|e| {
                    RomSorterError::invalid_path(lock_path, format!("serialize lock: {e}"))
                })?;
                file.write_all(json.as_bytes())
                    .map_err(|e| RomSorterError::io(lock_path, e))?;
                return Ok(IndexLockGuard {
                    lock_path: lock_path.to_path_buf(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt == 0 => {
                if let Ok(existing) = read_lock_info(lock_path) {
                    if !is_lock_valid(&existing) {
                        let _ = fs::remove_file(lock_path);
                        continue;
                    }
                }
                return Err(RomSorterError::invalid_path(
                    lock_path,
                    "index is locked by another active process",
                ));
            }
            Err(e) => return Err(RomSorterError::io(lock_path, e)),
        }
    }

    Err(RomSorterError::invalid_path(
        lock_path,
        "index is locked by another active process",
    ))
}

fn read_lock_info(lock_path: &Path) -> Result<LockInfo> {
    let text = fs::read_to_string(lock_path).map_err(|e| RomSorterError::io(lock_path, e))?;
    serde_json::from_str(&text)
        .map_err(|e| RomSorterError::invalid_path(lock_path, format!("corrupt lock file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquires_and_releases_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("index.lock");
        let index_path = dir.path().join("index.sqlite");
        {
            let _guard = acquire_index_lock(&lock_path, &index_path).unwrap();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn second_acquire_while_held_fails() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("index.lock");
        let index_path = dir.path().join("index.sqlite");
        let _guard = acquire_index_lock(&lock_path, &index_path).unwrap();
        let result = acquire_index_lock(&lock_path, &index_path);
        assert!(result.is_err());
    }

    #[test]
    fn stale_lock_from_dead_pid_is_taken_over() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("index.lock");
        let index_path = dir.path().join("index.sqlite");
        let stale = LockInfo {
            pid: 999_999_999,
            process_start_time: 123,
            created_at_utc: Utc::now(),
            hostname: "stale-host".to_string(),
            user: "stale-user".to_string(),
            index_path: index_path.clone(),
        };
        fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = acquire_index_lock(&lock_path, &index_path).unwrap();
        drop(guard);
    }
}
