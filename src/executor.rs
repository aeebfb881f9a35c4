//! Plan execution: atomic copy/move, conversion, backup-on-overwrite, and
//! cancellation.
//!
//! Follows `controller.py::execute_sort`'s `_atomic_copy_with_cancel`
//! (`.part` staging + rename, per-chunk cancel check) and the
//! external-tool subprocess idiom in `chdman.rs`/`sevenzip.rs` (spawn,
//! poll, kill on cancel), generalized from one hardcoded tool per module
//! to the config-driven conversion rules in
//! [`crate::planner::ConversionPlan`].

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::cancel::CancelToken;
use crate::config::BackupConfig;
use crate::error::{Result, RomSorterError};
use crate::planner::{ActionStatus, SortAction, SortMode, SortPlan};
use crate::resume::SortResumeState;

const COPY_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub completed: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub errors: Vec<(PathBuf, String)>,
}

/// Apply `plan`. When `dry_run` is set, no filesystem mutation or
/// subprocess runs — every non-skipped, non-resumed action is still
/// walked through `resume_state`/report bookkeeping so the report's
/// counts match a real run exactly, but nothing is written to disk and
/// the resume state file is never updated.
pub async fn execute_sort(
    plan: &SortPlan,
    cancel: &CancelToken,
    backup: &BackupConfig,
    resume_path: Option<&Path>,
    dry_run: bool,
) -> Result<ExecutionReport> {
    let mut resume_state = match resume_path {
        Some(p) => SortResumeState::load(p)?,
        None => SortResumeState::default(),
    };

    let mut report = ExecutionReport::default();

    for action in &plan.actions {
        if cancel.is_cancelled() {
            report.errors.push((action.input_path.clone(), "cancelled".to_string()));
            break;
        }

        if matches!(action.status, ActionStatus::Skipped | ActionStatus::Error) {
            report.skipped.push(action.input_path.clone());
            continue;
        }

        if resume_state.is_completed(&action.input_path) {
            report.completed.push(action.input_path.clone());
            continue;
        }

        if dry_run {
            report.completed.push(action.input_path.clone());
            continue;
        }

        match apply_action(action, cancel, backup).await {
            Ok(()) => {
                report.completed.push(action.input_path.clone());
                resume_state.mark_completed(&action.input_path);
                if let Some(p) = resume_path {
                    resume_state.save(p)?;
                }
            }
            Err(e) => report.errors.push((action.input_path.clone(), e.to_string())),
        }
    }

    Ok(report)
}

async fn apply_action(action: &SortAction, cancel: &CancelToken, backup: &BackupConfig) -> Result<()> {
    let Some(output_path) = &action.output_path else {
        return Ok(());
    };

    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RomSorterError::io(parent, e))?;
    }

    if output_path.exists() && backup.enabled && backup.before_overwrite {
        backup_existing_file(output_path, backup).await?;
    }

    if let Some(convert) = &action.convert {
        run_conversion(&action.input_path, output_path, convert, cancel).await?;
    } else {
        match action.mode {
            SortMode::Copy => atomic_copy_with_cancel(&action.input_path, output_path, cancel).await?,
            SortMode::Move => move_with_exdev_fallback(&action.input_path, output_path, cancel).await?,
        }
    }

    Ok(())
}

async fn backup_existing_file(output_path: &Path, backup: &BackupConfig) -> Result<()> {
    let backup_dir = output_path
        .parent()
        .map(|p| p.join(&backup.local_dir))
        .unwrap_or_else(|| PathBuf::from(&backup.local_dir));
    tokio::fs::create_dir_all(&backup_dir)
        .await
        .map_err(|e| RomSorterError::io(&backup_dir, e))?;

    let file_name = output_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let backup_path = backup_dir.join(file_name);
    tokio::fs::copy(output_path, &backup_path)
        .await
        .map_err(|e| RomSorterError::io(&backup_path, e))?;
    Ok(())
}

/// Copy via a `.part` staging file, checking `cancel` before each chunk
/// read and removing the stale `.part` before starting. Renaming into
/// place is atomic on the same filesystem.
async fn atomic_copy_with_cancel(src: &Path, dst: &Path, cancel: &CancelToken) -> Result<()> {
    let part_path = part_path_for(dst);
    if part_path.exists() {
        tokio::fs::remove_file(&part_path)
            .await
            .map_err(|e| RomSorterError::io(&part_path, e))?;
    }

    let mut reader = tokio::fs::File::open(src).await.map_err(|e| RomSorterError::io(src, e))?;
    let mut writer = tokio::fs::File::create(&part_path)
        .await
        .map_err(|e| RomSorterError::io(&part_path, e))?;

    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            drop(writer);
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(RomSorterError::Cancelled);
        }
        let n = reader.read(&mut buf).await.map_err(|e| RomSorterError::io(src, e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| RomSorterError::io(&part_path, e))?;
    }
    writer.flush().await.map_err(|e| RomSorterError::io(&part_path, e))?;
    drop(writer);

    tokio::fs::rename(&part_path, dst).await.map_err(|e| RomSorterError::io(dst, e))
}

/// Move, falling back to copy+remove when source and destination are on
/// different filesystems (`EXDEV`), the one case `rename(2)` can't do.
async fn move_with_exdev_fallback(src: &Path, dst: &Path, cancel: &CancelToken) -> Result<()> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if is_exdev(&e) => {
            atomic_copy_with_cancel(src, dst, cancel).await?;
            tokio::fs::remove_file(src).await.map_err(|e| RomSorterError::io(src, e))
        }
        Err(e) => Err(RomSorterError::io(dst, e)),
    }
}

#[cfg(unix)]
fn is_exdev(e: &std::io::Error) -> bool {
    const EXDEV: i32 = 18; // Linux and most unix targets.
    e.raw_os_error() == Some(EXDEV)
}

#[cfg(not(unix))]
fn is_exdev(_e: &std::io::Error) -> bool {
    false
}

fn part_path_for(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dst.with_file_name(name)
}

/// Run an external conversion tool, polling its completion so `cancel`
/// can kill the child mid-run rather than block until it exits on its own.
async fn run_conversion(
    src: &Path,
    dst: &Path,
    convert: &crate::planner::ConversionPlan,
    cancel: &CancelToken,
) -> Result<()> {
    let Some(tool_path) = &convert.tool_path else {
        return Err(RomSorterError::MissingTool { tool: convert.tool_key.clone() });
    };

    let args: Vec<String> = convert
        .args
        .iter()
        .map(|arg| {
            arg.replace("{input}", &src.to_string_lossy())
                .replace("{output}", &dst.to_string_lossy())
        })
        .collect();

    let mut child = Command::new(tool_path)
        .args(&args)
        .spawn()
        .map_err(|e| RomSorterError::ConversionFailed {
            tool: convert.tool_key.clone(),
            reason: e.to_string(),
        })?;

    loop {
        if cancel.is_cancelled() {
            let _ = child.kill().await;
            return Err(RomSorterError::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    return Ok(());
                }
                return Err(RomSorterError::ConversionFailed {
                    tool: convert.tool_key.clone(),
                    reason: format!("exited with {status}"),
                });
            }
            Ok(None) => {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            Err(e) => {
                return Err(RomSorterError::ConversionFailed {
                    tool: convert.tool_key.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_copy_produces_identical_bytes_and_no_leftover_part() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.nes");
        let dst = dir.path().join("dst.nes");
        tokio::fs::write(&src, b"rom contents").await.unwrap();

        let cancel = CancelToken::new();
        atomic_copy_with_cancel(&src, &dst, &cancel).await.unwrap();

        let contents = tokio::fs::read(&dst).await.unwrap();
        assert_eq!(contents, b"rom contents");
        assert!(!part_path_for(&dst).exists());
    }

    #[tokio::test]
    async fn cancelled_copy_removes_part_file_and_errors() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.nes");
        let dst = dir.path().join("dst.nes");
        tokio::fs::write(&src, vec![0u8; 4096]).await.unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = atomic_copy_with_cancel(&src, &dst, &cancel).await;
        assert!(matches!(result, Err(RomSorterError::Cancelled)));
        assert!(!part_path_for(&dst).exists());
        assert!(!dst.exists());
    }

    #[tokio::test]
    async fn backup_copies_existing_file_before_overwrite() {
        let dir = tempdir().unwrap();
        let output_path = dir.path().join("dst.nes");
        tokio::fs::write(&output_path, b"old").await.unwrap();

        let backup = BackupConfig {
            enabled: true,
            before_overwrite: true,
            local_dir: "backups".to_string(),
        };
        backup_existing_file(&output_path, &backup).await.unwrap();

        let backup_file = dir.path().join("backups").join("dst.nes");
        assert_eq!(tokio::fs::read(&backup_file).await.unwrap(), b"old");
    }
}
