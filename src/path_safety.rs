//! Path containment and traversal guards.
//!
//! Follows `get_canonicalized_path` (`util.rs`) and the
//! `validate_file_operation`-style checks scattered across
//! `import_roms.rs`/`sort_roms.rs`, consolidated into a single entry
//! point every filesystem-touching operation routes through.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, RomSorterError};

#[derive(Debug, Clone, Copy, Default)]
pub struct AccessMode {
    pub allow_read: bool,
    pub allow_write: bool,
}

impl AccessMode {
    pub fn read() -> Self {
        Self {
            allow_read: true,
            allow_write: false,
        }
    }

    pub fn write() -> Self {
        Self {
            allow_read: false,
            allow_write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            allow_read: true,
            allow_write: true,
        }
    }
}

/// Validate that `path` is safe to touch, optionally confined under `base_dir`.
///
/// `path` need not exist (planning validates future targets); if it does
/// not exist, only its existing ancestors are checked for symlinks, and
/// containment is checked against the lexically-normalized path.
pub fn validate(path: &Path, base_dir: Option<&Path>, _mode: AccessMode) -> Result<PathBuf> {
    reject_traversal_components(path)?;

    let resolved = resolve_best_effort(path)?;

    if let Some(ancestor) = first_symlink_ancestor(&resolved)? {
        return Err(RomSorterError::invalid_path(
            path,
            format!("ancestor {} is a symlink", ancestor.display()),
        ));
    }

    if let Ok(meta) = fs::symlink_metadata(&resolved) {
        if meta.file_type().is_symlink() {
            return Err(RomSorterError::invalid_path(path, "path is a symlink"));
        }
        if is_device_or_fifo(&meta) {
            return Err(RomSorterError::invalid_path(
                path,
                "path is a device or FIFO",
            ));
        }
    }

    if let Some(base) = base_dir {
        let base_resolved = resolve_best_effort(base)?;
        if !resolved.starts_with(&base_resolved) {
            return Err(RomSorterError::invalid_path(
                path,
                format!("escapes base directory {}", base_resolved.display()),
            ));
        }
    }

    Ok(resolved)
}

/// Reject `..`, drive-letter-looking, absolute, or unicode-slash archive
/// member names before they are ever joined to an extraction root.
pub fn validate_archive_member_name(name: &str) -> Result<()> {
    const UNICODE_SLASHES: &[char] = &['\u{2215}', '\u{FF0F}', '\u{2044}'];

    if name.is_empty() {
        return Err(RomSorterError::invalid_path(name, "empty member name"));
    }
    if name.contains(UNICODE_SLASHES) {
        return Err(RomSorterError::invalid_path(
            name,
            "unicode slash in member name",
        ));
    }
    let normalized = name.replace('\\', "/");
    let candidate = Path::new(&normalized);
    if candidate.is_absolute() {
        return Err(RomSorterError::invalid_path(name, "absolute member path"));
    }
    if has_drive_letter(&normalized) {
        return Err(RomSorterError::invalid_path(
            name,
            "drive-letter member path",
        ));
    }
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                return Err(RomSorterError::invalid_path(name, "traversal component"));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(RomSorterError::invalid_path(name, "rooted member path"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Unix file-mode bits declaring a zip entry as a symlink (`S_IFLNK`).
pub fn archive_mode_is_symlink(unix_mode: u32) -> bool {
    const S_IFMT: u32 = 0o170000;
    const S_IFLNK: u32 = 0o120000;
    (unix_mode & S_IFMT) == S_IFLNK
}

fn has_drive_letter(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn reject_traversal_components(path: &Path) -> Result<()> {
    for component in path.components() {
        if component == Component::ParentDir {
            return Err(RomSorterError::invalid_path(path, "contains `..`"));
        }
    }
    Ok(())
}

/// Canonicalize if possible; fall back to a lexical, `..`-free normalization
/// for paths whose final component does not yet exist (planning targets).
fn resolve_best_effort(path: &Path) -> Result<PathBuf> {
    if let Ok(canon) = path.canonicalize() {
        return Ok(canon);
    }
    let base = if path.is_absolute() {
        PathBuf::new()
    } else {
        std::env::current_dir().map_err(|e| RomSorterError::io(path, e))?
    };
    let mut out = base;
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    // Canonicalize the deepest existing ancestor so symlinked parents are
    // still caught even though the leaf itself doesn't exist yet.
    if let Some(existing_ancestor) = deepest_existing_ancestor(&out) {
        if let Ok(canon_ancestor) = existing_ancestor.canonicalize() {
            if let Ok(suffix) = out.strip_prefix(&existing_ancestor) {
                return Ok(canon_ancestor.join(suffix));
            }
        }
    }
    Ok(out)
}

fn deepest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = path.to_path_buf();
    loop {
        if current.exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

fn first_symlink_ancestor(resolved: &Path) -> Result<Option<PathBuf>> {
    let mut current = PathBuf::new();
    for component in resolved.components() {
        current.push(component);
        if current == *resolved {
            break;
        }
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(Some(current)),
            _ => {}
        }
    }
    Ok(None)
}

#[cfg(unix)]
fn is_device_or_fifo(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    let ft = meta.file_type();
    ft.is_block_device() || ft.is_char_device() || ft.is_fifo() || ft.is_socket()
}

#[cfg(not(unix))]
fn is_device_or_fifo(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rejects_dotdot_in_raw_path() {
        let err = validate(Path::new("/tmp/../etc/passwd"), None, AccessMode::read());
        assert!(err.is_err());
    }

    #[test]
    fn accepts_path_inside_base_dir() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("game.nes");
        std::fs::write(&file, b"data").unwrap();
        let resolved = validate(&file, Some(dir.path()), AccessMode::read()).unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn rejects_path_outside_base_dir() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let file = other.path().join("game.nes");
        std::fs::write(&file, b"data").unwrap();
        let result = validate(&file, Some(dir.path()), AccessMode::read());
        assert!(result.is_err());
    }

    #[test]
    fn archive_member_rejects_traversal() {
        assert!(validate_archive_member_name("../../etc/passwd").is_err());
        assert!(validate_archive_member_name("C:\\windows\\system32").is_err());
        assert!(validate_archive_member_name("/etc/passwd").is_err());
        assert!(validate_archive_member_name("game\u{2215}..\u{2215}passwd").is_err());
        assert!(validate_archive_member_name("roms/game.nes").is_ok());
    }

    #[test]
    fn archive_mode_detects_symlink_bit() {
        assert!(archive_mode_is_symlink(0o120777 << 16 >> 16));
        assert!(!archive_mode_is_symlink(0o100644));
    }
}
