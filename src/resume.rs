//! Resume-checkpoint persistence for long-running sort executions.
//!
//! Follows `controller.py`'s `SortResumeState`, reduced to what the
//! executor actually needs: which input paths have already been fully
//! applied.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RomSorterError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SortResumeState {
    pub completed_inputs: HashSet<PathBuf>,
}

impl SortResumeState {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| RomSorterError::io(path, e))?;
        serde_json::from_str(&text)
            .map_err(|e| RomSorterError::invalid_path(path, format!("corrupt resume state: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RomSorterError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| RomSorterError::invalid_path(path, format!("serialize resume state: {e}")))?;
        std::fs::write(path, json).map_err(|e| RomSorterError::io(path, e))
    }

    pub fn is_completed(&self, input_path: &Path) -> bool {
        self.completed_inputs.contains(input_path)
    }

    pub fn mark_completed(&mut self, input_path: &Path) {
        self.completed_inputs.insert(input_path.to_path_buf());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_empty_state() {
        let state = SortResumeState::load(Path::new("/nonexistent/resume.json")).unwrap();
        assert!(state.completed_inputs.is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume.json");
        let mut state = SortResumeState::default();
        state.mark_completed(Path::new("/roms/a.nes"));
        state.save(&path).unwrap();

        let reloaded = SortResumeState::load(&path).unwrap();
        assert!(reloaded.is_completed(Path::new("/roms/a.nes")));
        assert!(!reloaded.is_completed(Path::new("/roms/b.nes")));
    }
}
