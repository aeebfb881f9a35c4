//! Configuration loading.
//!
//! Follows the settings-resolution idiom of `config.rs` (env override,
//! then a well-known default path), adapted from a DB-resident settings
//! table to a TOML file, the format `retro-junk-lib/src/settings.rs`
//! uses for its own settings.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, RomSorterError};

pub const CONFIG_ENV_VAR: &str = "ROM_SORTER_CONFIG";
pub const PLATFORM_CATALOG_ENV_VAR: &str = "ROM_SORTER_PLATFORM_CATALOG";
const DEFAULT_CONFIG_FILE: &str = "romsorter.toml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub performance: PerformanceConfig,
    pub features: FeaturesConfig,
    pub dats: DatsConfig,
    pub identification_overrides: OverridesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub max_threads: usize,
    pub chunk_size: usize,
    pub ignore_images: bool,
    pub ignore_extensions: Vec<String>,
    pub follow_symlinks: bool,
    pub platform_catalog_path: Option<PathBuf>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_threads: (2 * ncpu).clamp(4, 32),
            chunk_size: crate::hasher::DEFAULT_CHUNK_SIZE,
            ignore_images: true,
            ignore_extensions: default_ignored_extensions(),
            follow_symlinks: false,
            platform_catalog_path: None,
        }
    }
}

fn default_ignored_extensions() -> Vec<String> {
    [
        ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".txt", ".nfo", ".url", ".ds_store",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PerformanceConfig {
    pub optimization: OptimizationConfig,
    pub processing: ProcessingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub enable_progress_batching: bool,
    pub lazy_archive_extraction: bool,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            enable_progress_batching: true,
            lazy_archive_extraction: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub io_buffer_size: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            io_buffer_size: crate::hasher::DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FeaturesConfig {
    pub sorting: SortingConfig,
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SortingConfig {
    pub create_console_folders: bool,
    pub confidence_threshold: f64,
    pub create_unknown_folder: bool,
    pub unknown_folder_name: String,
    pub quarantine_unknown: bool,
    pub quarantine_folder_name: String,
    pub region_based_sorting: bool,
    pub preserve_folder_structure: bool,
    pub rename_template: Option<String>,
    pub conversion: ConversionConfig,
}

impl Default for SortingConfig {
    fn default() -> Self {
        Self {
            create_console_folders: true,
            confidence_threshold: 0.95,
            create_unknown_folder: true,
            unknown_folder_name: "Unknown".to_string(),
            quarantine_unknown: false,
            quarantine_folder_name: "Quarantine".to_string(),
            region_based_sorting: false,
            preserve_folder_structure: false,
            rename_template: None,
            conversion: ConversionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConversionConfig {
    pub enabled: bool,
    pub require_dat_match: bool,
    pub fallback_on_missing_tool: bool,
    pub rules: Vec<ConversionRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversionRule {
    pub name: String,
    pub extensions: Vec<String>,
    pub systems: Vec<String>,
    pub tool_key: String,
    pub tool_path: Option<String>,
    pub args: Vec<String>,
    pub output_extension: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub before_overwrite: bool,
    pub local_dir: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            before_overwrite: true,
            local_dir: "backups".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatsConfig {
    pub import_paths: Vec<PathBuf>,
    pub index_path: PathBuf,
    pub lock_path: PathBuf,
    pub sharding: ShardingConfig,
}

impl Default for DatsConfig {
    fn default() -> Self {
        Self {
            import_paths: Vec::new(),
            index_path: PathBuf::from("data/index/romsorter_dat_index.sqlite"),
            lock_path: PathBuf::from("data/index/romsorter_dat_index.lock"),
            sharding: ShardingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ShardingConfig {
    pub enabled: bool,
    pub shard_count: usize,
    pub shard_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OverridesConfig {
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

/// Resolution order: `ROM_SORTER_CONFIG` env → `config_path` argument →
/// `./romsorter.toml` → the platform config directory (`dirs::config_dir`)
/// → built-in defaults if nothing exists.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let resolved = std::env::var(CONFIG_ENV_VAR)
        .ok()
        .map(PathBuf::from)
        .or_else(|| config_path.map(Path::to_path_buf))
        .or_else(|| {
            let cwd_default = PathBuf::from(DEFAULT_CONFIG_FILE);
            cwd_default.exists().then_some(cwd_default)
        })
        .or_else(|| {
            dirs::config_dir()
                .map(|dir| dir.join("romsorter").join(DEFAULT_CONFIG_FILE))
                .filter(|p| p.exists())
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if !resolved.exists() {
        return Ok(Config::default());
    }

    let text = std::fs::read_to_string(&resolved).map_err(|e| RomSorterError::io(&resolved, e))?;
    toml::from_str(&text).map_err(|e| RomSorterError::CatalogInvalid {
        reason: format!("{resolved:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.scanner.max_threads >= 4 && cfg.scanner.max_threads <= 32);
        assert_eq!(cfg.features.sorting.confidence_threshold, 0.95);
        assert!(!cfg.features.sorting.conversion.enabled);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_config(Some(Path::new("/nonexistent/romsorter.toml"))).unwrap();
        assert_eq!(cfg.features.sorting.unknown_folder_name, "Unknown");
    }

    #[test]
    fn loads_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("romsorter.toml");
        std::fs::write(
            &path,
            r#"
            [features.sorting]
            confidence_threshold = 0.8
            unknown_folder_name = "Misc"
            "#,
        )
        .unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.features.sorting.confidence_threshold, 0.8);
        assert_eq!(cfg.features.sorting.unknown_folder_name, "Misc");
    }
}
