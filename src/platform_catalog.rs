//! Platform heuristic catalog loading.
//!
//! Follows `retro-junk-catalog/src/yaml.rs` for the YAML-first,
//! JSON-fallback loading idiom (including its use of `serde_yml` rather
//! than `serde_yaml`) and `platform_heuristics.py`
//! (`_load_catalog`/`_basic_catalog_validation`) for the catalog shape
//! and validation rules. A default catalog is bundled with `rust_embed`,
//! the same way `import_dats.rs` embeds `data/`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;

use rust_embed::RustEmbed;
use serde::Deserialize;

use crate::config::PLATFORM_CATALOG_ENV_VAR;
use crate::error::{Result, RomSorterError};

#[derive(RustEmbed)]
#[folder = "data/"]
#[include = "platform_catalog.yaml"]
struct DefaultCatalogAsset;

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformEntry {
    pub platform_id: String,
    pub display_name: String,
    /// Preferred display form for the platform, distinct from aliases used
    /// only for matching. Defaults to `display_name` when absent.
    #[serde(default)]
    pub canonical_name: Option<String>,
    /// Alternate names a filename or path might carry for this platform.
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub media_types: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub positive_tokens: Vec<String>,
    #[serde(default)]
    pub negative_tokens: Vec<String>,
    /// Signal categories ("extension", "container", "token") of which at
    /// least one must fire for this platform to be considered a candidate.
    #[serde(default)]
    pub minimum_signals: Vec<String>,
    /// Platforms this one is routinely confused with (e.g. optical-disc
    /// siblings sharing `.bin`/`.iso`). Drives the conflict-group outcome
    /// in `scanner::classify_candidates`.
    #[serde(default)]
    pub conflict_groups: Vec<String>,
}

impl PlatformEntry {
    pub fn canonical_name(&self) -> &str {
        self.canonical_name.as_deref().unwrap_or(&self.display_name)
    }
}

/// Scoring thresholds that gate how the heuristic candidate list resolves
/// into an accepted platform versus an `Unknown` outcome.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub min_score_delta: f64,
    pub min_top_score: f64,
    pub contradiction_min_score: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_score_delta: 1.0,
            min_top_score: 2.0,
            contradiction_min_score: 3.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformCatalog {
    pub version: Option<String>,
    pub policy: Policy,
    pub platforms: Vec<PlatformEntry>,
}

impl Default for PlatformCatalog {
    fn default() -> Self {
        Self {
            version: None,
            policy: Policy::default(),
            platforms: Vec::new(),
        }
    }
}

impl PlatformCatalog {
    fn validate(&self) -> Result<()> {
        if self.platforms.is_empty() {
            return Err(RomSorterError::CatalogEmpty);
        }
        for entry in &self.platforms {
            if entry.platform_id.trim().is_empty() {
                return Err(RomSorterError::CatalogInvalid {
                    reason: "platform entry missing platform_id".to_string(),
                });
            }
            for signal in &entry.minimum_signals {
                if !matches!(signal.as_str(), "extension" | "container" | "token") {
                    return Err(RomSorterError::CatalogInvalid {
                        reason: format!(
                            "{}: unknown minimum_signals entry {signal:?}",
                            entry.platform_id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn parse_catalog_text(text: &str, is_json: bool) -> Result<PlatformCatalog> {
    let catalog: PlatformCatalog = if is_json {
        serde_json::from_str(text)
            .map_err(|e| RomSorterError::CatalogInvalid { reason: e.to_string() })?
    } else {
        serde_yml::from_str(text)
            .map_err(|e| RomSorterError::CatalogInvalid { reason: e.to_string() })?
    };
    catalog.validate()?;
    Ok(catalog)
}

/// Resolve the catalog path: explicit `override_path`, then
/// `ROM_SORTER_PLATFORM_CATALOG`, then `None` (caller falls back to the
/// bundled default).
pub fn resolve_catalog_path(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = override_path {
        return Some(p.to_path_buf());
    }
    std::env::var(PLATFORM_CATALOG_ENV_VAR).ok().map(PathBuf::from)
}

struct CacheEntry {
    key: (Option<PathBuf>, Option<SystemTime>),
    catalog: PlatformCatalog,
}

static CACHE: OnceLock<Mutex<Option<CacheEntry>>> = OnceLock::new();

/// Load the platform catalog, mtime-cached the way `retro-junk-catalog`
/// avoids re-parsing its YAML on every lookup. Falls back to the bundled
/// default when no override path is configured or the override is missing.
pub fn load_catalog(override_path: Option<&Path>) -> Result<PlatformCatalog> {
    let path = resolve_catalog_path(override_path);
    let mtime = path.as_ref().and_then(|p| {
        std::fs::metadata(p).ok().and_then(|m| m.modified().ok())
    });
    let key = (path.clone(), mtime);

    let cache = CACHE.get_or_init(|| Mutex::new(None));
    let mut guard = cache.lock().unwrap();
    if let Some(entry) = guard.as_ref() {
        if entry.key == key {
            return Ok(entry.catalog.clone());
        }
    }

    let catalog = match &path {
        Some(p) if p.exists() => {
            let text = std::fs::read_to_string(p).map_err(|e| RomSorterError::io(p, e))?;
            let is_json = p.extension().and_then(|e| e.to_str()) == Some("json");
            parse_catalog_text(&text, is_json)?
        }
        Some(_) => return Err(RomSorterError::CatalogMissing),
        None => {
            let bytes = DefaultCatalogAsset::get("platform_catalog.yaml")
                .ok_or(RomSorterError::CatalogMissing)?;
            let text = std::str::from_utf8(&bytes.data)
                .map_err(|e| RomSorterError::CatalogInvalid { reason: e.to_string() })?;
            parse_catalog_text(text, false)?
        }
    };

    *guard = Some(CacheEntry { key, catalog: catalog.clone() });
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_default_loads_and_validates() {
        let catalog = load_catalog(None).unwrap();
        assert!(!catalog.platforms.is_empty());
    }

    #[test]
    fn missing_override_path_errors() {
        let result = load_catalog(Some(Path::new("/nonexistent/catalog.yaml")));
        assert!(matches!(result, Err(RomSorterError::CatalogMissing)));
    }

    #[test]
    fn rejects_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        std::fs::write(&path, "platforms: []\n").unwrap();
        let result = load_catalog(Some(&path));
        assert!(matches!(result, Err(RomSorterError::CatalogEmpty)));
    }

    #[test]
    fn rejects_unknown_minimum_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        std::fs::write(
            &path,
            r#"
platforms:
  - platform_id: nes
    display_name: Nintendo Entertainment System
    extensions: [".nes"]
    minimum_signals: ["bogus"]
"#,
        )
        .unwrap();
        let result = load_catalog(Some(&path));
        assert!(matches!(result, Err(RomSorterError::CatalogInvalid { .. })));
    }
}
