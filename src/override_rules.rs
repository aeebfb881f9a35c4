//! Post-hoc identification overrides.
//!
//! A user-maintained YAML/JSON list of rules, each matching on a
//! conjunction of path/name predicates, applied *after* the normal
//! DAT/heuristic identification pass completes. Follows the YAML-first /
//! JSON-fallback loading idiom already used in `platform_catalog.rs`.

use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Result, RomSorterError};

#[derive(Debug, Clone, Deserialize)]
pub struct OverrideEntry {
    #[serde(default)]
    pub name: Option<String>,
    pub platform_id: String,
    #[serde(default)]
    pub confidence: Option<f64>,

    #[serde(default)]
    pub path_equals: Option<String>,
    #[serde(default)]
    pub path_glob: Option<String>,
    #[serde(default)]
    pub path_regex: Option<String>,
    #[serde(default)]
    pub name_regex: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub starts_with: Option<String>,
    #[serde(default)]
    pub ends_with: Option<String>,
}

impl OverrideEntry {
    fn has_any_predicate(&self) -> bool {
        self.path_equals.is_some()
            || self.path_glob.is_some()
            || self.path_regex.is_some()
            || self.name_regex.is_some()
            || self.extension.is_some()
            || self.contains.is_some()
            || self.starts_with.is_some()
            || self.ends_with.is_some()
    }

    /// All predicates present on the rule must match (conjunction); a rule
    /// with no predicates at all never matches anything.
    fn matches(&self, path: &Path) -> bool {
        if !self.has_any_predicate() {
            return false;
        }
        let path_str = path.to_string_lossy().to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if let Some(expected) = &self.path_equals {
            if path_str != *expected {
                return false;
            }
        }
        if let Some(pattern) = &self.path_glob {
            if !glob_match(pattern, &path_str) {
                return false;
            }
        }
        if let Some(pattern) = &self.path_regex {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(&path_str) => {}
                _ => return false,
            }
        }
        if let Some(pattern) = &self.name_regex {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(&name) => {}
                _ => return false,
            }
        }
        if let Some(extension) = &self.extension {
            let actual = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{}", e.to_lowercase()));
            let expected = if extension.starts_with('.') {
                extension.to_lowercase()
            } else {
                format!(".{}", extension.to_lowercase())
            };
            if actual.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.contains {
            if !name.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(prefix) = &self.starts_with {
            if !name.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(suffix) = &self.ends_with {
            if !name.ends_with(suffix.as_str()) {
                return false;
            }
        }
        true
    }

    fn rule_name(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("rule{index}"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OverrideDocument {
    Wrapped { rules: Vec<OverrideEntry> },
    Bare(Vec<OverrideEntry>),
}

#[derive(Debug, Clone, Default)]
pub struct OverrideRules {
    entries: Vec<OverrideEntry>,
}

/// The confirmed override for a path: the platform it resolves to, the
/// confidence to apply (defaulting to 1.0), and the rule's name for the
/// `override:<name>` evidence string.
#[derive(Debug, Clone)]
pub struct OverrideMatch {
    pub platform_id: String,
    pub rule_name: String,
    pub confidence: f64,
}

impl OverrideRules {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::empty());
        };
        if !path.exists() {
            return Ok(Self::empty());
        }
        let text = std::fs::read_to_string(path).map_err(|e| RomSorterError::io(path, e))?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        let doc: OverrideDocument = if is_json {
            serde_json::from_str(&text)
                .map_err(|e| RomSorterError::CatalogInvalid { reason: e.to_string() })?
        } else {
            serde_yml::from_str(&text)
                .map_err(|e| RomSorterError::CatalogInvalid { reason: e.to_string() })?
        };
        let entries = match doc {
            OverrideDocument::Wrapped { rules } => rules,
            OverrideDocument::Bare(rules) => rules,
        };
        Ok(Self { entries })
    }

    /// Return the override for `path`, if any rule's predicates all match.
    /// Rules are checked in file order; the first match wins.
    pub fn match_path(&self, path: &Path) -> Option<OverrideMatch> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.matches(path))
            .map(|(index, entry)| OverrideMatch {
                platform_id: entry.platform_id.clone(),
                rule_name: entry.rule_name(index),
                confidence: entry.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
            })
    }

    pub fn add(&mut self, pattern: impl Into<String>, platform_id: impl Into<String>) {
        self.entries.push(OverrideEntry {
            name: None,
            platform_id: platform_id.into(),
            confidence: None,
            path_equals: None,
            path_glob: Some(pattern.into()),
            path_regex: None,
            name_regex: None,
            extension: None,
            contains: None,
            starts_with: None,
            ends_with: None,
        });
    }

    pub fn add_rule(&mut self, entry: OverrideEntry) {
        self.entries.push(entry);
    }
}

/// Minimal `*`/`?` glob matcher — no `**`, no character classes. Covers
/// the override file's use case (single filenames or simple suffix/prefix
/// patterns) without pulling in a dedicated glob crate for one call site.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches() {
        assert!(glob_match("game.nes", "game.nes"));
        assert!(!glob_match("game.nes", "game.snes"));
    }

    #[test]
    fn star_glob_matches_suffix() {
        assert!(glob_match("*.nes", "weird/path/game.nes"));
        assert!(!glob_match("*.nes", "weird/path/game.snes"));
    }

    #[test]
    fn missing_override_file_is_empty() {
        let rules = OverrideRules::load(Some(Path::new("/nonexistent/overrides.yaml"))).unwrap();
        assert!(rules.match_path(Path::new("anything.nes")).is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut rules = OverrideRules::empty();
        rules.add("*.nes", "nes");
        rules.add("game.nes", "famicom");
        let hit = rules.match_path(Path::new("game.nes")).unwrap();
        assert_eq!(hit.platform_id, "nes");
    }

    #[test]
    fn conjunction_requires_every_predicate_to_match() {
        let mut rules = OverrideRules::empty();
        rules.add_rule(OverrideEntry {
            name: Some("override-game".to_string()),
            platform_id: "genesis".to_string(),
            confidence: None,
            path_equals: None,
            path_glob: None,
            path_regex: None,
            name_regex: Some("override-game".to_string()),
            extension: Some(".rom".to_string()),
            contains: None,
            starts_with: None,
            ends_with: None,
        });

        let hit = rules.match_path(Path::new("override-game.rom")).unwrap();
        assert_eq!(hit.platform_id, "genesis");
        assert_eq!(hit.rule_name, "override-game");
        assert_eq!(hit.confidence, 1.0);

        // Extension predicate fails to match -> the whole conjunction fails.
        assert!(rules.match_path(Path::new("override-game.bin")).is_none());
    }

    #[test]
    fn confidence_is_clamped_into_zero_one() {
        let mut rules = OverrideRules::empty();
        rules.add_rule(OverrideEntry {
            name: Some("loud".to_string()),
            platform_id: "nes".to_string(),
            confidence: Some(1.5),
            path_equals: None,
            path_glob: Some("*.nes".to_string()),
            path_regex: None,
            name_regex: None,
            extension: None,
            contains: None,
            starts_with: None,
            ends_with: None,
        });
        let hit = rules.match_path(Path::new("game.nes")).unwrap();
        assert_eq!(hit.confidence, 1.0);
    }

    #[test]
    fn rule_without_predicates_never_matches() {
        let mut rules = OverrideRules::empty();
        rules.add_rule(OverrideEntry {
            name: Some("empty".to_string()),
            platform_id: "nes".to_string(),
            confidence: None,
            path_equals: None,
            path_glob: None,
            path_regex: None,
            name_regex: None,
            extension: None,
            contains: None,
            starts_with: None,
            ends_with: None,
        });
        assert!(rules.match_path(Path::new("anything.nes")).is_none());
    }
}
