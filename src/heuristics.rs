//! Conservative platform-guess scoring.
//!
//! A faithful port of `platform_heuristics.py`'s
//! `evaluate_platform_candidates`: extension/container/token signals with
//! fixed weights, per-platform minimum-signal gating, and deterministic
//! `(-score, platform_id)` ordering. This never runs when a DAT hash hit
//! already identified the item; it is the fallback path for unidentified
//! candidates.

use std::path::Path;

use crate::platform_catalog::{PlatformCatalog, PlatformEntry};

const EXTENSION_WEIGHT: f64 = 2.0;
const CONTAINER_WEIGHT: f64 = 1.0;
const POSITIVE_TOKEN_WEIGHT: f64 = 1.0;
const NEGATIVE_TOKEN_WEIGHT: f64 = -2.0;
const MAX_CANDIDATES: usize = 10;

/// Load/evaluation status tag, distinct from [`crate::platform_catalog::Policy`]
/// (the scoring-threshold struct). Derives its wire form with `strum`
/// rather than a hand-written `as_str`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EvaluationStatus {
    CatalogMissing,
    CatalogInvalid,
    CatalogEmpty,
    Ok,
    NoMatch,
}

#[derive(Debug, Clone)]
pub struct CandidateDetail {
    pub platform_id: String,
    pub display_name: String,
    pub score: f64,
    pub matched_extension: bool,
    pub matched_container: bool,
    pub matched_positive_tokens: Vec<String>,
    pub matched_negative_tokens: Vec<String>,
    pub conflict_groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub candidates: Vec<String>,
    pub candidate_systems: Vec<String>,
    pub candidate_details: Vec<CandidateDetail>,
    pub signals: Vec<String>,
    pub policy: EvaluationStatus,
    pub reason: String,
}

impl Evaluation {
    fn empty(policy: EvaluationStatus, reason: impl Into<String>) -> Self {
        Self {
            candidates: Vec::new(),
            candidate_systems: Vec::new(),
            candidate_details: Vec::new(),
            signals: Vec::new(),
            policy,
            reason: reason.into(),
        }
    }

    pub fn top(&self) -> Option<&CandidateDetail> {
        self.candidate_details.first()
    }
}

/// Score every catalog entry against `path` (and an optional archive
/// `container` extension such as `.zip`), returning the ranked result.
/// The catalog itself having failed to load is signalled by the caller
/// via [`Evaluation::empty`] rather than by this function.
pub fn evaluate_platform_candidates(
    catalog: &PlatformCatalog,
    path: &Path,
    container: Option<&str>,
) -> Evaluation {
    if catalog.platforms.is_empty() {
        return Evaluation::empty(EvaluationStatus::CatalogEmpty, "platform catalog has no entries");
    }

    let haystack = build_haystack(path);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()));
    let container = container.map(|c| c.to_lowercase());

    let mut details: Vec<CandidateDetail> = Vec::new();
    let mut fired_signal_kinds: Vec<String> = Vec::new();

    for entry in &catalog.platforms {
        let detail = score_entry(entry, extension.as_deref(), container.as_deref(), &haystack);
        if detail.score <= 0.0 {
            continue;
        }
        if !signals_satisfy_minimum(entry, &detail) {
            continue;
        }
        for kind in signal_kinds(&detail) {
            if !fired_signal_kinds.contains(&kind) {
                fired_signal_kinds.push(kind);
            }
        }
        details.push(detail);
    }

    if details.is_empty() {
        return Evaluation::empty(EvaluationStatus::NoMatch, "no platform signals matched");
    }

    details.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.platform_id.cmp(&b.platform_id))
    });
    details.truncate(MAX_CANDIDATES);

    let candidates = details.iter().map(|d| d.platform_id.clone()).collect();
    let candidate_systems = details.iter().map(|d| d.display_name.clone()).collect();

    Evaluation {
        candidates,
        candidate_systems,
        candidate_details: details,
        signals: fired_signal_kinds,
        policy: EvaluationStatus::Ok,
        reason: "ok".to_string(),
    }
}

fn build_haystack(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        if let Some(s) = component.as_os_str().to_str() {
            parts.push(s.to_lowercase());
        }
    }
    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
        parts.push(stem.to_lowercase());
    }
    if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
        parts.push(name.to_lowercase());
    }
    parts.join(" / ")
}

fn score_entry(
    entry: &PlatformEntry,
    extension: Option<&str>,
    container: Option<&str>,
    haystack: &str,
) -> CandidateDetail {
    let mut score = 0.0;

    let matched_extension = extension
        .map(|ext| entry.extensions.iter().any(|e| e.to_lowercase() == ext))
        .unwrap_or(false);
    if matched_extension {
        score += EXTENSION_WEIGHT;
    }

    let matched_container = container
        .map(|c| entry.containers.iter().any(|e| e.to_lowercase() == c))
        .unwrap_or(false);
    if matched_container {
        score += CONTAINER_WEIGHT;
    }

    let matched_positive_tokens: Vec<String> = entry
        .positive_tokens
        .iter()
        .filter(|token| haystack.contains(&token.to_lowercase()))
        .cloned()
        .collect();
    score += POSITIVE_TOKEN_WEIGHT * matched_positive_tokens.len() as f64;

    let matched_negative_tokens: Vec<String> = entry
        .negative_tokens
        .iter()
        .filter(|token| haystack.contains(&token.to_lowercase()))
        .cloned()
        .collect();
    score += NEGATIVE_TOKEN_WEIGHT * matched_negative_tokens.len() as f64;

    CandidateDetail {
        platform_id: entry.platform_id.clone(),
        display_name: entry.display_name.clone(),
        score,
        matched_extension,
        matched_container,
        matched_positive_tokens,
        matched_negative_tokens,
        conflict_groups: entry.conflict_groups.clone(),
    }
}

fn signal_kinds(detail: &CandidateDetail) -> Vec<String> {
    let mut kinds = Vec::new();
    if detail.matched_extension {
        kinds.push("extension".to_string());
    }
    if detail.matched_container {
        kinds.push("container".to_string());
    }
    if !detail.matched_positive_tokens.is_empty() {
        kinds.push("token".to_string());
    }
    kinds
}

fn signals_satisfy_minimum(entry: &PlatformEntry, detail: &CandidateDetail) -> bool {
    if entry.minimum_signals.is_empty() {
        return true;
    }
    let fired = signal_kinds(detail);
    entry.minimum_signals.iter().any(|required| fired.contains(required))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform_catalog::PlatformEntry;

    fn catalog(entries: Vec<PlatformEntry>) -> PlatformCatalog {
        PlatformCatalog { platforms: entries, ..Default::default() }
    }

    fn nes_entry() -> PlatformEntry {
        PlatformEntry {
            platform_id: "nes".to_string(),
            display_name: "Nintendo Entertainment System".to_string(),
            canonical_name: None,
            aliases: vec![],
            category: None,
            media_types: vec![],
            extensions: vec![".nes".to_string()],
            containers: vec![".zip".to_string()],
            positive_tokens: vec!["famicom".to_string()],
            negative_tokens: vec!["snes".to_string()],
            minimum_signals: vec!["extension".to_string()],
            conflict_groups: vec![],
        }
    }

    #[test]
    fn empty_catalog_reports_catalog_empty() {
        let cat = catalog(vec![]);
        let eval = evaluate_platform_candidates(&cat, Path::new("game.nes"), None);
        assert_eq!(eval.policy, EvaluationStatus::CatalogEmpty);
    }

    #[test]
    fn extension_match_scores_and_ranks_first() {
        let cat = catalog(vec![nes_entry()]);
        let eval = evaluate_platform_candidates(&cat, Path::new("Super Game (USA).nes"), None);
        assert_eq!(eval.policy, EvaluationStatus::Ok);
        assert_eq!(eval.candidates, vec!["nes"]);
        assert_eq!(eval.candidate_details[0].score, EXTENSION_WEIGHT);
    }

    #[test]
    fn negative_token_can_drop_score_to_zero_or_below() {
        let cat = catalog(vec![nes_entry()]);
        let eval = evaluate_platform_candidates(&cat, Path::new("Super Game (SNES).nes"), None);
        // +2.0 extension, -2.0 negative token => 0.0, dropped by the <= 0 rule.
        assert_eq!(eval.policy, EvaluationStatus::NoMatch);
    }

    #[test]
    fn minimum_signals_gate_drops_token_only_match() {
        let mut entry = nes_entry();
        entry.extensions = vec![".bogus".to_string()];
        let cat = catalog(vec![entry]);
        // Only a token signal fires, but minimum_signals requires "extension".
        let eval = evaluate_platform_candidates(&cat, Path::new("Famicom Game.rom"), None);
        assert_eq!(eval.policy, EvaluationStatus::NoMatch);
    }

    #[test]
    fn container_signal_contributes_score() {
        let mut entry = nes_entry();
        entry.minimum_signals = vec!["container".to_string()];
        entry.extensions = vec![".bogus".to_string()];
        let cat = catalog(vec![entry]);
        let eval = evaluate_platform_candidates(&cat, Path::new("game.bin"), Some(".zip"));
        assert_eq!(eval.policy, EvaluationStatus::Ok);
        assert!(eval.candidate_details[0].matched_container);
    }

    #[test]
    fn results_are_capped_and_deterministically_ordered() {
        let entries: Vec<PlatformEntry> = (0..15)
            .map(|i| PlatformEntry {
                platform_id: format!("p{i:02}"),
                display_name: format!("Platform {i}"),
                canonical_name: None,
                aliases: vec![],
                category: None,
                media_types: vec![],
                extensions: vec![".rom".to_string()],
                containers: vec![],
                positive_tokens: vec![],
                negative_tokens: vec![],
                minimum_signals: vec![],
                conflict_groups: vec![],
            })
            .collect();
        let cat = catalog(entries);
        let eval = evaluate_platform_candidates(&cat, Path::new("game.rom"), None);
        assert_eq!(eval.candidates.len(), MAX_CANDIDATES);
        assert_eq!(eval.candidates[0], "p00");
    }
}
