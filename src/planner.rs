//! Pure, deterministic sort planning.
//!
//! A restructuring of `controller.py::plan_sort` around the
//! destination-path-building helpers `sort_roms.rs` uses for its own
//! layout, generalized from a fixed region/subfolder scheme to a
//! config-driven one. `plan_rebuild` and `diff_sort_plans` are carried
//! over from the same `controller.py` module.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use shiratsu_naming::naming::nointro::{NoIntroName, NoIntroToken};
use shiratsu_naming::naming::TokenizedName;

use crate::config::{Config, ConversionRule};
use crate::error::Result;
use crate::path_safety::{self, AccessMode};
use crate::scanner::{ScanItem, ScanResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    Copy,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Skip,
    Overwrite,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    Planned,
    PlannedConvert,
    PlannedRename,
    Skipped,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConversionPlan {
    pub rule_name: String,
    pub tool_key: String,
    pub tool_path: Option<String>,
    pub args: Vec<String>,
    pub output_extension: String,
}

#[derive(Debug, Clone)]
pub struct SortAction {
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub platform_id: Option<String>,
    pub mode: SortMode,
    pub status: ActionStatus,
    pub convert: Option<ConversionPlan>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SortPlan {
    pub dest_root: PathBuf,
    pub actions: Vec<SortAction>,
}

/// Build a full sort plan from a scan result and configuration. Items are
/// processed in input-path order so the plan (and its conflict-driven
/// rename suffixes) is reproducible across runs.
pub fn plan_sort(scan_result: &ScanResult, config: &Config, dest_root: &Path, mode: SortMode) -> Result<SortPlan> {
    let sorting = &config.features.sorting;
    let mut items: Vec<&ScanItem> = scan_result.items.iter().collect();
    items.sort_by(|a, b| a.input_path.cmp(&b.input_path));

    let mut actions = Vec::with_capacity(items.len());
    let mut claimed_paths: HashSet<PathBuf> = HashSet::new();

    for item in items {
        path_safety::validate(&item.input_path, None, AccessMode::read())?;

        let confident = item.identification.platform_id.is_some()
            && item.identification.confidence >= sorting.confidence_threshold;

        if !confident {
            actions.push(plan_unknown_action(item, dest_root, sorting, mode));
            continue;
        }

        let platform_id = item.identification.platform_id.clone().unwrap();
        let mut dest_dir = dest_root.to_path_buf();
        if sorting.create_console_folders {
            dest_dir.push(&platform_id);
        }
        if sorting.region_based_sorting {
            dest_dir.push(infer_region_from_name(&item.input_path));
        }
        if sorting.preserve_folder_structure {
            if let Ok(relative) = item.input_path.strip_prefix(dest_root) {
                if let Some(parent) = relative.parent() {
                    dest_dir.push(parent);
                }
            }
        }

        let mut file_name = sorting
            .rename_template
            .as_deref()
            .map(|template| apply_rename_template(template, item, &platform_id))
            .unwrap_or_else(|| {
                item.input_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            });

        let mut status = ActionStatus::Planned;
        let mut convert = None;
        if sorting.conversion.enabled {
            if let Some(rule) = match_conversion_rule(&sorting.conversion.rules, &item.input_path, &platform_id) {
                match resolve_conversion_tool(rule) {
                    Ok(tool_path) => {
                        if let Some(stem) = Path::new(&file_name).file_stem().map(|s| s.to_string_lossy().to_string()) {
                            file_name = format!("{stem}.{}", rule.output_extension);
                        }
                        status = ActionStatus::PlannedConvert;
                        convert = Some(ConversionPlan {
                            rule_name: rule.name.clone(),
                            tool_key: rule.tool_key.clone(),
                            tool_path,
                            args: rule.args.clone(),
                            output_extension: rule.output_extension.clone(),
                        });
                    }
                    Err(_) if sorting.conversion.fallback_on_missing_tool => {}
                    Err(e) => {
                        actions.push(SortAction {
                            input_path: item.input_path.clone(),
                            output_path: None,
                            platform_id: Some(platform_id),
                            mode,
                            status: ActionStatus::Error,
                            convert: None,
                            reason: Some(e.to_string()),
                        });
                        continue;
                    }
                }
            }
        }

        let target = dest_dir.join(&file_name);
        let (resolved_target, resolved_status) = match resolve_target_path(&target, &claimed_paths, ConflictPolicy::Rename) {
            Some((path, renamed)) => (path, if renamed { ActionStatus::PlannedRename } else { status.clone() }),
            None => {
                actions.push(SortAction {
                    input_path: item.input_path.clone(),
                    output_path: Some(target),
                    platform_id: Some(platform_id),
                    mode,
                    status: ActionStatus::Skipped,
                    convert,
                    reason: Some("destination already exists".to_string()),
                });
                continue;
            }
        };

        let validated = path_safety::validate(&resolved_target, Some(dest_root), AccessMode::write())?;
        claimed_paths.insert(validated.clone());

        actions.push(SortAction {
            input_path: item.input_path.clone(),
            output_path: Some(validated),
            platform_id: Some(platform_id),
            mode,
            status: resolved_status,
            convert,
            reason: None,
        });
    }

    Ok(SortPlan {
        dest_root: dest_root.to_path_buf(),
        actions,
    })
}

/// Forces copy mode and skip-on-conflict, matching the original's
/// rebuild semantics: rebuilding from a DAT set must never destroy the
/// source tree or silently overwrite an existing rebuilt file.
pub fn plan_rebuild(scan_result: &ScanResult, config: &Config, dest_root: &Path) -> Result<SortPlan> {
    let mut plan = plan_sort(scan_result, config, dest_root, SortMode::Copy)?;
    for action in &mut plan.actions {
        if action.status == ActionStatus::PlannedRename {
            action.status = ActionStatus::Skipped;
            action.reason = Some("rebuild never renames on conflict".to_string());
        }
    }
    Ok(plan)
}

#[derive(Debug, Clone, Default)]
pub struct PlanDiff {
    pub added: Vec<SortAction>,
    pub removed: Vec<SortAction>,
    pub changed: Vec<(SortAction, SortAction)>,
}

/// Compare two plans by input path, useful for showing what a re-scan
/// would change before committing to it.
pub fn diff_sort_plans(before: &SortPlan, after: &SortPlan) -> PlanDiff {
    let mut before_by_input: HashMap<&Path, &SortAction> =
        before.actions.iter().map(|a| (a.input_path.as_path(), a)).collect();
    let mut diff = PlanDiff::default();

    for action in &after.actions {
        match before_by_input.remove(action.input_path.as_path()) {
            None => diff.added.push(action.clone()),
            Some(prior) => {
                if prior.output_path != action.output_path || prior.status != action.status {
                    diff.changed.push((prior.clone(), action.clone()));
                }
            }
        }
    }
    diff.removed = before_by_input.into_values().cloned().collect();
    diff
}

fn plan_unknown_action(
    item: &ScanItem,
    dest_root: &Path,
    sorting: &crate::config::SortingConfig,
    mode: SortMode,
) -> SortAction {
    let file_name = item
        .input_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if sorting.quarantine_unknown {
        let target = dest_root.join(&sorting.quarantine_folder_name).join(&file_name);
        return SortAction {
            input_path: item.input_path.clone(),
            output_path: Some(target),
            platform_id: None,
            mode,
            status: ActionStatus::Planned,
            convert: None,
            reason: Some("quarantined: low-confidence or unidentified".to_string()),
        };
    }

    if sorting.create_unknown_folder {
        let target = dest_root.join(&sorting.unknown_folder_name).join(&file_name);
        return SortAction {
            input_path: item.input_path.clone(),
            output_path: Some(target),
            platform_id: None,
            mode,
            status: ActionStatus::Planned,
            convert: None,
            reason: Some("unidentified: routed to unknown folder".to_string()),
        };
    }

    SortAction {
        input_path: item.input_path.clone(),
        output_path: None,
        platform_id: None,
        mode,
        status: ActionStatus::Skipped,
        convert: None,
        reason: Some("unidentified and no unknown/quarantine folder configured".to_string()),
    }
}

fn match_conversion_rule<'a>(
    rules: &'a [ConversionRule],
    path: &Path,
    platform_id: &str,
) -> Option<&'a ConversionRule> {
    let ext = path.extension().and_then(|e| e.to_str()).map(|e| format!(".{}", e.to_lowercase()))?;
    rules.iter().find(|rule| {
        rule.extensions.iter().any(|e| e.to_lowercase() == ext)
            && (rule.systems.is_empty() || rule.systems.iter().any(|s| s == platform_id))
    })
}

fn resolve_conversion_tool(rule: &ConversionRule) -> Result<Option<String>> {
    if let Some(explicit) = &rule.tool_path {
        return Ok(Some(explicit.clone()));
    }
    which::which(&rule.tool_key)
        .map(|p| Some(p.to_string_lossy().to_string()))
        .map_err(|_| crate::error::RomSorterError::MissingTool {
            tool: rule.tool_key.clone(),
        })
}

/// Resolve conflicts for a target path already claimed within this plan
/// or present on disk. Returns `None` under [`ConflictPolicy::Skip`];
/// otherwise the final path and whether a rename suffix was applied.
fn resolve_target_path(
    target: &Path,
    claimed: &HashSet<PathBuf>,
    policy: ConflictPolicy,
) -> Option<(PathBuf, bool)> {
    let exists = target.exists() || claimed.contains(target);
    if !exists {
        return Some((target.to_path_buf(), false));
    }

    match policy {
        ConflictPolicy::Skip => None,
        ConflictPolicy::Overwrite => Some((target.to_path_buf(), false)),
        ConflictPolicy::Rename => {
            let stem = target.file_stem()?.to_string_lossy().to_string();
            let ext = target.extension().map(|e| e.to_string_lossy().to_string());
            let parent = target.parent()?.to_path_buf();
            for n in 1..10_000 {
                let candidate_name = match &ext {
                    Some(ext) => format!("{stem} ({n}).{ext}"),
                    None => format!("{stem} ({n})"),
                };
                let candidate = parent.join(candidate_name);
                if !candidate.exists() && !claimed.contains(&candidate) {
                    return Some((candidate, true));
                }
            }
            None
        }
    }
}

/// Region inference prefers the No-Intro naming convention's own region
/// tag (`shiratsu-naming`'s tokenizer), since it recognizes the full
/// No-Intro region vocabulary rather than the handful of literals a regex
/// can practically enumerate. Falls back to the regex for names that
/// don't parse as No-Intro (homebrew dumps, arcade sets, ad hoc naming).
fn infer_region_from_name(path: &Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

    if let Ok(parsed) = NoIntroName::try_parse(&name) {
        for token in parsed.iter() {
            if let NoIntroToken::Region(_, regions) = token {
                if let Some(region) = regions.first() {
                    return format!("{region:?}");
                }
            }
        }
    }

    infer_region_from_name_fallback(&name)
}

fn infer_region_from_name_fallback(name: &str) -> String {
    lazy_static::lazy_static! {
        static ref REGION_RE: Regex = Regex::new(r"(?i)\((USA|Europe|Japan|World|Asia|Brazil|Korea)\)").unwrap();
    }
    REGION_RE
        .captures(name)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| "Unknown Region".to_string())
}

/// `{platform}`/`{region}`/`{stem}`/`{ext}` template substitution; an
/// unresolvable key is substituted with the empty string rather than
/// erroring, matching the original's `_SafeDict` fallback.
fn apply_rename_template(template: &str, item: &ScanItem, platform_id: &str) -> String {
    let stem = item
        .input_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = item
        .input_path
        .extension()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let region = infer_region_from_name(&item.input_path);

    let mut out = template.to_string();
    for (key, value) in [
        ("{platform}", platform_id),
        ("{region}", &region),
        ("{stem}", &stem),
        ("{ext}", &ext),
    ] {
        out = out.replace(key, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scanner::{DetectionSource, IdentificationResult};

    fn item(path: &str, platform_id: Option<&str>, confidence: f64) -> ScanItem {
        ScanItem {
            input_path: PathBuf::from(path),
            size_bytes: 100,
            hashes: None,
            container: None,
            identification: IdentificationResult {
                platform_id: platform_id.map(|s| s.to_string()),
                confidence,
                is_exact: confidence >= 1.0,
                source: match platform_id {
                    Some(p) => DetectionSource::ExtensionUnique { platform_id: p.to_string() },
                    None => DetectionSource::Unknown { reason: "test".to_string() },
                },
                evidence: vec![],
                reason: None,
            },
        }
    }

    #[test]
    fn confident_item_is_routed_under_platform_folder() {
        let mut config = Config::default();
        config.features.sorting.confidence_threshold = 0.5;
        let scan = ScanResult {
            items: vec![item("/roms/Game (USA).nes", Some("nes"), 0.9)],
            errors: vec![],
        };
        let plan = plan_sort(&scan, &config, Path::new("/dest"), SortMode::Copy).unwrap();
        assert_eq!(plan.actions.len(), 1);
        let output = plan.actions[0].output_path.as_ref().unwrap();
        assert!(output.starts_with("/dest/nes"));
    }

    #[test]
    fn low_confidence_item_goes_to_unknown_folder() {
        let config = Config::default();
        let scan = ScanResult {
            items: vec![item("/roms/mystery.bin", Some("psx"), 0.1)],
            errors: vec![],
        };
        let plan = plan_sort(&scan, &config, Path::new("/dest"), SortMode::Copy).unwrap();
        let output = plan.actions[0].output_path.as_ref().unwrap();
        assert!(output.starts_with("/dest/Unknown"));
    }

    #[test]
    fn rebuild_never_renames_on_conflict() {
        let mut config = Config::default();
        config.features.sorting.confidence_threshold = 0.5;
        let scan = ScanResult {
            items: vec![item("/roms/a.nes", Some("nes"), 0.9), item("/roms/b.nes", Some("nes"), 0.9)],
            errors: vec![],
        };
        let plan = plan_rebuild(&scan, &config, Path::new("/dest")).unwrap();
        assert!(plan.actions.iter().all(|a| a.status != ActionStatus::PlannedRename));
    }

    #[test]
    fn region_template_substitution_has_no_leftover_braces() {
        let item = item("/roms/Game (Europe).nes", Some("nes"), 0.9);
        let name = apply_rename_template("{platform}/{region}/{stem}.{ext}", &item, "nes");
        assert!(!name.contains('{'));
        assert!(name.contains("Europe"));
    }
}
