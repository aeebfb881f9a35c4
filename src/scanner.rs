//! Concurrent file-tree scanner and identification engine.
//!
//! Tree walking and the bounded worker pool follow `import_roms.rs`/
//! `check_roms.rs` (`walkdir::WalkDir` plus a `rayon` thread pool sized
//! off `num_cpus`) and `indicatif`'s `ProgressBar` for batched progress,
//! the way `checksum.rs` wraps a reader in `pb.wrap_write`. The
//! identification policy itself — the strict candidate resolution,
//! magic-bytes last resort, and the archive short-circuit — follows
//! `controller.py::identify` and `platform_heuristics.py`.
//!
//! Each rayon worker is a plain OS thread outside the tokio runtime, so
//! DAT lookups (async, pool-backed) are bridged in via a captured
//! `tokio::runtime::Handle::block_on`, the same bridge `check_roms.rs`
//! uses to call async DB code from its own rayon fan-out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::config::ScannerConfig;
use crate::dat_index::DatIndex;
use crate::error::{Result, RomSorterError};
use crate::hasher::{self, FileHashes};
use crate::heuristics::{self, CandidateDetail, EvaluationStatus};
use crate::override_rules::OverrideRules;
use crate::path_safety;
use crate::platform_catalog::{PlatformCatalog, Policy};

/// Candidates below this confidence are reported as `Unknown` even
/// though a heuristic candidate technically exists.
const MIN_CONFIDENCE: f64 = 0.3;

/// The confidence a strict-policy extension-unique accept always carries.
const EXTENSION_UNIQUE_CONFIDENCE: f64 = 0.90;

/// The confidence `magic_bytes_override` assigns an iNES header match.
const NES_MAGIC_CONFIDENCE: f64 = 0.85;

#[derive(Debug, Clone, strum::Display)]
pub enum DetectionSource {
    #[strum(serialize = "dat:sha1")]
    DatSha1 { dat_id: i64, platform_id: String },
    #[strum(serialize = "dat:crc_size")]
    DatCrcSize { dat_id: i64, platform_id: String },
    #[strum(serialize = "extension-unique")]
    ExtensionUnique { platform_id: String },
    #[strum(serialize = "heuristic-accepted")]
    HeuristicAccepted { platform_id: String },
    #[strum(serialize = "ambiguous-candidates")]
    AmbiguousCandidates { platform_ids: Vec<String> },
    #[strum(serialize = "conflict-group")]
    ConflictGroup { platform_ids: Vec<String> },
    #[strum(serialize = "contradiction-candidates")]
    ContradictionCandidates { platform_ids: Vec<String> },
    #[strum(serialize = "magic-bytes")]
    MagicBytes { platform_id: String },
    #[strum(serialize = "override")]
    Override { platform_id: String },
    #[strum(serialize = "zip-conflict")]
    ZipConflict { platform_ids: Vec<String> },
    #[strum(serialize = "zip-mixed")]
    ZipMixed { platform_id: String },
    #[strum(serialize = "archive-lazy")]
    ArchiveLazy,
    #[strum(serialize = "ps3-directory")]
    Ps3Directory,
    #[strum(serialize = "unknown")]
    Unknown { reason: String },
}

#[derive(Debug, Clone)]
pub struct IdentificationResult {
    pub platform_id: Option<String>,
    pub confidence: f64,
    pub is_exact: bool,
    pub source: DetectionSource,
    /// Free-form evidence strings, e.g. `"DAT_CROSS_CHECK: ps2 vs psx"`.
    pub evidence: Vec<String>,
    /// Set only by override application (`"override:<rule_name>"`), kept
    /// distinct from `evidence` so callers can single out the override
    /// decision without scanning the whole list.
    pub reason: Option<String>,
}

impl IdentificationResult {
    fn unknown(reason: impl Into<String>) -> Self {
        Self {
            platform_id: None,
            confidence: 0.0,
            is_exact: false,
            source: DetectionSource::Unknown { reason: reason.into() },
            evidence: Vec::new(),
            reason: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanItem {
    pub input_path: PathBuf,
    pub size_bytes: u64,
    pub hashes: Option<FileHashes>,
    pub container: Option<String>,
    pub identification: IdentificationResult,
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub items: Vec<ScanItem>,
    pub errors: Vec<(PathBuf, String)>,
}

/// A unit of work discovered by the tree walk: either a plain file, or a
/// whole PS3 game directory treated as a single opaque item so the walk
/// never descends into its `PS3_GAME`/`USRDIR` contents.
enum WalkUnit {
    File(PathBuf),
    Ps3Directory(PathBuf),
}

impl WalkUnit {
    fn path(&self) -> &Path {
        match self {
            WalkUnit::File(p) | WalkUnit::Ps3Directory(p) => p,
        }
    }
}

type ScanCacheKey = (PathBuf, i64, u64);

pub struct Scanner {
    config: ScannerConfig,
    catalog: PlatformCatalog,
    overrides: OverrideRules,
    dat_index: Option<Arc<DatIndex>>,
    lazy_archive_extraction: bool,
    cache: Mutex<HashMap<ScanCacheKey, ScanItem>>,
}

impl Scanner {
    pub fn new(
        config: ScannerConfig,
        catalog: PlatformCatalog,
        overrides: OverrideRules,
        dat_index: Option<Arc<DatIndex>>,
        lazy_archive_extraction: bool,
    ) -> Self {
        Self {
            config,
            catalog,
            overrides,
            dat_index,
            lazy_archive_extraction,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Walk `root`, identify every file and PS3 game directory found, in
    /// parallel on a worker pool sized `min(32, max(4, config.max_threads))`,
    /// reporting progress in batches rather than one callback per item.
    pub async fn scan(
        &self,
        root: &Path,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(usize, usize) + Send,
    ) -> Result<ScanResult> {
        let entries = self.collect_entries(root);
        let total = entries.len();

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let num_threads = self.config.max_threads.clamp(4, 32);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| RomSorterError::invalid_path(root, format!("failed to build worker pool: {e}")))?;

        let handle = tokio::runtime::Handle::current();
        let done = AtomicUsize::new(0);
        let items: Mutex<Vec<ScanItem>> = Mutex::new(Vec::with_capacity(total));
        let errors: Mutex<Vec<(PathBuf, String)>> = Mutex::new(Vec::new());
        let progress = Mutex::new(&mut on_progress);
        let batch_size = progress_batch_size(total);

        pool.install(|| {
            entries.par_iter().for_each(|unit| {
                if cancel.is_cancelled() {
                    errors.lock().unwrap().push((unit.path().to_path_buf(), "cancelled".to_string()));
                } else {
                    match handle.block_on(self.identify_unit(unit, cancel)) {
                        Ok(item) => items.lock().unwrap().push(item),
                        Err(e) => errors.lock().unwrap().push((unit.path().to_path_buf(), e.to_string())),
                    }
                }

                let done = done.fetch_add(1, Ordering::SeqCst) + 1;
                if done % batch_size == 0 || done == total {
                    pb.set_position(done as u64);
                    (progress.lock().unwrap())(done, total);
                }
            });
        });

        pb.finish_and_clear();

        let mut items = items.into_inner().unwrap();
        items.sort_by(|a, b| a.input_path.cmp(&b.input_path));
        Ok(ScanResult { items, errors: errors.into_inner().unwrap() })
    }

    fn collect_entries(&self, root: &Path) -> Vec<WalkUnit> {
        let mut out = Vec::new();
        let mut it = WalkDir::new(root).follow_links(self.config.follow_symlinks).into_iter();
        while let Some(entry) = it.next() {
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_dir() {
                if entry.depth() > 0 && is_ps3_game_directory(entry.path()) {
                    out.push(WalkUnit::Ps3Directory(entry.path().to_path_buf()));
                    it.skip_current_dir();
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if self.is_ignored(&path) {
                continue;
            }
            out.push(WalkUnit::File(path));
        }
        out
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()));
        match ext {
            Some(ext) => self.config.ignore_extensions.iter().any(|i| i.to_lowercase() == ext),
            None => false,
        }
    }

    async fn identify_unit(&self, unit: &WalkUnit, cancel: &CancelToken) -> Result<ScanItem> {
        match unit {
            WalkUnit::File(path) => self.identify_file(path, cancel).await,
            WalkUnit::Ps3Directory(dir) => Ok(self.identify_ps3_directory(dir)),
        }
    }

    fn identify_ps3_directory(&self, dir: &Path) -> ScanItem {
        let size_bytes = directory_size(dir);
        let identification = IdentificationResult {
            platform_id: Some("ps3".to_string()),
            confidence: 0.95,
            is_exact: false,
            source: DetectionSource::Ps3Directory,
            evidence: vec!["PS3_GAME directory structure detected".to_string()],
            reason: None,
        };
        let item = ScanItem {
            input_path: dir.to_path_buf(),
            size_bytes,
            hashes: None,
            container: None,
            identification,
        };
        self.apply_overrides(item)
    }

    async fn identify_file(&self, path: &Path, cancel: &CancelToken) -> Result<ScanItem> {
        let metadata = std::fs::metadata(path).map_err(|e| RomSorterError::io(path, e))?;
        let size_bytes = metadata.len();
        let mtime = mtime_epoch_secs(&metadata);
        let cache_key = (path.to_path_buf(), mtime, size_bytes);

        if let Some(cached) = self.cache.lock().unwrap().get(&cache_key).cloned() {
            return Ok(cached);
        }

        let container = container_extension(path);

        let (hashes, identification) = if container.as_deref() == Some(".zip") {
            if self.lazy_archive_extraction {
                (None, archive_lazy_result())
            } else if let Some(result) = self.identify_zip_entries(path, cancel).await? {
                (None, result)
            } else {
                let hashes = hasher::hash_file(path, cancel, self.config.chunk_size)?;
                let id = self.identify_via_dat_then_heuristics(path, container.as_deref(), &hashes).await?;
                (Some(hashes), id)
            }
        } else {
            let hashes = hasher::hash_file(path, cancel, self.config.chunk_size)?;
            let id = self.identify_via_dat_then_heuristics(path, container.as_deref(), &hashes).await?;
            (Some(hashes), id)
        };

        let item = ScanItem {
            input_path: path.to_path_buf(),
            size_bytes,
            hashes,
            container,
            identification,
        };
        let item = self.apply_overrides(item);

        self.cache.lock().unwrap().insert(cache_key, item.clone());
        Ok(item)
    }

    /// Identification overrides are applied *after* the normal
    /// DAT/heuristic/magic-bytes pipeline resolves, overlaying the matched
    /// rule's platform and stamping `OVERRIDE_RULE` evidence — never
    /// consulted up front, so a DAT-confirmed identification is still
    /// visible in `evidence` even when a rule then overrides it.
    fn apply_overrides(&self, mut item: ScanItem) -> ScanItem {
        if let Some(hit) = self.overrides.match_path(&item.input_path) {
            item.identification.platform_id = Some(hit.platform_id.clone());
            item.identification.confidence = hit.confidence;
            item.identification.is_exact = true;
            item.identification.source = DetectionSource::Override { platform_id: hit.platform_id.clone() };
            item.identification.evidence.push("OVERRIDE_RULE".to_string());
            item.identification.evidence.push(format!("override:{}", hit.rule_name));
            item.identification.reason = Some(format!("override:{}", hit.rule_name));
        }
        item
    }

    /// Archive short-circuit: hash every zip entry, DAT-look up each one,
    /// and classify by agreement before falling back to whole-file
    /// hashing. Returns `None` when there's no DAT index to check against,
    /// or when nothing in the archive is DAT-confirmed.
    async fn identify_zip_entries(&self, path: &Path, cancel: &CancelToken) -> Result<Option<IdentificationResult>> {
        let Some(index) = &self.dat_index else {
            return Ok(None);
        };

        let file = std::fs::File::open(path).map_err(|e| RomSorterError::io(path, e))?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| RomSorterError::invalid_path(path, format!("invalid zip archive: {e}")))?;

        let mut confirmed: Vec<IdentificationResult> = Vec::new();
        let mut any_unconfirmed = false;

        for i in 0..archive.len() {
            if cancel.is_cancelled() {
                return Err(RomSorterError::Cancelled);
            }
            let Ok(mut entry) = archive.by_index(i) else {
                continue;
            };
            if entry.is_dir() {
                continue;
            }
            if path_safety::validate_archive_member_name(entry.name()).is_err() {
                continue;
            }

            let hashes = hasher::hash_reader(&mut entry, cancel, self.config.chunk_size)?;
            match self.identify_via_dat(index, &hashes).await? {
                Some(result) => confirmed.push(result),
                None => any_unconfirmed = true,
            }
        }

        if confirmed.is_empty() {
            return Ok(None);
        }

        let distinct_platforms: Vec<String> =
            confirmed.iter().filter_map(|r| r.platform_id.clone()).unique().collect();

        if distinct_platforms.len() > 1 {
            return Ok(Some(IdentificationResult {
                platform_id: None,
                confidence: 0.0,
                is_exact: false,
                source: DetectionSource::ZipConflict { platform_ids: distinct_platforms },
                evidence: vec!["zip entries matched different DAT platforms".to_string()],
                reason: None,
            }));
        }

        if any_unconfirmed {
            return Ok(Some(IdentificationResult {
                platform_id: None,
                confidence: 0.0,
                is_exact: false,
                source: DetectionSource::ZipMixed { platform_id: distinct_platforms[0].clone() },
                evidence: vec!["zip contains both DAT-confirmed and unconfirmed entries".to_string()],
                reason: None,
            }));
        }

        Ok(Some(IdentificationResult {
            platform_id: Some(distinct_platforms[0].clone()),
            confidence: 1.0,
            is_exact: true,
            source: confirmed[0].source.clone(),
            evidence: vec![format!("all zip entries match dat platform {}", distinct_platforms[0])],
            reason: None,
        }))
    }

    async fn identify_via_dat_then_heuristics(
        &self,
        path: &Path,
        container: Option<&str>,
        hashes: &FileHashes,
    ) -> Result<IdentificationResult> {
        if let Some(index) = &self.dat_index {
            if let Some(result) = self.identify_via_dat(index, hashes).await? {
                return Ok(result);
            }
        }
        Ok(self.identify_via_heuristics(path, container))
    }

    async fn identify_via_dat(
        &self,
        index: &DatIndex,
        hashes: &FileHashes,
    ) -> Result<Option<IdentificationResult>> {
        if let Some(hit) = index.lookup_sha1(&hashes.sha1_hex).await? {
            let mut evidence = vec![format!("SHA1 match in dat_id {}", hit.dat_id)];

            let cross_hits = index.lookup_crc_size(&hashes.crc32_hex, hashes.size_bytes).await?;
            for cross in &cross_hits {
                if cross.dat_id != hit.dat_id && cross.platform_id != hit.platform_id {
                    evidence.push(format!(
                        "DAT_CROSS_CHECK: sha1 matches {} but crc/size also matches {}",
                        hit.platform_id, cross.platform_id
                    ));
                }
            }

            return Ok(Some(IdentificationResult {
                platform_id: Some(hit.platform_id.clone()),
                confidence: 1.0,
                is_exact: true,
                source: DetectionSource::DatSha1 {
                    dat_id: hit.dat_id,
                    platform_id: hit.platform_id,
                },
                evidence,
                reason: None,
            }));
        }

        let crc_hits = index.lookup_crc_size(&hashes.crc32_hex, hashes.size_bytes).await?;
        if let Some(first) = crc_hits.first() {
            let mut evidence = vec!["CRC32+size match (DAT row has no SHA-1)".to_string()];
            if crc_hits.iter().any(|h| h.dat_id != first.dat_id && h.platform_id != first.platform_id) {
                evidence.push("DAT_CROSS_CHECK: multiple dat_ids share this crc/size".to_string());
            }
            return Ok(Some(IdentificationResult {
                platform_id: Some(first.platform_id.clone()),
                confidence: 1.0,
                is_exact: true,
                source: DetectionSource::DatCrcSize {
                    dat_id: first.dat_id,
                    platform_id: first.platform_id.clone(),
                },
                evidence,
                reason: None,
            }));
        }

        Ok(None)
    }

    fn identify_via_heuristics(&self, path: &Path, container: Option<&str>) -> IdentificationResult {
        let evaluation = heuristics::evaluate_platform_candidates(&self.catalog, path, container);

        if evaluation.policy != EvaluationStatus::Ok {
            return IdentificationResult::unknown(evaluation.reason);
        }

        let classified = classify_candidates(&self.catalog.policy, &evaluation.candidate_details);
        if classified.platform_id.is_some() {
            return classified;
        }

        // Magic bytes is a last resort for bare extensions the heuristic
        // evaluator couldn't resolve to anything.
        magic_bytes_override(path).unwrap_or(classified)
    }
}

fn mtime_epoch_secs(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn progress_batch_size(total: usize) -> usize {
    (total / 100).max(1)
}

fn container_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    matches!(ext.as_str(), "zip" | "7z").then(|| format!(".{ext}"))
}

fn archive_lazy_result() -> IdentificationResult {
    IdentificationResult {
        platform_id: None,
        confidence: 0.0,
        is_exact: false,
        source: DetectionSource::ArchiveLazy,
        evidence: vec!["lazy archive extraction: entry hashing skipped".to_string()],
        reason: None,
    }
}

fn is_ps3_game_directory(dir: &Path) -> bool {
    dir.join("PS3_GAME").join("PARAM.SFO").is_file()
        || dir.join("PS3_GAME").join("USRDIR").join("EBOOT.BIN").is_file()
}

fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Resolve the ranked heuristic candidate list into an outcome: unique
/// extension, ambiguous extension, shared conflict group, contradiction,
/// otherwise an accept/reject gate at confidence `0.95`.
fn classify_candidates(policy: &Policy, details: &[CandidateDetail]) -> IdentificationResult {
    if details.is_empty() {
        return IdentificationResult::unknown("no platform candidates");
    }

    let top = &details[0];
    let top_score = top.score;
    let within_tolerance: Vec<&CandidateDetail> =
        details.iter().take_while(|d| top_score - d.score < policy.min_score_delta).collect();

    if within_tolerance.len() == 1 {
        if top_score < MIN_CONFIDENCE {
            return IdentificationResult::unknown("below confidence floor");
        }
        return IdentificationResult {
            platform_id: Some(top.platform_id.clone()),
            confidence: EXTENSION_UNIQUE_CONFIDENCE,
            is_exact: false,
            source: DetectionSource::ExtensionUnique { platform_id: top.platform_id.clone() },
            evidence: vec![format!("extension-unique, score {top_score:.1}")],
            reason: None,
        };
    }

    let runner = details[1];
    let platform_ids: Vec<String> = within_tolerance.iter().map(|d| d.platform_id.clone()).collect();
    let both_above_min_top = top_score >= policy.min_top_score && runner.score >= policy.min_top_score;

    if both_above_min_top
        && (top_score - runner.score) < policy.min_score_delta
        && !has_token_discriminator(top, runner)
    {
        return IdentificationResult {
            platform_id: None,
            confidence: 0.0,
            is_exact: false,
            source: DetectionSource::AmbiguousCandidates { platform_ids },
            evidence: vec![format!(
                "{} candidates within scoring tolerance, no token discriminator",
                within_tolerance.len()
            )],
            reason: None,
        };
    }

    if both_above_min_top {
        if let Some(shared) = shared_conflict_group(top, runner) {
            return IdentificationResult {
                platform_id: None,
                confidence: 0.0,
                is_exact: false,
                source: DetectionSource::ConflictGroup {
                    platform_ids: vec![top.platform_id.clone(), runner.platform_id.clone()],
                },
                evidence: vec![format!("shares conflict group(s) {}", shared.join(", "))],
                reason: None,
            };
        }
    }

    if top_score >= policy.contradiction_min_score && has_token_contradiction(&within_tolerance) {
        return IdentificationResult {
            platform_id: None,
            confidence: 0.0,
            is_exact: false,
            source: DetectionSource::ContradictionCandidates { platform_ids },
            evidence: vec!["contradicting positive/negative tokens across candidates".to_string()],
            reason: None,
        };
    }

    let accepted_confidence = (0.5 + 0.1 * top_score).min(0.95);
    if accepted_confidence >= 0.95 {
        return IdentificationResult {
            platform_id: Some(top.platform_id.clone()),
            confidence: accepted_confidence,
            is_exact: false,
            source: DetectionSource::HeuristicAccepted { platform_id: top.platform_id.clone() },
            evidence: vec![format!("score {top_score:.1}")],
            reason: None,
        };
    }

    IdentificationResult::unknown("below confidence floor")
}

fn has_token_discriminator(a: &CandidateDetail, b: &CandidateDetail) -> bool {
    a.matched_positive_tokens != b.matched_positive_tokens
}

fn has_token_contradiction(contenders: &[&CandidateDetail]) -> bool {
    for a in contenders {
        for b in contenders {
            if a.platform_id == b.platform_id {
                continue;
            }
            if a.matched_negative_tokens
                .iter()
                .any(|neg| b.matched_positive_tokens.iter().any(|pos| pos == neg))
            {
                return true;
            }
        }
    }
    false
}

fn shared_conflict_group(a: &CandidateDetail, b: &CandidateDetail) -> Option<Vec<String>> {
    let shared: Vec<String> =
        a.conflict_groups.iter().filter(|g| b.conflict_groups.contains(g)).cloned().collect();
    (!shared.is_empty()).then_some(shared)
}

/// Last-resort identification via magic bytes, consulted only when
/// heuristic scoring produced no usable candidate. The iNES header
/// (`NES\x1a`) is checked directly; everything else goes through `infer`.
fn magic_bytes_override(path: &Path) -> Option<IdentificationResult> {
    if let Ok(mut file) = std::fs::File::open(path) {
        use std::io::Read;
        let mut head = [0u8; 4];
        if file.read_exact(&mut head).is_ok() && &head == b"NES\x1a" {
            return Some(IdentificationResult {
                platform_id: Some("nes".to_string()),
                confidence: NES_MAGIC_CONFIDENCE,
                is_exact: false,
                source: DetectionSource::MagicBytes { platform_id: "nes".to_string() },
                evidence: vec!["magic bytes matched iNES header".to_string()],
                reason: None,
            });
        }
    }

    let kind = infer::get_from_path(path).ok().flatten()?;
    let platform_id = match kind.mime_type() {
        "application/x-iso9660-image" => "psx",
        _ => return None,
    };
    Some(IdentificationResult {
        platform_id: Some(platform_id.to_string()),
        confidence: 0.5,
        is_exact: false,
        source: DetectionSource::MagicBytes {
            platform_id: platform_id.to_string(),
        },
        evidence: vec![format!("magic bytes matched {}", kind.mime_type())],
        reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform_catalog::PlatformEntry;

    fn nes_entry() -> PlatformEntry {
        PlatformEntry {
            platform_id: "nes".to_string(),
            display_name: "NES".to_string(),
            canonical_name: None,
            aliases: vec![],
            category: None,
            media_types: vec![],
            extensions: vec![".nes".to_string()],
            containers: vec![],
            positive_tokens: vec![],
            negative_tokens: vec![],
            minimum_signals: vec!["extension".to_string()],
            conflict_groups: vec![],
        }
    }

    fn famicom_entry() -> PlatformEntry {
        PlatformEntry {
            platform_id: "famicom".to_string(),
            display_name: "Famicom".to_string(),
            canonical_name: None,
            aliases: vec![],
            category: None,
            media_types: vec![],
            extensions: vec![".nes".to_string()],
            containers: vec![],
            positive_tokens: vec![],
            negative_tokens: vec![],
            minimum_signals: vec!["extension".to_string()],
            conflict_groups: vec![],
        }
    }

    #[test]
    fn single_confident_candidate_is_extension_unique_at_090() {
        let catalog = PlatformCatalog { platforms: vec![nes_entry()], ..Default::default() };
        let eval = heuristics::evaluate_platform_candidates(&catalog, Path::new("game.nes"), None);
        let id = classify_candidates(&catalog.policy, &eval.candidate_details);
        assert!(matches!(id.source, DetectionSource::ExtensionUnique { .. }));
        assert_eq!(id.platform_id.as_deref(), Some("nes"));
        assert_eq!(id.confidence, EXTENSION_UNIQUE_CONFIDENCE);
    }

    #[test]
    fn no_candidates_is_unknown() {
        let id = classify_candidates(&Policy::default(), &[]);
        assert!(matches!(id.source, DetectionSource::Unknown { .. }));
        assert!(id.platform_id.is_none());
    }

    #[test]
    fn two_platforms_sharing_an_extension_with_no_tokens_are_ambiguous() {
        let catalog = PlatformCatalog { platforms: vec![nes_entry(), famicom_entry()], ..Default::default() };
        let eval = heuristics::evaluate_platform_candidates(&catalog, Path::new("game.nes"), None);
        let id = classify_candidates(&catalog.policy, &eval.candidate_details);
        assert!(matches!(id.source, DetectionSource::AmbiguousCandidates { .. }));
        assert!(id.platform_id.is_none());
    }

    #[test]
    fn shared_conflict_group_platforms_are_flagged() {
        let mut psx = nes_entry();
        psx.platform_id = "psx".to_string();
        psx.conflict_groups = vec!["optical-disc".to_string()];
        let mut ps2 = famicom_entry();
        ps2.platform_id = "ps2".to_string();
        ps2.conflict_groups = vec!["optical-disc".to_string()];

        let top = CandidateDetail {
            platform_id: psx.platform_id.clone(),
            display_name: psx.display_name.clone(),
            score: 2.0,
            matched_extension: true,
            matched_container: false,
            matched_positive_tokens: vec![],
            matched_negative_tokens: vec![],
            conflict_groups: psx.conflict_groups.clone(),
        };
        let runner = CandidateDetail {
            platform_id: ps2.platform_id.clone(),
            display_name: ps2.display_name.clone(),
            score: 2.0,
            matched_extension: true,
            matched_container: false,
            matched_positive_tokens: vec![],
            matched_negative_tokens: vec![],
            conflict_groups: ps2.conflict_groups.clone(),
        };
        assert_eq!(shared_conflict_group(&top, &runner), Some(vec!["optical-disc".to_string()]));

        let policy = Policy { min_score_delta: 1.0, min_top_score: 2.0, contradiction_min_score: 3.0 };
        let id = classify_candidates(&policy, &[top, runner]);
        assert!(matches!(id.source, DetectionSource::ConflictGroup { .. }));
    }

    #[test]
    fn override_application_overlays_evidence_and_reason() {
        let mut rules = OverrideRules::empty();
        rules.add("*.rom", "genesis");
        let scanner = Scanner::new(ScannerConfig::default(), PlatformCatalog::default(), rules, None, false);
        let item = ScanItem {
            input_path: PathBuf::from("game.rom"),
            size_bytes: 10,
            hashes: None,
            container: None,
            identification: IdentificationResult::unknown("no platform candidates"),
        };
        let item = scanner.apply_overrides(item);
        assert_eq!(item.identification.platform_id.as_deref(), Some("genesis"));
        assert!(item.identification.evidence.contains(&"OVERRIDE_RULE".to_string()));
        assert!(item.identification.reason.as_deref().unwrap().starts_with("override:"));
    }

    #[test]
    fn ps3_directory_detection_requires_param_sfo_or_eboot() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("My Game");
        std::fs::create_dir_all(root.join("PS3_GAME")).unwrap();
        assert!(!is_ps3_game_directory(&root));

        std::fs::write(root.join("PS3_GAME").join("PARAM.SFO"), b"x").unwrap();
        assert!(is_ps3_game_directory(&root));
    }
}
