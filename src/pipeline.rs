use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sysinfo::Disks;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::app_config::AppConfig;
use crate::archive::{ArchiveOrchestrator, ExtractionOutcome, RepairOutcome};
use crate::dupes::{DuplicateCandidate, DuplicateDetector};
use crate::error::{Error, Result};
use crate::model::{
    FileOperation, FolderState, OperationOutcome, OutcomeLabel, ValidationCache,
    ValidationDecision, ValidationResult, VideoFolder, WorkPlan,
};
use crate::policy::{self, AdaptiveTimeoutPolicy, AdaptiveThreshold};
use crate::recovery::RetryRecoveryLayer;
use crate::safety::{sanitize_filename, EnforcementMode, LoopGuard, OperationContext, SafetyInvariantEngine};
use crate::scanner::{self, Scanner};
use crate::stats::{self, SessionStats, SharedStats, StatsTimer};
use crate::video::VideoValidator;

const SIZE_RATIO_BASE: f64 = 0.70;
const SIZE_RATIO_MIN: f64 = 0.50;
const SIZE_RATIO_MAX: f64 = 0.90;
const TICKER_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_PASSES: u32 = 2;
const RETRY_PASS_WAIT: Duration = Duration::from_secs(5);

/// Cooperative cancellation, checked between discrete steps.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub stats: SessionStats,
    pub violations: u64,
    pub folders_failed: u64,
    pub retries_pending: usize,
    pub elapsed: Duration,
}

/// Per-folder pipeline: repair -> extract -> validate -> dedupe -> move ->
/// clean, strictly sequential across folders, every destructive step
/// routed through the safety engine.
pub struct FolderLifecycleDriver {
    config: AppConfig,
    engine: SafetyInvariantEngine,
    policy: AdaptiveTimeoutPolicy,
    recovery: RetryRecoveryLayer,
    size_ratio: AdaptiveThreshold,
    cache: ValidationCache,
    stats: SharedStats,
    cancel: CancelToken,
    folders_failed: u64,
}

impl FolderLifecycleDriver {
    pub fn new(config: AppConfig) -> Self {
        Self::with_cache_dir(config, policy::default_cache_dir())
    }

    pub fn with_cache_dir(config: AppConfig, cache_dir: PathBuf) -> Self {
        let mode = if config.strict_safety {
            EnforcementMode::Strict
        } else {
            EnforcementMode::Permissive
        };
        let engine = SafetyInvariantEngine::new(
            Path::new(&config.destination_root),
            mode,
            config.disk_buffer_ratio,
        );
        let policy = AdaptiveTimeoutPolicy::load_or_benchmark(cache_dir.clone());
        let size_ratio = AdaptiveThreshold::new(
            "size_ratio",
            SIZE_RATIO_BASE,
            SIZE_RATIO_MIN,
            SIZE_RATIO_MAX,
        )
        .with_store(&cache_dir);
        let recovery = RetryRecoveryLayer::new(
            config.lock_holder_names.clone(),
            config.delete_retry_attempts,
            config.retry_queue_limit,
        );

        Self {
            config,
            engine,
            policy,
            recovery,
            size_ratio,
            cache: ValidationCache::new(),
            stats: SharedStats::new(),
            cancel: CancelToken::new(),
            folders_failed: 0,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn validation_cache(&self) -> &ValidationCache {
        &self.cache
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        let mut timer = StatsTimer::new();
        fs::create_dir_all(&self.config.destination_root)?;

        let stop = Arc::new(AtomicBool::new(false));
        let ticker = stats::spawn_ticker(self.stats.clone(), stop.clone(), TICKER_INTERVAL);

        let result = self.run_all_roots();

        stop.store(true, Ordering::SeqCst);
        let _ = ticker.join();
        timer.finish();

        result?;

        let pending = self.recovery.replay_queue(RETRY_PASSES, RETRY_PASS_WAIT);
        self.stats.update(|s| s.retries_queued = pending as u64);

        let summary = RunSummary {
            stats: self.stats.snapshot(),
            violations: self.engine.violation_count(),
            folders_failed: self.folders_failed,
            retries_pending: pending,
            elapsed: timer.get_duration(),
        };
        info!(
            "Run finished in {}: {} folders processed, {} videos moved, {} files deleted, \
             {} duplicates, {} safety violations",
            timer.get_duration_string(),
            summary.stats.folders_processed,
            summary.stats.videos_moved,
            summary.stats.files_deleted,
            summary.stats.duplicates_found,
            summary.violations,
        );
        Ok(summary)
    }

    fn run_all_roots(&mut self) -> Result<()> {
        for root in self.config.source_roots.clone() {
            let root = PathBuf::from(root);
            let plan = match Scanner::new(&self.config).build_work_plan(&root) {
                Ok(plan) => plan,
                Err(e) => {
                    error!("Skipping source root {}: {}", root.display(), e);
                    continue;
                }
            };
            self.execute_plan(&plan)?;
        }
        Ok(())
    }

    fn execute_plan(&mut self, plan: &WorkPlan) -> Result<()> {
        for folder in &plan.video_folders {
            self.check_cancel()?;
            if let Err(e) = self.process_video_folder(folder) {
                if matches!(e, Error::Cancelled) {
                    return Err(e);
                }
                error!("Folder {} failed: {}", folder.path.display(), e);
                self.folders_failed += 1;
            }
            self.stats.update(|s| s.folders_processed += 1);
        }

        for video in &plan.loose_videos {
            self.check_cancel()?;
            if let Err(e) = self.process_loose_video(video) {
                if matches!(e, Error::Cancelled) {
                    return Err(e);
                }
                error!("Loose video {} failed: {}", video.display(), e);
            }
        }

        for junk in &plan.junk_folders {
            self.check_cancel()?;
            self.remove_folder_if_still_removable(junk, false);
        }

        for content in &plan.content_folders {
            debug!(
                "Protected {:?} collection at {} ({} files); not touching it",
                content.kind,
                content.path.display(),
                content.file_count
            );
        }

        Ok(())
    }

    fn process_video_folder(&mut self, folder: &VideoFolder) -> Result<()> {
        let path = &folder.path;
        info!(
            "Processing {} ({} videos, {} archive parts, {} repair parts)",
            path.display(),
            folder.video_count,
            folder.archive_part_count,
            folder.repair_part_count
        );

        let mut state = FolderState::Scanned;
        let mut archives_removable = false;
        let mut archive_step_failed = false;
        let mut extraction_happened = false;

        // Repair strictly before extraction.
        if folder.repair_part_count > 0 {
            advance(&mut state, FolderState::Repairing)?;
            self.check_cancel()?;
            let outcome = ArchiveOrchestrator::new(&self.config).repair(path, &self.policy)?;
            match outcome {
                RepairOutcome::Repaired => info!("Repair pass fixed {}", path.display()),
                RepairOutcome::VerifiedOnly => {
                    debug!("Repair pass verified {} clean", path.display())
                }
                RepairOutcome::ToolMissing | RepairOutcome::NoRepairSets => {}
                RepairOutcome::Failed(reason) => {
                    warn!(
                        "Archive set in {} is unrecoverable: {}",
                        path.display(),
                        reason
                    );
                    // The archives are dead weight; remove them under the
                    // explicit unrecoverable authorization (I3).
                    let ctx = OperationContext {
                        unrecoverable: true,
                        ..OperationContext::default()
                    };
                    let removed = ArchiveOrchestrator::new(&self.config).cleanup_archives(
                        path,
                        &self.engine,
                        &mut self.recovery,
                        &ctx,
                    )?;
                    self.stats.update(|s| s.files_deleted += removed as u64);
                    archives_removable = true;
                    archive_step_failed = true;
                }
            }
        }

        // Extract first-part candidates.
        if folder.archive_part_count > 0 && !archive_step_failed {
            advance(&mut state, FolderState::Extracting)?;
            self.check_cancel()?;
            let report = ArchiveOrchestrator::new(&self.config).extract_all(path, &self.policy)?;
            extraction_happened = report.attempted > 0;
            for (size, elapsed) in &report.timings {
                self.policy.record_extraction(*size, *elapsed);
            }
            match report.outcome {
                ExtractionOutcome::Success => {
                    debug!("All {} archives extracted in {}", report.succeeded, path.display())
                }
                ExtractionOutcome::Partial => warn!(
                    "Partial extraction in {}: {}/{} archives",
                    path.display(),
                    report.succeeded,
                    report.attempted
                ),
                ExtractionOutcome::Failure => warn!(
                    "No archive extracted in {}; archives retained for a later retry",
                    path.display()
                ),
                ExtractionOutcome::NoArchives => {}
            }
        }

        // Validate every video now present.
        advance(&mut state, FolderState::Validating)?;
        let videos = collect_videos(path, self.config.max_scan_depth);
        let mut healthy: Vec<DuplicateCandidate> = Vec::new();
        for video in &videos {
            self.check_cancel()?;
            if let Some(candidate) = self.validate_video(video)? {
                healthy.push(candidate);
            }
        }

        // Archive deletion authorization per I3: extraction counts as
        // verified only once it yielded at least one healthy video.
        let extraction_verified = extraction_happened && !healthy.is_empty();

        // Duplicate detection over the validated set only.
        if healthy.len() > 1 {
            let records = {
                let detector = DuplicateDetector::new(&self.config);
                detector.detect(&healthy, |p| {
                    self.cache.get(p).and_then(|r| r.duration_secs)
                })
            };
            for record in records {
                info!(
                    "Duplicate: {} (keeping {}, {})",
                    record.candidate.display(),
                    record.keeper.display(),
                    record.reason
                );
                self.stats.update(|s| s.duplicates_found += 1);
                self.cache.record(ValidationResult::new(
                    &record.candidate,
                    ValidationDecision::FailDuplicate,
                    record.reason.clone(),
                ));
                healthy.retain(|c| c.path != record.candidate);
                self.delete_rejected(&record.candidate);
            }
        }

        // Move the keepers into the library.
        if !healthy.is_empty() {
            advance(&mut state, FolderState::Moving)?;
            for candidate in &healthy {
                self.check_cancel()?;
                if let Err(e) = self.move_to_destination(&candidate.path, candidate.size) {
                    warn!("Could not move {}: {}", candidate.path.display(), e);
                }
            }
        }

        // Clean the folder: archives (if authorized), junk files, then the
        // folder itself through the double-checked delete.
        advance(&mut state, FolderState::Cleaning)?;
        if extraction_verified {
            let ctx = OperationContext {
                extraction_verified: true,
                ..OperationContext::default()
            };
            let removed = ArchiveOrchestrator::new(&self.config).cleanup_archives(
                path,
                &self.engine,
                &mut self.recovery,
                &ctx,
            )?;
            if removed > 0 {
                debug!("Removed {} archive files from {}", removed, path.display());
                self.stats.update(|s| s.files_deleted += removed as u64);
            }
        }
        self.delete_junk_files(path);

        let removed = self.remove_folder_if_still_removable(path, archives_removable);
        if removed {
            advance(&mut state, FolderState::Done)?;
        } else if archive_step_failed {
            advance(&mut state, FolderState::Failed)?;
        } else {
            // Folder stays (locked file, unextracted archives, ...); it
            // will be picked up again on the next run.
            advance(&mut state, FolderState::Done)?;
        }

        Ok(())
    }

    /// Validate one video, record the result in the session cache, delete
    /// rejects, and return it as a duplicate-detection candidate if it is
    /// retainable.
    fn validate_video(&mut self, video: &Path) -> Result<Option<DuplicateCandidate>> {
        let size = match fs::metadata(video) {
            Ok(m) => m.len(),
            Err(e) => {
                warn!("Cannot stat {}: {}", video.display(), e);
                return Ok(None);
            }
        };

        let report = {
            let validator = VideoValidator::new(&self.config);
            match validator.validate(video, &self.policy, self.size_ratio.current()) {
                Ok(report) => report,
                Err(e) => {
                    warn!("Validation of {} errored: {}", video.display(), e);
                    return Ok(None);
                }
            }
        };

        if let (Some(elapsed), Some(duration)) =
            (report.decode_elapsed, report.result.duration_secs)
        {
            self.policy.record_decode(duration, elapsed);
        }

        // The ratio check and the decoder cross-check each other; their
        // agreement is the self-supervised signal the threshold learns from.
        if report.decode_elapsed.is_some() {
            let label = match (report.ratio_flagged, report.decode_corrupt) {
                (true, true) => OutcomeLabel::TruePositive,
                (true, false) => OutcomeLabel::FalsePositive,
                (false, true) => OutcomeLabel::FalseNegative,
                (false, false) => OutcomeLabel::TrueNegative,
            };
            self.size_ratio.record(OperationOutcome {
                timestamp: Utc::now(),
                operation: "validate".to_string(),
                path: video.to_path_buf(),
                size_bytes: size,
                duration_ms: report
                    .decode_elapsed
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
                decision: report.result.decision,
                outcome: label,
                note: String::new(),
            });
        }

        let decision = report.result.decision;
        debug!("{} -> {:?} ({})", video.display(), decision, report.result.note);
        self.cache.record(report.result);
        self.stats.update(|s| s.videos_validated += 1);

        match decision {
            ValidationDecision::Pass | ValidationDecision::FailLowQuality => {
                Ok(Some(DuplicateCandidate {
                    path: video.to_path_buf(),
                    size,
                }))
            }
            ValidationDecision::FailCorrupt | ValidationDecision::FailSample => {
                self.delete_rejected(video);
                Ok(None)
            }
            ValidationDecision::FailDuplicate | ValidationDecision::Unknown => Ok(None),
        }
    }

    /// Gated delete of a rejected file. I2 holds because the rejection was
    /// recorded in the cache before this runs.
    fn delete_rejected(&mut self, path: &Path) {
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let op = FileOperation::delete(path);
        let ctx = OperationContext::default();
        match self.engine.enforce(&op, &ctx, Some(&self.cache)) {
            Ok(true) => match self.recovery.delete_file_with_retry(path) {
                Ok(()) => {
                    self.stats.update(|s| {
                        s.files_deleted += 1;
                        s.bytes_reclaimed += size;
                    });
                }
                Err(e) => warn!("Delete of {} failed: {}", path.display(), e),
            },
            Ok(false) => {}
            Err(e) => warn!("Delete of {} refused: {}", path.display(), e),
        }
    }

    fn move_to_destination(&mut self, src: &Path, size: u64) -> Result<()> {
        let dest_root = PathBuf::from(&self.config.destination_root);
        let raw_name = src
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| "unnamed".to_string());
        let safe_name = sanitize_filename(&raw_name);

        let mut dest = dest_root.join(&safe_name);
        if dest.exists() {
            let dest_size = fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
            if dest_size == size {
                info!(
                    "{} already exists in destination with identical size; dropping source",
                    safe_name
                );
                self.cache.record(ValidationResult::new(
                    src,
                    ValidationDecision::FailDuplicate,
                    "identical file already in destination",
                ));
                self.stats.update(|s| s.duplicates_found += 1);
                self.delete_rejected(src);
                return Ok(());
            }
            dest = unique_destination(&dest_root, &safe_name)?;
        }

        // DiskExhaustion is discovered before the move starts, never
        // mid-write; the engine re-checks the same numbers under I5.
        let available = available_space(&dest_root);
        if let Some(available) = available {
            if !SafetyInvariantEngine::never_operate_without_disk_space(
                size,
                available,
                self.config.disk_buffer_ratio,
            ) {
                warn!(
                    "Skipping move of {}: {} bytes needed (x{} buffer), {} available",
                    src.display(),
                    size,
                    self.config.disk_buffer_ratio,
                    available
                );
                return Err(Error::DiskExhaustion {
                    required: size,
                    available,
                });
            }
        }

        let ctx = OperationContext {
            required_bytes: Some(size),
            available_bytes: available,
            ..OperationContext::default()
        };
        let op = FileOperation::move_to(src, &dest);
        if !self.engine.enforce(&op, &ctx, Some(&self.cache))? {
            return Ok(());
        }

        move_file(src, &dest, &mut self.recovery)?;

        // I10, post-hoc: the file must have landed inside the library.
        if !self.engine.provenance_contained(&dest) {
            return Err(Error::SafetyViolation {
                invariant: "I10",
                detail: format!("{} resolved outside the destination root", dest.display()),
            });
        }

        info!("Moved {} -> {}", src.display(), dest.display());
        self.stats.update(|s| s.videos_moved += 1);
        Ok(())
    }

    fn process_loose_video(&mut self, video: &Path) -> Result<()> {
        if let Some(candidate) = self.validate_video(video)? {
            self.move_to_destination(&candidate.path, candidate.size)?;
        }
        Ok(())
    }

    fn delete_junk_files(&mut self, folder: &Path) {
        let junk: Vec<PathBuf> = WalkDir::new(folder)
            .follow_links(false)
            .max_depth(self.config.max_scan_depth)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| scanner::is_junk_file(p))
            .collect();
        for file in junk {
            self.delete_rejected(&file);
        }
    }

    /// Folder deletion with the double-check pattern: removability is
    /// re-evaluated by the recovery layer immediately before `rmtree`.
    fn remove_folder_if_still_removable(&mut self, path: &Path, archives_removable: bool) -> bool {
        let removed = {
            let scanner = Scanner::new(&self.config);
            self.recovery
                .safe_delete_folder(path, |p| scanner.folder_is_removable(p, archives_removable))
        };
        match removed {
            Ok(true) => {
                self.stats.update(|s| s.folders_deleted += 1);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Could not remove folder {}: {}", path.display(), e);
                false
            }
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// State transitions are always strict; an illegal one is a bug, not an
/// environmental condition (I7).
fn advance(state: &mut FolderState, to: FolderState) -> Result<()> {
    if !SafetyInvariantEngine::transition_is_legal(*state, to) {
        return Err(Error::SafetyViolation {
            invariant: "I7",
            detail: format!("illegal transition {:?} -> {:?}", state, to),
        });
    }
    debug!("state {:?} -> {:?}", state, to);
    *state = to;
    Ok(())
}

fn collect_videos(folder: &Path, max_depth: usize) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(folder)
        .follow_links(false)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| scanner::is_video_file(p))
        .collect();
    videos.sort();
    videos
}

/// Append ` (N)` to the stem until the name is free; bounded so a
/// pathological destination cannot spin forever (I4).
fn unique_destination(dest_root: &Path, name: &str) -> Result<PathBuf> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) => (s, Some(e)),
        None => (name, None),
    };
    let mut guard = LoopGuard::new("unique-destination", 50);
    let mut n = 1u32;
    while guard.tick() {
        let candidate_name = match ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dest_root.join(candidate_name);
        if !candidate.exists() {
            return Ok(candidate);
        }
        n += 1;
    }
    Err(Error::Other(format!(
        "could not find a free destination name for '{}'",
        name
    )))
}

/// Available bytes on the filesystem holding `path`, from the mounted
/// disk with the longest matching mount point.
fn available_space(path: &Path) -> Option<u64> {
    let resolved = crate::utils::path::resolve_for_containment(path);
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| resolved.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

fn move_file(src: &Path, dest: &Path, recovery: &mut RetryRecoveryLayer) -> Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Cross-device move: copy then delete the source through the
            // retry layer.
            let copied = fs::copy(src, dest)?;
            let src_size = fs::metadata(src)?.len();
            if copied != src_size {
                let _ = fs::remove_file(dest);
                return Err(Error::Other(format!(
                    "short copy of {} ({} of {} bytes)",
                    src.display(),
                    copied,
                    src_size
                )));
            }
            recovery.delete_file_with_retry(src)
        }
    }
}
