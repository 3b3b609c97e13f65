use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ahash::AHashMap;
use tracing::{debug, error, info, warn};

use crate::app_config::AppConfig;
use crate::error::Result;
use crate::model::FileOperation;
use crate::policy::AdaptiveTimeoutPolicy;
use crate::recovery::RetryRecoveryLayer;
use crate::safety::{LoopGuard, OperationContext, SafetyInvariantEngine};
use crate::scanner;
use crate::tool::{self, ToolResult};

/// One repair set: the main index file plus its volume files.
#[derive(Debug, Clone)]
pub struct RepairSet {
    pub main: PathBuf,
    pub volumes: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The tool rewrote damaged blocks.
    Repaired,
    /// The tool verified the set and found nothing to fix.
    VerifiedOnly,
    /// The set is beyond recovery; the archives it covers are dead weight.
    Failed(String),
    ToolMissing,
    NoRepairSets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Success,
    Partial,
    Failure,
    NoArchives,
}

#[derive(Debug)]
pub struct ExtractionReport {
    pub outcome: ExtractionOutcome,
    pub attempted: usize,
    pub succeeded: usize,
    /// (archive size, wall time) per successful extraction, for the
    /// policy's learned-speed update.
    pub timings: Vec<(u64, Duration)>,
    pub loop_aborted: bool,
}

/// Invokes repair and extraction tools under timeout and loop guards.
/// Repair runs strictly before extraction; archive cleanup goes through
/// the safety engine (I3) and never happens implicitly.
pub struct ArchiveOrchestrator<'a> {
    config: &'a AppConfig,
}

impl<'a> ArchiveOrchestrator<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        Self { config }
    }

    /// Run the repair tool over every repair set in the folder. One pass
    /// per set: the tool verifies and only repairs when needed.
    pub fn repair(&self, folder: &Path, policy: &AdaptiveTimeoutPolicy) -> Result<RepairOutcome> {
        let sets = find_repair_sets(folder);
        if sets.is_empty() {
            return Ok(RepairOutcome::NoRepairSets);
        }

        let covered_bytes = archive_and_repair_bytes(folder);
        let timeout = policy.extraction_timeout(covered_bytes);
        let mut repaired_any = false;

        for set in &sets {
            let result = tool::run_with_timeout(
                &self.config.repair_tool,
                [OsStr::new("r"), set.main.as_os_str()],
                timeout,
            )?;

            let output = match result {
                ToolResult::NotFound => {
                    warn!(
                        "Repair tool '{}' not installed; skipping repair step",
                        self.config.repair_tool
                    );
                    return Ok(RepairOutcome::ToolMissing);
                }
                ToolResult::Output(output) => output,
            };

            if output.timed_out {
                return Ok(RepairOutcome::Failed(format!(
                    "repair of {} exceeded {}s",
                    set.main.display(),
                    timeout.as_secs()
                )));
            }
            if !output.success {
                return Ok(RepairOutcome::Failed(format!(
                    "repair tool exited {:?} for {}",
                    output.exit_code,
                    set.main.display()
                )));
            }

            // "Repaired" vs "verified only" is read from output text for
            // logging; control flow only cares about the exit code.
            let combined = output.combined_lower();
            if combined.contains("repair complete") || combined.contains("repaired") {
                info!("Repaired archive set {}", set.main.display());
                repaired_any = true;
            } else {
                debug!("Archive set {} verified, no repair needed", set.main.display());
            }
        }

        Ok(if repaired_any {
            RepairOutcome::Repaired
        } else {
            RepairOutcome::VerifiedOnly
        })
    }

    /// Extract every first-part candidate in the folder. Each call runs
    /// under its own policy-derived timeout; the whole loop is capped by a
    /// hard circuit breaker.
    pub fn extract_all(
        &self,
        folder: &Path,
        policy: &AdaptiveTimeoutPolicy,
    ) -> Result<ExtractionReport> {
        let candidates = find_archive_candidates(folder);
        if candidates.is_empty() {
            return Ok(ExtractionReport {
                outcome: ExtractionOutcome::NoArchives,
                attempted: 0,
                succeeded: 0,
                timings: Vec::new(),
                loop_aborted: false,
            });
        }

        let mut guard = LoopGuard::new(
            format!("extract:{}", folder.display()),
            self.config.max_extraction_iterations,
        );
        let mut attempted = 0usize;
        let mut succeeded = 0usize;
        let mut timings = Vec::new();
        let mut loop_aborted = false;

        for candidate in &candidates {
            // I4: hard circuit breaker, not a soft warning.
            if !guard.tick() {
                error!(
                    "Extraction loop bound hit in {}; aborting remaining archives",
                    folder.display()
                );
                loop_aborted = true;
                break;
            }

            let size = fs::metadata(candidate).map(|m| m.len()).unwrap_or(0);
            let timeout = policy.extraction_timeout(size);
            attempted += 1;

            let output_arg = format!("-o{}", folder.display());
            let result = tool::run_with_timeout(
                &self.config.extraction_tool,
                [
                    OsStr::new("x"),
                    candidate.as_os_str(),
                    OsStr::new(&output_arg),
                    OsStr::new("-aoa"),
                    OsStr::new("-y"),
                ],
                timeout,
            )?;

            match result {
                ToolResult::NotFound => {
                    error!(
                        "Extraction tool '{}' not installed; cannot extract {}",
                        self.config.extraction_tool,
                        folder.display()
                    );
                    break;
                }
                ToolResult::Output(output) => {
                    if output.success {
                        info!(
                            "Extracted {} in {:.1}s",
                            candidate.display(),
                            output.elapsed.as_secs_f64()
                        );
                        succeeded += 1;
                        timings.push((size, output.elapsed));
                    } else if output.timed_out {
                        warn!(
                            "Extraction of {} timed out after {}s",
                            candidate.display(),
                            timeout.as_secs()
                        );
                    } else {
                        warn!(
                            "Extraction of {} failed with exit {:?}",
                            candidate.display(),
                            output.exit_code
                        );
                    }
                }
            }
        }

        let outcome = if succeeded == attempted && succeeded > 0 && !loop_aborted {
            ExtractionOutcome::Success
        } else if succeeded > 0 {
            ExtractionOutcome::Partial
        } else {
            ExtractionOutcome::Failure
        };

        Ok(ExtractionReport {
            outcome,
            attempted,
            succeeded,
            timings,
            loop_aborted,
        })
    }

    /// Delete the folder's archive and repair-set files. Every delete is
    /// authorized individually by the safety engine; without a legitimate
    /// `extraction_verified`/`unrecoverable` flag in the context this
    /// removes nothing (I3).
    pub fn cleanup_archives(
        &self,
        folder: &Path,
        engine: &SafetyInvariantEngine,
        recovery: &mut RetryRecoveryLayer,
        ctx: &OperationContext,
    ) -> Result<usize> {
        let mut deleted = 0usize;
        let entries = match fs::read_dir(folder) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read {} for archive cleanup: {}", folder.display(), e);
                return Ok(0);
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if !scanner::is_archive_file(&path) && !scanner::is_repair_file(&path) {
                continue;
            }

            let op = FileOperation::delete(&path);
            if !engine.enforce(&op, ctx, None)? {
                continue;
            }
            match recovery.delete_file_with_retry(&path) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Archive cleanup of {} failed: {}", path.display(), e),
            }
        }

        Ok(deleted)
    }
}

fn archive_and_repair_bytes(folder: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(folder) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| {
            let p = e.path();
            scanner::is_archive_file(&p) || scanner::is_repair_file(&p)
        })
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Group a folder's `.par2` files into repair sets keyed by base name.
pub fn find_repair_sets(folder: &Path) -> Vec<RepairSet> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Vec::new();
    };

    let mut groups: AHashMap<String, Vec<PathBuf>> = AHashMap::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || !scanner::is_repair_file(&path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let lower = name.to_ascii_lowercase();
        let Some(mut base) = lower.strip_suffix(".par2").map(str::to_string) else {
            continue;
        };
        if let Some(idx) = base.rfind(".vol") {
            base.truncate(idx);
        }
        groups.entry(base).or_default().push(path);
    }

    let mut sets: Vec<RepairSet> = groups
        .into_iter()
        .map(|(base, mut files)| {
            files.sort();
            let index_name = format!("{}.par2", base);
            let main_pos = files
                .iter()
                .position(|f| {
                    f.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.to_ascii_lowercase() == index_name)
                })
                .unwrap_or(0);
            let main = files.remove(main_pos);
            RepairSet {
                main,
                volumes: files,
            }
        })
        .collect();
    sets.sort_by(|a, b| a.main.cmp(&b.main));
    sets
}

/// First-part-only candidate selection: a multi-part archive contributes
/// exactly one extraction candidate.
pub fn find_archive_candidates(folder: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Vec::new();
    };
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| is_first_part(&n.to_ascii_lowercase()))
        })
        .collect();
    candidates.sort();
    candidates
}

fn is_first_part(name: &str) -> bool {
    if let Some(stem) = name.strip_suffix(".rar") {
        if let Some(idx) = stem.rfind(".part") {
            let digits = &stem[idx + ".part".len()..];
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return digits.parse::<u32>() == Ok(1);
            }
        }
        return true;
    }
    if name.ends_with(".7z") || name.ends_with(".zip") {
        return true;
    }
    if let Some(idx) = name.rfind('.') {
        let ext = &name[idx + 1..];
        if ext.len() == 3 && ext.chars().all(|c| c.is_ascii_digit()) {
            return ext == "001";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_part_selection() {
        assert!(is_first_part("movie.part001.rar"));
        assert!(is_first_part("movie.part1.rar"));
        assert!(!is_first_part("movie.part002.rar"));
        assert!(!is_first_part("movie.part17.rar"));
        assert!(is_first_part("movie.rar"));
        assert!(is_first_part("movie.7z"));
        assert!(is_first_part("movie.7z.001"));
        assert!(!is_first_part("movie.7z.002"));
        assert!(is_first_part("movie.zip"));
        assert!(!is_first_part("movie.r00"));
        assert!(!is_first_part("movie.mkv"));
    }

    #[test]
    fn test_candidates_are_first_parts_only() {
        let tmp = tempfile::tempdir().unwrap();
        for name in [
            "a.part001.rar",
            "a.part002.rar",
            "a.part003.rar",
            "b.7z.001",
            "b.7z.002",
            "c.zip",
        ] {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        let candidates = find_archive_candidates(tmp.path());
        let names: Vec<String> = candidates
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.part001.rar", "b.7z.001", "c.zip"]);
    }

    #[test]
    fn test_repair_set_grouping() {
        let tmp = tempfile::tempdir().unwrap();
        for name in [
            "movie.par2",
            "movie.vol000+01.par2",
            "movie.vol001+02.par2",
            "other.par2",
        ] {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        let sets = find_repair_sets(tmp.path());
        assert_eq!(sets.len(), 2);
        let movie = sets
            .iter()
            .find(|s| s.main.file_name().unwrap() == "movie.par2")
            .unwrap();
        assert_eq!(movie.volumes.len(), 2);
    }
}
