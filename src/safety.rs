use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{
    FileOperation, FolderState, OperationKind, ValidationCache, ValidationDecision,
};
use crate::scanner;
use crate::utils::path::{is_within, resolve_for_containment};

/// Subprocess timeouts above this are suspicious but still accepted (I8).
const EXCESSIVE_TIMEOUT_SECS: u64 = 7200;

#[derive(Debug, Clone)]
pub struct Violation {
    pub invariant: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
    /// Violations abort the operation with an error.
    Strict,
    /// Violations are logged and the operation is refused without error.
    Permissive,
}

/// Per-call authorization context for an operation check. Flags are never
/// inferred; the caller must set them explicitly.
#[derive(Debug, Default, Clone)]
pub struct OperationContext {
    /// Archive deletion authorization: the folder's extraction produced at
    /// least one validated healthy video (I3).
    pub extraction_verified: bool,
    /// Archive deletion authorization: the repair tool declared the set
    /// unrecoverable (I3).
    pub unrecoverable: bool,
    /// Bytes the operation will consume, for the disk buffer check (I5).
    pub required_bytes: Option<u64>,
    /// Bytes available on the target filesystem (I5).
    pub available_bytes: Option<u64>,
}

/// Executable predicates gating every destructive operation. Nothing else
/// in the crate owns filesystem authority; all deletes and moves funnel
/// through `enforce`.
pub struct SafetyInvariantEngine {
    destination_root: PathBuf,
    mode: EnforcementMode,
    buffer_ratio: f64,
    violations: AtomicU64,
}

impl SafetyInvariantEngine {
    pub fn new(destination_root: &Path, mode: EnforcementMode, buffer_ratio: f64) -> Self {
        Self {
            destination_root: resolve_for_containment(destination_root),
            mode,
            buffer_ratio,
            violations: AtomicU64::new(0),
        }
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    pub fn violation_count(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// I1: every Write/Move target must resolve inside the destination root.
    pub fn path_within_destination(&self, op: &FileOperation) -> bool {
        let target = match op.kind {
            OperationKind::Move => match &op.destination {
                Some(d) => d.as_path(),
                None => return false,
            },
            OperationKind::Write | OperationKind::Overwrite => op.target.as_path(),
            OperationKind::Delete => return true,
        };
        is_within(target, &self.destination_root)
    }

    /// I2: a video whose last validation decision is Pass may never be
    /// the target of a Delete.
    pub fn validated_video_protected(&self, op: &FileOperation, cache: &ValidationCache) -> bool {
        if op.kind != OperationKind::Delete || !scanner::is_video_file(&op.target) {
            return true;
        }
        cache.decision_for(&op.target) != Some(ValidationDecision::Pass)
    }

    /// I3: archive/repair-set files may only be deleted under an explicit
    /// authorization flag in the call context.
    pub fn archive_deletion_authorized(&self, op: &FileOperation, ctx: &OperationContext) -> bool {
        if op.kind != OperationKind::Delete {
            return true;
        }
        if !scanner::is_archive_file(&op.target) && !scanner::is_repair_file(&op.target) {
            return true;
        }
        ctx.extraction_verified || ctx.unrecoverable
    }

    /// I4: a named loop must stay below its configured bound.
    pub fn loop_within_bound(name: &str, count: u64, max: u64) -> bool {
        if count < max {
            true
        } else {
            warn!("loop '{}' reached its bound of {} iterations", name, max);
            false
        }
    }

    /// I5: available space must cover the requirement times the buffer ratio.
    pub fn never_operate_without_disk_space(required: u64, available: u64, ratio: f64) -> bool {
        (available as f64) >= (required as f64) * ratio
    }

    /// I6: reject traversal sequences, shell metacharacters, control
    /// characters and reserved device names in a filename.
    pub fn filename_is_safe(name: &str) -> bool {
        !name.is_empty() && sanitize_filename(name) == name
    }

    /// I7: a state transition must appear in the adjacency table.
    pub fn transition_is_legal(from: FolderState, to: FolderState) -> bool {
        LEGAL_TRANSITIONS.contains(&(from, to))
    }

    /// I8: every subprocess invocation carries an explicit timeout.
    /// Excessive values are warned about, not rejected.
    pub fn subprocess_timeout_declared(timeout: Option<Duration>) -> bool {
        match timeout {
            Some(t) => {
                if t.as_secs() > EXCESSIVE_TIMEOUT_SECS {
                    warn!("subprocess timeout of {}s is excessive", t.as_secs());
                }
                true
            }
            None => false,
        }
    }

    /// I9: after an operation, none of its declared temp files may remain.
    pub fn cleanup_complete(temp_files: &[PathBuf]) -> bool {
        temp_files.iter().all(|p| !p.exists())
    }

    /// I10: a file that ended up in the destination must resolve inside the
    /// destination root. Post-hoc companion to I1.
    pub fn provenance_contained(&self, path: &Path) -> bool {
        is_within(path, &self.destination_root)
    }

    /// Run the subset of invariants relevant to `op` and collect violations.
    pub fn check_before_operation(
        &self,
        op: &FileOperation,
        ctx: &OperationContext,
        cache: Option<&ValidationCache>,
    ) -> (bool, Vec<Violation>) {
        let mut violations = Vec::new();

        // I6 gates names this tool produces; delete targets keep whatever
        // name they already have on disk.
        let produced_name = match op.kind {
            OperationKind::Move => op.destination.as_deref(),
            OperationKind::Write | OperationKind::Overwrite => Some(op.target.as_path()),
            OperationKind::Delete => None,
        };
        if let Some(name) = produced_name
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        {
            if !Self::filename_is_safe(name) {
                violations.push(Violation {
                    invariant: "I6",
                    detail: format!("unsafe filename '{}'", name),
                });
            }
        }

        match op.kind {
            OperationKind::Delete => {
                if let Some(cache) = cache {
                    if !self.validated_video_protected(op, cache) {
                        violations.push(Violation {
                            invariant: "I2",
                            detail: format!(
                                "'{}' passed validation and may not be deleted",
                                op.target.display()
                            ),
                        });
                    }
                }
                if !self.archive_deletion_authorized(op, ctx) {
                    violations.push(Violation {
                        invariant: "I3",
                        detail: format!(
                            "archive '{}' deletion lacks extraction_verified/unrecoverable",
                            op.target.display()
                        ),
                    });
                }
            }
            OperationKind::Write | OperationKind::Move | OperationKind::Overwrite => {
                if !self.path_within_destination(op) {
                    violations.push(Violation {
                        invariant: "I1",
                        detail: format!(
                            "target of {:?} resolves outside destination root",
                            op.kind
                        ),
                    });
                }
                if let (Some(required), Some(available)) = (ctx.required_bytes, ctx.available_bytes)
                {
                    if !Self::never_operate_without_disk_space(
                        required,
                        available,
                        self.buffer_ratio,
                    ) {
                        violations.push(Violation {
                            invariant: "I5",
                            detail: format!(
                                "need {} bytes x{} buffer, only {} available",
                                required, self.buffer_ratio, available
                            ),
                        });
                    }
                }
            }
        }

        (violations.is_empty(), violations)
    }

    /// Enforcement wrapper around destructive operations. Strict mode turns
    /// violations into errors; permissive mode logs and refuses. Violations
    /// are counted either way.
    pub fn enforce(
        &self,
        op: &FileOperation,
        ctx: &OperationContext,
        cache: Option<&ValidationCache>,
    ) -> Result<bool> {
        let (passed, violations) = self.check_before_operation(op, ctx, cache);
        if passed {
            return Ok(true);
        }

        self.violations
            .fetch_add(violations.len() as u64, Ordering::Relaxed);
        for v in &violations {
            warn!("safety violation [{}]: {}", v.invariant, v.detail);
        }

        match self.mode {
            EnforcementMode::Strict => {
                let first = &violations[0];
                Err(Error::SafetyViolation {
                    invariant: first.invariant,
                    detail: first.detail.clone(),
                })
            }
            EnforcementMode::Permissive => Ok(false),
        }
    }
}

/// Legal folder lifecycle transitions (I7). Anything absent is illegal.
const LEGAL_TRANSITIONS: &[(FolderState, FolderState)] = &[
    (FolderState::Scanned, FolderState::Repairing),
    (FolderState::Scanned, FolderState::Extracting),
    (FolderState::Scanned, FolderState::Validating),
    (FolderState::Scanned, FolderState::Cleaning),
    (FolderState::Scanned, FolderState::Failed),
    (FolderState::Repairing, FolderState::Extracting),
    (FolderState::Repairing, FolderState::Validating),
    (FolderState::Repairing, FolderState::Failed),
    (FolderState::Extracting, FolderState::Validating),
    (FolderState::Extracting, FolderState::Cleaning),
    (FolderState::Extracting, FolderState::Failed),
    (FolderState::Validating, FolderState::Moving),
    (FolderState::Validating, FolderState::Cleaning),
    (FolderState::Validating, FolderState::Failed),
    (FolderState::Moving, FolderState::Cleaning),
    (FolderState::Moving, FolderState::Failed),
    (FolderState::Cleaning, FolderState::Done),
    (FolderState::Cleaning, FolderState::Failed),
];

/// Bounded loop counter. `tick` returns true exactly `max` times, then
/// false until `reset`.
#[derive(Debug)]
pub struct LoopGuard {
    name: String,
    max: u64,
    count: u64,
}

impl LoopGuard {
    pub fn new(name: impl Into<String>, max: u64) -> Self {
        Self {
            name: name.into(),
            max,
            count: 0,
        }
    }

    pub fn tick(&mut self) -> bool {
        if self.count < self.max {
            self.count += 1;
            true
        } else {
            warn!(
                "loop '{}' exceeded its bound of {} iterations",
                self.name, self.max
            );
            false
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn exhausted(&self) -> bool {
        self.count >= self.max
    }
}

const SHELL_METACHARACTERS: &[char] = &[
    '|', '&', ';', '$', '`', '<', '>', '"', '\'', '*', '?', '!', '{', '}', '~',
];

fn is_reserved_device_name(stem: &str) -> bool {
    let upper = stem.to_ascii_uppercase();
    matches!(
        upper.as_str(),
        "CON" | "PRN" | "AUX" | "NUL"
    ) || (upper.len() == 4
        && (upper.starts_with("COM") || upper.starts_with("LPT"))
        && upper[3..].chars().all(|c| c.is_ascii_digit() && c != '0'))
}

/// Idempotent filename sanitization: control characters, path separators
/// and shell metacharacters become underscores, `..` sequences collapse,
/// reserved device names get a suffix, and a name that strips to nothing
/// falls back to a timestamp-based one.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let mapped = if ch.is_control()
            || ch == '/'
            || ch == '\\'
            || ch == ':'
            || SHELL_METACHARACTERS.contains(&ch)
        {
            '_'
        } else {
            ch
        };
        out.push(mapped);
    }

    while out.contains("..") {
        out = out.replace("..", ".");
    }

    let trimmed: &str = out.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        return format!("unnamed_{}", Utc::now().format("%Y%m%d%H%M%S"));
    }

    let stem = trimmed.split('.').next().unwrap_or("");
    if is_reserved_device_name(stem) {
        return match trimmed.split_once('.') {
            Some((s, rest)) => format!("{}_file.{}", s, rest),
            None => format!("{}_file", trimmed),
        };
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_guard_ticks_exactly_n_times() {
        let mut guard = LoopGuard::new("test", 3);
        assert!(guard.tick());
        assert!(guard.tick());
        assert!(guard.tick());
        assert!(!guard.tick());
        assert!(!guard.tick());
        guard.reset();
        assert!(guard.tick());
    }

    #[test]
    fn test_disk_space_buffer() {
        // 120MB available < 100MB * 1.5 required
        assert!(!SafetyInvariantEngine::never_operate_without_disk_space(
            100 * 1024 * 1024,
            120 * 1024 * 1024,
            1.5
        ));
        assert!(SafetyInvariantEngine::never_operate_without_disk_space(
            100 * 1024 * 1024,
            150 * 1024 * 1024,
            1.5
        ));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let cases = [
            "movie.mkv",
            "../../../etc/passwd",
            "a|b&c;d.mp4",
            "con.txt",
            "  ..  ",
            "",
            "name with spaces (1).avi",
        ];
        for case in cases {
            let once = sanitize_filename(case);
            let twice = sanitize_filename(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", case);
        }
    }

    #[test]
    fn test_sanitize_strips_traversal_and_meta() {
        let s = sanitize_filename("../../evil;rm -rf.mkv");
        assert!(!s.contains(".."));
        assert!(!s.contains(';'));
        assert!(!s.contains('/'));
    }

    #[test]
    fn test_sanitize_reserved_names() {
        assert_eq!(sanitize_filename("con.txt"), "con_file.txt");
        assert_eq!(sanitize_filename("COM3"), "COM3_file");
        // Not reserved: COM0, CONSOLE
        assert_eq!(sanitize_filename("CONSOLE.txt"), "CONSOLE.txt");
    }

    #[test]
    fn test_empty_name_gets_timestamp_fallback() {
        let s = sanitize_filename("...");
        assert!(s.starts_with("unnamed_"));
        assert_eq!(sanitize_filename(&s), s);
    }

    #[test]
    fn test_transition_table() {
        assert!(SafetyInvariantEngine::transition_is_legal(
            FolderState::Scanned,
            FolderState::Repairing
        ));
        assert!(SafetyInvariantEngine::transition_is_legal(
            FolderState::Cleaning,
            FolderState::Done
        ));
        assert!(!SafetyInvariantEngine::transition_is_legal(
            FolderState::Done,
            FolderState::Scanned
        ));
        assert!(!SafetyInvariantEngine::transition_is_legal(
            FolderState::Moving,
            FolderState::Repairing
        ));
    }

    #[test]
    fn test_timeout_presence() {
        assert!(SafetyInvariantEngine::subprocess_timeout_declared(Some(
            Duration::from_secs(60)
        )));
        assert!(!SafetyInvariantEngine::subprocess_timeout_declared(None));
    }
}
