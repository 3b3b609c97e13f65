use std::path::Path;

use tempfile::tempdir;

use downsweep::model::{FileOperation, ValidationCache, ValidationDecision, ValidationResult};
use downsweep::safety::{EnforcementMode, OperationContext, SafetyInvariantEngine};
use downsweep::Error;

fn strict_engine(dest: &Path) -> SafetyInvariantEngine {
    SafetyInvariantEngine::new(dest, EnforcementMode::Strict, 1.5)
}

#[test]
fn test_move_inside_destination_allowed() {
    let tmp = tempdir().unwrap();
    let dest = tmp.path().join("library");
    let engine = strict_engine(&dest);

    let op = FileOperation::move_to("/data/downloads/movie.mkv", dest.join("movie.mkv"));
    let allowed = engine
        .enforce(&op, &OperationContext::default(), None)
        .unwrap();
    assert!(allowed);
    assert_eq!(engine.violation_count(), 0);
}

#[test]
fn test_move_outside_destination_refused() {
    let tmp = tempdir().unwrap();
    let dest = tmp.path().join("library");
    let engine = strict_engine(&dest);

    let op = FileOperation::move_to(
        "/data/downloads/movie.mkv",
        tmp.path().join("elsewhere").join("movie.mkv"),
    );
    let err = engine
        .enforce(&op, &OperationContext::default(), None)
        .unwrap_err();
    assert!(matches!(err, Error::SafetyViolation { invariant: "I1", .. }));
    assert_eq!(engine.violation_count(), 1);
}

#[test]
fn test_traversal_escape_refused() {
    let tmp = tempdir().unwrap();
    let dest = tmp.path().join("library");
    let engine = strict_engine(&dest);

    let sneaky = dest.join("..").join("outside").join("movie.mkv");
    let op = FileOperation::move_to("/data/downloads/movie.mkv", sneaky);
    assert!(engine
        .enforce(&op, &OperationContext::default(), None)
        .is_err());
}

#[test]
fn test_validated_video_never_deleted() {
    let tmp = tempdir().unwrap();
    let engine = strict_engine(&tmp.path().join("library"));

    let video = tmp.path().join("downloads").join("keeper.mkv");
    let mut cache = ValidationCache::new();
    cache.record(ValidationResult::new(
        &video,
        ValidationDecision::Pass,
        "healthy",
    ));

    let op = FileOperation::delete(&video);
    let err = engine
        .enforce(&op, &OperationContext::default(), Some(&cache))
        .unwrap_err();
    assert!(matches!(err, Error::SafetyViolation { invariant: "I2", .. }));

    // A rejected video is deletable.
    cache.record(ValidationResult::new(
        &video,
        ValidationDecision::FailCorrupt,
        "truncated",
    ));
    let op = FileOperation::delete(&video);
    assert!(engine
        .enforce(&op, &OperationContext::default(), Some(&cache))
        .unwrap());
}

#[test]
fn test_archive_deletion_needs_explicit_flag() {
    let tmp = tempdir().unwrap();
    let engine = strict_engine(&tmp.path().join("library"));
    let archive = tmp.path().join("downloads").join("release.part001.rar");

    let op = FileOperation::delete(&archive);
    let err = engine
        .enforce(&op, &OperationContext::default(), None)
        .unwrap_err();
    assert!(matches!(err, Error::SafetyViolation { invariant: "I3", .. }));

    let verified = OperationContext {
        extraction_verified: true,
        ..OperationContext::default()
    };
    let op = FileOperation::delete(&archive);
    assert!(engine.enforce(&op, &verified, None).unwrap());

    let unrecoverable = OperationContext {
        unrecoverable: true,
        ..OperationContext::default()
    };
    let repair_file = tmp.path().join("downloads").join("release.par2");
    let op = FileOperation::delete(&repair_file);
    assert!(engine.enforce(&op, &unrecoverable, None).unwrap());
}

#[test]
fn test_disk_buffer_scenario() {
    // required=100MB, available=120MB, ratio=1.5 -> refused (120 < 150).
    let tmp = tempdir().unwrap();
    let dest = tmp.path().join("library");
    let engine = strict_engine(&dest);

    let op = FileOperation::move_to("/data/downloads/movie.mkv", dest.join("movie.mkv"));
    let ctx = OperationContext {
        required_bytes: Some(100 * 1024 * 1024),
        available_bytes: Some(120 * 1024 * 1024),
        ..OperationContext::default()
    };
    let err = engine.enforce(&op, &ctx, None).unwrap_err();
    assert!(matches!(err, Error::SafetyViolation { invariant: "I5", .. }));

    let ctx = OperationContext {
        required_bytes: Some(100 * 1024 * 1024),
        available_bytes: Some(200 * 1024 * 1024),
        ..OperationContext::default()
    };
    let op = FileOperation::move_to("/data/downloads/movie.mkv", dest.join("movie.mkv"));
    assert!(engine.enforce(&op, &ctx, None).unwrap());
}

#[test]
fn test_permissive_mode_logs_and_refuses() {
    let tmp = tempdir().unwrap();
    let dest = tmp.path().join("library");
    let engine = SafetyInvariantEngine::new(&dest, EnforcementMode::Permissive, 1.5);

    let op = FileOperation::move_to(
        "/data/downloads/movie.mkv",
        tmp.path().join("outside.mkv"),
    );
    let allowed = engine
        .enforce(&op, &OperationContext::default(), None)
        .unwrap();
    assert!(!allowed);
    assert_eq!(engine.violation_count(), 1);
}

#[test]
fn test_cleanup_completeness_predicate() {
    let tmp = tempdir().unwrap();
    let gone = tmp.path().join("was-temp.tmp");
    let still_there = tmp.path().join("still-temp.tmp");
    std::fs::write(&still_there, b"x").unwrap();

    assert!(SafetyInvariantEngine::cleanup_complete(&[gone.clone()]));
    assert!(!SafetyInvariantEngine::cleanup_complete(&[
        gone,
        still_there.clone()
    ]));

    std::fs::remove_file(&still_there).unwrap();
    assert!(SafetyInvariantEngine::cleanup_complete(&[still_there]));
}

#[test]
fn test_provenance_containment() {
    let tmp = tempdir().unwrap();
    let dest = tmp.path().join("library");
    std::fs::create_dir_all(&dest).unwrap();
    let engine = strict_engine(&dest);

    assert!(engine.provenance_contained(&dest.join("movie.mkv")));
    assert!(!engine.provenance_contained(&tmp.path().join("movie.mkv")));
}
