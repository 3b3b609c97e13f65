use std::fs;
use std::path::Path;

use tempfile::tempdir;

use downsweep::app_config::AppConfig;
use downsweep::scanner::Scanner;

fn touch(path: &Path) {
    fs::write(path, b"x").unwrap();
}

fn touch_many(dir: &Path, stem: &str, ext: &str, count: usize) {
    for i in 0..count {
        touch(&dir.join(format!("{}{:02}.{}", stem, i, ext)));
    }
}

#[test]
fn test_classification_of_mixed_root() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();

    let movie = root.join("Some.Movie.2023");
    fs::create_dir(&movie).unwrap();
    touch(&movie.join("movie.mkv"));
    touch(&movie.join("movie.nfo"));

    let archive_only = root.join("Archived.Release");
    fs::create_dir(&archive_only).unwrap();
    touch(&archive_only.join("release.part001.rar"));
    touch(&archive_only.join("release.part002.rar"));
    touch(&archive_only.join("release.par2"));

    let photos = root.join("holiday-photos");
    fs::create_dir(&photos).unwrap();
    touch_many(&photos, "img", "jpg", 12);

    let junk = root.join("leftover-stuff");
    fs::create_dir(&junk).unwrap();
    touch(&junk.join("readme.txt"));

    touch(&root.join("loose.mkv"));

    let config = AppConfig::default();
    let scanner = Scanner::new(&config);
    let plan = scanner.build_work_plan(root).unwrap();

    assert_eq!(plan.video_folders.len(), 2);
    assert_eq!(plan.content_folders.len(), 1);
    assert_eq!(plan.junk_folders.len(), 1);
    assert_eq!(plan.loose_videos.len(), 1);

    let archived = plan
        .video_folders
        .iter()
        .find(|f| f.path == archive_only)
        .unwrap();
    assert_eq!(archived.archive_part_count, 2);
    assert_eq!(archived.repair_part_count, 1);
    assert_eq!(archived.video_count, 0);
}

#[test]
fn test_protected_image_collection_not_removable() {
    // 12 images with min_image_files=10 -> protected collection.
    let tmp = tempdir().unwrap();
    let folder = tmp.path().join("wallpapers");
    fs::create_dir(&folder).unwrap();
    touch_many(&folder, "wall", "png", 12);

    let config = AppConfig::default();
    let scanner = Scanner::new(&config);
    assert!(!scanner.folder_is_removable(&folder, false));

    // Below the threshold the same folder is junk and removable.
    let sparse = tmp.path().join("two-pics");
    fs::create_dir(&sparse).unwrap();
    touch_many(&sparse, "pic", "png", 2);
    assert!(scanner.folder_is_removable(&sparse, false));
}

#[test]
fn test_archives_block_removal_unless_flagged() {
    let tmp = tempdir().unwrap();
    let folder = tmp.path().join("release");
    fs::create_dir(&folder).unwrap();
    touch(&folder.join("release.rar"));

    let config = AppConfig::default();
    let scanner = Scanner::new(&config);
    assert!(!scanner.folder_is_removable(&folder, false));
    assert!(scanner.folder_is_removable(&folder, true));
}

#[test]
fn test_videos_always_block_removal() {
    let tmp = tempdir().unwrap();
    let folder = tmp.path().join("release");
    fs::create_dir(&folder).unwrap();
    touch(&folder.join("movie.mkv"));

    let config = AppConfig::default();
    let scanner = Scanner::new(&config);
    assert!(!scanner.folder_is_removable(&folder, true));
}

#[test]
fn test_misnamed_video_renamed_during_scan() {
    let tmp = tempdir().unwrap();
    let folder = tmp.path().join("incoming");
    fs::create_dir(&folder).unwrap();
    touch(&folder.join("movie.mp4.1"));

    let config = AppConfig::default();
    let scanner = Scanner::new(&config);
    let plan = scanner.build_work_plan(tmp.path()).unwrap();

    assert_eq!(plan.video_folders.len(), 1);
    assert_eq!(plan.video_folders[0].video_count, 1);
    assert!(folder.join("movie.mp4").exists());
    assert!(!folder.join("movie.mp4.1").exists());
}

#[test]
fn test_misnamed_loose_video_renamed() {
    let tmp = tempdir().unwrap();
    touch(&tmp.path().join("clip.mkv.partial"));

    let config = AppConfig::default();
    let scanner = Scanner::new(&config);
    let plan = scanner.build_work_plan(tmp.path()).unwrap();

    assert_eq!(plan.loose_videos.len(), 1);
    assert!(tmp.path().join("clip.mkv").exists());
}

#[test]
fn test_ignore_patterns_respected() {
    let tmp = tempdir().unwrap();
    let skipped = tmp.path().join("keep-out");
    fs::create_dir(&skipped).unwrap();
    touch(&skipped.join("movie.mkv"));

    let mut config = AppConfig::default();
    config.ignore_patterns = vec!["*keep-out*".to_string()];
    let scanner = Scanner::new(&config);
    let plan = scanner.build_work_plan(tmp.path()).unwrap();

    assert!(plan.video_folders.is_empty());
    assert!(plan.junk_folders.is_empty());
}

#[test]
fn test_missing_root_is_an_error_but_empty_root_is_not() {
    let tmp = tempdir().unwrap();
    let config = AppConfig::default();
    let scanner = Scanner::new(&config);

    assert!(scanner.build_work_plan(&tmp.path().join("nope")).is_err());
    let plan = scanner.build_work_plan(tmp.path()).unwrap();
    assert_eq!(plan.total_folders(), 0);
}
