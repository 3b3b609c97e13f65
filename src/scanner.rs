use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::{debug, info, warn};

use crate::app_config::AppConfig;
use crate::error::{Error, Result};
use crate::model::{ContentFolder, ContentKind, VideoFolder, WorkPlan};
use crate::utils::path::extension_lower;
use walkdir::WalkDir;

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "m4v", "mpg", "mpeg", "ts", "webm", "flv",
];
pub const ARCHIVE_EXTENSIONS: &[&str] = &["rar", "zip", "7z"];
pub const REPAIR_EXTENSIONS: &[&str] = &["par2"];
pub const MUSIC_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "m4a", "wav", "aac", "opus"];
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff"];
pub const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "epub", "mobi", "azw3", "doc", "docx", "cbz", "cbr"];

/// Release clutter that never blocks folder removal.
pub const JUNK_EXTENSIONS: &[&str] = &["nfo", "sfv", "srr", "url", "lnk", "torrent", "diz"];

pub fn is_video_file(path: &Path) -> bool {
    extension_lower(path).is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
}

/// Archive volumes: the base extensions plus split-volume tails
/// (`.001`-style numeric parts and `.r00`-style rar volumes).
pub fn is_archive_file(path: &Path) -> bool {
    match extension_lower(path) {
        Some(ext) => {
            ARCHIVE_EXTENSIONS.contains(&ext.as_str())
                || is_numeric_part_ext(&ext)
                || is_rar_volume_ext(&ext)
        }
        None => false,
    }
}

pub fn is_repair_file(path: &Path) -> bool {
    extension_lower(path).is_some_and(|e| REPAIR_EXTENSIONS.contains(&e.as_str()))
}

pub fn is_junk_file(path: &Path) -> bool {
    extension_lower(path).is_some_and(|e| JUNK_EXTENSIONS.contains(&e.as_str()))
}

fn is_numeric_part_ext(ext: &str) -> bool {
    ext.len() == 3 && ext.chars().all(|c| c.is_ascii_digit())
}

fn is_rar_volume_ext(ext: &str) -> bool {
    ext.len() == 3
        && ext.starts_with('r')
        && ext[1..].chars().all(|c| c.is_ascii_digit())
}

fn is_meaningful_ext(ext: &str) -> bool {
    VIDEO_EXTENSIONS.contains(&ext)
        || ARCHIVE_EXTENSIONS.contains(&ext)
        || REPAIR_EXTENSIONS.contains(&ext)
        || MUSIC_EXTENSIONS.contains(&ext)
        || IMAGE_EXTENSIONS.contains(&ext)
        || DOCUMENT_EXTENSIONS.contains(&ext)
        || JUNK_EXTENSIONS.contains(&ext)
        || is_numeric_part_ext(ext)
        || is_rar_volume_ext(ext)
}

/// A video extension buried mid-name under a meaningless tail
/// (`movie.mp4.1`, `show.mkv.part`) marks a misnamed video; returns the
/// canonical name to restore. Tails that mean something on their own
/// (`movie.mkv.par2`, `movie.mp4.001`) are left alone.
pub fn canonical_video_name(file_name: &str) -> Option<String> {
    let tokens: Vec<&str> = file_name.split('.').collect();
    if tokens.len() < 3 {
        return None;
    }
    let last = tokens[tokens.len() - 1].to_ascii_lowercase();
    if is_meaningful_ext(&last) {
        return None;
    }
    for i in (1..tokens.len() - 1).rev() {
        let token = tokens[i].to_ascii_lowercase();
        if VIDEO_EXTENSIONS.contains(&token.as_str()) {
            return Some(tokens[..=i].join("."));
        }
    }
    None
}

#[derive(Debug, Default, Clone)]
pub struct FolderSurvey {
    pub videos: usize,
    pub archives: usize,
    pub repair_sets: usize,
    pub music: usize,
    pub images: usize,
    pub documents: usize,
    pub other: usize,
    pub unreadable: usize,
}

#[derive(Debug)]
enum FolderKind {
    Video(VideoFolder),
    Content(ContentFolder),
    Junk,
}

/// Walks one level of each source root and classifies every entry.
/// Classification never fails on a permission error; unreadable subtrees
/// degrade to skip-log-continue.
pub struct Scanner<'a> {
    config: &'a AppConfig,
    ignore: Vec<Pattern>,
}

impl<'a> Scanner<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        let ignore = config
            .ignore_patterns
            .iter()
            .filter_map(|g| match Pattern::new(g) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("Invalid glob pattern '{}': {}", g, e);
                    None
                }
            })
            .collect();
        Self { config, ignore }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        self.ignore.iter().any(|p| p.matches_path(path))
    }

    /// Build the work plan for one source root: video folders, protected
    /// content folders, junk folders and loose top-level videos.
    pub fn build_work_plan(&self, root: &Path) -> Result<WorkPlan> {
        if !root.is_dir() {
            return Err(Error::ConfigValidation {
                field: "source_roots",
                message: format!(
                    "'{}' does not exist or is not a directory \
                     (example: source_roots = [\"/data/downloads\"])",
                    root.display()
                ),
            });
        }

        let mut plan = WorkPlan::default();

        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read source root {}: {}", root.display(), e);
                return Ok(plan);
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };
            let path = entry.path();
            if self.is_ignored(&path) {
                debug!("Ignoring {} (pattern match)", path.display());
                continue;
            }

            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            if file_type.is_dir() {
                match self.classify_folder(&path) {
                    FolderKind::Video(folder) => plan.video_folders.push(folder),
                    FolderKind::Content(folder) => plan.content_folders.push(folder),
                    FolderKind::Junk => plan.junk_folders.push(path),
                }
            } else if file_type.is_file() {
                let fixed = self.fix_misnamed_video(&path);
                if is_video_file(&fixed) {
                    plan.loose_videos.push(fixed);
                }
            }
        }

        info!(
            "Scan of {}: {} video folders, {} content folders, {} junk folders, {} loose videos",
            root.display(),
            plan.video_folders.len(),
            plan.content_folders.len(),
            plan.junk_folders.len(),
            plan.loose_videos.len()
        );
        Ok(plan)
    }

    fn classify_folder(&self, path: &Path) -> FolderKind {
        let survey = self.survey_folder(path);

        if survey.videos > 0 || survey.archives > 0 || survey.repair_sets > 0 {
            return FolderKind::Video(VideoFolder {
                path: path.to_path_buf(),
                video_count: survey.videos,
                archive_part_count: survey.archives,
                repair_part_count: survey.repair_sets,
            });
        }

        if let Some(folder) = self.protected_content(path, &survey) {
            return FolderKind::Content(folder);
        }

        FolderKind::Junk
    }

    fn protected_content(&self, path: &Path, survey: &FolderSurvey) -> Option<ContentFolder> {
        let candidates = [
            (ContentKind::Music, survey.music, self.config.min_music_files),
            (ContentKind::Images, survey.images, self.config.min_image_files),
            (
                ContentKind::Documents,
                survey.documents,
                self.config.min_document_files,
            ),
        ];
        candidates
            .iter()
            .filter(|(_, count, min)| count >= min)
            .max_by_key(|(_, count, _)| *count)
            .map(|(kind, count, _)| ContentFolder {
                path: path.to_path_buf(),
                kind: *kind,
                file_count: *count,
            })
    }

    /// Bounded-depth survey of a folder. The traversal is iterative with
    /// depth tracked per entry, and errors count as unreadable instead of
    /// propagating. Misnamed videos are renamed in place as they are seen
    /// so every later stage works with canonical extensions.
    pub fn survey_folder(&self, path: &Path) -> FolderSurvey {
        let mut survey = FolderSurvey::default();

        for entry in WalkDir::new(path)
            .follow_links(false)
            .max_depth(self.config.max_scan_depth)
            .into_iter()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("Unreadable entry under {}: {}", path.display(), e);
                    survey.unreadable += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let file_path = self.fix_misnamed_video(entry.path());
            if self.is_ignored(&file_path) {
                continue;
            }

            if is_video_file(&file_path) {
                survey.videos += 1;
            } else if is_repair_file(&file_path) {
                survey.repair_sets += 1;
            } else if is_archive_file(&file_path) {
                survey.archives += 1;
            } else {
                match extension_lower(&file_path) {
                    Some(ext) if MUSIC_EXTENSIONS.contains(&ext.as_str()) => survey.music += 1,
                    Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => survey.images += 1,
                    Some(ext) if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) => {
                        survey.documents += 1
                    }
                    _ => survey.other += 1,
                }
            }
        }

        survey
    }

    /// Restore a canonical video extension on a misnamed file. Returns the
    /// path later stages should use; on any failure the original path is
    /// returned untouched.
    fn fix_misnamed_video(&self, path: &Path) -> PathBuf {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return path.to_path_buf();
        };
        let Some(canonical) = canonical_video_name(name) else {
            return path.to_path_buf();
        };
        let target = path.with_file_name(&canonical);
        if target.exists() {
            warn!(
                "Not renaming misnamed video {}: {} already exists",
                path.display(),
                target.display()
            );
            return path.to_path_buf();
        }
        match fs::rename(path, &target) {
            Ok(()) => {
                info!("Renamed misnamed video {} -> {}", path.display(), canonical);
                target
            }
            Err(e) => {
                warn!("Could not rename {}: {}", path.display(), e);
                path.to_path_buf()
            }
        }
    }

    /// Removability predicate for the double-check delete: a folder may be
    /// removed when a fresh survey shows no videos, no archive/repair files
    /// (unless the folder's archive step failed and they are explicitly
    /// removable) and no protected content collection.
    pub fn folder_is_removable(&self, path: &Path, archives_removable: bool) -> bool {
        if !path.is_dir() {
            return false;
        }
        let survey = self.survey_folder(path);
        if survey.videos > 0 {
            return false;
        }
        if !archives_removable && (survey.archives > 0 || survey.repair_sets > 0) {
            return false;
        }
        if self.protected_content(path, &survey).is_some() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_extension_variants() {
        assert!(is_archive_file(Path::new("a.rar")));
        assert!(is_archive_file(Path::new("a.part001.rar")));
        assert!(is_archive_file(Path::new("a.7z.001")));
        assert!(is_archive_file(Path::new("a.r00")));
        assert!(is_archive_file(Path::new("a.zip")));
        assert!(!is_archive_file(Path::new("a.mkv")));
        assert!(!is_archive_file(Path::new("a.part001")));
        assert!(!is_archive_file(Path::new("a")));
    }

    #[test]
    fn test_misnamed_video_detection() {
        assert_eq!(
            canonical_video_name("movie.mp4.1"),
            Some("movie.mp4".to_string())
        );
        assert_eq!(
            canonical_video_name("show.s01e01.mkv.part"),
            Some("show.s01e01.mkv".to_string())
        );
        assert_eq!(canonical_video_name("movie.mp4"), None);
        assert_eq!(canonical_video_name("archive.rar"), None);
        assert_eq!(canonical_video_name("noext"), None);
        // Meaningful tails are not "misnames".
        assert_eq!(canonical_video_name("movie.mkv.par2"), None);
        assert_eq!(canonical_video_name("movie.mp4.001"), None);
        assert_eq!(canonical_video_name("movie.mkv.nfo"), None);
    }

    #[test]
    fn test_rar_volume_not_confused_with_regular_ext() {
        assert!(is_rar_volume_ext("r00"));
        assert!(is_rar_volume_ext("r42"));
        assert!(!is_rar_volume_ext("rar"));
        assert!(!is_rar_volume_ext("raw"));
    }
}
