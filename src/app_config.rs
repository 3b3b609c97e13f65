use config::{Config, File as ConfigFile};
use serde::Deserialize;
use tracing::warn;

use crate::error::Result;
use crate::utils::non_overlapping_directories;

/// Effective, validated configuration. Every field has a default; malformed
/// values degrade to the default with a diagnostic, never a crash.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub source_roots: Vec<String>,
    pub destination_root: String,
    pub ignore_patterns: Vec<String>,

    pub min_music_files: usize,
    pub min_image_files: usize,
    pub min_document_files: usize,

    pub max_scan_depth: usize,
    pub max_extraction_iterations: u64,
    pub disk_buffer_ratio: f64,
    pub strict_safety: bool,

    pub sample_max_bytes: u64,
    pub low_res_height: u32,

    pub extraction_tool: String,
    pub repair_tool: String,
    pub probe_tool: String,
    pub lock_holder_names: Vec<String>,

    pub favorite_prefix: String,
    pub copy_markers: Vec<String>,

    pub delete_retry_attempts: u32,
    pub retry_queue_limit: usize,
}

/// Raw deserialization target: everything optional so a single bad field
/// never takes down the whole load.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    source_roots: Option<Vec<String>>,
    destination_root: Option<String>,
    ignore_patterns: Option<Vec<String>>,
    min_music_files: Option<i64>,
    min_image_files: Option<i64>,
    min_document_files: Option<i64>,
    max_scan_depth: Option<i64>,
    max_extraction_iterations: Option<i64>,
    disk_buffer_ratio: Option<f64>,
    strict_safety: Option<bool>,
    sample_max_bytes: Option<i64>,
    low_res_height: Option<i64>,
    extraction_tool: Option<String>,
    repair_tool: Option<String>,
    probe_tool: Option<String>,
    lock_holder_names: Option<Vec<String>>,
    favorite_prefix: Option<String>,
    copy_markers: Option<Vec<String>>,
    delete_retry_attempts: Option<i64>,
    retry_queue_limit: Option<i64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source_roots: vec!["downloads".to_string()],
            destination_root: "library".to_string(),
            ignore_patterns: Vec::new(),
            min_music_files: 5,
            min_image_files: 10,
            min_document_files: 10,
            max_scan_depth: 5,
            max_extraction_iterations: 100,
            disk_buffer_ratio: 1.5,
            strict_safety: true,
            sample_max_bytes: 50 * 1024 * 1024,
            low_res_height: 480,
            extraction_tool: "7z".to_string(),
            repair_tool: "par2".to_string(),
            probe_tool: "ffmpeg".to_string(),
            lock_holder_names: vec![
                "7z".to_string(),
                "par2".to_string(),
                "ffmpeg".to_string(),
            ],
            favorite_prefix: "keep-".to_string(),
            copy_markers: vec![
                " copy".to_string(),
                "-copy".to_string(),
                " duplicate".to_string(),
                "_duplicate".to_string(),
            ],
            delete_retry_attempts: 3,
            retry_queue_limit: 100,
        }
    }
}

/// Load `Config.toml` if present, falling back to defaults field by field.
pub fn load_configuration() -> Result<AppConfig> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .build()?;

    let raw = match builder.try_deserialize::<RawConfig>() {
        Ok(raw) => raw,
        Err(e) => {
            warn!(
                "Config.toml could not be deserialized ({}); continuing with built-in defaults. \
                 Example: source_roots = [\"/data/downloads\"]",
                e
            );
            RawConfig::default()
        }
    };

    Ok(validate(raw))
}

fn range_usize(field: &'static str, raw: Option<i64>, min: i64, max: i64, default: usize) -> usize {
    match raw {
        None => default,
        Some(v) if v >= min && v <= max => v as usize,
        Some(v) => {
            warn!(
                "config field '{}' = {} is out of range [{}, {}]; using default {} \
                 (example: {} = {})",
                field, v, min, max, default, field, default
            );
            default
        }
    }
}

fn range_u64(field: &'static str, raw: Option<i64>, min: i64, max: i64, default: u64) -> u64 {
    match raw {
        None => default,
        Some(v) if v >= min && v <= max => v as u64,
        Some(v) => {
            warn!(
                "config field '{}' = {} is out of range [{}, {}]; using default {} \
                 (example: {} = {})",
                field, v, min, max, default, field, default
            );
            default
        }
    }
}

fn non_empty_string(field: &'static str, raw: Option<String>, default: &str) -> String {
    match raw {
        None => default.to_string(),
        Some(v) if !v.trim().is_empty() => v,
        Some(_) => {
            warn!(
                "config field '{}' is empty; using default '{}' (example: {} = \"{}\")",
                field, default, field, default
            );
            default.to_string()
        }
    }
}

fn validate(raw: RawConfig) -> AppConfig {
    let defaults = AppConfig::default();

    let source_roots = match raw.source_roots {
        Some(roots) if !roots.is_empty() => non_overlapping_directories(roots),
        Some(_) => {
            warn!(
                "config field 'source_roots' is an empty list; using default {:?} \
                 (example: source_roots = [\"/data/downloads\"])",
                defaults.source_roots
            );
            defaults.source_roots.clone()
        }
        None => defaults.source_roots.clone(),
    };

    let ignore_patterns = raw
        .ignore_patterns
        .unwrap_or_default()
        .into_iter()
        .filter(|p| match glob::Pattern::new(p) {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "config field 'ignore_patterns' entry '{}' is not a valid glob ({}); \
                     dropping it (example: ignore_patterns = [\"*.tmp\"])",
                    p, e
                );
                false
            }
        })
        .collect();

    let disk_buffer_ratio = match raw.disk_buffer_ratio {
        None => defaults.disk_buffer_ratio,
        Some(v) if (1.0..=10.0).contains(&v) => v,
        Some(v) => {
            warn!(
                "config field 'disk_buffer_ratio' = {} is out of range [1.0, 10.0]; \
                 using default {} (example: disk_buffer_ratio = 2.0)",
                v, defaults.disk_buffer_ratio
            );
            defaults.disk_buffer_ratio
        }
    };

    AppConfig {
        destination_root: non_empty_string(
            "destination_root",
            raw.destination_root,
            &defaults.destination_root,
        ),
        source_roots,
        ignore_patterns,
        min_music_files: range_usize("min_music_files", raw.min_music_files, 1, 10_000, 5),
        min_image_files: range_usize("min_image_files", raw.min_image_files, 1, 10_000, 10),
        min_document_files: range_usize(
            "min_document_files",
            raw.min_document_files,
            1,
            10_000,
            10,
        ),
        max_scan_depth: range_usize("max_scan_depth", raw.max_scan_depth, 1, 64, 5),
        max_extraction_iterations: range_u64(
            "max_extraction_iterations",
            raw.max_extraction_iterations,
            1,
            100_000,
            100,
        ),
        disk_buffer_ratio,
        strict_safety: raw.strict_safety.unwrap_or(defaults.strict_safety),
        sample_max_bytes: range_u64(
            "sample_max_bytes",
            raw.sample_max_bytes,
            1,
            i64::MAX,
            defaults.sample_max_bytes,
        ),
        low_res_height: range_u64("low_res_height", raw.low_res_height, 1, 10_000, 480) as u32,
        extraction_tool: non_empty_string("extraction_tool", raw.extraction_tool, "7z"),
        repair_tool: non_empty_string("repair_tool", raw.repair_tool, "par2"),
        probe_tool: non_empty_string("probe_tool", raw.probe_tool, "ffmpeg"),
        lock_holder_names: raw
            .lock_holder_names
            .unwrap_or_else(|| defaults.lock_holder_names.clone()),
        favorite_prefix: non_empty_string("favorite_prefix", raw.favorite_prefix, "keep-"),
        copy_markers: raw
            .copy_markers
            .unwrap_or_else(|| defaults.copy_markers.clone()),
        delete_retry_attempts: range_u64(
            "delete_retry_attempts",
            raw.delete_retry_attempts,
            1,
            20,
            3,
        ) as u32,
        retry_queue_limit: range_usize("retry_queue_limit", raw.retry_queue_limit, 1, 100_000, 100),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.disk_buffer_ratio, 1.5);
        assert_eq!(cfg.max_extraction_iterations, 100);
        assert!(cfg.strict_safety);
    }

    #[test]
    fn test_out_of_range_field_falls_back() {
        let raw = RawConfig {
            max_scan_depth: Some(-3),
            disk_buffer_ratio: Some(0.1),
            ..RawConfig::default()
        };
        let cfg = validate(raw);
        assert_eq!(cfg.max_scan_depth, 5);
        assert_eq!(cfg.disk_buffer_ratio, 1.5);
    }

    #[test]
    fn test_invalid_glob_dropped() {
        let raw = RawConfig {
            ignore_patterns: Some(vec!["[".to_string(), "*.tmp".to_string()]),
            ..RawConfig::default()
        };
        let cfg = validate(raw);
        assert_eq!(cfg.ignore_patterns, vec!["*.tmp".to_string()]);
    }

    #[test]
    fn test_overlapping_roots_reduced() {
        let raw = RawConfig {
            source_roots: Some(vec![
                "/data/downloads".to_string(),
                "/data/downloads/complete".to_string(),
            ]),
            ..RawConfig::default()
        };
        let cfg = validate(raw);
        assert_eq!(cfg.source_roots, vec!["/data/downloads".to_string()]);
    }
}
