use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app_config::AppConfig;
use crate::error::Result;
use crate::model::{ValidationDecision, ValidationResult};
use crate::policy::AdaptiveTimeoutPolicy;
use crate::tool::{self, ToolResult};

/// Decode-output signatures that mark a file unhealthy regardless of the
/// size-ratio check.
const CORRUPTION_MARKERS: &[&str] = &[
    "invalid data found",
    "moov atom not found",
    "error while decoding",
    "invalid nal unit",
    "header damaged",
    "corrupt",
];

#[derive(Debug, Default, Clone)]
pub struct ProbeInfo {
    pub duration_secs: Option<f64>,
    pub bitrate_kbps: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// What the validator concluded plus the raw signals the driver needs to
/// label the outcome (the ratio check and the decoder can disagree).
#[derive(Debug)]
pub struct ValidationReport {
    pub result: ValidationResult,
    pub ratio_flagged: bool,
    pub decode_corrupt: bool,
    pub decode_elapsed: Option<Duration>,
}

pub struct VideoValidator<'a> {
    config: &'a AppConfig,
}

impl<'a> VideoValidator<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        Self { config }
    }

    /// Validate one candidate video. Zero-byte files fail immediately;
    /// sample files are classified by name before any probing; a missing
    /// probe tool is fail-open. `size_ratio_threshold` is the adaptive
    /// truncation bound (base 0.70).
    pub fn validate(
        &self,
        path: &Path,
        policy: &AdaptiveTimeoutPolicy,
        size_ratio_threshold: f64,
    ) -> Result<ValidationReport> {
        let size = fs::metadata(path)?.len();

        if size == 0 {
            return Ok(plain_report(
                ValidationResult::new(path, ValidationDecision::FailCorrupt, "zero-byte file"),
            ));
        }

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if is_sample_name(name) {
                return Ok(plain_report(ValidationResult::new(
                    path,
                    ValidationDecision::FailSample,
                    "sample marker in filename",
                )));
            }
        }

        let probe = match self.probe(path, policy)? {
            ProbeOutcome::Info(info) => info,
            ProbeOutcome::ToolMissing => {
                info!(
                    "Probe tool '{}' not installed; assuming {} is healthy",
                    self.config.probe_tool,
                    path.display()
                );
                return Ok(plain_report(ValidationResult::new(
                    path,
                    ValidationDecision::Pass,
                    "probe tool unavailable; health check skipped",
                )));
            }
            ProbeOutcome::Failed(reason) => {
                return Ok(plain_report(ValidationResult::new(
                    path,
                    ValidationDecision::FailCorrupt,
                    reason,
                )));
            }
        };

        let Some(duration) = probe.duration_secs else {
            // Without a duration there is no size expectation to validate.
            return Ok(report_with_probe(
                ValidationResult::new(
                    path,
                    ValidationDecision::FailCorrupt,
                    "could not parse duration from probe output",
                ),
                &probe,
            ));
        };

        if size < self.config.sample_max_bytes && duration < 300.0 {
            return Ok(report_with_probe(
                ValidationResult::new(
                    path,
                    ValidationDecision::FailSample,
                    "short low-size file treated as sample",
                ),
                &probe,
            ));
        }

        let ratio_flagged = match probe.bitrate_kbps {
            Some(bitrate) if bitrate > 0 => {
                let expected = bitrate as f64 * 1000.0 / 8.0 * duration;
                let ratio = size as f64 / expected.max(1.0);
                debug!(
                    "{}: size ratio {:.2} (threshold {:.2})",
                    path.display(),
                    ratio,
                    size_ratio_threshold
                );
                ratio < size_ratio_threshold
            }
            _ => false,
        };

        let decode_timeout = policy.validation_timeout(duration);
        let (decode_corrupt, decode_note, decode_elapsed) =
            self.decode_check(path, decode_timeout)?;

        if decode_corrupt || ratio_flagged {
            let note = if decode_corrupt {
                decode_note
            } else {
                format!(
                    "file size below {:.0}% of bitrate x duration expectation",
                    size_ratio_threshold * 100.0
                )
            };
            let mut result = ValidationResult::new(path, ValidationDecision::FailCorrupt, note);
            apply_probe(&mut result, &probe);
            return Ok(ValidationReport {
                result,
                ratio_flagged,
                decode_corrupt,
                decode_elapsed,
            });
        }

        let low_quality = is_low_quality(
            probe.height,
            probe.bitrate_kbps,
            self.config.low_res_height,
        );
        let (decision, note) = if low_quality {
            (
                ValidationDecision::FailLowQuality,
                "below quality floor; retained with flag".to_string(),
            )
        } else {
            (ValidationDecision::Pass, String::new())
        };

        let mut result = ValidationResult::new(path, decision, note);
        apply_probe(&mut result, &probe);
        Ok(ValidationReport {
            result,
            ratio_flagged: false,
            decode_corrupt: false,
            decode_elapsed,
        })
    }

    fn probe(&self, path: &Path, policy: &AdaptiveTimeoutPolicy) -> Result<ProbeOutcome> {
        // Duration is unknown before the probe; the floor timeout covers it.
        let timeout = policy.validation_timeout(0.0);
        let result = tool::run_with_timeout(
            &self.config.probe_tool,
            [
                OsStr::new("-hide_banner"),
                OsStr::new("-i"),
                path.as_os_str(),
            ],
            timeout,
        )?;

        let output = match result {
            ToolResult::NotFound => return Ok(ProbeOutcome::ToolMissing),
            ToolResult::Output(output) => output,
        };
        if output.timed_out {
            return Ok(ProbeOutcome::Failed("metadata probe timed out".to_string()));
        }

        // The probe invocation has no output sink, so the tool exits
        // non-zero by design; the metadata text on stderr is what matters.
        let text = &output.stderr;
        Ok(ProbeOutcome::Info(ProbeInfo {
            duration_secs: parse_duration_secs(text),
            bitrate_kbps: parse_bitrate_kbps(text),
            width: parse_resolution(text).map(|(w, _)| w),
            height: parse_resolution(text).map(|(_, h)| h),
        }))
    }

    /// Full decode pass; stderr is scanned for corruption signatures.
    fn decode_check(
        &self,
        path: &Path,
        timeout: Duration,
    ) -> Result<(bool, String, Option<Duration>)> {
        let result = tool::run_with_timeout(
            &self.config.probe_tool,
            [
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-i"),
                path.as_os_str(),
                OsStr::new("-f"),
                OsStr::new("null"),
                OsStr::new("-"),
            ],
            timeout,
        )?;

        let output = match result {
            ToolResult::NotFound => {
                warn!(
                    "Decode tool '{}' disappeared mid-run; skipping decode check",
                    self.config.probe_tool
                );
                return Ok((false, String::new(), None));
            }
            ToolResult::Output(output) => output,
        };

        if output.timed_out {
            return Ok((
                true,
                format!("decode pass exceeded {}s", timeout.as_secs()),
                Some(output.elapsed),
            ));
        }

        let combined = output.combined_lower();
        for marker in CORRUPTION_MARKERS {
            if combined.contains(marker) {
                return Ok((
                    true,
                    format!("decoder reported '{}'", marker),
                    Some(output.elapsed),
                ));
            }
        }

        Ok((false, String::new(), Some(output.elapsed)))
    }
}

enum ProbeOutcome {
    Info(ProbeInfo),
    ToolMissing,
    Failed(String),
}

fn plain_report(result: ValidationResult) -> ValidationReport {
    ValidationReport {
        result,
        ratio_flagged: false,
        decode_corrupt: false,
        decode_elapsed: None,
    }
}

fn report_with_probe(mut result: ValidationResult, probe: &ProbeInfo) -> ValidationReport {
    apply_probe(&mut result, probe);
    plain_report(result)
}

fn apply_probe(result: &mut ValidationResult, probe: &ProbeInfo) {
    result.duration_secs = probe.duration_secs;
    result.bitrate_kbps = probe.bitrate_kbps;
    result.width = probe.width;
    result.height = probe.height;
}

/// A `sample` token anywhere in the stem (word-bounded, not substring)
/// marks a placeholder release file.
pub fn is_sample_name(file_name: &str) -> bool {
    let stem = file_name
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(file_name);
    stem.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == "sample")
}

fn quality_floor_kbps(height: u32) -> u64 {
    if height >= 1080 {
        2500
    } else if height >= 720 {
        1500
    } else {
        800
    }
}

/// Low quality is a retain-but-flag outcome: low resolution, or a bitrate
/// below the floor for its resolution tier (the floor is stricter at 1080p
/// than below it).
pub fn is_low_quality(height: Option<u32>, bitrate_kbps: Option<u64>, low_res_height: u32) -> bool {
    if let Some(height) = height {
        if height <= low_res_height {
            return true;
        }
        if let Some(bitrate) = bitrate_kbps {
            return bitrate < quality_floor_kbps(height);
        }
    }
    false
}

/// `H:MM:SS.ss` into seconds.
pub fn parse_timestamp_secs(token: &str) -> Option<f64> {
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f64 = parts[0].trim().parse().ok()?;
    let minutes: f64 = parts[1].trim().parse().ok()?;
    let seconds: f64 = parts[2].trim().parse().ok()?;
    if hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

pub fn parse_duration_secs(text: &str) -> Option<f64> {
    let idx = text.find("Duration:")?;
    let rest = text[idx + "Duration:".len()..].trim_start();
    let token: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ',')
        .collect();
    parse_timestamp_secs(&token)
}

pub fn parse_bitrate_kbps(text: &str) -> Option<u64> {
    let idx = text.find("bitrate:")?;
    let rest = text[idx + "bitrate:".len()..].trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// `WxH` on a Video stream line. Codec fourcc tags like `0x31637668` are
/// filtered by the minimum-dimension guard.
pub fn parse_resolution(text: &str) -> Option<(u32, u32)> {
    for line in text.lines().filter(|l| l.contains("Video:")) {
        for token in line.split([',', ' ']) {
            if let Some((w, h)) = token.trim().split_once('x') {
                if let (Ok(w), Ok(h)) = (w.parse::<u32>(), h.parse::<u32>()) {
                    if w >= 16 && h >= 16 {
                        return Some((w, h));
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_TEXT: &str = "Input #0, matroska,webm, from 'movie.mkv':\n\
  Duration: 00:42:17.33, start: 0.000000, bitrate: 5372 kb/s\n\
  Stream #0:0: Video: h264 (High), yuv420p, 1920x1080, 23.98 fps\n\
  Stream #0:1: Audio: aac, 48000 Hz, stereo";

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration_secs(PROBE_TEXT),
            Some(42.0 * 60.0 + 17.33 + 0.0)
        );
        assert_eq!(parse_duration_secs("Duration: N/A, bitrate: N/A"), None);
        assert_eq!(parse_duration_secs("no duration here"), None);
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp_secs("1:02:03.5"), Some(3723.5));
        assert_eq!(parse_timestamp_secs("00:00:00.00"), Some(0.0));
        assert_eq!(parse_timestamp_secs("N/A"), None);
        assert_eq!(parse_timestamp_secs("02:03"), None);
    }

    #[test]
    fn test_parse_bitrate() {
        assert_eq!(parse_bitrate_kbps(PROBE_TEXT), Some(5372));
        assert_eq!(parse_bitrate_kbps("bitrate: N/A"), None);
    }

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution(PROBE_TEXT), Some((1920, 1080)));
        assert_eq!(
            parse_resolution("Stream #0:0: Video: h264 (avc1 / 0x31637661), 1280x720, 30 fps"),
            Some((1280, 720))
        );
        assert_eq!(parse_resolution("Stream #0:1: Audio: aac"), None);
    }

    #[test]
    fn test_sample_name_is_token_bounded() {
        assert!(is_sample_name("movie-sample.mkv"));
        assert!(is_sample_name("SAMPLE.avi"));
        assert!(is_sample_name("movie.sample.mkv"));
        assert!(!is_sample_name("samples.of.life.mkv"));
        assert!(!is_sample_name("movie.mkv"));
    }

    #[test]
    fn test_low_quality_tiers() {
        // At/below the low-res tier: flagged regardless of bitrate.
        assert!(is_low_quality(Some(480), Some(9000), 480));
        // 1080p floor is stricter than 720p's.
        assert!(is_low_quality(Some(1080), Some(2000), 480));
        assert!(!is_low_quality(Some(720), Some(2000), 480));
        assert!(!is_low_quality(Some(1080), Some(5000), 480));
        // Unknown resolution: never flagged.
        assert!(!is_low_quality(None, Some(100), 480));
    }
}
