use std::collections::VecDeque;
use std::fs::{self, File};
use std::hash::Hasher as _;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

use crate::error::Result;
use crate::model::{DiskTier, OperationOutcome, OutcomeLabel};

const PROFILE_FILE: &str = "environment.json";
const PROFILE_FRESH_DAYS: i64 = 7;
const EMA_ALPHA: f64 = 0.3;

const EXTRACTION_TIMEOUT_MIN_SECS: u64 = 60;
const EXTRACTION_TIMEOUT_MAX_SECS: u64 = 7200;
const VALIDATION_TIMEOUT_MIN_SECS: u64 = 30;
const VALIDATION_TIMEOUT_MAX_SECS: u64 = 600;

const BENCH_FILE_BYTES: usize = 16 * 1024 * 1024;
const BENCH_RANDOM_READS: usize = 128;
const BENCH_RANDOM_READ_BYTES: usize = 64 * 1024;

/// Learned facts about the machine this runs on. Benchmarked once, cached
/// for a week; the learned throughput fields are only ever blended, never
/// overwritten wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentProfile {
    pub disk_tier: DiskTier,
    pub seq_read_mb_s: f64,
    pub rand_read_mb_s: f64,
    pub cpu_score: f64,
    pub extraction_speed_mb_s: f64,
    pub decode_speed_factor: f64,
    pub updated_at: DateTime<Utc>,
}

impl Default for EnvironmentProfile {
    fn default() -> Self {
        Self {
            disk_tier: DiskTier::Unknown,
            seq_read_mb_s: 100.0,
            rand_read_mb_s: 50.0,
            cpu_score: 1.0,
            extraction_speed_mb_s: 20.0,
            decode_speed_factor: 8.0,
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("downsweep")
}

fn tier_multiplier(tier: DiskTier) -> f64 {
    match tier {
        DiskTier::Hdd => 3.0,
        DiskTier::Ssd => 2.0,
        DiskTier::Nvme => 1.5,
        DiskTier::Unknown => 2.5,
    }
}

fn classify_tier(seq_mb_s: f64, rand_mb_s: f64) -> DiskTier {
    if seq_mb_s <= 0.0 || rand_mb_s <= 0.0 {
        return DiskTier::Unknown;
    }
    let ratio = seq_mb_s / rand_mb_s;
    if ratio > 5.0 {
        DiskTier::Hdd
    } else if ratio < 3.0 && seq_mb_s > 1500.0 {
        DiskTier::Nvme
    } else if ratio < 3.0 {
        DiskTier::Ssd
    } else {
        DiskTier::Unknown
    }
}

fn ema(old: f64, observed: f64) -> f64 {
    EMA_ALPHA * observed + (1.0 - EMA_ALPHA) * old
}

/// Derives subprocess timeouts from the environment profile and keeps the
/// profile honest with observed timings.
pub struct AdaptiveTimeoutPolicy {
    profile: EnvironmentProfile,
    cache_dir: PathBuf,
}

impl AdaptiveTimeoutPolicy {
    /// Load the cached profile if it is fresh, otherwise benchmark. Any
    /// failure degrades to the default profile rather than aborting a run.
    pub fn load_or_benchmark(cache_dir: PathBuf) -> Self {
        let cached = read_profile(&cache_dir.join(PROFILE_FILE));
        if let Some(profile) = &cached {
            let age = Utc::now().signed_duration_since(profile.updated_at);
            if age.num_days() < PROFILE_FRESH_DAYS {
                debug!("Using cached environment profile ({:?})", profile.disk_tier);
                return Self {
                    profile: profile.clone(),
                    cache_dir,
                };
            }
        }

        let mut profile = match run_benchmark(&cache_dir) {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Environment benchmark failed ({}); using defaults", e);
                EnvironmentProfile::default()
            }
        };
        // A stale profile still holds learned throughput; carry it forward.
        if let Some(old) = cached {
            profile.extraction_speed_mb_s = old.extraction_speed_mb_s;
            profile.decode_speed_factor = old.decode_speed_factor;
        }
        let policy = Self { profile, cache_dir };
        policy.persist();
        policy
    }

    /// Force a fresh benchmark, preserving learned throughput fields.
    pub fn rebenchmark(cache_dir: PathBuf) -> Result<Self> {
        let old = read_profile(&cache_dir.join(PROFILE_FILE));
        let mut profile = run_benchmark(&cache_dir)?;
        if let Some(old) = old {
            profile.extraction_speed_mb_s = old.extraction_speed_mb_s;
            profile.decode_speed_factor = old.decode_speed_factor;
        }
        let policy = Self { profile, cache_dir };
        policy.persist();
        Ok(policy)
    }

    pub fn with_profile(profile: EnvironmentProfile, cache_dir: PathBuf) -> Self {
        Self { profile, cache_dir }
    }

    pub fn profile(&self) -> &EnvironmentProfile {
        &self.profile
    }

    /// Extraction timeout = size / learned speed x tier buffer, clamped to
    /// [60s, 7200s]. Non-decreasing in size.
    pub fn extraction_timeout(&self, size_bytes: u64) -> Duration {
        let speed = self.profile.extraction_speed_mb_s.max(0.1);
        let secs =
            size_bytes as f64 / 1_000_000.0 / speed * tier_multiplier(self.profile.disk_tier);
        Duration::from_secs(
            (secs.ceil() as u64).clamp(EXTRACTION_TIMEOUT_MIN_SECS, EXTRACTION_TIMEOUT_MAX_SECS),
        )
    }

    /// Validation timeout = duration / (decode speed x CPU score) x 3 + 30s,
    /// clamped to [30s, 600s].
    pub fn validation_timeout(&self, video_duration_secs: f64) -> Duration {
        let speed = self.profile.decode_speed_factor.max(0.1);
        let cpu = self.profile.cpu_score.max(0.1);
        let secs = video_duration_secs.max(0.0) / (speed * cpu) * 3.0 + 30.0;
        Duration::from_secs(
            (secs.ceil() as u64).clamp(VALIDATION_TIMEOUT_MIN_SECS, VALIDATION_TIMEOUT_MAX_SECS),
        )
    }

    /// Blend an observed extraction timing into the learned speed.
    pub fn record_extraction(&mut self, size_bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || size_bytes == 0 {
            return;
        }
        let observed = size_bytes as f64 / 1_000_000.0 / secs;
        self.profile.extraction_speed_mb_s = ema(self.profile.extraction_speed_mb_s, observed);
        self.profile.updated_at = Utc::now();
        self.persist();
    }

    /// Blend an observed decode timing (video seconds per wall second).
    pub fn record_decode(&mut self, video_duration_secs: f64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || video_duration_secs <= 0.0 {
            return;
        }
        let observed = video_duration_secs / secs;
        self.profile.decode_speed_factor = ema(self.profile.decode_speed_factor, observed);
        self.profile.updated_at = Utc::now();
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = write_profile(&self.cache_dir, &self.profile) {
            warn!("Could not persist environment profile: {}", e);
        }
    }
}

fn read_profile(path: &Path) -> Option<EnvironmentProfile> {
    let text = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(profile) => Some(profile),
        Err(e) => {
            warn!("Corrupt environment profile at {}: {}", path.display(), e);
            None
        }
    }
}

fn write_profile(cache_dir: &Path, profile: &EnvironmentProfile) -> Result<()> {
    fs::create_dir_all(cache_dir)?;
    let text = serde_json::to_string_pretty(profile)?;
    fs::write(cache_dir.join(PROFILE_FILE), text)?;
    Ok(())
}

fn run_benchmark(cache_dir: &Path) -> Result<EnvironmentProfile> {
    info!("Benchmarking environment (first run or stale profile)...");
    let (seq, rand) = benchmark_disk(cache_dir)?;
    let cpu = benchmark_cpu();
    let tier = classify_tier(seq, rand);
    info!(
        "Benchmark: seq {:.0} MB/s, rand {:.0} MB/s, cpu score {:.2} -> {:?}",
        seq, rand, cpu, tier
    );
    let defaults = EnvironmentProfile::default();
    Ok(EnvironmentProfile {
        disk_tier: tier,
        seq_read_mb_s: seq,
        rand_read_mb_s: rand,
        cpu_score: cpu,
        extraction_speed_mb_s: defaults.extraction_speed_mb_s,
        decode_speed_factor: defaults.decode_speed_factor,
        updated_at: Utc::now(),
    })
}

fn benchmark_disk(cache_dir: &Path) -> Result<(f64, f64)> {
    fs::create_dir_all(cache_dir)?;
    let bench_path = cache_dir.join("bench.tmp");
    let data = vec![0x5Au8; BENCH_FILE_BYTES];
    fs::write(&bench_path, &data)?;
    drop(data);

    let mut file = File::open(&bench_path)?;
    let mut buf = vec![0u8; 1024 * 1024];
    let start = Instant::now();
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
    }
    let seq = BENCH_FILE_BYTES as f64 / 1_000_000.0 / start.elapsed().as_secs_f64().max(1e-6);

    let mut file = File::open(&bench_path)?;
    let mut buf = vec![0u8; BENCH_RANDOM_READ_BYTES];
    let span = (BENCH_FILE_BYTES - BENCH_RANDOM_READ_BYTES) as u64;
    let mut offset: u64 = 7919;
    let start = Instant::now();
    for _ in 0..BENCH_RANDOM_READS {
        offset = offset.wrapping_mul(2_654_435_761) % span;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
    }
    let rand = (BENCH_RANDOM_READS * BENCH_RANDOM_READ_BYTES) as f64
        / 1_000_000.0
        / start.elapsed().as_secs_f64().max(1e-6);

    // Declared temp set for this benchmark is exactly the one file (I9).
    fs::remove_file(&bench_path)?;

    Ok((seq, rand))
}

fn benchmark_cpu() -> f64 {
    let buf = vec![0xA7u8; 4 * 1024 * 1024];
    let start = Instant::now();
    let mut sink = 0u64;
    for _ in 0..32 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&buf);
        sink ^= hasher.finish();
    }
    let elapsed = start.elapsed().as_secs_f64().max(1e-6);
    let mb_s = (32.0 * 4.0) / elapsed;
    // Keep the compiler from eliding the loop.
    std::hint::black_box(sink);
    // Normalized so a mid-range desktop lands near 1.0.
    mb_s / 4000.0
}

const HISTORY_LIMIT: usize = 1000;
const ADAPT_WINDOW: usize = 50;
const SMOOTHING: f64 = 0.1;

/// An accept/reject threshold that drifts with observed outcomes: many
/// false positives relax it toward `min`, many false negatives tighten it
/// toward `max`, always with 90/10 smoothing and clamped to bounds. The
/// current value is derived from history, never the source of truth.
#[derive(Debug)]
pub struct AdaptiveThreshold {
    name: String,
    base: f64,
    min: f64,
    max: f64,
    current: f64,
    history: VecDeque<OperationOutcome>,
    store_path: Option<PathBuf>,
}

impl AdaptiveThreshold {
    pub fn new(name: impl Into<String>, base: f64, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            base,
            min,
            max,
            current: base,
            history: VecDeque::new(),
            store_path: None,
        }
    }

    /// Attach a JSON history store and recompute the current threshold by
    /// replaying the persisted outcomes.
    pub fn with_store(mut self, cache_dir: &Path) -> Self {
        let path = cache_dir.join(format!("outcomes_{}.json", self.name));
        if let Ok(text) = fs::read_to_string(&path) {
            match serde_json::from_str::<Vec<OperationOutcome>>(&text) {
                Ok(history) => {
                    self.history = history.into_iter().collect();
                    while self.history.len() > HISTORY_LIMIT {
                        self.history.pop_front();
                    }
                    self.recompute();
                }
                Err(e) => warn!("Corrupt outcome history for '{}': {}", self.name, e),
            }
        }
        self.store_path = Some(path);
        self
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn record(&mut self, outcome: OperationOutcome) {
        self.history.push_back(outcome);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.adapt_step();
        self.persist();
    }

    /// One adaptation step over the trailing window.
    fn adapt_step(&mut self) {
        let mut false_positives = 0usize;
        let mut false_negatives = 0usize;
        for outcome in self.history.iter().rev().take(ADAPT_WINDOW) {
            match outcome.outcome {
                OutcomeLabel::FalsePositive => false_positives += 1,
                OutcomeLabel::FalseNegative => false_negatives += 1,
                OutcomeLabel::TruePositive
                | OutcomeLabel::TrueNegative
                | OutcomeLabel::UserOverride => {}
            }
        }

        let target = if false_positives > 0 && false_positives >= 2 * false_negatives.max(1) {
            self.min
        } else if false_negatives > 0 && false_negatives >= 2 * false_positives.max(1) {
            self.max
        } else {
            return;
        };

        self.current = ((1.0 - SMOOTHING) * self.current + SMOOTHING * target)
            .clamp(self.min, self.max);
        debug!(
            "threshold '{}' adapted to {:.3} (fp={}, fn={})",
            self.name, self.current, false_positives, false_negatives
        );
    }

    /// Replay the full history from the base value; used after loading.
    fn recompute(&mut self) {
        self.current = self.base;
        let full: Vec<OperationOutcome> = self.history.iter().cloned().collect();
        self.history.clear();
        for outcome in full {
            self.history.push_back(outcome);
            self.adapt_step();
        }
    }

    fn persist(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let history: Vec<&OperationOutcome> = self.history.iter().collect();
        match serde_json::to_string(&history) {
            Ok(text) => {
                if let Err(e) = fs::write(path, text) {
                    warn!("Could not persist outcome history '{}': {}", self.name, e);
                }
            }
            Err(e) => warn!("Could not serialize outcome history '{}': {}", self.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ValidationDecision;

    fn outcome(label: OutcomeLabel) -> OperationOutcome {
        OperationOutcome {
            timestamp: Utc::now(),
            operation: "validate".to_string(),
            path: PathBuf::from("/tmp/x.mkv"),
            size_bytes: 1000,
            duration_ms: 10,
            decision: ValidationDecision::FailCorrupt,
            outcome: label,
            note: String::new(),
        }
    }

    #[test]
    fn test_extraction_timeout_monotonic_and_clamped() {
        let policy = AdaptiveTimeoutPolicy::with_profile(
            EnvironmentProfile::default(),
            PathBuf::from("/tmp/downsweep-test"),
        );
        let mut last = Duration::ZERO;
        for size in [0u64, 1 << 20, 1 << 28, 1 << 34, 1 << 40] {
            let t = policy.extraction_timeout(size);
            assert!(t >= last, "timeout not monotonic at size {}", size);
            assert!(t >= Duration::from_secs(60));
            assert!(t <= Duration::from_secs(7200));
            last = t;
        }
    }

    #[test]
    fn test_validation_timeout_clamped() {
        let policy = AdaptiveTimeoutPolicy::with_profile(
            EnvironmentProfile::default(),
            PathBuf::from("/tmp/downsweep-test"),
        );
        assert_eq!(policy.validation_timeout(0.0), Duration::from_secs(30));
        assert!(policy.validation_timeout(100_000.0) <= Duration::from_secs(600));
    }

    #[test]
    fn test_tier_classification() {
        assert_eq!(classify_tier(600.0, 100.0), DiskTier::Hdd);
        assert_eq!(classify_tier(500.0, 400.0), DiskTier::Ssd);
        assert_eq!(classify_tier(3000.0, 2500.0), DiskTier::Nvme);
        assert_eq!(classify_tier(400.0, 100.0), DiskTier::Unknown);
    }

    #[test]
    fn test_ema_blends() {
        let blended = ema(10.0, 20.0);
        assert!(blended > 10.0 && blended < 20.0);
        assert!((blended - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_relaxes_on_false_positives() {
        let mut t = AdaptiveThreshold::new("ratio", 0.70, 0.50, 0.90);
        for _ in 0..10 {
            t.record(outcome(OutcomeLabel::FalsePositive));
        }
        assert!(t.current() < 0.70);
        assert!(t.current() >= 0.50);
    }

    #[test]
    fn test_threshold_tightens_on_false_negatives() {
        let mut t = AdaptiveThreshold::new("ratio", 0.70, 0.50, 0.90);
        for _ in 0..10 {
            t.record(outcome(OutcomeLabel::FalseNegative));
        }
        assert!(t.current() > 0.70);
        assert!(t.current() <= 0.90);
    }

    #[test]
    fn test_threshold_stable_on_balance() {
        let mut t = AdaptiveThreshold::new("ratio", 0.70, 0.50, 0.90);
        for _ in 0..5 {
            t.record(outcome(OutcomeLabel::FalsePositive));
            t.record(outcome(OutcomeLabel::FalseNegative));
        }
        assert!((t.current() - 0.70).abs() < 0.05);
    }

    #[test]
    fn test_history_bounded() {
        let mut t = AdaptiveThreshold::new("ratio", 0.70, 0.50, 0.90);
        for _ in 0..1200 {
            t.record(outcome(OutcomeLabel::TrueNegative));
        }
        assert_eq!(t.history_len(), 1000);
    }
}
