use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::info;

#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub folders_processed: u64,
    pub videos_validated: u64,
    pub videos_moved: u64,
    pub files_deleted: u64,
    pub folders_deleted: u64,
    pub duplicates_found: u64,
    pub bytes_reclaimed: u64,
    pub retries_queued: u64,
}

/// Lock-guarded counters shared with the background ticker thread. The
/// ticker only reads; core decisions never look at these.
#[derive(Clone, Default)]
pub struct SharedStats {
    inner: Arc<Mutex<SessionStats>>,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<F: FnOnce(&mut SessionStats)>(&self, f: F) {
        if let Ok(mut stats) = self.inner.lock() {
            f(&mut stats);
        }
    }

    pub fn snapshot(&self) -> SessionStats {
        self.inner.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Periodic progress line while a run is active. Touches nothing but the
/// stats lock.
pub fn spawn_ticker(
    stats: SharedStats,
    stop: Arc<AtomicBool>,
    interval: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last_tick = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(250));
            if last_tick.elapsed() < interval {
                continue;
            }
            last_tick = Instant::now();
            let s = stats.snapshot();
            info!(
                "progress: {} folders, {} videos validated, {} moved, {} files deleted, {} dupes",
                s.folders_processed,
                s.videos_validated,
                s.videos_moved,
                s.files_deleted,
                s.duplicates_found
            );
        }
    })
}

#[derive(Debug, Default, Clone)]
pub struct StatsTimer {
    start_time: Option<Instant>,
    duration: Duration,
}

impl StatsTimer {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            duration: Duration::new(0, 0),
        }
    }

    pub fn finish(&mut self) {
        if let Some(start) = self.start_time {
            self.duration = start.elapsed();
        }
    }

    pub fn get_duration(&self) -> Duration {
        self.duration
    }

    pub fn get_duration_string(&self) -> String {
        let total_seconds = self.duration.as_secs();
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;
        let millis = self.duration.subsec_millis();
        format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_update_and_snapshot() {
        let stats = SharedStats::new();
        stats.update(|s| s.files_deleted += 3);
        stats.update(|s| s.bytes_reclaimed += 1024);
        let snap = stats.snapshot();
        assert_eq!(snap.files_deleted, 3);
        assert_eq!(snap.bytes_reclaimed, 1024);
    }

    #[test]
    fn test_timer_formats() {
        let mut timer = StatsTimer::new();
        timer.finish();
        let s = timer.get_duration_string();
        assert!(s.starts_with("00:00:00"));
    }
}
