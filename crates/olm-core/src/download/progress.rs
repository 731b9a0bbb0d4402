//! Progress tracking with windowed speed and ETA.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Speed is averaged over samples no older than this.
const SPEED_WINDOW: Duration = Duration::from_secs(2);

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Bytes written so far, including any resumed prefix.
    pub downloaded: u64,
    /// Total bytes when known.
    pub total: Option<u64>,
    /// Current speed in bytes per second.
    pub speed: f64,
    /// Time remaining, `None` when total or speed is unknown.
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    /// Progress as a percentage (0 to 100). Zero when the total is unknown.
    #[must_use]
    pub fn percent(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => {
                (self.downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        }
    }

    /// Speed formatted for display.
    #[must_use]
    pub fn speed_text(&self) -> String {
        format_speed(self.speed)
    }

    /// ETA formatted for display.
    #[must_use]
    pub fn eta_text(&self) -> String {
        format_eta(self.eta)
    }
}

/// Accumulates byte counts and decides when to emit snapshots.
///
/// Time is passed in by the caller so the tracker stays deterministic.
#[derive(Debug)]
pub struct ProgressTracker {
    downloaded: u64,
    total: Option<u64>,
    samples: VecDeque<(Instant, u64)>,
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    /// New tracker that emits at most once per `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            downloaded: 0,
            total: None,
            samples: VecDeque::with_capacity(32),
            interval,
            last_emit: None,
        }
    }

    /// Reset the baseline for a new attempt. Speed restarts from zero.
    pub fn start(&mut self, downloaded: u64, total: Option<u64>, now: Instant) {
        self.downloaded = downloaded;
        self.total = total;
        self.samples.clear();
        self.samples.push_back((now, downloaded));
    }

    /// Update the known total.
    pub fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
    }

    /// Record the new cumulative byte count.
    pub fn record(&mut self, downloaded: u64, now: Instant) {
        self.downloaded = downloaded;
        self.samples.push_back((now, downloaded));

        while self.samples.len() > 2 {
            match self.samples.front() {
                Some((at, _)) if now.duration_since(*at) > SPEED_WINDOW => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Bytes recorded so far.
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Bytes per second over the sample window.
    #[must_use]
    pub fn speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };

        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        last.1.saturating_sub(first.1) as f64 / elapsed
    }

    /// Remaining time at the current speed.
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total?;
        let speed = self.speed();
        if speed <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.downloaded) as f64;
        Some(Duration::from_secs_f64(remaining / speed))
    }

    /// True at most once per interval. The first call always emits.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            downloaded: self.downloaded,
            total: self.total,
            speed: self.speed(),
            eta: self.eta(),
        }
    }
}

/// Format bytes as a human-readable string.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format speed as a human-readable string.
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}

/// Format an ETA as `45s`, `3m 12s` or `1h 5m`.
#[must_use]
pub fn format_eta(eta: Option<Duration>) -> String {
    let Some(eta) = eta else {
        return "unknown".to_string();
    };

    let secs = eta.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(52_428_800), "50.0 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.0 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024.0), "1.0 KB/s");
        assert_eq!(format_speed(0.0), "0 B/s");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "unknown");
        assert_eq!(format_eta(Some(Duration::from_secs(45))), "45s");
        assert_eq!(format_eta(Some(Duration::from_secs(192))), "3m 12s");
        assert_eq!(format_eta(Some(Duration::from_secs(3900))), "1h 5m");
    }

    #[test]
    fn test_speed_and_eta() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(Duration::from_millis(500));
        tracker.start(0, Some(1000), start);
        tracker.record(100, start + Duration::from_secs(1));

        let snapshot = tracker.snapshot();
        assert!((snapshot.speed - 100.0).abs() < 1e-6);
        assert_eq!(snapshot.eta, Some(Duration::from_secs(9)));
        assert!((snapshot.percent() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_eta_unknown_without_total_or_speed() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(Duration::from_millis(500));
        tracker.start(0, None, start);
        tracker.record(100, start + Duration::from_secs(1));
        assert_eq!(tracker.snapshot().eta_text(), "unknown");

        tracker.start(100, Some(1000), start);
        assert_eq!(tracker.snapshot().eta_text(), "unknown");
    }

    #[test]
    fn test_resumed_prefix_does_not_inflate_speed() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(Duration::from_millis(500));
        tracker.start(4_000, Some(10_000), start);
        tracker.record(4_500, start + Duration::from_secs(1));
        assert!((tracker.speed() - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_drops_old_samples() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(Duration::from_millis(500));
        tracker.start(0, None, start);
        tracker.record(10_000, start + Duration::from_secs(1));
        tracker.record(10_000, start + Duration::from_secs(4));
        tracker.record(10_100, start + Duration::from_secs(5));
        assert!((tracker.speed() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_should_emit_throttles() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(Duration::from_millis(500));
        assert!(tracker.should_emit(start));
        assert!(!tracker.should_emit(start + Duration::from_millis(200)));
        assert!(tracker.should_emit(start + Duration::from_millis(600)));
    }
}
