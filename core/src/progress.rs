use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TransferProgress {
    pub bytes_done: u64,
    pub total_bytes: Option<u64>,
    pub bytes_per_sec: f64,
    pub eta_secs: Option<u64>,
}

impl TransferProgress {
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some(self.bytes_done as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}

/// Average throughput over a sliding time window.
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(100)),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        while let Some((oldest, _)) = self.samples.front() {
            if at.saturating_duration_since(*oldest) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn bytes_per_sec(&self, now: Instant) -> f64 {
        let Some((oldest, _)) = self.samples.front() else {
            return 0.0;
        };
        let span = now.saturating_duration_since(*oldest).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let bytes: u64 = self.samples.iter().map(|(_, bytes)| bytes).sum();
        bytes as f64 / span
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Tracks bytes for one transfer and decides when observers hear about it.
#[derive(Debug)]
pub struct ProgressMeter {
    bytes_done: u64,
    total_bytes: Option<u64>,
    speed: SpeedMeter,
    min_interval: Duration,
    min_bytes: u64,
    last_emit_at: Option<Instant>,
    last_emit_bytes: u64,
}

impl ProgressMeter {
    pub fn new(window: Duration, min_interval: Duration, min_bytes: u64) -> Self {
        Self {
            bytes_done: 0,
            total_bytes: None,
            speed: SpeedMeter::new(window),
            min_interval,
            min_bytes: min_bytes.max(1),
            last_emit_at: None,
            last_emit_bytes: 0,
        }
    }

    /// Starts (or restarts) counting at `offset`.
    pub fn start_at(&mut self, offset: u64, total_bytes: Option<u64>) {
        self.bytes_done = offset;
        self.total_bytes = total_bytes;
        self.last_emit_bytes = offset;
        self.last_emit_at = None;
        self.speed.reset();
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    /// Records `bytes` and returns a snapshot when one is due.
    pub fn advance(&mut self, bytes: u64, now: Instant) -> Option<TransferProgress> {
        self.bytes_done = self.bytes_done.saturating_add(bytes);
        self.speed.record(now, bytes);
        let due_by_time = self
            .last_emit_at
            .map(|at| now.saturating_duration_since(at) >= self.min_interval)
            .unwrap_or(true);
        let due_by_bytes = self.bytes_done.saturating_sub(self.last_emit_bytes) >= self.min_bytes;
        if due_by_time || due_by_bytes {
            Some(self.emit(now))
        } else {
            None
        }
    }

    pub fn emit(&mut self, now: Instant) -> TransferProgress {
        self.last_emit_at = Some(now);
        self.last_emit_bytes = self.bytes_done;
        self.snapshot(now)
    }

    pub fn snapshot(&self, now: Instant) -> TransferProgress {
        let bytes_per_sec = self.speed.bytes_per_sec(now);
        let eta_secs = match self.total_bytes {
            Some(total) if bytes_per_sec > 0.0 => {
                Some((total.saturating_sub(self.bytes_done) as f64 / bytes_per_sec).ceil() as u64)
            }
            _ => None,
        };
        TransferProgress {
            bytes_done: self.bytes_done,
            total_bytes: self.total_bytes,
            bytes_per_sec,
            eta_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_uses_window_not_last_delta() {
        let start = Instant::now();
        let mut meter = SpeedMeter::new(Duration::from_secs(2));
        meter.record(start, 1_000);
        meter.record(start + Duration::from_millis(500), 1_000);
        meter.record(start + Duration::from_millis(1_000), 100_000);
        let speed = meter.bytes_per_sec(start + Duration::from_secs(1));
        assert!((speed - 102_000.0).abs() < 1.0);

        // Samples older than the window drop out.
        meter.record(start + Duration::from_secs(4), 2_000);
        let speed = meter.bytes_per_sec(start + Duration::from_secs(5));
        assert!((speed - 2_000.0).abs() < 1.0);
    }

    #[test]
    fn emission_is_throttled() {
        let start = Instant::now();
        let mut meter = ProgressMeter::new(Duration::from_secs(1), Duration::from_secs(1), 1_000);
        meter.start_at(0, Some(10_000));

        assert!(meter.advance(10, start).is_some());
        assert!(meter.advance(10, start + Duration::from_millis(10)).is_none());
        let by_bytes = meter.advance(1_000, start + Duration::from_millis(20));
        assert_eq!(by_bytes.map(|p| p.bytes_done), Some(1_020));
        let by_time = meter.advance(1, start + Duration::from_millis(1_100));
        assert!(by_time.is_some());
    }

    #[test]
    fn eta_from_speed_and_remaining() {
        let start = Instant::now();
        let mut meter = ProgressMeter::new(Duration::from_secs(10), Duration::ZERO, 1);
        meter.start_at(0, Some(3_000));
        meter.advance(500, start);
        let snapshot = meter.advance(500, start + Duration::from_secs(1)).unwrap();
        assert_eq!(snapshot.bytes_done, 1_000);
        assert_eq!(snapshot.eta_secs, Some(2));
        assert_eq!(snapshot.percent().map(|p| p.round()), Some(33.0));
    }
}
