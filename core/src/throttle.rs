use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// Credit older than this is forgotten so an idle period cannot fund a burst.
const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ThrottleState {
    window_start: Instant,
    bytes: u64,
    limit_bytes_per_sec: u64,
}

impl ThrottleState {
    fn new(limit_bytes_per_sec: u64) -> Self {
        Self {
            window_start: Instant::now(),
            bytes: 0,
            limit_bytes_per_sec,
        }
    }

    fn reserve_sleep(&mut self, bytes: u64, now: Instant) -> Duration {
        if self.limit_bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        if now.saturating_duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.bytes = 0;
        }
        self.bytes = self.bytes.saturating_add(bytes);
        let expected = self.bytes as f64 / self.limit_bytes_per_sec as f64;
        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();
        if expected > elapsed {
            Duration::from_secs_f64(expected - elapsed)
        } else {
            Duration::ZERO
        }
    }
}

/// Bandwidth cap shared by every worker holding a clone.
#[derive(Clone, Debug, Default)]
pub struct Throttle {
    state: Option<Arc<Mutex<ThrottleState>>>,
}

impl Throttle {
    pub fn new(limit_bytes_per_sec: Option<u64>) -> Self {
        Self {
            state: limit_bytes_per_sec
                .filter(|limit| *limit > 0)
                .map(|limit| Arc::new(Mutex::new(ThrottleState::new(limit)))),
        }
    }

    pub fn unlimited() -> Self {
        Self { state: None }
    }

    /// How long the caller should wait after moving `bytes`.
    pub fn reserve(&self, bytes: u64) -> Duration {
        let Some(state) = &self.state else {
            return Duration::ZERO;
        };
        match state.lock() {
            Ok(mut guard) => guard.reserve_sleep(bytes, Instant::now()),
            Err(_) => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_sleeps() {
        assert_eq!(Throttle::unlimited().reserve(u64::MAX), Duration::ZERO);
        assert_eq!(Throttle::new(Some(0)).reserve(1_000), Duration::ZERO);
    }

    #[test]
    fn limited_asks_for_sleep_past_budget() {
        let mut state = ThrottleState::new(1_000);
        let now = state.window_start;
        assert_eq!(state.reserve_sleep(500, now), Duration::from_millis(500));
        let sleep = state.reserve_sleep(500, now + Duration::from_millis(250));
        assert_eq!(sleep, Duration::from_millis(750));

        // A new window forgets the earlier bytes.
        let later = now + Duration::from_secs(5);
        assert_eq!(state.reserve_sleep(100, later), Duration::from_millis(100));
    }
}
