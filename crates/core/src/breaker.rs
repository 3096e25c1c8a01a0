//! Per-type consumer circuit breaker.
//!
//! Closed counts outcomes in a fixed ring; enough failures open the
//! breaker, which pauses consumption for the type. After the reset
//! interval the breaker half-opens and probes; consecutive successes close
//! it again, any probe failure reopens it.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    /// Last `window_size` outcomes; `false` is a failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_successes: usize,
}

pub struct CircuitBreaker {
    label: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            label: label.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.advance_clock(&mut inner);
        match inner.state {
            BreakerState::Closed => {
                push_outcome(&mut inner.window, true, self.config.window_size);
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.active_threshold {
                    inner.state = BreakerState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    inner.half_open_successes = 0;
                    info!("✅ Circuit breaker for {} closed again", self.label);
                }
            }
            // A late success while open changes nothing.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.advance_clock(&mut inner);
        match inner.state {
            BreakerState::Closed => {
                push_outcome(&mut inner.window, false, self.config.window_size);
                let failures = inner.window.iter().filter(|ok| !**ok).count();
                if failures >= self.config.trip_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        "🚧 Circuit breaker for {} opened after {} failures in the last {}",
                        self.label,
                        failures,
                        inner.window.len()
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
                warn!("🚧 Circuit breaker for {} reopened by a probe failure", self.label);
            }
            BreakerState::Open => {}
        }
    }

    /// Whether the poll loop must keep this type paused. Also drives the
    /// time-based Open → HalfOpen transition.
    pub fn requires_pause(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance_clock(&mut inner);
        inner.state == BreakerState::Open
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.advance_clock(&mut inner);
        inner.state
    }

    fn advance_clock(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.reset_interval {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    info!("🔎 Circuit breaker for {} half-open, probing", self.label);
                }
            }
        }
    }
}

fn push_outcome(window: &mut VecDeque<bool>, ok: bool, size: usize) {
    if window.len() == size {
        window.pop_front();
    }
    window.push_back(ok);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(trip: usize, window: usize, active: usize, reset: Duration) -> BreakerConfig {
        BreakerConfig {
            trip_threshold: trip,
            window_size: window,
            active_threshold: active,
            reset_interval: reset,
        }
    }

    #[test]
    fn trips_after_exactly_the_threshold() {
        let breaker = CircuitBreaker::new("orders", config(3, 5, 1, Duration::from_secs(30)));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.requires_pause());
    }

    #[test]
    fn old_successes_roll_out_of_the_window() {
        let breaker = CircuitBreaker::new("orders", config(2, 3, 1, Duration::from_secs(30)));
        breaker.record_success();
        breaker.record_success();
        breaker.record_success();
        breaker.record_failure();
        // Window is now [ok, ok, fail]; one more failure reaches the trip
        // threshold inside the window.
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn half_opens_after_reset_and_closes_on_success() {
        let breaker = CircuitBreaker::new("orders", config(1, 5, 1, Duration::from_millis(10)));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(15));
        assert!(!breaker.requires_pause());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn probe_failure_reopens() {
        let breaker = CircuitBreaker::new("orders", config(1, 5, 2, Duration::from_millis(10)));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        // Still half-open: active_threshold is 2.
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn closing_clears_the_window() {
        let breaker = CircuitBreaker::new("orders", config(2, 3, 1, Duration::from_millis(10)));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(15));
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // A single failure after closing must not trip immediately.
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
