//! Consecutive-failure circuit breaker.
//!
//! `failure_threshold` consecutive failures open the circuit; calls then fail
//! fast with [`RagError::CircuitOpen`] until `cooldown` has elapsed, after
//! which exactly one probe call is let through. A successful probe closes the
//! circuit, a failed one re-opens it.
//!
//! Every admitted call holds a [`Permit`]. A permit dropped without an
//! outcome (the caller's future was abandoned mid-call) frees the probe slot.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use ragpipe_shared::{CircuitBreakerConfig, RagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { probing: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// A `threshold` of zero disables the breaker.
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold,
            cooldown,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_secs(config.cooldown_secs),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Permission to make one call.
    pub fn try_acquire(&self) -> Result<Permit<'_>> {
        if self.threshold == 0 {
            return Ok(Permit::new(self, false));
        }
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } => Ok(Permit::new(self, false)),
            Inner::Open { since } if since.elapsed() >= self.cooldown => {
                info!(collaborator = %self.name, "circuit half-open, probing");
                *inner = Inner::HalfOpen { probing: true };
                Ok(Permit::new(self, true))
            }
            Inner::HalfOpen { probing: false } => {
                *inner = Inner::HalfOpen { probing: true };
                Ok(Permit::new(self, true))
            }
            Inner::Open { .. } | Inner::HalfOpen { probing: true } => Err(RagError::CircuitOpen {
                collaborator: self.name.clone(),
            }),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if matches!(*inner, Inner::HalfOpen { .. }) {
            info!(collaborator = %self.name, "circuit closed");
        }
        *inner = Inner::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        if self.threshold == 0 {
            return;
        }
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { failures } if failures + 1 < self.threshold => {
                *inner = Inner::Closed {
                    failures: failures + 1,
                };
            }
            Inner::Closed { .. } | Inner::HalfOpen { .. } => {
                warn!(
                    collaborator = %self.name,
                    cooldown_secs = self.cooldown.as_secs(),
                    "circuit opened"
                );
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        if let Inner::HalfOpen { probing: true } = *inner {
            *inner = Inner::HalfOpen { probing: false };
        }
    }
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// One admitted call. Consume it with [`Permit::record`]; dropping it
/// instead counts neither a success nor a failure.
#[must_use = "a permit dropped without an outcome releases its slot"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: Option<&'a CircuitBreaker>,
    probe: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker: Some(breaker),
            probe,
        }
    }

    /// Success closes the circuit, a retryable error counts as a failure,
    /// and any other error only gives the slot back.
    pub fn record<T>(mut self, outcome: &Result<T>) {
        let Some(breaker) = self.breaker.take() else {
            return;
        };
        match outcome {
            Ok(_) => breaker.record_success(),
            Err(e) if e.is_retryable() => breaker.record_failure(),
            Err(_) if self.probe => breaker.release_probe(),
            Err(_) => {}
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            if self.probe {
                breaker.release_probe();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold() {
        let b = CircuitBreaker::new("search", 3, Duration::from_secs(60));
        for _ in 0..2 {
            b.record_failure();
            assert!(b.try_acquire().is_ok());
        }
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(b.try_acquire(), Err(RagError::CircuitOpen { .. })));
    }

    #[test]
    fn success_resets_count() {
        let b = CircuitBreaker::new("search", 2, Duration::from_secs(60));
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn single_probe_after_cooldown() {
        let b = CircuitBreaker::new("search", 1, Duration::ZERO);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);

        let probe = b.try_acquire().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().is_err(), "second probe must wait");

        probe.record(&Ok(()));
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn failed_probe_reopens() {
        let b = CircuitBreaker::new("search", 1, Duration::ZERO);
        b.record_failure();
        let probe = b.try_acquire().unwrap();
        probe.record::<()>(&Err(RagError::unavailable("search", "still down")));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn non_retryable_half_open_error_frees_the_slot() {
        let b = CircuitBreaker::new("search", 1, Duration::ZERO);
        b.record_failure();
        let probe = b.try_acquire().unwrap();
        probe.record::<()>(&Err(RagError::Cancelled));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn dropped_half_open_permit_frees_the_slot() {
        let b = CircuitBreaker::new("search", 1, Duration::ZERO);
        b.record_failure();
        let probe = b.try_acquire().unwrap();
        assert!(b.try_acquire().is_err());
        drop(probe);
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn dropped_ordinary_permit_leaves_half_open_slot_alone() {
        let b = CircuitBreaker::new("search", 1, Duration::ZERO);
        let stale = b.try_acquire().unwrap();
        b.record_failure();
        let _probe = b.try_acquire().unwrap();
        drop(stale);
        assert!(b.try_acquire().is_err(), "probe still in flight");
    }

    #[test]
    fn zero_threshold_disables() {
        let b = CircuitBreaker::new("search", 0, Duration::from_secs(60));
        for _ in 0..10 {
            b.record_failure();
        }
        assert!(b.try_acquire().is_ok());
    }
}
