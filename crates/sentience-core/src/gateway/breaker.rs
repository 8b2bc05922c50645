//! Three-state circuit breaker, generic over the wrapped operation.
//!
//! Closed: calls run under the caller's timeout; consecutive failures are counted and the
//! circuit opens when they reach the threshold. Open: calls fail fast until the cooldown
//! elapses, then exactly one trial call is admitted (HalfOpen). Callers arriving while the
//! trial is in flight fail fast with `HalfOpenBusy`; they never queue.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, Clock};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum GatewayError<E> {
    #[error("circuit open")]
    CircuitOpen,

    #[error("circuit half-open: trial call in flight")]
    HalfOpenBusy,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Inner(E),
}

// ---------------------------------------------------------------------------
// Configuration and observable state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of the breaker; also its persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    /// Set only while `status` is `Open`.
    pub opened_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Circuit {
    Closed { failures: u32 },
    Open { opened_at: DateTime<Utc>, failures: u32 },
    HalfOpen { trial_in_flight: bool, failures: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

pub struct CircuitBreaker {
    circuit: Mutex<Circuit>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("circuit", &*self.lock())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown,
        };
        Self {
            circuit: Mutex::new(Circuit::Closed { failures: 0 }),
            config,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Circuit> {
        self.circuit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Runs `request` if the circuit admits it, bounded by `timeout`.
    ///
    /// `request` is not invoked when the call is rejected. A timeout or an `Err` from the
    /// request counts as a failure. Dropping the returned future while a HalfOpen trial is
    /// running counts as a failed trial.
    pub async fn call<F, Fut, T, E>(&self, timeout: Duration, request: F) -> Result<T, GatewayError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.admit::<E>()?;
        let mut guard = CallGuard {
            breaker: self,
            permit,
            settled: false,
        };

        let outcome = tokio::time::timeout(timeout, request()).await;
        guard.settled = true;
        match outcome {
            Ok(Ok(value)) => {
                self.record_success(permit);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure(permit);
                Err(GatewayError::Inner(err))
            }
            Err(_) => {
                debug!(target: "sentience::gateway", timeout_ms = timeout.as_millis() as u64, "call timed out");
                self.record_failure(permit);
                Err(GatewayError::Timeout(timeout))
            }
        }
    }

    fn admit<E>(&self) -> Result<Permit, GatewayError<E>> {
        let mut circuit = self.lock();
        match *circuit {
            Circuit::Closed { .. } => Ok(Permit::Normal),
            Circuit::Open { opened_at, failures } => {
                if elapsed_between(opened_at, self.clock.now()) >= self.config.cooldown {
                    debug!(target: "sentience::gateway", "cooldown elapsed; admitting trial call");
                    *circuit = Circuit::HalfOpen {
                        trial_in_flight: true,
                        failures,
                    };
                    Ok(Permit::Trial)
                } else {
                    Err(GatewayError::CircuitOpen)
                }
            }
            Circuit::HalfOpen { trial_in_flight: true, .. } => Err(GatewayError::HalfOpenBusy),
            Circuit::HalfOpen { trial_in_flight: false, failures } => {
                *circuit = Circuit::HalfOpen {
                    trial_in_flight: true,
                    failures,
                };
                Ok(Permit::Trial)
            }
        }
    }

    fn record_success(&self, permit: Permit) {
        let mut circuit = self.lock();
        match (*circuit, permit) {
            (Circuit::Closed { .. }, Permit::Normal) => *circuit = Circuit::Closed { failures: 0 },
            (Circuit::HalfOpen { .. }, Permit::Trial) => {
                *circuit = Circuit::Closed { failures: 0 };
                info!(target: "sentience::gateway", "trial call succeeded; circuit closed");
            }
            // Late result from a call admitted before the circuit changed.
            _ => {}
        }
    }

    fn record_failure(&self, permit: Permit) {
        let now = self.clock.now();
        let mut circuit = self.lock();
        match (*circuit, permit) {
            (Circuit::Closed { failures }, Permit::Normal) => {
                let failures = failures.saturating_add(1);
                if failures >= self.config.failure_threshold {
                    *circuit = Circuit::Open { opened_at: now, failures };
                    warn!(
                        target: "sentience::gateway",
                        failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "failure threshold reached; circuit opened"
                    );
                } else {
                    *circuit = Circuit::Closed { failures };
                }
            }
            (Circuit::HalfOpen { failures, .. }, Permit::Trial) => {
                *circuit = Circuit::Open {
                    opened_at: now,
                    failures: failures.saturating_add(1),
                };
                warn!(target: "sentience::gateway", "trial call failed; circuit reopened");
            }
            _ => {}
        }
    }

    /// True when a call made now would be attempted rather than rejected.
    pub fn is_accepting(&self) -> bool {
        match *self.lock() {
            Circuit::Closed { .. } => true,
            Circuit::Open { opened_at, .. } => elapsed_between(opened_at, self.clock.now()) >= self.config.cooldown,
            Circuit::HalfOpen { trial_in_flight, .. } => !trial_in_flight,
        }
    }

    pub fn status(&self) -> CircuitStatus {
        match *self.lock() {
            Circuit::Closed { .. } => CircuitStatus::Closed,
            Circuit::Open { .. } => CircuitStatus::Open,
            Circuit::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        let (status, consecutive_failures, opened_at) = match *self.lock() {
            Circuit::Closed { failures } => (CircuitStatus::Closed, failures, None),
            Circuit::Open { opened_at, failures } => (CircuitStatus::Open, failures, Some(opened_at)),
            Circuit::HalfOpen { failures, .. } => (CircuitStatus::HalfOpen, failures, None),
        };
        CircuitBreakerState {
            status,
            consecutive_failures,
            opened_at,
            failure_threshold: self.config.failure_threshold,
            cooldown: self.config.cooldown,
        }
    }

    /// Adopts persisted counters. Threshold and cooldown stay as configured.
    ///
    /// A persisted HalfOpen had a trial that never finished; it comes back Open with the
    /// cooldown already elapsed so the next call becomes the trial.
    pub fn restore(&self, saved: &CircuitBreakerState) {
        let now = self.clock.now();
        let restored = match saved.status {
            CircuitStatus::Closed => Circuit::Closed {
                failures: saved.consecutive_failures.min(self.config.failure_threshold.saturating_sub(1)),
            },
            CircuitStatus::Open => Circuit::Open {
                opened_at: saved.opened_at.unwrap_or(now),
                failures: saved.consecutive_failures,
            },
            CircuitStatus::HalfOpen => Circuit::Open {
                opened_at: now - chrono::Duration::from_std(self.config.cooldown).unwrap_or_else(|_| chrono::Duration::zero()),
                failures: saved.consecutive_failures,
            },
        };
        *self.lock() = restored;
        debug!(target: "sentience::gateway", status = ?saved.status, "breaker state restored");
    }
}

/// Settles an unfinished trial if the call future is dropped mid-flight.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.permit == Permit::Trial {
            self.breaker.record_failure(Permit::Trial);
        }
    }
}
