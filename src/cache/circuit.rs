//! Circuit Breaker
//!
//! Guards every remote-tier call. After `failure_threshold` consecutive
//! failures the circuit opens and calls fail fast with
//! [`Error::CircuitOpen`] until `cooldown` has elapsed; the next call then
//! runs as a half-open probe. A successful probe closes the circuit, a
//! failed one re-opens it and restarts the cooldown.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Default consecutive failures before opening
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the circuit stays open before probing
pub const DEFAULT_COOLDOWN_SECS: u64 = 30;

// =============================================================================
// State
// =============================================================================

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without reaching the remote store
    Open,
    /// Cooldown elapsed, calls are let through to probe recovery
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used for gauges
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
        }
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Callback invoked on every state transition as `(from, to)`
pub type TransitionListener = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Failure isolator for the remote tier
pub struct CircuitBreaker {
    inner: Mutex<CircuitInner>,
    config: CircuitBreakerConfig,
    listener: Option<TransitionListener>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
            config,
            listener: None,
        }
    }

    /// Register a transition callback; it must not block
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Current state (an open circuit whose cooldown elapsed still reads `Open`
    /// until the next call probes it)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Current consecutive failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Run `operation` through the breaker
    ///
    /// Errors that say the remote store was unreachable count towards the
    /// threshold; any other outcome proves the store answered and resets it.
    /// The operation's own error is always returned unchanged.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.counts_as_remote_failure() {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(e)
            }
        }
    }

    /// Decide whether a call may proceed
    fn acquire(&self) -> Result<()> {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => None,
                CircuitState::Open => {
                    let cooled = inner
                        .last_failure
                        .map(|at| at.elapsed() >= self.config.cooldown)
                        .unwrap_or(true);
                    if !cooled {
                        return Err(Error::CircuitOpen);
                    }
                    inner.state = CircuitState::HalfOpen;
                    Some((CircuitState::Open, CircuitState::HalfOpen))
                }
            }
        };

        if let Some((from, to)) = transition {
            info!("Circuit breaker cooldown elapsed, probing remote tier");
            self.notify(from, to);
        }
        Ok(())
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = 0;
            let from = inner.state;
            inner.state = CircuitState::Closed;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };

        if let Some((from, to)) = transition {
            info!(from = %from, "Circuit breaker closed, remote tier recovered");
            self.notify(from, to);
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            let from = inner.state;
            let should_open = from == CircuitState::HalfOpen
                || inner.consecutive_failures >= self.config.failure_threshold;

            if should_open {
                inner.state = CircuitState::Open;
                inner.last_failure = Some(Instant::now());
            }
            (should_open && from != CircuitState::Open).then_some((from, CircuitState::Open))
        };

        if let Some((from, to)) = transition {
            warn!(
                from = %from,
                threshold = self.config.failure_threshold,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit breaker opened, failing remote calls fast"
            );
            self.notify(from, to);
        }
    }

    /// Force the circuit closed and clear the failure history
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = 0;
            inner.last_failure = None;
        }
        self.record_success();
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        if let Some(listener) = &self.listener {
            listener(from, to);
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}
