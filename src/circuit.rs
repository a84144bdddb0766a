//! Three-state circuit breaker with a sliding failure window.
//!
//! No example repo in the pack carries an equivalent machine; this is
//! original to the crate, written in the teacher's state-machine-by-method
//! style (transitions gated by an explicit state enum, as in the cache
//! entry's `begin_load`/`begin_refresh`/`refresh_failure`).

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
	/// Requests pass through normally.
	Closed,
	/// A single probe period after `recoveryTimeout` has elapsed.
	HalfOpen,
	/// Requests are rejected without being attempted.
	Open,
}

/// Circuit breaker tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct CircuitConfig {
	/// Failures within `monitoring_window` required to trip from closed to open.
	pub failure_threshold: usize,
	/// Time after entering open before a probe request is admitted.
	pub recovery_timeout: Duration,
	/// Sliding window over which failures are counted.
	pub monitoring_window: Duration,
	/// Consecutive half-open successes required to close the circuit.
	pub success_threshold: u32,
}
impl Default for CircuitConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			recovery_timeout: Duration::from_secs(30),
			monitoring_window: Duration::from_secs(60),
			success_threshold: 3,
		}
	}
}

/// Read-only circuit snapshot.
#[derive(Clone, Copy, Debug)]
pub struct CircuitStats {
	/// Current state.
	pub state: CircuitState,
	/// Count of failures still within the monitoring window.
	pub recent_failures: usize,
}

struct Inner {
	state: CircuitState,
	failures: Vec<Instant>,
	opened_at: Option<Instant>,
	half_open_successes: u32,
}

type StateChangeListener = dyn Fn(CircuitState, CircuitState) + Send + Sync;

/// Wraps calls to a failing dependency, rejecting them outright once the
/// failure rate trips the breaker, and gradually re-admitting traffic.
pub struct CircuitBreaker {
	config: CircuitConfig,
	inner: Mutex<Inner>,
	listener: Mutex<Option<Arc<StateChangeListener>>>,
}

impl CircuitBreaker {
	/// Construct a closed circuit breaker.
	pub fn new(config: CircuitConfig) -> Self {
		Self {
			config,
			inner: Mutex::new(Inner {
				state: CircuitState::Closed,
				failures: Vec::new(),
				opened_at: None,
				half_open_successes: 0,
			}),
			listener: Mutex::new(None),
		}
	}

	/// Register a callback invoked synchronously after every state
	/// transition with `(from, to)`. Must not block.
	pub fn on_state_change<F>(&self, listener: F)
	where
		F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
	{
		*self.listener.lock().expect("circuit lock poisoned") = Some(Arc::new(listener));
	}

	/// Current state.
	pub fn state(&self) -> CircuitState {
		self.inner.lock().expect("circuit lock poisoned").state
	}

	/// Read-only stats, opportunistically pruning the failure window.
	pub fn stats(&self) -> CircuitStats {
		let mut inner = self.inner.lock().expect("circuit lock poisoned");
		let now = Instant::now();
		self.prune_failures(&mut inner, now);
		CircuitStats { state: inner.state, recent_failures: inner.failures.len() }
	}

	/// Invoke `operation` if the circuit admits requests; otherwise return
	/// [`Error::CircuitOpen`] without invoking it.
	pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		if !self.admit() {
			return Err(Error::CircuitOpen);
		}

		match operation().await {
			Ok(value) => {
				self.on_success();
				Ok(value)
			}
			Err(err) => {
				self.on_failure();
				Err(err)
			}
		}
	}

	/// Force the circuit open, bypassing the failure threshold. For operators/tests.
	pub fn force_open(&self) {
		let mut inner = self.inner.lock().expect("circuit lock poisoned");
		inner.opened_at = Some(Instant::now());
		self.transition(&mut inner, CircuitState::Open);
	}

	/// Force the circuit closed and clear its failure history. For operators/tests.
	pub fn force_reset(&self) {
		let mut inner = self.inner.lock().expect("circuit lock poisoned");
		inner.failures.clear();
		inner.half_open_successes = 0;
		inner.opened_at = None;
		self.transition(&mut inner, CircuitState::Closed);
	}

	fn admit(&self) -> bool {
		let mut inner = self.inner.lock().expect("circuit lock poisoned");
		match inner.state {
			CircuitState::Closed | CircuitState::HalfOpen => true,
			CircuitState::Open => {
				let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or(Duration::ZERO);
				if elapsed >= self.config.recovery_timeout {
					self.transition(&mut inner, CircuitState::HalfOpen);
					true
				} else {
					false
				}
			}
		}
	}

	fn on_success(&self) {
		let mut inner = self.inner.lock().expect("circuit lock poisoned");
		if inner.state == CircuitState::HalfOpen {
			inner.half_open_successes += 1;
			if inner.half_open_successes >= self.config.success_threshold {
				inner.failures.clear();
				inner.half_open_successes = 0;
				inner.opened_at = None;
				self.transition(&mut inner, CircuitState::Closed);
			}
		}
	}

	fn on_failure(&self) {
		let mut inner = self.inner.lock().expect("circuit lock poisoned");
		let now = Instant::now();
		inner.failures.push(now);
		self.prune_failures(&mut inner, now);

		match inner.state {
			CircuitState::HalfOpen => {
				inner.half_open_successes = 0;
				inner.opened_at = Some(now);
				self.transition(&mut inner, CircuitState::Open);
			}
			CircuitState::Closed => {
				if inner.failures.len() >= self.config.failure_threshold {
					inner.opened_at = Some(now);
					self.transition(&mut inner, CircuitState::Open);
				}
			}
			CircuitState::Open => {}
		}
	}

	fn prune_failures(&self, inner: &mut Inner, now: Instant) {
		let window = self.config.monitoring_window;
		inner.failures.retain(|at| now.duration_since(*at) <= window);
	}

	fn transition(&self, inner: &mut Inner, to: CircuitState) {
		let from = inner.state;
		if from == to {
			return;
		}
		inner.state = to;
		if let Some(listener) = self.listener.lock().expect("circuit lock poisoned").clone() {
			listener(from, to);
		}
	}
}
