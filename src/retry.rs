//! Bounded retry executor with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Retry tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
	/// Maximum number of retries after the first attempt; total attempts is `max_retries + 1`.
	pub max_retries: u32,
	/// Delay before the first retry.
	pub base_delay: Duration,
	/// Upper bound on the computed delay, before jitter.
	pub max_delay: Duration,
	/// Jitter fraction in `[0, 1]` applied symmetrically around the computed delay.
	pub jitter_factor: f64,
}
impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_retries: 3,
			base_delay: Duration::from_millis(100),
			max_delay: Duration::from_secs(10),
			jitter_factor: 0.1,
		}
	}
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
	/// Final result, success or the terminal error.
	pub result: Result<T>,
	/// Number of attempts actually made.
	pub attempts: u32,
}

/// Wraps an async operation with bounded, jittered exponential-backoff retry.
pub struct Retryer {
	config: RetryConfig,
}

impl Retryer {
	/// Construct a retryer with the given configuration.
	pub fn new(config: RetryConfig) -> Self {
		Self { config }
	}

	/// Run `operation` until it succeeds, exhausts its retry budget, fails
	/// with a non-retryable error, or `cancel` is signalled.
	pub async fn run<F, Fut, T>(&self, cancel: &mut CancelToken, mut operation: F) -> RetryOutcome<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let mut attempt = 0u32;
		loop {
			match operation().await {
				Ok(value) => return RetryOutcome { result: Ok(value), attempts: attempt + 1 },
				Err(err) => {
					if !err.is_retryable() {
						return RetryOutcome { result: Err(err), attempts: attempt + 1 };
					}
					if attempt + 1 > self.config.max_retries {
						return RetryOutcome { result: Err(err), attempts: attempt + 1 };
					}

					let delay = self.backoff_delay(attempt);
					tokio::select! {
						_ = tokio::time::sleep(delay) => {}
						_ = cancel.cancelled() => {
							return RetryOutcome { result: Err(Error::Cancelled), attempts: attempt + 1 };
						}
					}
					attempt += 1;
				}
			}
		}
	}

	fn backoff_delay(&self, attempt: u32) -> Duration {
		let unjittered =
			(self.config.base_delay.as_secs_f64() * 2f64.powi(attempt as i32)).min(self.config.max_delay.as_secs_f64());
		let bound = unjittered * self.config.jitter_factor;
		let jitter = if bound > 0.0 { rand::rng().random_range(-bound..=bound) } else { 0.0 };
		Duration::from_secs_f64((unjittered + jitter).max(0.0))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cancel;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn config(max_retries: u32) -> RetryConfig {
		RetryConfig { max_retries, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5), jitter_factor: 0.0 }
	}

	#[tokio::test]
	async fn stops_immediately_on_non_retryable_error() {
		let retryer = Retryer::new(config(3));
		let (_handle, mut token) = cancel::pair();
		let calls = AtomicU32::new(0);

		let outcome = retryer
			.run(&mut token, || {
				calls.fetch_add(1, Ordering::SeqCst);
				async { Err::<(), _>(Error::Validation { field: "x", reason: "bad".into() }) }
			})
			.await;

		assert_eq!(outcome.attempts, 1);
		assert!(outcome.result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn bounds_total_attempts_to_max_retries_plus_one() {
		let retryer = Retryer::new(config(3));
		let (_handle, mut token) = cancel::pair();
		let calls = AtomicU32::new(0);

		let outcome = retryer
			.run(&mut token, || {
				calls.fetch_add(1, Ordering::SeqCst);
				async { Err::<(), _>(Error::from_status(503, "down", None)) }
			})
			.await;

		assert_eq!(outcome.attempts, 4);
		assert_eq!(calls.load(Ordering::SeqCst), 4);
	}

	#[tokio::test]
	async fn succeeds_after_transient_failures() {
		let retryer = Retryer::new(config(3));
		let (_handle, mut token) = cancel::pair();
		let calls = AtomicU32::new(0);

		let outcome = retryer
			.run(&mut token, || {
				let attempt = calls.fetch_add(1, Ordering::SeqCst);
				async move {
					if attempt < 2 {
						Err(Error::from_status(503, "down", None))
					} else {
						Ok(7)
					}
				}
			})
			.await;

		assert_eq!(outcome.attempts, 3);
		assert_eq!(outcome.result.unwrap(), 7);
	}

	#[tokio::test]
	async fn cancellation_short_circuits_the_wait() {
		let retryer = Retryer::new(RetryConfig {
			max_retries: 5,
			base_delay: Duration::from_secs(10),
			max_delay: Duration::from_secs(10),
			jitter_factor: 0.0,
		});
		let (handle, mut token) = cancel::pair();
		handle.cancel();

		let outcome = retryer
			.run(&mut token, || async { Err::<(), _>(Error::from_status(503, "down", None)) })
			.await;

		assert!(matches!(outcome.result, Err(Error::Cancelled)));
	}
}
