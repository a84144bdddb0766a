//! Client configuration and the logging capability it is built against.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::cache::CacheConfig;
use crate::circuit::CircuitConfig;
use crate::error::{Error, Result};
use crate::events::EventsConfig;
use crate::retry::RetryConfig;
use crate::telemetry::TelemetryConfig;

/// Minimal structured-logging seam so host applications can redirect
/// diagnostics into their own pipeline instead of the global `tracing`
/// subscriber. Mirrors the teacher's approach of keeping a trait boundary at
/// the config layer rather than hard-wiring a single backend.
pub trait LoggerCapability: Send + Sync {
	/// Log a debug-level diagnostic.
	fn debug(&self, message: &str);
	/// Log an informational diagnostic.
	fn info(&self, message: &str);
	/// Log a warning-level diagnostic.
	fn warn(&self, message: &str);
	/// Log an error-level diagnostic.
	fn error(&self, message: &str);
}

/// Default logger that forwards to the `tracing` macros.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl LoggerCapability for TracingLogger {
	fn debug(&self, message: &str) {
		tracing::debug!("{message}");
	}
	fn info(&self, message: &str) {
		tracing::info!("{message}");
	}
	fn warn(&self, message: &str) {
		tracing::warn!("{message}");
	}
	fn error(&self, message: &str) {
		tracing::error!("{message}");
	}
}

/// Full client configuration, assembled by [`crate::client::ClientBuilder`].
#[derive(Clone)]
pub struct ClientConfig {
	/// API key sent as a bearer token on every request.
	pub api_key: String,
	/// Base URL of the management service.
	pub base_url: Url,
	/// URL of the server-sent-events stream; defaults to `base_url`'s `/api/v1/sdk/stream`.
	pub stream_url: Url,
	/// Per-request timeout for the flag-refresh endpoint.
	pub request_timeout: Duration,
	/// Polling interval used when streaming is disabled or unavailable.
	pub refresh_interval: Duration,
	/// Whether the SSE stream should be used in addition to polling.
	pub streaming_enabled: bool,
	/// Retry tuning.
	pub retry: RetryConfig,
	/// Circuit breaker tuning.
	pub circuit: CircuitConfig,
	/// Flag cache tuning.
	pub cache: CacheConfig,
	/// Conversion event collector tuning.
	pub events: EventsConfig,
	/// Evaluation telemetry collector tuning.
	pub telemetry: TelemetryConfig,
	/// Diagnostic sink.
	pub logger: Arc<dyn LoggerCapability>,
}

impl ClientConfig {
	/// Construct a configuration from an API key and base URL, with every
	/// other knob at its documented default.
	pub fn new(api_key: impl Into<String>, base_url: Url) -> Result<Self> {
		let stream_url = base_url.join("/api/v1/sdk/stream")?;
		Ok(Self {
			api_key: api_key.into(),
			base_url,
			stream_url,
			request_timeout: Duration::from_secs(5),
			refresh_interval: Duration::from_secs(30),
			streaming_enabled: true,
			retry: RetryConfig::default(),
			circuit: CircuitConfig::default(),
			cache: CacheConfig::default(),
			events: EventsConfig::default(),
			telemetry: TelemetryConfig::default(),
			logger: Arc::new(TracingLogger),
		})
	}

	/// Reject configurations that cannot possibly behave correctly.
	pub fn validate(&self) -> Result<()> {
		if self.api_key.trim().is_empty() {
			return Err(Error::Validation { field: "api_key", reason: "must not be empty".into() });
		}
		if self.request_timeout.is_zero() {
			return Err(Error::Validation { field: "request_timeout", reason: "must be greater than zero".into() });
		}
		// A zero `refresh_interval` is valid: it disables background polling
		// (streaming or manual `refresh()` calls remain available).
		if self.circuit.failure_threshold == 0 {
			return Err(Error::Validation {
				field: "circuit.failure_threshold",
				reason: "must be greater than zero".into(),
			});
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base() -> ClientConfig {
		ClientConfig::new("key", Url::parse("https://flags.example.com").unwrap()).unwrap()
	}

	#[test]
	fn defaults_match_documented_values() {
		let config = base();
		assert_eq!(config.request_timeout, Duration::from_secs(5));
		assert_eq!(config.refresh_interval, Duration::from_secs(30));
		assert_eq!(config.retry.max_retries, 3);
		assert_eq!(config.circuit.failure_threshold, 5);
		assert_eq!(config.cache.ttl, Duration::from_secs(300));
		assert_eq!(config.events.max_buffer, 100);
		assert_eq!(config.telemetry.max_buffer, 1000);
	}

	#[test]
	fn rejects_empty_api_key() {
		let mut config = base();
		config.api_key = "  ".into();
		assert!(config.validate().is_err());
	}

	#[test]
	fn stream_url_defaults_under_base_url() {
		let config = base();
		assert_eq!(config.stream_url.as_str(), "https://flags.example.com/api/v1/sdk/stream");
	}

	#[test]
	fn zero_refresh_interval_is_valid_and_disables_polling() {
		let mut config = base();
		config.refresh_interval = Duration::ZERO;
		assert!(config.validate().is_ok());
	}
}
