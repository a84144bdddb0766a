//! Async feature-flag evaluation client — local cache with stale-while-revalidate,
//! bounded retry, circuit breaker, ETag-conditional refresh, SSE streaming, and
//! deterministic client-side rule evaluation.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod cancel;
pub mod circuit;
pub mod client;
pub mod config;
pub mod dedup;
pub mod events;
pub mod http;
#[cfg(feature = "metrics")] pub mod metrics;
pub mod retry;
pub mod rules;
pub mod telemetry;
pub mod user;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	cache::{CacheConfig, CacheStats},
	cancel::{CancelHandle, CancelToken},
	circuit::{CircuitConfig, CircuitState, CircuitStats},
	client::{ClientBuilder, ClientEvent, ClientMetrics, EvaluationDetail, FlagsClient},
	config::{ClientConfig, LoggerCapability, TracingLogger},
	error::{Error, ErrorCategory, Result},
	events::{ConversionEvent, EventsConfig},
	retry::RetryConfig,
	rules::{Condition, ErrorKind, EvaluationReason, FlagRule, Operator, TargetingRule},
	telemetry::{FlagCounts, TelemetryConfig},
	user::{AttributeValue, UserContext},
};
