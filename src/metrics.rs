//! Metrics helpers and process-wide telemetry bookkeeping, gated behind the
//! `metrics`/`prometheus` features.

// std
use std::sync::{
	OnceLock,
	atomic::{AtomicU64, Ordering},
};
// crates.io
use metrics::Label;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use smallvec::SmallVec;
// self
use crate::_prelude::*;

type LabelSet = SmallVec<[Label; 2]>;

const METRIC_CACHE_REQUESTS_TOTAL: &str = "rollgate_cache_requests_total";
const METRIC_CACHE_HITS_TOTAL: &str = "rollgate_cache_hits_total";
const METRIC_CACHE_STALE_TOTAL: &str = "rollgate_cache_stale_total";
const METRIC_CACHE_MISSES_TOTAL: &str = "rollgate_cache_misses_total";
const METRIC_REFRESH_TOTAL: &str = "rollgate_refresh_total";
const METRIC_REFRESH_DURATION: &str = "rollgate_refresh_duration_seconds";
const METRIC_CIRCUIT_TRANSITIONS_TOTAL: &str = "rollgate_circuit_transitions_total";
const METRIC_EVENTS_FLUSH_TOTAL: &str = "rollgate_events_flush_total";
const METRIC_TELEMETRY_FLUSH_TOTAL: &str = "rollgate_telemetry_flush_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thread-safe accumulator mirroring the counters emitted through the global
/// `metrics` recorder, for callers that want in-process numbers without
/// scraping Prometheus.
#[derive(Debug, Default)]
pub struct UsageMetrics {
	cache_requests: AtomicU64,
	cache_hits: AtomicU64,
	cache_stale_hits: AtomicU64,
	refresh_successes: AtomicU64,
	refresh_errors: AtomicU64,
	last_refresh_micros: AtomicU64,
}
impl UsageMetrics {
	/// Create a new, empty accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record a cache lookup outcome.
	pub fn record_cache_lookup(&self, hit: bool, stale: bool) {
		self.cache_requests.fetch_add(1, Ordering::Relaxed);
		if hit {
			self.cache_hits.fetch_add(1, Ordering::Relaxed);
			if stale {
				self.cache_stale_hits.fetch_add(1, Ordering::Relaxed);
			}
		}
	}

	/// Record a completed refresh and its latency.
	pub fn record_refresh(&self, succeeded: bool, duration: Duration) {
		if succeeded {
			self.refresh_successes.fetch_add(1, Ordering::Relaxed);
		} else {
			self.refresh_errors.fetch_add(1, Ordering::Relaxed);
		}
		self.last_refresh_micros.store(duration.as_micros() as u64, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> UsageMetricsSnapshot {
		UsageMetricsSnapshot {
			cache_requests: self.cache_requests.load(Ordering::Relaxed),
			cache_hits: self.cache_hits.load(Ordering::Relaxed),
			cache_stale_hits: self.cache_stale_hits.load(Ordering::Relaxed),
			refresh_successes: self.refresh_successes.load(Ordering::Relaxed),
			refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
			last_refresh_micros: match self.last_refresh_micros.load(Ordering::Relaxed) {
				0 => None,
				value => Some(value),
			},
		}
	}
}

/// Read-only snapshot of [`UsageMetrics`] counters.
#[derive(Clone, Debug)]
pub struct UsageMetricsSnapshot {
	/// Total number of cache lookups observed.
	pub cache_requests: u64,
	/// Count of lookups served from the cache (fresh or stale).
	pub cache_hits: u64,
	/// Count of cache hits that were stale-while-revalidate serves.
	pub cache_stale_hits: u64,
	/// Count of successful background refreshes.
	pub refresh_successes: u64,
	/// Count of refresh attempts that resulted in errors.
	pub refresh_errors: u64,
	/// Microsecond latency of the most recent refresh.
	pub last_refresh_micros: Option<u64>,
}
impl UsageMetricsSnapshot {
	/// Convenience method to compute the cache hit rate.
	pub fn hit_rate(&self) -> f64 {
		if self.cache_requests == 0 {
			0.0
		} else {
			self.cache_hits as f64 / self.cache_requests as f64
		}
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Validation { field: "prometheus_recorder", reason: err.to_string() })?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a cache hit, tagging whether it was served stale.
pub fn record_cache_hit(stale: bool) {
	metrics::counter!(METRIC_CACHE_REQUESTS_TOTAL).increment(1);
	metrics::counter!(METRIC_CACHE_HITS_TOTAL).increment(1);
	if stale {
		metrics::counter!(METRIC_CACHE_STALE_TOTAL).increment(1);
	}
}

/// Record a cache miss.
pub fn record_cache_miss() {
	metrics::counter!(METRIC_CACHE_REQUESTS_TOTAL).increment(1);
	metrics::counter!(METRIC_CACHE_MISSES_TOTAL).increment(1);
}

/// Record a completed refresh attempt along with its latency.
pub fn record_refresh(succeeded: bool, duration: Duration) {
	let status = if succeeded { "success" } else { "error" };
	metrics::counter!(METRIC_REFRESH_TOTAL, status_label(status).iter()).increment(1);
	metrics::histogram!(METRIC_REFRESH_DURATION).record(duration.as_secs_f64());
}

/// Record a circuit breaker state transition.
pub fn record_circuit_transition(state: &'static str) {
	metrics::counter!(METRIC_CIRCUIT_TRANSITIONS_TOTAL, status_label(state).iter()).increment(1);
}

/// Record the outcome of a conversion-event batch flush.
pub fn record_events_flush(succeeded: bool, count: usize) {
	let status = if succeeded { "success" } else { "error" };
	metrics::counter!(METRIC_EVENTS_FLUSH_TOTAL, status_label(status).iter())
		.increment(count as u64);
}

/// Record the outcome of an evaluation-telemetry flush.
pub fn record_telemetry_flush(succeeded: bool) {
	let status = if succeeded { "success" } else { "error" };
	metrics::counter!(METRIC_TELEMETRY_FLUSH_TOTAL, status_label(status).iter()).increment(1);
}

fn status_label(status: &'static str) -> LabelSet {
	let mut labels = LabelSet::with_capacity(1);
	labels.push(Label::new("status", status));
	labels
}
