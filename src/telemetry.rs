//! Aggregated evaluation telemetry, flushed periodically and out-of-band
//! once enough evaluations accumulate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::http::client::HttpTransport;

/// Telemetry collector tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct TelemetryConfig {
	/// How often the background task flushes aggregated counts.
	pub flush_interval: Duration,
	/// Cumulative evaluations accumulated since the last flush before an
	/// out-of-band flush is scheduled.
	pub max_buffer: usize,
	/// Whether telemetry aggregation is enabled at all.
	pub enabled: bool,
}
impl Default for TelemetryConfig {
	fn default() -> Self {
		Self { flush_interval: Duration::from_secs(60), max_buffer: 1000, enabled: true }
	}
}

/// Per-flag evaluation tally.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct FlagCounts {
	/// Total evaluations observed.
	pub total: u64,
	/// Evaluations that resolved `true`.
	#[serde(rename = "true")]
	pub true_count: u64,
	/// Evaluations that resolved `false`.
	#[serde(rename = "false")]
	pub false_count: u64,
}

impl FlagCounts {
	fn record(&mut self, value: bool) {
		self.total += 1;
		if value {
			self.true_count += 1;
		} else {
			self.false_count += 1;
		}
	}

	fn merge(&mut self, other: FlagCounts) {
		self.total += other.total;
		self.true_count += other.true_count;
		self.false_count += other.false_count;
	}
}

/// Wire payload posted to the telemetry endpoint.
#[derive(Debug, Serialize)]
pub struct TelemetryPayload {
	/// Per-flag counts accumulated over `period_ms`.
	pub evaluations: HashMap<String, FlagCounts>,
	/// Length of the aggregation window, in milliseconds.
	pub period_ms: u64,
}

/// Accumulates per-flag evaluation counts and flushes them as a single
/// aggregate payload, merging back on failure instead of re-sending raw events.
pub struct TelemetryCollector {
	config: TelemetryConfig,
	transport: Arc<HttpTransport>,
	counts: Mutex<HashMap<String, FlagCounts>>,
	pending: AtomicU64,
	flushing: AtomicBool,
	task: Mutex<Option<JoinHandle<()>>>,
	shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl TelemetryCollector {
	/// Construct a collector bound to `transport`.
	pub fn new(config: TelemetryConfig, transport: Arc<HttpTransport>) -> Self {
		Self {
			config,
			transport,
			counts: Mutex::new(HashMap::new()),
			pending: AtomicU64::new(0),
			flushing: AtomicBool::new(false),
			task: Mutex::new(None),
			shutdown: Mutex::new(None),
		}
	}

	/// Record a single flag evaluation outcome, scheduling an out-of-band
	/// flush once `max_buffer` evaluations have accumulated since the last one.
	pub fn record_evaluation(self: &Arc<Self>, flag_key: &str, value: bool) {
		if !self.config.enabled {
			return;
		}
		{
			let mut counts = self.counts.lock().expect("telemetry lock poisoned");
			counts.entry(flag_key.to_string()).or_default().record(value);
		}

		let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
		if pending >= self.config.max_buffer as u64 {
			self.pending.store(0, Ordering::SeqCst);
			let collector = Arc::clone(self);
			let period_ms = self.config.flush_interval.as_millis() as u64;
			tokio::spawn(async move {
				collector.flush(period_ms).await;
			});
		}
	}

	/// Snapshot of the per-flag counts currently buffered, without flushing.
	pub fn snapshot(&self) -> HashMap<String, FlagCounts> {
		self.counts.lock().expect("telemetry lock poisoned").clone()
	}

	/// Start the periodic background flush loop.
	pub fn start(self: &Arc<Self>) {
		if !self.config.enabled {
			return;
		}
		let (tx, mut rx) = mpsc::channel(1);
		*self.shutdown.lock().expect("telemetry lock poisoned") = Some(tx);

		let collector = Arc::clone(self);
		let interval = self.config.flush_interval;
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.tick().await;
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						collector.flush(interval.as_millis() as u64).await;
					}
					_ = rx.recv() => {
						collector.flush(interval.as_millis() as u64).await;
						break;
					}
				}
			}
		});
		*self.task.lock().expect("telemetry lock poisoned") = Some(handle);
	}

	/// Stop the background loop, flushing whatever remains buffered.
	pub async fn stop(self: &Arc<Self>) {
		let shutdown = self.shutdown.lock().expect("telemetry lock poisoned").take();
		if let Some(shutdown) = shutdown {
			let _ = shutdown.send(()).await;
		}
		let handle = self.task.lock().expect("telemetry lock poisoned").take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}

	/// Drain the counts and POST them as one aggregate payload. On failure,
	/// merge the drained counts back into whatever accumulated meanwhile
	/// rather than discarding or re-sending raw events.
	pub async fn flush(&self, period_ms: u64) {
		if self.flushing.swap(true, Ordering::SeqCst) {
			return;
		}

		let drained: HashMap<String, FlagCounts> = {
			let mut counts = self.counts.lock().expect("telemetry lock poisoned");
			std::mem::take(&mut *counts)
		};

		if drained.is_empty() {
			self.flushing.store(false, Ordering::SeqCst);
			return;
		}

		let payload = TelemetryPayload { evaluations: drained.clone(), period_ms };
		if let Err(err) = self.transport.post_telemetry(&payload).await {
			tracing::warn!(error = %err, flags = drained.len(), "telemetry flush failed, merging back");
			let mut counts = self.counts.lock().expect("telemetry lock poisoned");
			for (key, value) in drained {
				counts.entry(key).or_default().merge(value);
			}
		} else {
			tracing::debug!(flags = payload.evaluations.len(), "telemetry flushed");
		}

		self.flushing.store(false, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use reqwest::Url;

	fn transport() -> Arc<HttpTransport> {
		Arc::new(HttpTransport::new(
			reqwest::Client::new(),
			Url::parse("http://127.0.0.1:9/").unwrap(),
			"key".into(),
			Duration::from_secs(1),
		))
	}

	#[test]
	fn records_true_and_false_counts_separately() {
		let mut counts = FlagCounts::default();
		counts.record(true);
		counts.record(false);
		counts.record(true);
		assert_eq!(counts.total, 3);
		assert_eq!(counts.true_count, 2);
		assert_eq!(counts.false_count, 1);
	}

	#[tokio::test]
	async fn failed_flush_merges_counts_back_instead_of_dropping() {
		let collector = Arc::new(TelemetryCollector::new(TelemetryConfig::default(), transport()));
		collector.record_evaluation("beta", true);
		collector.record_evaluation("beta", false);

		collector.flush(1000).await;

		let snapshot = collector.snapshot();
		let beta = snapshot.get("beta").expect("counts merged back after failed flush");
		assert_eq!(beta.total, 2);
		assert_eq!(beta.true_count, 1);
		assert_eq!(beta.false_count, 1);
	}

	#[tokio::test]
	async fn new_evaluations_during_failed_flush_accumulate_on_merge() {
		let collector = Arc::new(TelemetryCollector::new(TelemetryConfig::default(), transport()));
		collector.record_evaluation("beta", true);
		collector.flush(1000).await;
		collector.record_evaluation("beta", true);

		let snapshot = collector.snapshot();
		assert_eq!(snapshot.get("beta").unwrap().total, 2);
	}

	#[tokio::test]
	async fn reaching_max_buffer_schedules_an_out_of_band_flush_without_blocking_the_caller() {
		let collector = Arc::new(TelemetryCollector::new(
			TelemetryConfig { max_buffer: 2, ..Default::default() },
			transport(),
		));

		let before = std::time::Instant::now();
		collector.record_evaluation("beta", true);
		collector.record_evaluation("beta", true);
		assert!(before.elapsed() < Duration::from_millis(50), "record_evaluation must not block on the flush");

		tokio::time::sleep(Duration::from_millis(50)).await;

		let snapshot = collector.snapshot();
		let beta = snapshot.get("beta").expect("counts preserved across the background flush attempt");
		assert_eq!(beta.total, 2, "the background flush failed against an unreachable transport and merged back");
	}
}
