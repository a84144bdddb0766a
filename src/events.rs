//! Conversion event buffering and periodic background flush.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::http::client::HttpTransport;

/// Event collector tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct EventsConfig {
	/// How often the background task flushes buffered events.
	pub flush_interval: Duration,
	/// Size-triggered flush threshold; also bounds the re-buffer cap at `2 * max_buffer`.
	pub max_buffer: usize,
	/// Whether conversion tracking is enabled at all.
	pub enabled: bool,
}
impl Default for EventsConfig {
	fn default() -> Self {
		Self { flush_interval: Duration::from_secs(30), max_buffer: 100, enabled: true }
	}
}

/// A single conversion event tracked by the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionEvent {
	/// Flag key this conversion is attributed to.
	pub flag_key: String,
	/// Application-defined event name (e.g. `"purchase"`).
	pub event_name: String,
	/// User the event is attributed to.
	pub user_id: String,
	/// Variation the user was evaluated into, if known.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub variation_id: Option<String>,
	/// Numeric value associated with the event (e.g. order total).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub value: Option<f64>,
	/// Arbitrary additional metadata.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metadata: Option<serde_json::Value>,
	/// UTC instant the event was tracked, serialized as RFC-3339.
	pub timestamp: DateTime<Utc>,
}

/// Buffers [`ConversionEvent`]s and flushes them to the management service on
/// a timer, on a size threshold, or on demand.
///
/// Grounded on the teacher's background-refresh-task lifecycle: a
/// `JoinHandle` plus an `mpsc` shutdown signal, spawned from `start` and torn
/// down from `stop`.
pub struct EventCollector {
	config: EventsConfig,
	transport: Arc<HttpTransport>,
	buffer: Mutex<VecDeque<ConversionEvent>>,
	flushing: AtomicBool,
	task: Mutex<Option<JoinHandle<()>>>,
	shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl EventCollector {
	/// Construct a collector bound to `transport`.
	pub fn new(config: EventsConfig, transport: Arc<HttpTransport>) -> Self {
		Self {
			config,
			transport,
			buffer: Mutex::new(VecDeque::new()),
			flushing: AtomicBool::new(false),
			task: Mutex::new(None),
			shutdown: Mutex::new(None),
		}
	}

	/// Queue `event`, scheduling an out-of-band flush if the buffer has
	/// reached its size threshold. Never blocks on the network.
	pub async fn track(self: &Arc<Self>, event: ConversionEvent) {
		if !self.config.enabled {
			return;
		}
		let should_flush = {
			let mut buffer = self.buffer.lock().expect("events lock poisoned");
			buffer.push_back(event);
			buffer.len() >= self.config.max_buffer
		};
		if should_flush {
			let collector = Arc::clone(self);
			tokio::spawn(async move {
				collector.flush().await;
			});
		}
	}

	/// Current buffer depth.
	pub fn buffer_size(&self) -> usize {
		self.buffer.lock().expect("events lock poisoned").len()
	}

	/// Start the periodic background flush loop.
	pub fn start(self: &Arc<Self>) {
		if !self.config.enabled {
			return;
		}
		let (tx, mut rx) = mpsc::channel(1);
		*self.shutdown.lock().expect("events lock poisoned") = Some(tx);

		let collector = Arc::clone(self);
		let interval = self.config.flush_interval;
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.tick().await;
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						collector.flush().await;
					}
					_ = rx.recv() => {
						collector.flush().await;
						break;
					}
				}
			}
		});
		*self.task.lock().expect("events lock poisoned") = Some(handle);
	}

	/// Stop the background loop, flushing whatever remains buffered.
	pub async fn stop(self: &Arc<Self>) {
		let shutdown = self.shutdown.lock().expect("events lock poisoned").take();
		if let Some(shutdown) = shutdown {
			let _ = shutdown.send(()).await;
		}
		let handle = self.task.lock().expect("events lock poisoned").take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}

	/// Drain the buffer and POST it. On failure, re-buffer the batch ahead of
	/// whatever was queued in the meantime, discarding the oldest overflow
	/// past `2 * max_buffer`.
	pub async fn flush(&self) {
		if self.flushing.swap(true, Ordering::SeqCst) {
			return;
		}

		let batch: Vec<ConversionEvent> = {
			let mut buffer = self.buffer.lock().expect("events lock poisoned");
			buffer.drain(..).collect()
		};

		if batch.is_empty() {
			self.flushing.store(false, Ordering::SeqCst);
			return;
		}

		if let Err(err) = self.transport.post_events(&batch).await {
			tracing::warn!(error = %err, dropped = batch.len(), "event flush failed, re-buffering");
			self.rebuffer(batch);
		} else {
			tracing::debug!(count = batch.len(), "events flushed");
		}

		self.flushing.store(false, Ordering::SeqCst);
	}

	fn rebuffer(&self, batch: Vec<ConversionEvent>) {
		let cap = self.config.max_buffer * 2;
		let mut buffer = self.buffer.lock().expect("events lock poisoned");
		for event in batch.into_iter().rev() {
			buffer.push_front(event);
		}
		while buffer.len() > cap {
			buffer.pop_front();
		}
	}
}
