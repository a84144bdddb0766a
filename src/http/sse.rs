//! Server-sent-event streaming client with reconnect/backoff.
//!
//! Grounded on the retrieval pack's SSE consumer (`other_examples` loom-flags
//! stream handling): `eventsource_stream::Eventsource` layered over
//! `reqwest`'s `bytes_stream()`, with a doubling backoff reconnect loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::rules::EvaluationReason;

/// SSE reconnect tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct SseConfig {
	/// Initial reconnect delay after a dropped connection.
	pub reconnect_base_delay: Duration,
	/// Upper bound the doubling reconnect delay is capped at.
	pub reconnect_max_delay: Duration,
}
impl Default for SseConfig {
	fn default() -> Self {
		Self { reconnect_base_delay: Duration::from_secs(1), reconnect_max_delay: Duration::from_secs(30) }
	}
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamPayload {
	FullReplace {
		flags: HashMap<String, bool>,
		#[serde(default)]
		reasons: HashMap<String, EvaluationReason>,
	},
	SingleFlag {
		key: String,
		#[serde(rename = "enabled")]
		value: bool,
		#[serde(default)]
		reason: Option<EvaluationReason>,
	},
	Empty {},
}

/// Update dispatched to the client facade from the stream.
#[derive(Clone, Debug)]
pub enum SseUpdate {
	/// The full flag set was replaced.
	FullReplace { flags: HashMap<String, bool>, reasons: HashMap<String, EvaluationReason> },
	/// A single flag changed.
	SingleFlag { key: String, value: bool, reason: Option<EvaluationReason> },
	/// The server signalled a change without a payload; caller should poll.
	RefreshAdvisory,
}

/// Sink the connection dispatches parsed updates and lifecycle events to.
pub trait SseSink: Send + Sync {
	/// A new update arrived on the stream.
	fn on_update(&self, update: SseUpdate);
	/// The stream (re)connected successfully.
	fn on_connect(&self) {}
	/// The stream hit an error and is about to reconnect.
	fn on_error(&self, message: String) {
		let _ = message;
	}
}

/// A managed SSE connection with automatic reconnect.
pub struct SseConnection {
	client: Client,
	url: Url,
	api_key: String,
	config: SseConfig,
	connected: AtomicBool,
	reconnect_attempts: AtomicU64,
	task: Mutex<Option<JoinHandle<()>>>,
	shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl SseConnection {
	/// Construct a connection bound to the streaming endpoint, not yet started.
	pub fn new(client: Client, url: Url, api_key: String, config: SseConfig) -> Self {
		Self {
			client,
			url,
			api_key,
			config,
			connected: AtomicBool::new(false),
			reconnect_attempts: AtomicU64::new(0),
			task: Mutex::new(None),
			shutdown: Mutex::new(None),
		}
	}

	/// Whether the stream currently believes it is connected.
	pub fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	/// Number of reconnect attempts made since the last successful connect.
	pub fn reconnect_attempts(&self) -> u64 {
		self.reconnect_attempts.load(Ordering::SeqCst)
	}

	/// Start the background reconnect loop, dispatching to `sink`.
	pub fn start(self: &Arc<Self>, sink: Arc<dyn SseSink>) {
		let (tx, rx) = mpsc::channel(1);
		*self.shutdown.lock().expect("sse lock poisoned") = Some(tx);

		let connection = Arc::clone(self);
		let handle = tokio::spawn(async move {
			connection.run_sse_loop(sink, rx).await;
		});
		*self.task.lock().expect("sse lock poisoned") = Some(handle);
	}

	/// Stop the background loop and await its exit.
	pub async fn stop(self: &Arc<Self>) {
		let shutdown = self.shutdown.lock().expect("sse lock poisoned").take();
		if let Some(shutdown) = shutdown {
			let _ = shutdown.send(()).await;
		}
		let handle = self.task.lock().expect("sse lock poisoned").take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
		self.connected.store(false, Ordering::SeqCst);
	}

	async fn run_sse_loop(self: Arc<Self>, sink: Arc<dyn SseSink>, mut shutdown: mpsc::Receiver<()>) {
		let mut delay = self.config.reconnect_base_delay;

		loop {
			tokio::select! {
				_ = shutdown.recv() => {
					break;
				}
				result = self.connect_and_process(&sink) => {
					self.connected.store(false, Ordering::SeqCst);
					match result {
						Ok(()) => {
							delay = self.config.reconnect_base_delay;
						}
						Err(message) => {
							self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
							sink.on_error(message);
						}
					}
				}
			}

			tokio::select! {
				_ = shutdown.recv() => break,
				_ = tokio::time::sleep(delay) => {}
			}
			delay = (delay * 2).min(self.config.reconnect_max_delay);
		}
	}

	async fn connect_and_process(&self, sink: &Arc<dyn SseSink>) -> Result<(), String> {
		let response = self
			.client
			.get(self.url.clone())
			.bearer_auth(&self.api_key)
			.header("accept", "text/event-stream")
			.send()
			.await
			.map_err(|err| err.to_string())?;

		if !response.status().is_success() {
			return Err(format!("stream responded with status {}", response.status()));
		}

		self.connected.store(true, Ordering::SeqCst);
		self.reconnect_attempts.store(0, Ordering::SeqCst);
		sink.on_connect();

		let mut stream = response.bytes_stream().eventsource();
		while let Some(event) = stream.next().await {
			let event = event.map_err(|err| err.to_string())?;
			if let Some(update) = process_event(&event.event, &event.data) {
				sink.on_update(update);
			}
		}

		Ok(())
	}
}

fn process_event(event_name: &str, data: &str) -> Option<SseUpdate> {
	match event_name {
		"" | "init" | "flags" => parse_payload(data).map(to_update),
		"flag-update" => parse_payload(data).map(to_update),
		"flag-changed" => Some(SseUpdate::RefreshAdvisory),
		_ => {
			tracing::debug!(event = event_name, "ignoring unrecognized stream event");
			None
		}
	}
}

fn parse_payload(data: &str) -> Option<StreamPayload> {
	if data.trim().is_empty() {
		return Some(StreamPayload::Empty {});
	}
	serde_json::from_str(data)
		.map_err(|err| tracing::warn!(error = %err, "malformed stream payload"))
		.ok()
}

fn to_update(payload: StreamPayload) -> SseUpdate {
	match payload {
		StreamPayload::FullReplace { flags, reasons } => SseUpdate::FullReplace { flags, reasons },
		StreamPayload::SingleFlag { key, value, reason } => SseUpdate::SingleFlag { key, value, reason },
		StreamPayload::Empty {} => SseUpdate::RefreshAdvisory,
	}
}
