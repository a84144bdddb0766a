//! The `FlagsClient` facade: composes every sub-component into the public surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::Cache;
use crate::cancel::{self, CancelHandle, CancelToken};
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::config::ClientConfig;
use crate::dedup::Deduplicator;
use crate::error::{Error, Result};
use crate::events::{ConversionEvent, EventCollector};
use crate::http::client::{HttpTransport, RefreshOutcome};
use crate::http::sse::{SseConnection, SseSink, SseUpdate};
use crate::retry::Retryer;
use crate::rules::{ErrorKind, EvaluationReason};
use crate::telemetry::{FlagCounts, TelemetryCollector};
use crate::user::UserContext;

/// Result of a single `is_enabled`-family evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationDetail {
	/// The resolved boolean.
	pub value: bool,
	/// Why the value was produced.
	pub reason: EvaluationReason,
}

/// Point-in-time read of every sub-component's counters.
#[derive(Clone, Copy, Debug)]
pub struct ClientMetrics {
	/// Cache hit/stale/miss counters.
	pub cache: crate::cache::CacheStats,
	/// Circuit breaker state and recent-failure count.
	pub circuit: crate::circuit::CircuitStats,
	/// Conversion events currently buffered.
	pub events_buffered: usize,
}

/// Stream-style signals applications can subscribe to via [`FlagsClient::subscribe`].
#[derive(Clone, Debug)]
pub enum ClientEvent {
	/// The client completed its initial fetch and is serving evaluations.
	Ready,
	/// A single flag's value changed.
	FlagChanged {
		/// Flag key.
		key: String,
		/// Previous value, `None` if the key was not previously known.
		old: Option<bool>,
		/// New value.
		new: bool,
	},
	/// A full flag snapshot was committed.
	FlagsUpdated,
	/// A refresh failed and the client fell back to a stale cache entry.
	FlagsStale,
	/// A refresh completed with `304 Not Modified`.
	NotModified,
	/// A non-fatal error occurred in a background loop.
	Error(String),
}

struct FacadeState {
	flags: HashMap<String, bool>,
	reasons: HashMap<String, EvaluationReason>,
	user: UserContext,
	ready: bool,
	streaming: bool,
}

/// Feature-flag evaluation client. Cheap to clone via `Arc`; intended to be
/// constructed once per process through [`ClientBuilder`] and shared.
pub struct FlagsClient {
	config: ClientConfig,
	transport: Arc<HttpTransport>,
	cache: Cache,
	dedup: Deduplicator<RefreshOutcome>,
	circuit: CircuitBreaker,
	retryer: Retryer,
	state: RwLock<FacadeState>,
	sse: Arc<SseConnection>,
	events: Arc<EventCollector>,
	telemetry: Arc<TelemetryCollector>,
	broadcaster: broadcast::Sender<ClientEvent>,
	poll_task: std::sync::Mutex<Option<JoinHandle<()>>>,
	internal_cancel_handle: CancelHandle,
	internal_cancel: CancelToken,
	closed: AtomicBool,
	on_circuit_open: std::sync::Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
	on_circuit_closed: std::sync::Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl FlagsClient {
	/// Begin configuring a client for `api_key` against `base_url`.
	pub fn builder(api_key: impl Into<String>, base_url: url::Url) -> Result<ClientBuilder> {
		Ok(ClientBuilder { config: ClientConfig::new(api_key, base_url)? })
	}

	/// Perform the initial blocking fetch and start all background loops.
	///
	/// If the initial fetch fails but a cache entry (even stale) already
	/// exists, initialization still succeeds; otherwise the failure is
	/// returned to the caller.
	pub async fn init(self: &Arc<Self>, cancel: CancelToken) -> Result<()> {
		let result = self.do_refresh(cancel.clone()).await;
		if result.is_err() && !self.cache.has_any() {
			return result;
		}

		{
			let mut state = self.state.write().expect("state lock poisoned");
			state.ready = true;
		}
		self.broadcast(ClientEvent::Ready);

		self.events.start();
		self.telemetry.start();

		if !self.config.refresh_interval.is_zero() {
			self.spawn_poll_loop();
		}
		if self.config.streaming_enabled {
			self.start_streaming();
		}

		Ok(())
	}

	/// Evaluate `key`, returning `default` if unknown or if the client is not ready.
	pub fn is_enabled(&self, key: &str, default: bool) -> bool {
		self.is_enabled_detail(key, default).value
	}

	/// Evaluate `key` with the reason it resolved that way.
	///
	/// Per-call user/attribute overrides are intentionally not part of this
	/// surface: the reference behavior accepts but always ignores them, and a
	/// silently-ignored parameter is a worse API than omitting it outright.
	pub fn is_enabled_detail(&self, key: &str, default: bool) -> EvaluationDetail {
		let state = self.state.read().expect("state lock poisoned");
		let detail = if !state.ready {
			EvaluationDetail { value: default, reason: EvaluationReason::Error { kind: ErrorKind::ClientNotReady } }
		} else {
			match state.flags.get(key) {
				Some(value) => {
					let reason = state.reasons.get(key).cloned().unwrap_or(EvaluationReason::Unknown);
					EvaluationDetail { value: *value, reason }
				}
				None => EvaluationDetail { value: default, reason: EvaluationReason::Unknown },
			}
		};
		drop(state);
		self.telemetry.record_evaluation(key, detail.value);
		detail
	}

	/// Replace the active user context, best-effort notify the service, and refresh.
	pub async fn identify(self: &Arc<Self>, user: UserContext, cancel: CancelToken) -> Result<()> {
		{
			let mut state = self.state.write().expect("state lock poisoned");
			state.user = user.clone();
		}
		if let Err(err) = self.transport.identify(&user).await {
			self.config.logger.warn(&format!("identify post failed (non-fatal): {err}"));
		}
		self.do_refresh(cancel).await
	}

	/// Identify with the same id and empty attributes, drop the local user
	/// context, then refresh.
	pub async fn reset(self: &Arc<Self>, cancel: CancelToken) -> Result<()> {
		let id = self.state.read().expect("state lock poisoned").user.id.clone();
		if let Err(err) = self.transport.identify(&UserContext::new(id)).await {
			self.config.logger.warn(&format!("reset identify post failed (non-fatal): {err}"));
		}
		{
			let mut state = self.state.write().expect("state lock poisoned");
			state.user = UserContext::anonymous();
		}
		self.do_refresh(cancel).await
	}

	/// Force an immediate refresh, propagating failure to the caller.
	pub async fn refresh(self: &Arc<Self>, cancel: CancelToken) -> Result<()> {
		self.do_refresh(cancel).await
	}

	/// Queue a conversion event for batched delivery.
	pub async fn track(&self, event: ConversionEvent) {
		self.events.track(event).await;
	}

	/// Force an out-of-band event flush.
	pub async fn flush_events(&self) {
		self.events.flush().await;
	}

	/// Force an out-of-band telemetry flush.
	pub async fn flush_telemetry(&self) {
		self.telemetry.flush(self.config.telemetry.flush_interval.as_millis() as u64).await;
	}

	/// Snapshot of buffered per-flag telemetry counts.
	pub fn get_telemetry_stats(&self) -> HashMap<String, FlagCounts> {
		self.telemetry.snapshot()
	}

	/// Snapshot of every sub-component's counters.
	pub fn get_metrics(&self) -> ClientMetrics {
		ClientMetrics {
			cache: self.cache.stats(),
			circuit: self.circuit.stats(),
			events_buffered: self.events.buffer_size(),
		}
	}

	/// Current circuit breaker state.
	pub fn get_circuit_state(&self) -> CircuitState {
		self.circuit.state()
	}

	/// Whether the client has completed its initial fetch.
	pub fn is_ready(&self) -> bool {
		self.state.read().expect("state lock poisoned").ready
	}

	/// Whether the SSE stream is currently connected.
	pub fn is_streaming(&self) -> bool {
		self.state.read().expect("state lock poisoned").streaming && self.sse.is_connected()
	}

	/// Register a callback invoked when the circuit breaker opens. Must not block.
	pub fn on_circuit_open<F: Fn() + Send + Sync + 'static>(&self, f: F) {
		*self.on_circuit_open.lock().expect("callback lock poisoned") = Some(Arc::new(f));
	}

	/// Register a callback invoked when the circuit breaker closes. Must not block.
	pub fn on_circuit_closed<F: Fn() + Send + Sync + 'static>(&self, f: F) {
		*self.on_circuit_closed.lock().expect("callback lock poisoned") = Some(Arc::new(f));
	}

	/// Subscribe to the stream-style event surface.
	pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
		self.broadcaster.subscribe()
	}

	/// Idempotently stop every background loop and return once they have
	/// drained.
	pub async fn close(self: &Arc<Self>) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.internal_cancel_handle.cancel();
		self.sse.stop().await;
		self.events.stop().await;
		self.telemetry.stop().await;
		let handle = self.poll_task.lock().expect("poll task lock poisoned").take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}

	async fn do_refresh(self: &Arc<Self>, cancel: CancelToken) -> Result<()> {
		let user_id = self.state.read().expect("state lock poisoned").user.id.clone();

		let client = Arc::clone(self);
		let outcome = self
			.dedup
			.dedupe("fetch-flags", move || async move {
				let client_for_retry = Arc::clone(&client);
				let user_id_for_retry = user_id.clone();
				let mut cancel = cancel;
				client
					.circuit
					.execute(move || async move {
						let fetch_client = Arc::clone(&client_for_retry);
						let fetch_user_id = user_id_for_retry.clone();
						client_for_retry
							.retryer
							.run(&mut cancel, move || {
								let client = Arc::clone(&fetch_client);
								let user_id = fetch_user_id.clone();
								async move { client.transport.fetch_flags(&user_id).await }
							})
							.await
							.result
					})
					.await
			})
			.await;

		match outcome.as_ref() {
			Ok(RefreshOutcome::NotModified) => {
				self.broadcast(ClientEvent::NotModified);
				Ok(())
			}
			Ok(RefreshOutcome::Updated(snapshot)) => {
				self.commit_snapshot(snapshot.flags.clone(), snapshot.reasons.clone());
				Ok(())
			}
			Err(err) => {
				let err = err.clone();
				self.handle_refresh_failure(&err);
				Err(err)
			}
		}
	}

	fn commit_snapshot(&self, flags: HashMap<String, bool>, reasons: HashMap<String, EvaluationReason>) {
		let changed: Vec<(String, Option<bool>, bool)> = {
			let mut state = self.state.write().expect("state lock poisoned");
			let changed = flags
				.iter()
				.filter_map(|(key, value)| {
					let old = state.flags.get(key).copied();
					(old != Some(*value)).then(|| (key.clone(), old, *value))
				})
				.collect();
			state.flags = flags.clone();
			state.reasons = reasons.clone();
			state.ready = true;
			changed
		};

		self.cache.set(flags, reasons);
		for (key, old, new) in changed {
			self.broadcast(ClientEvent::FlagChanged { key, old, new });
		}
		self.broadcast(ClientEvent::FlagsUpdated);
	}

	fn merge_single_flag(&self, key: String, value: bool, reason: Option<EvaluationReason>) {
		let old = {
			let mut state = self.state.write().expect("state lock poisoned");
			let old = state.flags.insert(key.clone(), value);
			match reason.clone() {
				Some(reason) => {
					state.reasons.insert(key.clone(), reason);
				}
				None => {
					state.reasons.remove(&key);
				}
			}
			state.ready = true;
			old
		};

		let (flags, reasons) = {
			let state = self.state.read().expect("state lock poisoned");
			(state.flags.clone(), state.reasons.clone())
		};
		self.cache.set(flags, reasons);

		if old != Some(value) {
			self.broadcast(ClientEvent::FlagChanged { key, old, new: value });
		}
		self.broadcast(ClientEvent::FlagsUpdated);
	}

	fn handle_refresh_failure(&self, err: &Error) {
		self.config.logger.warn(&format!("refresh failed: {err}"));
		let lookup = self.cache.get();
		if lookup.found && lookup.stale {
			self.broadcast(ClientEvent::FlagsStale);
		}
	}

	fn broadcast(&self, event: ClientEvent) {
		let _ = self.broadcaster.send(event);
	}

	fn spawn_poll_loop(self: &Arc<Self>) {
		let client = Arc::clone(self);
		let mut cancel = self.internal_cancel.clone();
		let interval = self.config.refresh_interval;
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.tick().await;
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						let _ = client.refresh(client.internal_cancel.clone()).await;
					}
					_ = cancel.cancelled() => break,
				}
			}
		});
		*self.poll_task.lock().expect("poll task lock poisoned") = Some(handle);
	}

	fn start_streaming(self: &Arc<Self>) {
		let sink = Arc::new(FacadeSseSink { client: Arc::downgrade(self) });
		self.sse.start(sink);
		self.state.write().expect("state lock poisoned").streaming = true;
	}

	fn handle_circuit_transition(&self, from: CircuitState, to: CircuitState) {
		match to {
			CircuitState::Open => {
				if let Some(f) = self.on_circuit_open.lock().expect("callback lock poisoned").as_ref() {
					f();
				}
				self.broadcast(ClientEvent::Error("circuit opened".into()));
			}
			CircuitState::Closed if from != CircuitState::Closed => {
				if let Some(f) = self.on_circuit_closed.lock().expect("callback lock poisoned").as_ref() {
					f();
				}
			}
			_ => {}
		}
	}
}

struct FacadeSseSink {
	client: Weak<FlagsClient>,
}

impl SseSink for FacadeSseSink {
	fn on_update(&self, update: SseUpdate) {
		let Some(client) = self.client.upgrade() else { return };
		match update {
			SseUpdate::FullReplace { flags, reasons } => client.commit_snapshot(flags, reasons),
			SseUpdate::SingleFlag { key, value, reason } => client.merge_single_flag(key, value, reason),
			SseUpdate::RefreshAdvisory => {
				let cancel = client.internal_cancel.clone();
				tokio::spawn(async move {
					let _ = client.refresh(cancel).await;
				});
			}
		}
	}

	fn on_connect(&self) {
		if let Some(client) = self.client.upgrade() {
			client.config.logger.info("stream connected");
		}
	}

	fn on_error(&self, message: String) {
		if let Some(client) = self.client.upgrade() {
			client.config.logger.warn(&format!("stream error: {message}"));
			client.broadcast(ClientEvent::Error(message));
		}
	}
}

/// Builds a [`FlagsClient`] from a [`ClientConfig`], installing the circuit
/// breaker listener that bridges into the facade's own callback slots.
pub struct ClientBuilder {
	config: ClientConfig,
}

impl ClientBuilder {
	/// Override the request timeout.
	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = timeout;
		self
	}

	/// Override the polling refresh interval. `Duration::ZERO` disables polling.
	pub fn refresh_interval(mut self, interval: Duration) -> Self {
		self.config.refresh_interval = interval;
		self
	}

	/// Enable or disable the SSE stream.
	pub fn streaming(mut self, enabled: bool) -> Self {
		self.config.streaming_enabled = enabled;
		self
	}

	/// Override retry tuning.
	pub fn retry(mut self, retry: crate::retry::RetryConfig) -> Self {
		self.config.retry = retry;
		self
	}

	/// Override circuit breaker tuning.
	pub fn circuit(mut self, circuit: crate::circuit::CircuitConfig) -> Self {
		self.config.circuit = circuit;
		self
	}

	/// Override cache tuning.
	pub fn cache(mut self, cache: crate::cache::CacheConfig) -> Self {
		self.config.cache = cache;
		self
	}

	/// Override conversion event collector tuning.
	pub fn events(mut self, events: crate::events::EventsConfig) -> Self {
		self.config.events = events;
		self
	}

	/// Override telemetry collector tuning.
	pub fn telemetry(mut self, telemetry: crate::telemetry::TelemetryConfig) -> Self {
		self.config.telemetry = telemetry;
		self
	}

	/// Install a custom diagnostic sink in place of the default tracing logger.
	pub fn logger(mut self, logger: Arc<dyn crate::config::LoggerCapability>) -> Self {
		self.config.logger = logger;
		self
	}

	/// Finish building. Does not perform any network activity; call
	/// [`FlagsClient::init`] next.
	pub fn build(self) -> Result<Arc<FlagsClient>> {
		self.config.validate()?;

		let http_client = reqwest::Client::new();
		let transport = Arc::new(HttpTransport::new(
			http_client.clone(),
			self.config.base_url.clone(),
			self.config.api_key.clone(),
			self.config.request_timeout,
		));
		let events = Arc::new(EventCollector::new(self.config.events, Arc::clone(&transport)));
		let telemetry = Arc::new(TelemetryCollector::new(self.config.telemetry, Arc::clone(&transport)));
		let sse = Arc::new(SseConnection::new(
			http_client,
			self.config.stream_url.clone(),
			self.config.api_key.clone(),
			crate::http::sse::SseConfig::default(),
		));
		let (internal_cancel_handle, internal_cancel) = cancel::pair();
		let (broadcaster, _) = broadcast::channel(64);

		let client = Arc::new(FlagsClient {
			cache: Cache::new(self.config.cache),
			dedup: Deduplicator::new(),
			circuit: CircuitBreaker::new(self.config.circuit),
			retryer: Retryer::new(self.config.retry),
			state: RwLock::new(FacadeState {
				flags: HashMap::new(),
				reasons: HashMap::new(),
				user: UserContext::anonymous(),
				ready: false,
				streaming: false,
			}),
			transport,
			sse,
			events,
			telemetry,
			broadcaster,
			poll_task: std::sync::Mutex::new(None),
			internal_cancel_handle,
			internal_cancel,
			closed: AtomicBool::new(false),
			on_circuit_open: std::sync::Mutex::new(None),
			on_circuit_closed: std::sync::Mutex::new(None),
			config: self.config,
		});

		let weak = Arc::downgrade(&client);
		client.circuit.on_state_change(move |from, to| {
			if let Some(client) = weak.upgrade() {
				client.handle_circuit_transition(from, to);
			}
		});

		Ok(client)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn builder() -> ClientBuilder {
		FlagsClient::builder("test-key", url::Url::parse("http://127.0.0.1:9/").unwrap()).unwrap()
	}

	#[test]
	fn not_ready_evaluation_reports_client_not_ready() {
		let client = builder().build().unwrap();
		let detail = client.is_enabled_detail("feature", false);
		assert!(!detail.value);
		assert_eq!(detail.reason, EvaluationReason::Error { kind: ErrorKind::ClientNotReady });
	}

	#[test]
	fn unknown_flag_after_commit_reports_unknown_reason_and_default() {
		let client = builder().build().unwrap();
		client.commit_snapshot(HashMap::from([("a".to_string(), true)]), HashMap::new());

		let detail = client.is_enabled_detail("missing", true);
		assert!(detail.value);
		assert_eq!(detail.reason, EvaluationReason::Unknown);
	}

	#[test]
	fn known_flag_after_commit_reports_its_value() {
		let client = builder().build().unwrap();
		client.commit_snapshot(HashMap::from([("a".to_string(), true)]), HashMap::new());

		assert!(client.is_enabled("a", false));
		assert!(client.is_ready());
	}

	#[test]
	fn commit_then_same_value_again_emits_no_change_entries() {
		let client = builder().build().unwrap();
		client.commit_snapshot(HashMap::from([("a".to_string(), true)]), HashMap::new());
		let mut receiver = client.subscribe();
		client.commit_snapshot(HashMap::from([("a".to_string(), true)]), HashMap::new());

		// Only FlagsUpdated should follow; no FlagChanged for an unchanged value.
		match receiver.try_recv() {
			Ok(ClientEvent::FlagsUpdated) => {}
			other => panic!("unexpected: {other:?}"),
		}
		assert!(matches!(receiver.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
	}

	#[test]
	fn scenario_d_circuit_open_still_serves_cached_value() {
		let client = builder().build().unwrap();
		client.commit_snapshot(HashMap::from([("feature".to_string(), true)]), HashMap::new());
		client.circuit.force_open();

		client.handle_refresh_failure(&Error::CircuitOpen);
		assert!(client.is_enabled("feature", false));
	}
}
