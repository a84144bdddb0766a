//! Request deduplication (single-flight) by string key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::error::{Error, Result};

/// Coalesces concurrent invocations sharing the same key into a single
/// underlying call; every caller observes the same result.
///
/// Generalized from the teacher's single fixed guard into a keyed map so
/// distinct keys can be in flight simultaneously, even though this crate
/// only ever uses one key (`"fetch-flags"`).
pub struct Deduplicator<T> {
	inflight: Mutex<HashMap<String, Arc<broadcast::Sender<Arc<Result<T>>>>>>,
}

impl<T> Default for Deduplicator<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Deduplicator<T> {
	/// Construct an empty deduplicator.
	pub fn new() -> Self {
		Self { inflight: Mutex::new(HashMap::new()) }
	}

	/// Run `f` for `key` unless another call is already in flight, in which
	/// case await that call's result instead. The result is shared via `Arc`
	/// since the underlying error type does not implement `Clone` cheaply
	/// enough to duplicate per waiter.
	pub async fn dedupe<F, Fut>(&self, key: &str, f: F) -> Arc<Result<T>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let mut waiting = {
			let mut guard = self.inflight.lock().await;
			match guard.get(key) {
				Some(sender) => Some(sender.subscribe()),
				None => {
					let (sender, _receiver) = broadcast::channel(1);
					guard.insert(key.to_string(), Arc::new(sender));
					None
				}
			}
		};

		if let Some(receiver) = waiting.as_mut() {
			return match receiver.recv().await {
				Ok(result) => result,
				Err(_) => Arc::new(Err(Error::Cancelled)),
			};
		}

		let result = Arc::new(f().await);

		let sender = self.inflight.lock().await.remove(key);
		if let Some(sender) = sender {
			let _ = sender.send(result.clone());
		}

		result
	}

	/// Whether an invocation for `key` is currently in flight.
	pub async fn is_inflight(&self, key: &str) -> bool {
		self.inflight.lock().await.contains_key(key)
	}

	/// Drop all in-flight tracking without cancelling the underlying work.
	pub async fn clear(&self) {
		self.inflight.lock().await.clear();
	}
}
