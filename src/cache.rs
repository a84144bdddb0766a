//! Single-entry flag cache with TTL and stale-while-revalidate classification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

use crate::rules::EvaluationReason;

/// Cache tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
	/// Age under which an entry is considered fresh.
	pub ttl: Duration,
	/// Age under which a fresh-or-expired entry may still be served as stale.
	pub stale_ttl: Duration,
	/// When `false`, `set` is a no-op and `get` always reports absent.
	pub enabled: bool,
}
impl Default for CacheConfig {
	fn default() -> Self {
		Self { ttl: Duration::from_secs(300), stale_ttl: Duration::from_secs(3600), enabled: true }
	}
}

#[derive(Clone, Debug)]
struct CacheEntry {
	flags: HashMap<String, bool>,
	reasons: HashMap<String, EvaluationReason>,
	fetched_at: Instant,
}

/// Point-in-time read of the cache counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
	/// Lookups served fresh or stale.
	pub hits: u64,
	/// Lookups served from a stale-but-usable entry.
	pub stale_hits: u64,
	/// Lookups that found no usable entry.
	pub misses: u64,
}

/// Outcome of a [`Cache::get`] call. Flag/reason maps are always defensive
/// copies so callers cannot mutate cache-internal state.
#[derive(Clone, Debug)]
pub struct CacheLookup {
	/// Whether a usable (fresh or stale) entry was found.
	pub found: bool,
	/// Whether the found entry is past its TTL but within the stale window.
	pub stale: bool,
	/// Cached flag values, empty when `found` is `false`.
	pub flags: HashMap<String, bool>,
	/// Cached evaluation reasons, empty when `found` is `false`.
	pub reasons: HashMap<String, EvaluationReason>,
}
impl CacheLookup {
	fn absent() -> Self {
		Self { found: false, stale: false, flags: HashMap::new(), reasons: HashMap::new() }
	}
}

/// Holds at most one flag snapshot, classified by age into fresh, stale, or absent.
pub struct Cache {
	config: CacheConfig,
	entry: RwLock<Option<CacheEntry>>,
	hits: AtomicU64,
	stale_hits: AtomicU64,
	misses: AtomicU64,
}

impl Cache {
	/// Construct an empty cache with the given tuning.
	pub fn new(config: CacheConfig) -> Self {
		Self {
			config,
			entry: RwLock::new(None),
			hits: AtomicU64::new(0),
			stale_hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
		}
	}

	/// Classify and return the current entry, updating hit/stale/miss counters.
	/// An entry older than `stale_ttl` is treated as absent and cleared.
	pub fn get(&self) -> CacheLookup {
		if !self.config.enabled {
			self.misses.fetch_add(1, Ordering::Relaxed);
			return CacheLookup::absent();
		}

		let mut expired = false;
		let classified = {
			let guard = self.entry.read().expect("cache lock poisoned");
			guard.as_ref().map(|entry| {
				let age = entry.fetched_at.elapsed();
				if age > self.config.stale_ttl {
					expired = true;
					(false, false, HashMap::new(), HashMap::new())
				} else {
					(true, age > self.config.ttl, entry.flags.clone(), entry.reasons.clone())
				}
			})
		};

		if expired {
			*self.entry.write().expect("cache lock poisoned") = None;
		}

		match classified {
			None | Some((false, ..)) => {
				self.misses.fetch_add(1, Ordering::Relaxed);
				CacheLookup::absent()
			}
			Some((true, stale, flags, reasons)) => {
				self.hits.fetch_add(1, Ordering::Relaxed);
				if stale {
					self.stale_hits.fetch_add(1, Ordering::Relaxed);
				}
				CacheLookup { found: true, stale, flags, reasons }
			}
		}
	}

	/// Replace the entry with a defensive copy of `flags`/`reasons`, stamped `now`.
	pub fn set(&self, flags: HashMap<String, bool>, reasons: HashMap<String, EvaluationReason>) {
		if !self.config.enabled {
			return;
		}
		*self.entry.write().expect("cache lock poisoned") =
			Some(CacheEntry { flags, reasons, fetched_at: Instant::now() });
	}

	/// Drop the entry unconditionally.
	pub fn clear(&self) {
		*self.entry.write().expect("cache lock poisoned") = None;
	}

	/// Whether an entry exists and is within its TTL. Does not alter counters.
	pub fn has_fresh(&self) -> bool {
		self.entry
			.read()
			.expect("cache lock poisoned")
			.as_ref()
			.is_some_and(|entry| entry.fetched_at.elapsed() <= self.config.ttl)
	}

	/// Whether an entry exists and is within its stale window. Does not alter counters.
	pub fn has_any(&self) -> bool {
		self.entry
			.read()
			.expect("cache lock poisoned")
			.as_ref()
			.is_some_and(|entry| entry.fetched_at.elapsed() <= self.config.stale_ttl)
	}

	/// Read-only counter snapshot.
	pub fn stats(&self) -> CacheStats {
		CacheStats {
			hits: self.hits.load(Ordering::Relaxed),
			stale_hits: self.stale_hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
		}
	}

	/// Hit rate over all lookups so far, `0.0` when no lookups have occurred.
	pub fn hit_rate(&self) -> f64 {
		let stats = self.stats();
		let total = stats.hits + stats.misses;
		if total == 0 { 0.0 } else { stats.hits as f64 / total as f64 }
	}
}
