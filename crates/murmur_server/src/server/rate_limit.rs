#![forbid(unsafe_code)]

//! Named fixed-window quota buckets.
//!
//! Each bucket counts points per key (an address or a user id) inside the
//! current window. Windows roll either from the periodic reset task or
//! lazily when a bucket is touched after its window elapsed.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Authorize attempts per remote address.
pub const AUTHORIZE_BUCKET: &str = "authorize";
/// Application packets per user, short window.
pub const PACKET_BUCKET: &str = "packet";
/// Application packets per user, long window.
pub const PACKET_MINUTE_BUCKET: &str = "packet_minute";
/// HTTP API calls.
pub const API_BUCKET: &str = "api";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
	#[error("rate limit bucket {0:?} already exists")]
	Duplicate(String),

	#[error("unknown rate limit bucket {0:?}")]
	UnknownBucket(String),

	#[error("rate limit bucket {0:?} needs a non-zero capacity and window")]
	InvalidBucket(String),
}

/// What happens to points above capacity when a window rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
	/// Every key starts the new window at zero.
	#[default]
	Reset,
	/// Each elapsed window forgives `capacity` points per key.
	Carry,
}

impl std::str::FromStr for OverflowPolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"reset" => Ok(OverflowPolicy::Reset),
			"carry" => Ok(OverflowPolicy::Carry),
			other => Err(format!("unknown overflow policy {other:?} (expected reset|carry)")),
		}
	}
}

/// Key for quotas tracked per remote address.
pub fn address_key(addr: IpAddr) -> String {
	format!("ip:{addr}")
}

/// Key for quotas tracked per authenticated user.
pub fn user_key(user_id: &str) -> String {
	format!("user:{user_id}")
}

#[derive(Debug)]
struct Bucket {
	capacity: u32,
	window: Duration,
	window_started_at: Instant,
	points: HashMap<String, u64>,
}

impl Bucket {
	fn window_end(&self) -> Instant {
		self.window_started_at + self.window
	}

	/// Advance to the window containing `now`. Returns whether anything rolled.
	fn roll(&mut self, now: Instant, policy: OverflowPolicy) -> bool {
		let elapsed = now.saturating_duration_since(self.window_started_at);
		if elapsed < self.window {
			return false;
		}

		let window_nanos = self.window.as_nanos();
		let windows = elapsed.as_nanos() / window_nanos;
		let into_window = elapsed.as_nanos() % window_nanos;
		self.window_started_at = now - Duration::from_nanos(into_window as u64);

		match policy {
			OverflowPolicy::Reset => self.points.clear(),
			OverflowPolicy::Carry => {
				let forgiven = u64::try_from(windows.saturating_mul(u128::from(self.capacity))).unwrap_or(u64::MAX);
				self.points.retain(|_, p| {
					*p = p.saturating_sub(forgiven);
					*p > 0
				});
			}
		}
		true
	}

	fn add(&mut self, key: &str, points: i64) -> bool {
		let entry = self.points.entry(key.to_string()).or_insert(0);
		*entry = if points >= 0 {
			entry.saturating_add(points.unsigned_abs())
		} else {
			entry.saturating_sub(points.unsigned_abs())
		};

		let accepted = *entry <= u64::from(self.capacity);
		if *entry == 0 {
			self.points.remove(key);
		}
		accepted
	}

	fn retry_after_ms(&self, key: &str, now: Instant) -> i64 {
		let points = i128::from(self.points.get(key).copied().unwrap_or(0));
		let capacity = i128::from(self.capacity);
		let until_reset = self.window_end().saturating_duration_since(now).as_millis() as i128;
		let window = self.window.as_millis() as i128;

		let ms = until_reset + (points - capacity) * window / capacity;
		ms.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
	}
}

#[derive(Debug, Default)]
struct Inner {
	buckets: HashMap<String, Bucket>,
}

/// Shared registry of named buckets. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
	inner: Arc<Mutex<Inner>>,
	policy: OverflowPolicy,
}

impl Default for RateLimiter {
	fn default() -> Self {
		Self::new(OverflowPolicy::default())
	}
}

impl RateLimiter {
	pub fn new(policy: OverflowPolicy) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			policy,
		}
	}

	pub fn policy(&self) -> OverflowPolicy {
		self.policy
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Register a bucket. Its first window starts now.
	pub fn create(&self, id: &str, capacity: u32, window: Duration) -> Result<(), RateLimitError> {
		if capacity == 0 || window.is_zero() {
			return Err(RateLimitError::InvalidBucket(id.to_string()));
		}

		let mut inner = self.lock();
		if inner.buckets.contains_key(id) {
			return Err(RateLimitError::Duplicate(id.to_string()));
		}

		inner.buckets.insert(
			id.to_string(),
			Bucket {
				capacity,
				window,
				window_started_at: Instant::now(),
				points: HashMap::new(),
			},
		);
		debug!(bucket = id, capacity, window_ms = window.as_millis() as u64, "rate limit bucket created");
		Ok(())
	}

	pub fn bucket_ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.lock().buckets.keys().cloned().collect();
		ids.sort();
		ids
	}

	/// Add `points` (negative refunds) to `key` and report whether the total
	/// still fits the bucket's capacity. Points are recorded either way.
	pub fn consume(&self, id: &str, key: &str, points: i64) -> Result<bool, RateLimitError> {
		let now = Instant::now();
		let policy = self.policy;
		let mut inner = self.lock();
		let bucket = inner
			.buckets
			.get_mut(id)
			.ok_or_else(|| RateLimitError::UnknownBucket(id.to_string()))?;

		bucket.roll(now, policy);
		Ok(bucket.add(key, points))
	}

	/// Consume from every bucket in `ids` and accept only if all accept.
	///
	/// `bypass` accepts without touching any bucket. Every bucket is
	/// charged even after one has rejected. Unknown ids fail the whole call
	/// before anything is charged.
	pub fn consume2<S: AsRef<str>>(&self, ids: &[S], key: &str, bypass: bool, points: i64) -> Result<bool, RateLimitError> {
		if bypass {
			return Ok(true);
		}

		let now = Instant::now();
		let policy = self.policy;
		let mut inner = self.lock();

		if let Some(missing) = ids.iter().find(|id| !inner.buckets.contains_key(id.as_ref())) {
			return Err(RateLimitError::UnknownBucket(missing.as_ref().to_string()));
		}

		let mut accepted = true;
		for id in ids {
			if let Some(bucket) = inner.buckets.get_mut(id.as_ref()) {
				bucket.roll(now, policy);
				accepted &= bucket.add(key, points);
			}
		}
		Ok(accepted)
	}

	/// Milliseconds until `key` has headroom in bucket `id` again.
	///
	/// Zero or negative means there is headroom right now.
	pub fn retry_after(&self, id: &str, key: &str) -> Result<i64, RateLimitError> {
		let now = Instant::now();
		let policy = self.policy;
		let mut inner = self.lock();
		let bucket = inner
			.buckets
			.get_mut(id)
			.ok_or_else(|| RateLimitError::UnknownBucket(id.to_string()))?;

		bucket.roll(now, policy);
		Ok(bucket.retry_after_ms(key, now))
	}

	/// Largest `retry_after` over `ids`, clamped to zero.
	pub fn max_retry_after<S: AsRef<str>>(&self, ids: &[S], key: &str) -> Result<u64, RateLimitError> {
		let mut max = 0i64;
		for id in ids {
			max = max.max(self.retry_after(id.as_ref(), key)?);
		}
		Ok(max.max(0).unsigned_abs())
	}

	/// Points recorded for `key` in the current window.
	#[allow(dead_code)]
	pub fn points(&self, id: &str, key: &str) -> Result<u64, RateLimitError> {
		let now = Instant::now();
		let policy = self.policy;
		let mut inner = self.lock();
		let bucket = inner
			.buckets
			.get_mut(id)
			.ok_or_else(|| RateLimitError::UnknownBucket(id.to_string()))?;

		bucket.roll(now, policy);
		Ok(bucket.points.get(key).copied().unwrap_or(0))
	}

	/// Drop every key in bucket `id` and start a fresh window.
	pub fn reset(&self, id: &str) -> Result<(), RateLimitError> {
		let mut inner = self.lock();
		let bucket = inner
			.buckets
			.get_mut(id)
			.ok_or_else(|| RateLimitError::UnknownBucket(id.to_string()))?;

		bucket.points.clear();
		bucket.window_started_at = Instant::now();
		Ok(())
	}

	/// Roll every bucket whose window has elapsed. Returns how many rolled.
	pub fn reset_expired(&self) -> usize {
		let now = Instant::now();
		let policy = self.policy;
		let mut inner = self.lock();
		let mut rolled = 0;
		for bucket in inner.buckets.values_mut() {
			if bucket.roll(now, policy) {
				rolled += 1;
			}
		}
		rolled
	}

	/// Run `reset_expired` every `period` until the handle is aborted.
	pub fn spawn_reset_timer(&self, period: Duration) -> JoinHandle<()> {
		let limiter = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				let rolled = limiter.reset_expired();
				if rolled > 0 {
					debug!(rolled, "rate limit windows reset");
				}
			}
		})
	}
}
