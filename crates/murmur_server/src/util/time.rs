#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Whole seconds for a `Retry-After` header, rounded up.
pub fn retry_after_secs(ms: u64) -> u64 {
	ms.div_ceil(1000)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retry_after_rounds_up() {
		assert_eq!(retry_after_secs(0), 0);
		assert_eq!(retry_after_secs(1), 1);
		assert_eq!(retry_after_secs(1000), 1);
		assert_eq!(retry_after_secs(1001), 2);
	}
}
