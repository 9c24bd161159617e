use std::time::Duration;

use crate::OlmRsOptions;

/// Exponential delays between retries of a failing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeuePolicy {
	base: Duration,
	max: Duration,
	/// `None` retries forever.
	max_retries: Option<u32>,
}

impl RequeuePolicy {
	pub fn new(base: Duration, max: Duration, max_retries: Option<u32>) -> Self {
		Self { base, max, max_retries }
	}

	/// Infrastructure errors, retried until they go away.
	pub fn transient(options: &OlmRsOptions) -> Self {
		Self::new(options.backoff_base(), options.backoff_max(), None)
	}

	/// Errors in the content being reconciled, given up on after a few attempts.
	pub fn resolution(options: &OlmRsOptions) -> Self {
		Self::new(options.backoff_base(), options.backoff_max(), Some(options.max_resolution_retries()))
	}

	/// Delay before retry number `attempt`, counting from 1. `None` once retries are exhausted.
	pub fn delay(&self, attempt: u32) -> Option<Duration> {
		if self.max_retries.is_some_and(|m| attempt > m) {
			return None
		}
		let factor = 1u32 << attempt.saturating_sub(1).min(20);
		Some(self.base.saturating_mul(factor).min(self.max))
	}
}
