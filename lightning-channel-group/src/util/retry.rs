// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Bounded polling of a step until it reports completion.

use core::fmt::Debug;
use core::future::Future;
use core::ops::Deref;

use crate::util::config::RetryConfig;
use crate::util::errors::{BroadcastError, MemberError};
use crate::util::logger::Logger;

/// The outcome of a single successful attempt.
pub(crate) enum Attempt<T> {
	/// The step completed.
	Done(T),
	/// The counterparty is not there yet, poll again later.
	NotReady,
}

/// Errors which can tell whether an attempt is worth repeating.
pub(crate) trait RetryableError: Debug {
	fn is_retryable(&self) -> bool;
	fn retries_exhausted(operation: &'static str) -> Self;
}

impl RetryableError for MemberError {
	fn is_retryable(&self) -> bool {
		MemberError::is_retryable(self)
	}
	fn retries_exhausted(operation: &'static str) -> Self {
		MemberError::RetriesExhausted { operation }
	}
}

impl RetryableError for BroadcastError {
	fn is_retryable(&self) -> bool {
		matches!(self, BroadcastError::Unavailable)
	}
	fn retries_exhausted(_operation: &'static str) -> Self {
		BroadcastError::Unavailable
	}
}

/// Runs `op` until it returns [`Attempt::Done`], a non-retryable error, or `config.max_attempts`
/// attempts have been made.
pub(crate) async fn retry_until_ready<T, E, F, Fut, L: Deref>(
	config: &RetryConfig, operation: &'static str, logger: &L, mut op: F,
) -> Result<T, E>
where
	E: RetryableError,
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<Attempt<T>, E>>,
	L::Target: Logger,
{
	let mut attempt: u32 = 0;
	loop {
		match op().await {
			Ok(Attempt::Done(res)) => return Ok(res),
			Ok(Attempt::NotReady) => {
				log_trace!(logger, "{} not ready after attempt {}", operation, attempt + 1);
			},
			Err(e) if e.is_retryable() => {
				log_trace!(logger, "{} attempt {} failed: {:?}", operation, attempt + 1, e);
			},
			Err(e) => {
				log_debug!(logger, "{} failed permanently: {:?}", operation, e);
				return Err(e);
			},
		}
		attempt += 1;
		if attempt >= config.max_attempts {
			log_warn!(logger, "Giving up on {} after {} attempts", operation, attempt);
			return Err(E::retries_exhausted(operation));
		}
		tokio::time::sleep(config.delay_after(attempt - 1)).await;
	}
}
