// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Utilities for time handling in the group coordinator.

use core::time::Duration;

/// Trait defining a time provider for the group coordinator.
///
/// Member liveness is tracked against this clock, which lets tests drive timeouts without
/// sleeping.
pub trait TimeProvider {
	/// Get the current time as a duration since the Unix epoch.
	fn duration_since_epoch(&self) -> Duration;
}

/// Default time provider using the system clock.
#[derive(Clone, Debug)]
pub struct DefaultTimeProvider;

impl TimeProvider for DefaultTimeProvider {
	fn duration_since_epoch(&self) -> Duration {
		use std::time::{SystemTime, UNIX_EPOCH};
		SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO)
	}
}

impl core::ops::Deref for DefaultTimeProvider {
	type Target = Self;
	fn deref(&self) -> &Self {
		self
	}
}
