// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various user-configurable group coordination settings.

use core::time::Duration;

/// Options which apply to a [`GroupCoordinator`] and every group it hosts.
///
/// Default::default() provides sane defaults for most configurations.
///
/// [`GroupCoordinator`]: crate::coordinator::GroupCoordinator
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorConfig {
	/// How long a member may go without contacting us before we consider it gone.
	///
	/// Before the membership is locked, stale members are simply evicted to make room for
	/// others. Once locked, a stale member fails the whole group.
	///
	/// Default value: 10 minutes.
	pub stale_member_timeout: Duration,
	/// The largest group size [`GroupCoordinator::create_group`] accepts.
	///
	/// Default value: 650.
	///
	/// [`GroupCoordinator::create_group`]: crate::coordinator::GroupCoordinator::create_group
	pub max_group_count: u16,
	/// The maximum number of inputs accepted in a single member's proposal.
	///
	/// Default value: 500.
	pub max_proposal_inputs: usize,
	/// The maximum number of outputs a single member may request in a fanout group.
	///
	/// Default value: 100.
	pub max_fanout_outputs: usize,
	/// Publishing a group's joint transaction in [`GroupCoordinator::broadcast_group`].
	///
	/// Default: 1 second doubling up to 5 minutes, 20 attempts.
	///
	/// [`GroupCoordinator::broadcast_group`]: crate::coordinator::GroupCoordinator::broadcast_group
	pub broadcast: RetryConfig,
}

impl Default for CoordinatorConfig {
	fn default() -> Self {
		CoordinatorConfig {
			stale_member_timeout: Duration::from_secs(600),
			max_group_count: 650,
			max_proposal_inputs: 500,
			max_fanout_outputs: 100,
			broadcast: RetryConfig {
				interval: Duration::from_secs(1),
				max_interval: Duration::from_secs(300),
				max_attempts: 20,
			},
		}
	}
}

/// How often and how long a polling step is repeated before giving up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
	/// Delay after the first unsuccessful attempt.
	pub interval: Duration,
	/// Upper bound on the delay. The delay doubles after each attempt until it reaches this
	/// value, so setting it equal to `interval` polls at a fixed rate.
	pub max_interval: Duration,
	/// Total number of attempts, including the first one.
	pub max_attempts: u32,
}

impl RetryConfig {
	/// Polls every `interval` up to `max_attempts` times.
	pub const fn fixed(interval: Duration, max_attempts: u32) -> Self {
		RetryConfig { interval, max_interval: interval, max_attempts }
	}

	pub(crate) fn delay_after(&self, attempt: u32) -> Duration {
		let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
		self.interval.checked_mul(factor).unwrap_or(self.max_interval).min(self.max_interval)
	}
}

/// Options which control how a [`GroupMember`] paces its interaction with the coordinator.
///
/// The defaults allow tens of minutes for members to show up and connect, which is what real
/// groups need given peer connectivity and confirmation delays.
///
/// [`GroupMember`]: crate::member::GroupMember
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemberConfig {
	/// Fetching the group details. Default: every 500ms for 5 minutes.
	pub details: RetryConfig,
	/// Waiting for the group to fill up. Default: every second for 30 minutes.
	pub membership: RetryConfig,
	/// Finding our partners in the ring. Default: every second for 10 minutes.
	pub partners: RetryConfig,
	/// Connecting to our partners and waiting for everyone else to connect. Default: every 3
	/// seconds for an hour.
	///
	/// This outlasts [`CoordinatorConfig::stale_member_timeout`], so every connection attempt
	/// is followed by a heartbeat to the coordinator.
	pub connect: RetryConfig,
	/// Registering our proposal until the joint transaction is ready. Default: every second
	/// for 30 minutes.
	pub propose: RetryConfig,
	/// Submitting our signature until every member has signed. Default: every second for 30
	/// minutes.
	pub sign: RetryConfig,
	/// Publishing the finished transaction. Default: 1 second doubling up to 5 minutes, 20
	/// attempts.
	pub broadcast: RetryConfig,
	/// Our conflict transaction pays the group's feerate divided by this, floored at 1 sat/vB.
	///
	/// Default value: 2.
	pub conflict_feerate_divisor: u64,
	/// How many outputs of the group's capacity we ask for when joining a fanout group.
	///
	/// Default value: 1.
	pub fanout_outputs: usize,
}

impl Default for MemberConfig {
	fn default() -> Self {
		MemberConfig {
			details: RetryConfig::fixed(Duration::from_millis(500), 600),
			membership: RetryConfig::fixed(Duration::from_secs(1), 1800),
			partners: RetryConfig::fixed(Duration::from_secs(1), 600),
			connect: RetryConfig::fixed(Duration::from_secs(3), 1200),
			propose: RetryConfig::fixed(Duration::from_secs(1), 1800),
			sign: RetryConfig::fixed(Duration::from_secs(1), 1800),
			broadcast: RetryConfig {
				interval: Duration::from_secs(1),
				max_interval: Duration::from_secs(300),
				max_attempts: 20,
			},
			conflict_feerate_divisor: 2,
			fanout_outputs: 1,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fixed_delay_does_not_grow() {
		let config = RetryConfig::fixed(Duration::from_millis(250), 10);
		assert_eq!(config.delay_after(0), Duration::from_millis(250));
		assert_eq!(config.delay_after(9), Duration::from_millis(250));
	}

	#[test]
	fn backoff_doubles_until_capped() {
		let config = RetryConfig {
			interval: Duration::from_secs(1),
			max_interval: Duration::from_secs(10),
			max_attempts: 50,
		};
		assert_eq!(config.delay_after(0), Duration::from_secs(1));
		assert_eq!(config.delay_after(1), Duration::from_secs(2));
		assert_eq!(config.delay_after(3), Duration::from_secs(8));
		assert_eq!(config.delay_after(4), Duration::from_secs(10));
		assert_eq!(config.delay_after(40), Duration::from_secs(10));
	}
}
