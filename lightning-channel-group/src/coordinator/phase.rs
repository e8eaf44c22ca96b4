// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use core::fmt;

/// The lifecycle phase of a group, as seen by its coordinator.
///
/// Phases only ever move forward, in declaration order, except for [`GroupPhase::Failed`] which
/// can be entered from any phase after the membership is locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupPhase {
	/// Members are joining. Stale members are evicted to make room for others.
	Admitting,
	/// The member list is fixed.
	Locked,
	/// Some members confirmed they are connected to their partners.
	Connecting,
	/// Every member is connected, or no pairing is needed. Proposals are accepted.
	Connected,
	/// Some members proposed.
	Proposing,
	/// Every member proposed and the joint transaction was built.
	Assembled,
	/// Some members submitted signatures.
	Signing,
	/// Every member signed. The transaction can be combined and broadcast.
	Signed,
	/// The group cannot complete.
	Failed,
}

impl GroupPhase {
	/// Whether the membership list is fixed.
	pub fn is_locked(&self) -> bool {
		*self != GroupPhase::Admitting
	}

	/// Whether the group can still make progress.
	pub fn is_live(&self) -> bool {
		!matches!(self, GroupPhase::Signed | GroupPhase::Failed)
	}

	/// Returns `self` advanced to `to`, or unchanged if `to` is not ahead of it.
	pub(super) fn advanced_to(self, to: GroupPhase) -> GroupPhase {
		if self == GroupPhase::Failed {
			self
		} else {
			self.max(to)
		}
	}
}

impl fmt::Display for GroupPhase {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			GroupPhase::Admitting => f.write_str("admitting"),
			GroupPhase::Locked => f.write_str("locked"),
			GroupPhase::Connecting => f.write_str("connecting"),
			GroupPhase::Connected => f.write_str("connected"),
			GroupPhase::Proposing => f.write_str("proposing"),
			GroupPhase::Assembled => f.write_str("assembled"),
			GroupPhase::Signing => f.write_str("signing"),
			GroupPhase::Signed => f.write_str("signed"),
			GroupPhase::Failed => f.write_str("failed"),
		}
	}
}
