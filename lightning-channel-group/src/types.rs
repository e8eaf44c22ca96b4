// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Core group types and the protocol-wide bounds on their values.

use bitcoin::hex::DisplayHex;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Amount;

use core::fmt;

use crate::util::errors::GroupError;

/// The largest capacity, in satoshis, a group may ask each funding output to carry.
pub const MAX_CAPACITY_SATS: u64 = 700_000_000_000_000;
/// The largest number of members a group may have.
pub const MAX_GROUP_COUNT: u64 = 650;
/// The largest feerate, in sat/vB, a group may ask for.
pub const MAX_FEE_RATE: u64 = 100_000;
/// The largest member count reported in progress replies.
pub const MAX_REPORTED_COUNT: u64 = 25_000;
/// The largest value a single UTXO may carry.
pub const MAX_UTXO_VALUE_SATS: u64 = 2_100_000_000_000_000;
/// The largest output index a UTXO may have.
pub const MAX_VOUT: u64 = 150_000;
/// The largest number of UTXOs a single proposal may spend.
pub const MAX_PROPOSAL_UTXOS: u64 = 500;
/// The largest number of funding outputs a single proposal may request.
pub const MAX_FUNDING_SCRIPTS: u64 = 100;

/// The smallest capacity we accept, below which funding outputs would be dust.
pub const MIN_CAPACITY_SATS: u64 = 546;

/// A unique identifier of a group, chosen at random by the coordinator when the group is created.
#[derive(Hash, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GroupId(pub [u8; 32]);

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0.as_hex())
	}
}

impl fmt::Debug for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "GroupId({})", self)
	}
}

/// What the joint transaction of a group pays for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupKind {
	/// Members open channels to each other, arranged in a ring. Every member funds exactly one
	/// outbound channel of the group's capacity.
	Channel,
	/// Members pay equal outputs of the group's capacity to arbitrary destinations. No peer
	/// pairing takes place.
	Fanout,
}

/// The parameters a group is created with. They never change for the life of the group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupParams {
	/// The kind of joint transaction the group builds.
	pub kind: GroupKind,
	/// The value of every funding output.
	pub capacity: Amount,
	/// How many members, the coordinator included, the group needs before it locks.
	pub count: u16,
	/// The feerate of the joint transaction, in sat/vB.
	pub rate: u64,
	/// If set, only these nodes may join. The coordinator itself is always allowed.
	pub allowed: Option<Vec<PublicKey>>,
}

impl GroupParams {
	/// Checks the parameters against the protocol bounds and the given maximum group size.
	pub fn validate(&self, max_group_count: u16) -> Result<(), GroupError> {
		let capacity = self.capacity.to_sat();
		if capacity < MIN_CAPACITY_SATS || capacity > MAX_CAPACITY_SATS {
			return Err(GroupError::InvalidRequest {
				err: format!("Capacity {} out of range", self.capacity),
			});
		}
		if self.count < 2 || u64::from(self.count) > MAX_GROUP_COUNT || self.count > max_group_count
		{
			return Err(GroupError::InvalidRequest {
				err: format!("Group count {} out of range", self.count),
			});
		}
		if self.rate == 0 || self.rate > MAX_FEE_RATE {
			return Err(GroupError::InvalidRequest {
				err: format!("Fee rate {} out of range", self.rate),
			});
		}
		if let Some(allowed) = &self.allowed {
			if allowed.is_empty() {
				return Err(GroupError::InvalidRequest {
					err: "Allow list must not be empty".to_owned(),
				});
			}
		}
		Ok(())
	}

	/// Whether the given node may join the group.
	pub fn allows(&self, node_id: &PublicKey) -> bool {
		match &self.allowed {
			Some(allowed) => allowed.contains(node_id),
			None => true,
		}
	}
}

/// The neighbours of a member in the ring of channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partners {
	/// The member which opens a channel to us.
	pub inbound: PublicKey,
	/// The member we open a channel to.
	pub outbound: PublicKey,
}
