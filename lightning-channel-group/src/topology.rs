// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! How the members of a locked group are paired up.

use bitcoin::secp256k1::PublicKey;

use crate::types::{GroupKind, Partners};

/// Decides which members open channels to each other once the membership is locked.
pub trait PartnerTopology {
	/// The partners of `requester` given the locked member list, or `None` if the requester is
	/// not a member or the topology has no pairing.
	fn find_partners(&self, members: &[PublicKey], requester: &PublicKey) -> Option<Partners>;

	/// Whether members must connect to their partners before the joint transaction is built.
	fn requires_pairing(&self) -> bool;
}

/// Arranges members in a circle, each opening a channel to the next one.
///
/// The member at index `i` receives a channel from `i - 1` and opens one to `i + 1`, wrapping
/// around at both ends. With two members both partners are the other member, so they open
/// channels to each other.
pub struct RingTopology;

impl PartnerTopology for RingTopology {
	fn find_partners(&self, members: &[PublicKey], requester: &PublicKey) -> Option<Partners> {
		if members.len() < 2 {
			return None;
		}
		let idx = members.iter().position(|m| m == requester)?;
		let len = members.len();
		Some(Partners { inbound: members[(idx + len - 1) % len], outbound: members[(idx + 1) % len] })
	}

	fn requires_pairing(&self) -> bool {
		true
	}
}

/// No pairing at all, every member only talks to the coordinator.
pub struct StarTopology;

impl PartnerTopology for StarTopology {
	fn find_partners(&self, _members: &[PublicKey], _requester: &PublicKey) -> Option<Partners> {
		None
	}

	fn requires_pairing(&self) -> bool {
		false
	}
}

/// The topology a group of the given kind uses.
pub(crate) fn for_kind(kind: GroupKind) -> Box<dyn PartnerTopology + Send + Sync> {
	match kind {
		GroupKind::Channel => Box::new(RingTopology),
		GroupKind::Fanout => Box::new(StarTopology),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::pubkey;

	#[test]
	fn ring_of_three() {
		let members = [pubkey(1), pubkey(2), pubkey(3)];
		let ring = RingTopology;
		assert_eq!(
			ring.find_partners(&members, &pubkey(1)),
			Some(Partners { inbound: pubkey(3), outbound: pubkey(2) })
		);
		assert_eq!(
			ring.find_partners(&members, &pubkey(2)),
			Some(Partners { inbound: pubkey(1), outbound: pubkey(3) })
		);
		assert_eq!(
			ring.find_partners(&members, &pubkey(3)),
			Some(Partners { inbound: pubkey(2), outbound: pubkey(1) })
		);
		assert_eq!(ring.find_partners(&members, &pubkey(4)), None);
	}

	#[test]
	fn every_member_has_one_inbound_and_one_outbound() {
		let members: Vec<_> = (1..=7).map(pubkey).collect();
		let ring = RingTopology;
		let partners: Vec<_> =
			members.iter().map(|m| ring.find_partners(&members, m).unwrap()).collect();
		for (idx, member) in members.iter().enumerate() {
			// Whoever we open to sees us as their inbound partner.
			let outbound_idx = members.iter().position(|m| *m == partners[idx].outbound).unwrap();
			assert_eq!(partners[outbound_idx].inbound, *member);
			assert_eq!(partners.iter().filter(|p| p.outbound == *member).count(), 1);
			assert_ne!(partners[idx].outbound, *member);
		}
	}

	#[test]
	fn pair_is_mutual() {
		let members = [pubkey(1), pubkey(2)];
		assert_eq!(
			RingTopology.find_partners(&members, &pubkey(1)),
			Some(Partners { inbound: pubkey(2), outbound: pubkey(2) })
		);
		assert_eq!(
			RingTopology.find_partners(&members, &pubkey(2)),
			Some(Partners { inbound: pubkey(1), outbound: pubkey(1) })
		);
	}

	#[test]
	fn star_has_no_partners() {
		let members = [pubkey(1), pubkey(2), pubkey(3)];
		assert_eq!(StarTopology.find_partners(&members, &pubkey(2)), None);
		assert!(!StarTopology.requires_pairing());
		assert!(for_kind(GroupKind::Channel).requires_pairing());
	}
}
