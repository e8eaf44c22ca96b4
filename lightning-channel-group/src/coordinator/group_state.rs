// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The state the coordinator keeps for a single group.

use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Transaction};

use core::time::Duration;
use std::collections::{HashMap, HashSet};

use crate::assembler::{assemble_joint_funding, max_member_fee, JointFunding, MemberProposal};
use crate::ceremony::{combine_signatures, verify_member_signatures};
use crate::coordinator::phase::GroupPhase;
use crate::events::Event;
use crate::topology::{self, PartnerTopology};
use crate::types::{GroupId, GroupKind, GroupParams, Partners};
use crate::util::config::CoordinatorConfig;
use crate::util::errors::GroupError;

fn invalid(err: String) -> GroupError {
	GroupError::InvalidRequest { err }
}

pub(super) struct GroupState {
	pub(super) group_id: GroupId,
	pub(super) params: GroupParams,
	pub(super) phase: GroupPhase,
	coordinator_id: PublicKey,
	topology: Box<dyn PartnerTopology + Send + Sync>,
	// In join order, with the time each member last contacted us. Fixed once locked.
	members: Vec<(PublicKey, Duration)>,
	connected: HashSet<PublicKey>,
	proposals: HashMap<PublicKey, MemberProposal>,
	joint: Option<JointFunding>,
	signatures: HashMap<PublicKey, Psbt>,
	shuffle_seed: [u8; 32],
	failure: Option<(GroupError, Duration)>,
}

impl GroupState {
	pub(super) fn new(
		group_id: GroupId, params: GroupParams, coordinator_id: PublicKey, now: Duration,
		shuffle_seed: [u8; 32],
	) -> Self {
		let topology = topology::for_kind(params.kind);
		GroupState {
			group_id,
			params,
			phase: GroupPhase::Admitting,
			coordinator_id,
			topology,
			members: vec![(coordinator_id, now)],
			connected: HashSet::new(),
			proposals: HashMap::new(),
			joint: None,
			signatures: HashMap::new(),
			shuffle_seed,
			failure: None,
		}
	}

	pub(super) fn member_ids(&self) -> Vec<PublicKey> {
		self.members.iter().map(|(id, _)| *id).collect()
	}

	pub(super) fn member_count(&self) -> usize {
		self.members.len()
	}

	pub(super) fn locked_members(&self) -> Option<Vec<PublicKey>> {
		if self.phase.is_locked() {
			Some(self.member_ids())
		} else {
			None
		}
	}

	pub(super) fn unsigned_funding(&self) -> Option<&Psbt> {
		self.joint.as_ref().map(|joint| &joint.psbt)
	}

	fn check_live(&self) -> Result<(), GroupError> {
		match &self.failure {
			Some((err, _)) => Err(err.clone()),
			None => Ok(()),
		}
	}

	fn fail(&mut self, reason: GroupError, now: Duration, events: &mut Vec<Event>) {
		self.phase = GroupPhase::Failed;
		self.failure = Some((reason.clone(), now));
		events.push(Event::GroupFailed { group_id: self.group_id, reason });
	}

	/// Whether the group failed more than `timeout` ago and can be forgotten.
	pub(super) fn is_expired(&self, now: Duration, timeout: Duration) -> bool {
		match &self.failure {
			Some((_, failed_at)) => now.saturating_sub(*failed_at) > timeout,
			None => false,
		}
	}

	/// Drops members which have not confirmed their membership within `timeout`, as long as the
	/// group is still admitting. Returns the evicted members.
	pub(super) fn evict_stale(&mut self, now: Duration, timeout: Duration) -> Vec<PublicKey> {
		if self.phase.is_locked() {
			return Vec::new();
		}
		let coordinator_id = self.coordinator_id;
		let mut evicted = Vec::new();
		self.members.retain(|(id, last_seen)| {
			let fresh = *id == coordinator_id || now.saturating_sub(*last_seen) <= timeout;
			if !fresh {
				evicted.push(*id);
			}
			fresh
		});
		evicted
	}

	/// Fails the group if a locked member has been silent for longer than `timeout` before the
	/// last signature arrived. Returns the member which dropped out.
	pub(super) fn check_dropout(
		&mut self, now: Duration, timeout: Duration, events: &mut Vec<Event>,
	) -> Option<PublicKey> {
		if !self.phase.is_locked() || !self.phase.is_live() {
			return None;
		}
		let coordinator_id = self.coordinator_id;
		let dropped = self
			.members
			.iter()
			.find(|(id, last_seen)| {
				*id != coordinator_id && now.saturating_sub(*last_seen) > timeout
			})
			.map(|(id, _)| *id)?;
		self.fail(GroupError::MemberDropout { member: dropped }, now, events);
		Some(dropped)
	}

	/// Refreshes a locked member's liveness, rejecting anyone else.
	fn touch_locked_member(&mut self, node_id: &PublicKey, now: Duration) -> Result<(), GroupError> {
		self.check_live()?;
		let locked = self.phase.is_locked();
		match self.members.iter_mut().find(|(id, _)| id == node_id) {
			Some((_, last_seen)) if locked => {
				*last_seen = now;
				Ok(())
			},
			Some(_) => Err(GroupError::NotReady),
			None => Err(GroupError::MembershipDenied),
		}
	}

	/// Admits `node_id`, or refreshes it if already admitted. Returns the number of members.
	pub(super) fn confirm_membership(
		&mut self, node_id: &PublicKey, now: Duration, events: &mut Vec<Event>,
	) -> Result<usize, GroupError> {
		self.check_live()?;
		let member_count = self.members.len();
		if let Some((_, last_seen)) = self.members.iter_mut().find(|(id, _)| id == node_id) {
			*last_seen = now;
			return Ok(member_count);
		}
		if !self.params.allows(node_id) {
			return Err(GroupError::MembershipDenied);
		}
		if self.phase.is_locked() {
			return Err(GroupError::GroupLocked);
		}
		if member_count >= self.params.count as usize {
			return Err(GroupError::GroupFull);
		}

		self.members.push((*node_id, now));
		if self.members.len() == self.params.count as usize {
			self.phase = GroupPhase::Locked;
			events.push(Event::MembersJoined { group_id: self.group_id, members: self.member_ids() });
			if !self.topology.requires_pairing() {
				self.phase = GroupPhase::Connected;
			}
		}
		Ok(self.members.len())
	}

	/// Records that `node_id` is connected to its partners. Returns the number of members which
	/// confirmed so far.
	pub(super) fn confirm_connected(
		&mut self, node_id: &PublicKey, now: Duration, events: &mut Vec<Event>,
	) -> Result<usize, GroupError> {
		self.touch_locked_member(node_id, now)?;
		if !self.topology.requires_pairing() {
			return Err(invalid("Group members are not paired".to_owned()));
		}
		self.connected.insert(*node_id);
		self.phase = self.phase.advanced_to(GroupPhase::Connecting);
		if self.connected.len() == self.members.len() && self.phase < GroupPhase::Connected {
			self.phase = GroupPhase::Connected;
			events.push(Event::MembersConnected { group_id: self.group_id });
		}
		Ok(self.connected.len())
	}

	pub(super) fn find_partners(
		&mut self, node_id: &PublicKey, now: Duration,
	) -> Result<Partners, GroupError> {
		self.touch_locked_member(node_id, now)?;
		if !self.topology.requires_pairing() {
			return Err(invalid("Group members are not paired".to_owned()));
		}
		self.topology.find_partners(&self.member_ids(), node_id).ok_or(GroupError::MembershipDenied)
	}

	fn validate_proposal(
		&self, proposal: &MemberProposal, config: &CoordinatorConfig,
	) -> Result<(), GroupError> {
		match self.params.kind {
			GroupKind::Channel if proposal.funding.len() != 1 => {
				return Err(invalid("Channel proposals must fund exactly one output".to_owned()));
			},
			GroupKind::Fanout
				if proposal.funding.is_empty()
					|| proposal.funding.len() > config.max_fanout_outputs =>
			{
				return Err(invalid(format!(
					"Fanout proposals must fund between 1 and {} outputs",
					config.max_fanout_outputs
				)));
			},
			_ => {},
		}
		if proposal.utxos.is_empty() || proposal.utxos.len() > config.max_proposal_inputs {
			return Err(invalid(format!(
				"Proposals must spend between 1 and {} inputs",
				config.max_proposal_inputs
			)));
		}

		let mut outpoints = HashSet::new();
		for outpoint in proposal.outpoints() {
			let spent_by_other = self.proposals.values().any(|p| p.outpoints().any(|o| o == outpoint));
			if !outpoints.insert(outpoint) || spent_by_other {
				return Err(invalid(format!("Input {} is spent more than once", outpoint)));
			}
		}

		let weight = proposal.weight().map_err(|e| invalid(format!("{:?}", e)))?;
		let committed =
			proposal.committed_value(self.params.capacity).map_err(|e| invalid(format!("{:?}", e)))?;
		let available = proposal.input_value().map_err(|e| invalid(format!("{:?}", e)))?;
		let required = committed
			.checked_add(max_member_fee(weight, self.params.rate))
			.ok_or_else(|| invalid("Value overflow".to_owned()))?;
		if available < required {
			return Err(GroupError::InsufficientFunds {
				err: format!("Inputs of {} do not cover {} of outputs and fees", available, required),
			});
		}
		Ok(())
	}

	/// Stores the first proposal of `node_id`. Once every member proposed, returns the joint
	/// transaction, building it on first use.
	pub(super) fn register_proposal(
		&mut self, node_id: &PublicKey, kind: GroupKind, proposal: MemberProposal, now: Duration,
		config: &CoordinatorConfig, events: &mut Vec<Event>,
	) -> Result<Option<Psbt>, GroupError> {
		self.touch_locked_member(node_id, now)?;
		if kind != self.params.kind {
			return Err(invalid("Proposal kind does not match the group".to_owned()));
		}
		if self.phase < GroupPhase::Connected {
			return Err(GroupError::NotReady);
		}
		if !self.proposals.contains_key(node_id) {
			self.validate_proposal(&proposal, config)?;
			self.proposals.insert(*node_id, proposal);
			self.phase = self.phase.advanced_to(GroupPhase::Proposing);
		}
		if self.proposals.len() < self.members.len() {
			return Ok(None);
		}
		self.joint_funding(now, events).map(Some)
	}

	fn joint_funding(&mut self, now: Duration, events: &mut Vec<Event>) -> Result<Psbt, GroupError> {
		if let Some(joint) = &self.joint {
			return Ok(joint.psbt.clone());
		}
		let proposals: Vec<MemberProposal> =
			self.members.iter().filter_map(|(id, _)| self.proposals.get(id).cloned()).collect();
		match assemble_joint_funding(
			self.params.capacity,
			self.params.rate,
			&proposals,
			self.shuffle_seed,
		) {
			Ok(joint) => {
				let psbt = joint.psbt.clone();
				self.joint = Some(joint);
				self.phase = self.phase.advanced_to(GroupPhase::Assembled);
				events.push(Event::FundingAssembled { group_id: self.group_id, psbt: psbt.clone() });
				Ok(psbt)
			},
			Err(e) => {
				let reason = GroupError::AssemblyFailed { err: format!("{:?}", e) };
				self.fail(reason.clone(), now, events);
				Err(reason)
			},
		}
	}

	/// Verifies and stores the first signed copy of the joint transaction from `node_id`.
	/// Returns the number of members which signed so far.
	pub(super) fn register_signature(
		&mut self, node_id: &PublicKey, kind: GroupKind, signed: Psbt, now: Duration,
		events: &mut Vec<Event>,
	) -> Result<usize, GroupError> {
		self.touch_locked_member(node_id, now)?;
		if kind != self.params.kind {
			return Err(invalid("Signature kind does not match the group".to_owned()));
		}
		let joint = match &self.joint {
			Some(joint) => joint,
			None => return Err(GroupError::NotReady),
		};
		if !self.signatures.contains_key(node_id) {
			let owned: Vec<OutPoint> =
				self.proposals.get(node_id).map(|p| p.outpoints().collect()).unwrap_or_default();
			verify_member_signatures(&joint.psbt, &signed, &owned)
				.map_err(|e| invalid(format!("{:?}", e)))?;
			self.signatures.insert(*node_id, signed);
			self.phase = self.phase.advanced_to(GroupPhase::Signing);
			if self.signatures.len() == self.members.len() {
				self.phase = GroupPhase::Signed;
				events.push(Event::SignaturesCollected { group_id: self.group_id });
			}
		}
		Ok(self.signatures.len())
	}

	/// The fully signed joint transaction.
	pub(super) fn combined_transaction(&self) -> Result<Transaction, GroupError> {
		self.check_live()?;
		let joint = match &self.joint {
			Some(joint) if self.phase == GroupPhase::Signed => joint,
			_ => return Err(GroupError::NotReady),
		};
		let submissions: Vec<(Vec<OutPoint>, Psbt)> = self
			.members
			.iter()
			.filter_map(|(id, _)| {
				let proposal = self.proposals.get(id)?;
				let signed = self.signatures.get(id)?;
				Some((proposal.outpoints().collect(), signed.clone()))
			})
			.collect();
		combine_signatures(&joint.psbt, &submissions)
			.map_err(|e| GroupError::AssemblyFailed { err: format!("{:?}", e) })
	}
}
