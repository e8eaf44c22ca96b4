// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The coordinator of channel and fanout groups.
//!
//! A [`GroupCoordinator`] runs on the node which initiates a group. It admits members until the
//! group is full, locks the membership, tells ring members who their partners are, collects every
//! member's proposal, builds the joint transaction once and collects the members' signatures on
//! it. Requests for different groups are handled independently, while requests for the same group
//! are serialized.
//!
//! The coordinator does no I/O of its own: feed it requests with
//! [`GroupCoordinator::handle_message`] and send the replies back, call
//! [`GroupCoordinator::timer_tick_occurred`] periodically, and watch its [`Event`]s.

mod group_state;
mod phase;

pub use phase::GroupPhase;

use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Transaction, Txid};

use core::ops::Deref;
use core::time::Duration;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::assembler::MemberProposal;
use crate::ceremony::broadcast_transaction;
use crate::events::{Event, EventQueue};
use crate::interfaces::{BroadcasterInterface, EntropySource};
use crate::msgs::{
	ConnectedCount, GroupDetails, GroupErrorMessage, PartnersRecord, PendingProposal,
	SignedCount, UnsignedFunding,
};
use crate::types::{GroupId, GroupKind, GroupParams, Partners};
use crate::util::config::CoordinatorConfig;
use crate::util::errors::{CompletionError, GroupError};
use crate::util::logger::{Logger, WithContext};
use crate::util::time::TimeProvider;
use crate::wire::Message;

use group_state::GroupState;

/// Runs groups on behalf of the local node, which is always their first member.
pub struct GroupCoordinator<ES: Deref, L: Deref, TP: Deref>
where
	ES::Target: EntropySource,
	L::Target: Logger,
	TP::Target: TimeProvider,
{
	our_node_id: PublicKey,
	config: CoordinatorConfig,
	groups: RwLock<HashMap<GroupId, Mutex<GroupState>>>,
	pending_events: EventQueue,
	entropy_source: ES,
	logger: L,
	time_provider: TP,
}

impl<ES: Deref, L: Deref, TP: Deref> GroupCoordinator<ES, L, TP>
where
	ES::Target: EntropySource,
	L::Target: Logger,
	TP::Target: TimeProvider,
{
	/// Constructs a new coordinator for the node `our_node_id`.
	pub fn new(
		our_node_id: PublicKey, config: CoordinatorConfig, entropy_source: ES, logger: L,
		time_provider: TP,
	) -> Self {
		GroupCoordinator {
			our_node_id,
			config,
			groups: RwLock::new(HashMap::new()),
			pending_events: EventQueue::new(),
			entropy_source,
			logger,
			time_provider,
		}
	}

	/// Our node id, which is the first member of every group we coordinate.
	pub fn our_node_id(&self) -> PublicKey {
		self.our_node_id
	}

	/// Starts a new group with us as its first member and returns its randomly chosen id.
	pub fn create_group(&self, params: GroupParams) -> Result<GroupId, GroupError> {
		params.validate(self.config.max_group_count)?;
		let group_id = GroupId(self.entropy_source.get_secure_random_bytes());
		let shuffle_seed = self.entropy_source.get_secure_random_bytes();
		let now = self.time_provider.duration_since_epoch();

		let logger = WithContext::from(&self.logger, None, Some(group_id));
		log_info!(
			logger,
			"Created {:?} group for {} members with capacity {} at {} sat/vB",
			params.kind,
			params.count,
			params.capacity,
			params.rate
		);
		let state = GroupState::new(group_id, params, self.our_node_id, now, shuffle_seed);
		self.groups.write().unwrap().insert(group_id, Mutex::new(state));
		Ok(group_id)
	}

	fn with_group<T, F>(
		&self, group_id: &GroupId, node_id: Option<&PublicKey>, operation: &'static str, f: F,
	) -> Result<T, GroupError>
	where
		F: FnOnce(&mut GroupState, Duration, &mut Vec<Event>) -> Result<T, GroupError>,
	{
		let logger = WithContext::from(&self.logger, node_id.copied(), Some(*group_id));
		let groups = self.groups.read().unwrap();
		let group = match groups.get(group_id) {
			Some(group) => group,
			None => {
				log_trace!(logger, "Ignoring {} for unknown group", operation);
				return Err(GroupError::UnknownGroup);
			},
		};
		let mut state = group.lock().unwrap();
		let now = self.time_provider.duration_since_epoch();
		let mut events = Vec::new();
		let phase_before = state.phase;

		let res = f(&mut state, now, &mut events);

		if let Err(e) = &res {
			log_debug!(logger, "Rejected {}: {}", operation, e);
		}
		if state.phase != phase_before {
			log_info!(logger, "Group moved from {} to {}", phase_before, state.phase);
		}
		for event in events.iter() {
			if let Event::GroupFailed { reason, .. } = event {
				log_error!(logger, "Group failed: {}", reason);
			}
		}
		self.enqueue_events(events);
		res
	}

	fn enqueue_events(&self, events: Vec<Event>) {
		let dropped = self.pending_events.enqueue_all(events);
		if dropped > 0 {
			log_warn!(self.logger, "Event queue is full, dropped {} events", dropped);
		}
	}

	/// The parameters of a group.
	pub fn get_group_details(&self, group_id: &GroupId) -> Result<GroupDetails, GroupError> {
		self.with_group(group_id, None, "group details request", |state, _, _| {
			Ok(GroupDetails {
				group_id: *group_id,
				capacity: state.params.capacity.to_sat(),
				count: state.params.count as u64,
				rate: state.params.rate,
			})
		})
	}

	/// Admits `node_id` to a group, or refreshes its membership. Returns the number of members.
	///
	/// Members which stopped confirming are evicted first, as long as the group is admitting.
	/// The call which fills the last slot locks the membership.
	pub fn confirm_membership(
		&self, group_id: &GroupId, node_id: &PublicKey,
	) -> Result<usize, GroupError> {
		let timeout = self.config.stale_member_timeout;
		let logger = WithContext::from(&self.logger, Some(*node_id), Some(*group_id));
		self.with_group(group_id, Some(node_id), "membership", |state, now, events| {
			for evicted in state.evict_stale(now, timeout) {
				log_debug!(logger, "Evicted stale member {}", evicted);
			}
			let count = state.confirm_membership(node_id, now, events)?;
			log_trace!(logger, "Group has {} of {} members", count, state.params.count);
			Ok(count)
		})
	}

	/// Records that `node_id` is connected to its ring partners. Returns how many members are.
	pub fn confirm_connected(
		&self, group_id: &GroupId, node_id: &PublicKey,
	) -> Result<usize, GroupError> {
		self.with_group(group_id, Some(node_id), "connection confirmation", |state, now, events| {
			state.confirm_connected(node_id, now, events)
		})
	}

	/// The ring partners of `node_id`.
	pub fn find_partners(
		&self, group_id: &GroupId, node_id: &PublicKey,
	) -> Result<Partners, GroupError> {
		self.with_group(group_id, Some(node_id), "partner request", |state, now, _| {
			state.find_partners(node_id, now)
		})
	}

	/// Registers the proposal of `node_id`. Only its first proposal is kept.
	///
	/// Returns the unsigned joint transaction once every member proposed, or `None` while some
	/// have yet to.
	pub fn register_proposal(
		&self, group_id: &GroupId, node_id: &PublicKey, kind: GroupKind, proposal: MemberProposal,
	) -> Result<Option<Psbt>, GroupError> {
		let config = &self.config;
		self.with_group(group_id, Some(node_id), "proposal", |state, now, events| {
			state.register_proposal(node_id, kind, proposal, now, config, events)
		})
	}

	/// Registers the signed copy of the joint transaction from `node_id`. Only its first valid
	/// submission is kept. Returns how many members signed so far.
	pub fn register_signature(
		&self, group_id: &GroupId, node_id: &PublicKey, kind: GroupKind, signed: Psbt,
	) -> Result<usize, GroupError> {
		self.with_group(group_id, Some(node_id), "signature", |state, now, events| {
			state.register_signature(node_id, kind, signed, now, events)
		})
	}

	/// The fully signed joint transaction, once every member signed.
	pub fn combined_transaction(&self, group_id: &GroupId) -> Result<Transaction, GroupError> {
		let logger = WithContext::from(&self.logger, None, Some(*group_id));
		let tx = self.with_group(group_id, None, "combination", |state, _, _| {
			state.combined_transaction()
		})?;
		log_info!(logger, "Combined signatures into {}", log_tx!(tx));
		Ok(tx)
	}

	/// Broadcasts the fully signed joint transaction of a group and forgets the group once the
	/// broadcast went through.
	///
	/// If broadcasting fails the group is kept, so that this can be called again.
	pub async fn broadcast_group<B: Deref>(
		&self, group_id: &GroupId, broadcaster: &B,
	) -> Result<Txid, CompletionError>
	where
		B::Target: BroadcasterInterface,
	{
		let tx = self.combined_transaction(group_id)?;
		let logger = WithContext::from(&self.logger, None, Some(*group_id));
		broadcast_transaction(broadcaster, &tx, &self.config.broadcast, &&logger).await?;
		self.complete_group(group_id)?;
		Ok(tx.compute_txid())
	}

	/// Forgets a group, typically once its transaction was broadcast.
	pub fn complete_group(&self, group_id: &GroupId) -> Result<(), GroupError> {
		match self.groups.write().unwrap().remove(group_id) {
			Some(_) => {
				let logger = WithContext::from(&self.logger, None, Some(*group_id));
				log_info!(logger, "Group completed");
				Ok(())
			},
			None => Err(GroupError::UnknownGroup),
		}
	}

	/// The current phase of a group.
	pub fn group_phase(&self, group_id: &GroupId) -> Option<GroupPhase> {
		self.groups.read().unwrap().get(group_id).map(|group| group.lock().unwrap().phase)
	}

	/// The locked members of a group, in join order.
	pub fn locked_members(&self, group_id: &GroupId) -> Option<Vec<PublicKey>> {
		self.groups.read().unwrap().get(group_id).and_then(|group| group.lock().unwrap().locked_members())
	}

	/// The number of members admitted to a group so far.
	pub fn member_count(&self, group_id: &GroupId) -> Option<usize> {
		self.groups.read().unwrap().get(group_id).map(|group| group.lock().unwrap().member_count())
	}

	/// The unsigned joint transaction of a group, once built.
	pub fn unsigned_funding(&self, group_id: &GroupId) -> Option<Psbt> {
		self.groups
			.read()
			.unwrap()
			.get(group_id)
			.and_then(|group| group.lock().unwrap().unsigned_funding().cloned())
	}

	/// Evicts stale members from admitting groups, fails locked groups whose members went silent
	/// and forgets groups which failed a while ago.
	///
	/// Should be called roughly once a minute.
	pub fn timer_tick_occurred(&self) {
		let now = self.time_provider.duration_since_epoch();
		let timeout = self.config.stale_member_timeout;
		let mut events = Vec::new();
		let mut expired = Vec::new();
		{
			let groups = self.groups.read().unwrap();
			for (group_id, group) in groups.iter() {
				let logger = WithContext::from(&self.logger, None, Some(*group_id));
				let mut state = group.lock().unwrap();
				for evicted in state.evict_stale(now, timeout) {
					log_debug!(logger, "Evicted stale member {}", evicted);
				}
				if let Some(member) = state.check_dropout(now, timeout, &mut events) {
					log_error!(logger, "Member {} dropped out, failing group", member);
				}
				if state.is_expired(now, timeout) {
					expired.push(*group_id);
				}
			}
		}
		if !expired.is_empty() {
			let mut groups = self.groups.write().unwrap();
			for group_id in expired {
				let logger = WithContext::from(&self.logger, None, Some(group_id));
				log_debug!(logger, "Removing failed group");
				groups.remove(&group_id);
			}
		}
		self.enqueue_events(events);
	}

	/// Handles a request from `counterparty_node_id`, returning the reply to send back.
	///
	/// Requests for groups we do not know and messages which are not requests are dropped
	/// without a reply.
	pub fn handle_message(&self, counterparty_node_id: &PublicKey, msg: Message) -> Option<Message> {
		let group_id = match msg.group_id() {
			Some(group_id) => group_id,
			None => {
				log_debug!(self.logger, "Ignoring message of unknown type {}", msg.type_id());
				return None;
			},
		};
		let node_id = counterparty_node_id;
		let res = match msg {
			Message::GetGroupDetails(_) => self.get_group_details(&group_id).map(Message::GroupDetails),
			Message::ConfirmMembership(_) => self
				.confirm_membership(&group_id, node_id)
				.map(|count| Message::ConnectedCount(ConnectedCount { group_id, count: count as u64 })),
			Message::ConfirmConnected(_) => self
				.confirm_connected(&group_id, node_id)
				.map(|count| Message::ConnectedCount(ConnectedCount { group_id, count: count as u64 })),
			Message::FindPartners(_) => self.find_partners(&group_id, node_id).map(|partners| {
				Message::PartnersRecord(PartnersRecord {
					group_id,
					inbound: partners.inbound,
					outbound: partners.outbound,
				})
			}),
			Message::RegisterPendingOpen(proposal) => {
				self.handle_proposal(node_id, GroupKind::Channel, proposal)
			},
			Message::RegisterPendingFanout(proposal) => {
				self.handle_proposal(node_id, GroupKind::Fanout, proposal)
			},
			Message::RegisterSignedOpen(signed) => self
				.register_signature(&group_id, node_id, GroupKind::Channel, signed.psbt)
				.map(|count| Message::SignedCount(SignedCount { group_id, count: count as u64 })),
			Message::RegisterSignedFanout(signed) => self
				.register_signature(&group_id, node_id, GroupKind::Fanout, signed.psbt)
				.map(|count| Message::SignedCount(SignedCount { group_id, count: count as u64 })),
			_ => {
				let logger = WithContext::from(&self.logger, Some(*node_id), Some(group_id));
				log_debug!(logger, "Ignoring unexpected message of type {}", msg.type_id());
				return None;
			},
		};
		match res {
			Ok(reply) => Some(reply),
			Err(GroupError::UnknownGroup) => None,
			Err(error) => Some(Message::GroupError(GroupErrorMessage { group_id, error })),
		}
	}

	fn handle_proposal(
		&self, node_id: &PublicKey, kind: GroupKind, msg: PendingProposal,
	) -> Result<Message, GroupError> {
		let group_id = msg.group_id;
		let proposal = MemberProposal::from_msg(&msg)
			.map_err(|e| GroupError::InvalidRequest { err: format!("Invalid proposal: {}", e) })?;
		Ok(match self.register_proposal(&group_id, node_id, kind, proposal)? {
			Some(psbt) => Message::UnsignedFunding(UnsignedFunding { group_id, psbt }),
			None => Message::FundingPending(crate::msgs::FundingPending { group_id }),
		})
	}

	/// Returns the next event from the event queue, if any.
	pub fn next_event(&self) -> Option<Event> {
		self.pending_events.next_event()
	}

	/// Asynchronously polls the event queue and returns once the next event is ready.
	pub async fn next_event_async(&self) -> Event {
		self.pending_events.next_event_async().await
	}

	/// Blocks the current thread until the next event is ready and returns it.
	pub fn wait_next_event(&self) -> Event {
		self.pending_events.wait_next_event()
	}

	/// Returns and clears all events without blocking.
	pub fn get_and_clear_pending_events(&self) -> Vec<Event> {
		self.pending_events.get_and_clear_pending_events()
	}

	/// Returns and clears the events of a single group, leaving the events of other groups queued.
	pub fn get_and_clear_group_events(&self, group_id: &GroupId) -> Vec<Event> {
		self.pending_events.get_and_clear_group_events(group_id)
	}
}
