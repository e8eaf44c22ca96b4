// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The member side of a group.
//!
//! A [`GroupMember`] takes one node through a group from start to finish: it waits for the group
//! to fill up, connects to its ring partner and opens its channel (or picks fresh scripts for a
//! fanout group), funds its share of the joint transaction from the wallet, checks what the
//! coordinator assembled and signs it. Every step polls the coordinator until it reports the
//! whole group is ready to move on.
//!
//! If anything goes wrong the member releases what it reserved. Once it has handed out its
//! signatures it also broadcasts a pre-signed conflict transaction, spending its inputs back to
//! itself, so that its coins are not stuck in a group which never completes.

use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, Txid};

use core::ops::Deref;

use crate::assembler::{max_member_fee, member_fee, verify_contribution, MemberProposal};
use crate::ceremony::{
	broadcast_transaction, build_conflict_transaction, conflict_feerate, finalize_own_psbt,
	verify_member_signatures,
};
use crate::interfaces::{BroadcasterInterface, GroupNode, GroupTransport, GroupWallet, PendingChannel};
use crate::msgs::{
	ConfirmConnected, ConfirmMembership, FindPartners, GetGroupDetails, GroupDetails,
	SignedFunding,
};
use crate::types::{GroupId, GroupKind, MAX_PROPOSAL_UTXOS};
use crate::util::config::MemberConfig;
use crate::util::errors::{AssemblyError, MemberError};
use crate::util::logger::{Logger, WithContext};
use crate::util::retry::{retry_until_ready, Attempt};
use crate::utxo::{strip_key_origins, UtxoDescriptor};
use crate::wire::Message;

/// What a member is left with once every member signed the joint transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupOutcome {
	/// The id of the joint transaction, which the coordinator publishes with
	/// [`GroupCoordinator::broadcast_group`].
	///
	/// [`GroupCoordinator::broadcast_group`]: crate::coordinator::GroupCoordinator::broadcast_group
	pub txid: Txid,
	/// The channel we opened to our partner, for channel groups.
	pub channel: Option<PendingChannel>,
	/// The outputs the joint transaction pays to us, each of the group's capacity.
	pub funding_scripts: Vec<ScriptBuf>,
	/// A signed transaction spending our inputs back to us at a lower feerate, to be broadcast
	/// if the joint transaction never confirms. `None` if our inputs are too small to pay for
	/// it.
	pub conflict_transaction: Option<Transaction>,
}

/// Everything we have to undo if the group fails.
#[derive(Default)]
struct Reservations {
	channel: Option<PendingChannel>,
	locked: Vec<OutPoint>,
	conflict: Option<Transaction>,
	signed: bool,
}

/// Picks coins to fund `funding`, each output of `capacity`, plus our share of the fees at
/// `rate` sat/vB.
///
/// Coins are taken smallest first, skipping any worth less than the fee to spend them, until
/// they cover the worst-case fee share the coordinator will check the proposal against.
pub fn select_coins(
	available: Vec<UtxoDescriptor>, funding: Vec<ScriptBuf>, change: ScriptBuf, capacity: Amount,
	rate: u64,
) -> Result<MemberProposal, MemberError> {
	let mut candidates: Vec<UtxoDescriptor> = available
		.into_iter()
		.filter(|utxo| match utxo.input_weight() {
			Ok(weight) => utxo.value() > member_fee(weight, 0, 1, rate),
			Err(_) => false,
		})
		.collect();
	candidates.sort_by_key(|utxo| utxo.value());

	let mut proposal = MemberProposal { funding, change: Some(change), utxos: Vec::new() };
	let committed = proposal.committed_value(capacity)?;
	for utxo in candidates {
		proposal.utxos.push(utxo);
		if proposal.utxos.len() > MAX_PROPOSAL_UTXOS as usize {
			proposal.utxos.remove(0);
		}
		let required = committed
			.checked_add(max_member_fee(proposal.weight()?, rate))
			.ok_or(AssemblyError::Overflow)?;
		if proposal.input_value()? >= required {
			return Ok(proposal);
		}
	}
	Err(MemberError::InsufficientFunds)
}

/// Takes part in a single group on behalf of the local node.
///
/// The coordinator's own node takes part through a [`GroupMember`] too, using a transport which
/// delivers requests to the local [`GroupCoordinator`].
///
/// [`GroupCoordinator`]: crate::coordinator::GroupCoordinator
pub struct GroupMember<T: Deref, W: Deref, N: Deref, B: Deref, L: Deref>
where
	T::Target: GroupTransport,
	W::Target: GroupWallet,
	N::Target: GroupNode,
	B::Target: BroadcasterInterface,
	L::Target: Logger,
{
	our_node_id: PublicKey,
	coordinator_id: PublicKey,
	group_id: GroupId,
	kind: GroupKind,
	config: MemberConfig,
	transport: T,
	wallet: W,
	node: N,
	broadcaster: B,
	logger: L,
}

impl<T: Deref, W: Deref, N: Deref, B: Deref, L: Deref> GroupMember<T, W, N, B, L>
where
	T::Target: GroupTransport,
	W::Target: GroupWallet,
	N::Target: GroupNode,
	B::Target: BroadcasterInterface,
	L::Target: Logger,
{
	/// Prepares to join the group `group_id` of the given kind run by `coordinator_id`.
	pub fn new(
		our_node_id: PublicKey, coordinator_id: PublicKey, group_id: GroupId, kind: GroupKind,
		config: MemberConfig, transport: T, wallet: W, node: N, broadcaster: B, logger: L,
	) -> Self {
		GroupMember {
			our_node_id,
			coordinator_id,
			group_id,
			kind,
			config,
			transport,
			wallet,
			node,
			broadcaster,
			logger,
		}
	}

	/// Runs through the whole group, returning once every member signed the joint transaction.
	///
	/// On failure, any pending channel is cancelled and reserved coins are released before the
	/// error is returned.
	pub async fn run(&self) -> Result<GroupOutcome, MemberError> {
		let logger = WithContext::from(&self.logger, Some(self.coordinator_id), Some(self.group_id));
		let details = self.fetch_details(&logger).await?;
		log_info!(
			logger,
			"Joining {:?} group of {} members with capacity {} sat at {} sat/vB",
			self.kind,
			details.count,
			details.capacity,
			details.rate
		);
		self.await_membership(&details, &logger).await?;
		log_info!(logger, "Group membership is locked");

		let mut reservations = Reservations::default();
		let res = self.fund_and_sign(&details, &mut reservations, &logger).await;
		if let Err(e) = &res {
			log_error!(logger, "Leaving group: {:?}", e);
			self.abandon(reservations, &logger).await;
		}
		res
	}

	async fn request(&self, request: Message) -> Result<Message, MemberError> {
		match self.transport.send_request(self.coordinator_id, request).await? {
			Message::GroupError(msg) if msg.group_id == self.group_id => {
				Err(MemberError::Rejected(msg.error))
			},
			reply if reply.group_id() == Some(self.group_id) => Ok(reply),
			_ => Err(MemberError::UnexpectedResponse),
		}
	}

	async fn fetch_details(
		&self, logger: &WithContext<'_, L>,
	) -> Result<GroupDetails, MemberError> {
		let group_id = self.group_id;
		retry_until_ready(&self.config.details, "group details", &logger, || async move {
			match self.request(Message::GetGroupDetails(GetGroupDetails { group_id })).await? {
				Message::GroupDetails(details) => Ok(Attempt::Done(details)),
				_ => Err(MemberError::UnexpectedResponse),
			}
		})
		.await
	}

	async fn await_membership(
		&self, details: &GroupDetails, logger: &WithContext<'_, L>,
	) -> Result<(), MemberError> {
		let group_id = self.group_id;
		let count = details.count;
		retry_until_ready(&self.config.membership, "membership", &logger, || async move {
			match self.request(Message::ConfirmMembership(ConfirmMembership { group_id })).await? {
				Message::ConnectedCount(reply) if reply.count >= count => Ok(Attempt::Done(())),
				Message::ConnectedCount(_) => Ok(Attempt::NotReady),
				_ => Err(MemberError::UnexpectedResponse),
			}
		})
		.await
	}

	/// The member we open our channel to.
	async fn find_partner(
		&self, details: &GroupDetails, logger: &WithContext<'_, L>,
	) -> Result<PublicKey, MemberError> {
		// A pair has no ring to look up. The other member is the coordinator, or for the
		// coordinator itself the one other member it locked in.
		if details.count == 2 {
			if self.our_node_id != self.coordinator_id {
				return Ok(self.coordinator_id);
			}
			let members = self.transport.local_members(&self.group_id).unwrap_or_default();
			if let Some(partner) = members.into_iter().find(|id| *id != self.our_node_id) {
				return Ok(partner);
			}
		}
		let group_id = self.group_id;
		let partners = retry_until_ready(&self.config.partners, "partners", &logger, || async move {
			match self.request(Message::FindPartners(FindPartners { group_id })).await? {
				Message::PartnersRecord(record) => Ok(Attempt::Done(record)),
				_ => Err(MemberError::UnexpectedResponse),
			}
		})
		.await?;
		log_debug!(logger, "Our partners are {} and {}", partners.inbound, partners.outbound);
		Ok(partners.outbound)
	}

	/// Tells the coordinator we are still around while a local step takes its time.
	///
	/// Lost heartbeats are not an error, the next one may get through. A coordinator which
	/// gave up on the group is.
	async fn heartbeat(&self, logger: &WithContext<'_, L>) -> Result<(), MemberError> {
		let group_id = self.group_id;
		match self.request(Message::ConfirmMembership(ConfirmMembership { group_id })).await {
			Ok(_) => Ok(()),
			Err(e) if e.is_retryable() => {
				log_trace!(logger, "Heartbeat was not answered: {:?}", e);
				Ok(())
			},
			Err(e) => Err(e),
		}
	}

	async fn connect(
		&self, partner: PublicKey, details: &GroupDetails, logger: &WithContext<'_, L>,
	) -> Result<(), MemberError> {
		retry_until_ready(&self.config.connect, "connecting to partner", &logger, || async move {
			let connected = self.node.connect_peer(partner).await.is_ok();
			// The connection budget outlasts the coordinator's patience with silent members.
			self.heartbeat(logger).await?;
			if connected {
				Ok::<_, MemberError>(Attempt::Done(()))
			} else {
				Ok(Attempt::NotReady)
			}
		})
		.await?;
		log_debug!(logger, "Connected to {}, waiting for the rest of the group", partner);

		let group_id = self.group_id;
		let count = details.count;
		retry_until_ready(&self.config.connect, "connections", &logger, || async move {
			match self.request(Message::ConfirmConnected(ConfirmConnected { group_id })).await? {
				Message::ConnectedCount(reply) if reply.count >= count => Ok(Attempt::Done(())),
				Message::ConnectedCount(_) => Ok(Attempt::NotReady),
				_ => Err(MemberError::UnexpectedResponse),
			}
		})
		.await
	}

	/// The outputs we ask the joint transaction to fund.
	async fn funding_scripts(
		&self, details: &GroupDetails, reservations: &mut Reservations,
		logger: &WithContext<'_, L>,
	) -> Result<Vec<ScriptBuf>, MemberError> {
		match self.kind {
			GroupKind::Channel => {
				let partner = self.find_partner(details, logger).await?;
				self.connect(partner, details, logger).await?;
				let capacity = Amount::from_sat(details.capacity);
				let channel = self
					.node
					.open_pending_channel(partner, capacity, details.rate)
					.await
					.map_err(|()| MemberError::Node)?;
				log_info!(
					logger,
					"Opened pending channel {} to {}",
					log_bytes!(channel.channel_id),
					partner
				);
				let script = channel.funding_script.clone();
				reservations.channel = Some(channel);
				self.heartbeat(logger).await?;
				Ok(vec![script])
			},
			GroupKind::Fanout => {
				let outputs = self.config.fanout_outputs.max(1);
				let mut scripts = Vec::with_capacity(outputs);
				for _ in 0..outputs {
					scripts.push(self.wallet.get_new_script().await.map_err(|()| MemberError::Wallet)?);
				}
				Ok(scripts)
			},
		}
	}

	async fn fund_and_sign(
		&self, details: &GroupDetails, reservations: &mut Reservations,
		logger: &WithContext<'_, L>,
	) -> Result<GroupOutcome, MemberError> {
		let capacity = Amount::from_sat(details.capacity);
		let funding = self.funding_scripts(details, reservations, logger).await?;
		let change = self.wallet.get_change_script().await.map_err(|()| MemberError::Wallet)?;
		let available = self.wallet.list_confirmed_utxos().await.map_err(|()| MemberError::Wallet)?;
		let proposal = select_coins(available, funding, change.clone(), capacity, details.rate)?;

		let outpoints: Vec<OutPoint> = proposal.outpoints().collect();
		self.wallet.lock_utxos(&outpoints).await.map_err(|()| MemberError::Wallet)?;
		log_debug!(logger, "Reserved {}", log_outpoints!(outpoints));
		reservations.locked = outpoints;

		let unsigned = self.propose(&proposal, logger).await?;
		verify_contribution(&unsigned, &proposal, capacity, details.rate, details.count as usize)
			.map_err(|err| MemberError::VerificationFailed { err })?;
		let txid = unsigned.unsigned_tx.compute_txid();
		log_info!(logger, "Joint transaction {} pays what we asked for, signing it", txid);

		let signed = self.sign(&unsigned, &proposal).await?;
		reservations.conflict = self.sign_conflict(&proposal, &change, details.rate, logger).await?;
		reservations.signed = true;
		self.submit_signatures(signed, details, logger).await?;
		log_info!(logger, "Every member signed joint transaction {}", txid);

		Ok(GroupOutcome {
			txid,
			channel: reservations.channel.clone(),
			funding_scripts: proposal.funding,
			conflict_transaction: reservations.conflict.clone(),
		})
	}

	async fn propose(
		&self, proposal: &MemberProposal, logger: &WithContext<'_, L>,
	) -> Result<Psbt, MemberError> {
		let msg = proposal.to_msg(self.group_id);
		let kind = self.kind;
		retry_until_ready(&self.config.propose, "proposal", &logger, || {
			let request = match kind {
				GroupKind::Channel => Message::RegisterPendingOpen(msg.clone()),
				GroupKind::Fanout => Message::RegisterPendingFanout(msg.clone()),
			};
			async move {
				match self.request(request).await? {
					Message::UnsignedFunding(reply) => Ok(Attempt::Done(reply.psbt)),
					Message::FundingPending(_) => Ok(Attempt::NotReady),
					_ => Err(MemberError::UnexpectedResponse),
				}
			}
		})
		.await
	}

	/// Has the wallet sign our inputs of the joint transaction.
	async fn sign(&self, unsigned: &Psbt, proposal: &MemberProposal) -> Result<Psbt, MemberError> {
		let mut psbt = unsigned.clone();
		// The coordinator never sees our key origins, put them back for the signer.
		for utxo in proposal.utxos.iter() {
			let position =
				psbt.unsigned_tx.input.iter().position(|txin| txin.previous_output == utxo.outpoint);
			if let Some(idx) = position {
				utxo.populate_psbt_input(&mut psbt.inputs[idx]);
			}
		}
		let mut signed = self.wallet.sign_psbt(psbt).await.map_err(|()| MemberError::Wallet)?;
		let owned: Vec<OutPoint> = proposal.outpoints().collect();
		verify_member_signatures(unsigned, &signed, &owned)?;
		signed.inputs.iter_mut().for_each(strip_key_origins);
		Ok(signed)
	}

	async fn sign_conflict(
		&self, proposal: &MemberProposal, destination: &ScriptBuf, rate: u64,
		logger: &WithContext<'_, L>,
	) -> Result<Option<Transaction>, MemberError> {
		let rate = conflict_feerate(rate, self.config.conflict_feerate_divisor);
		let psbt = match build_conflict_transaction(&proposal.utxos, destination, rate)? {
			Some(psbt) => psbt,
			None => {
				log_debug!(logger, "Our inputs cannot pay for a conflict transaction");
				return Ok(None);
			},
		};
		let signed = self.wallet.sign_psbt(psbt).await.map_err(|()| MemberError::Wallet)?;
		let tx = finalize_own_psbt(&signed)?;
		log_debug!(logger, "Pre-signed conflict transaction {}", tx.compute_txid());
		Ok(Some(tx))
	}

	async fn submit_signatures(
		&self, signed: Psbt, details: &GroupDetails, logger: &WithContext<'_, L>,
	) -> Result<(), MemberError> {
		let msg = SignedFunding { group_id: self.group_id, psbt: signed };
		let kind = self.kind;
		let count = details.count;
		retry_until_ready(&self.config.sign, "signatures", &logger, || {
			let request = match kind {
				GroupKind::Channel => Message::RegisterSignedOpen(msg.clone()),
				GroupKind::Fanout => Message::RegisterSignedFanout(msg.clone()),
			};
			async move {
				match self.request(request).await? {
					Message::SignedCount(reply) if reply.count >= count => Ok(Attempt::Done(())),
					Message::SignedCount(_) => Ok(Attempt::NotReady),
					_ => Err(MemberError::UnexpectedResponse),
				}
			}
		})
		.await
	}

	/// Undoes whatever we reserved for a group which will not complete.
	async fn abandon(&self, reservations: Reservations, logger: &WithContext<'_, L>) {
		if let Some(channel) = &reservations.channel {
			match self.node.cancel_pending_channel(channel).await {
				Ok(()) => {
					log_debug!(logger, "Cancelled pending channel {}", log_bytes!(channel.channel_id));
				},
				Err(()) => {
					log_warn!(logger, "Failed to cancel pending channel {}", log_bytes!(channel.channel_id));
				},
			}
		}
		if let (true, Some(conflict)) = (reservations.signed, &reservations.conflict) {
			log_warn!(
				logger,
				"Broadcasting conflict transaction {} to reclaim our inputs",
				conflict.compute_txid()
			);
			let res =
				broadcast_transaction(&self.broadcaster, conflict, &self.config.broadcast, &logger)
					.await;
			if let Err(e) = res {
				log_error!(logger, "Failed to broadcast conflict transaction: {:?}", e);
			}
		}
		if !reservations.locked.is_empty() {
			match self.wallet.unlock_utxos(&reservations.locked).await {
				Ok(()) => {
					log_debug!(logger, "Released {}", log_outpoints!(reservations.locked));
				},
				Err(()) => {
					log_warn!(logger, "Failed to release {}", log_outpoints!(reservations.locked));
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::coordinator::{GroupCoordinator, GroupPhase};
	use crate::events::Event;
	use crate::interfaces::KeysEntropySource;
	use crate::types::GroupParams;
	use crate::util::config::{CoordinatorConfig, RetryConfig};
	use crate::util::errors::{BroadcastError, CompletionError, GroupError};
	use crate::util::test_utils::{
		p2wpkh_script, pubkey, utxo, TestBroadcaster, TestLogger, TestNode, TestTimeProvider,
		TestTransport, TestWallet,
	};

	use core::sync::atomic::{AtomicBool, Ordering};
	use core::time::Duration;
	use std::collections::HashSet;
	use std::sync::Arc;

	fn quick_config() -> MemberConfig {
		let quick = RetryConfig::fixed(Duration::from_millis(1), 500);
		MemberConfig {
			details: quick,
			membership: quick,
			partners: quick,
			connect: quick,
			propose: quick,
			sign: quick,
			broadcast: RetryConfig::fixed(Duration::from_millis(1), 5),
			conflict_feerate_divisor: 2,
			fanout_outputs: 1,
		}
	}

	fn params(kind: GroupKind, count: u16) -> GroupParams {
		GroupParams { kind, capacity: Amount::from_sat(100_000), count, rate: 1, allowed: None }
	}

	#[test]
	fn coin_selection() {
		let script = p2wpkh_script(1);
		let coins = vec![
			utxo(1, 0, script.clone(), 80_000),
			utxo(1, 1, script.clone(), 50),
			utxo(1, 2, script.clone(), 30_000),
			utxo(1, 3, script.clone(), 500_000),
		];
		let capacity = Amount::from_sat(100_000);

		let proposal =
			select_coins(coins.clone(), vec![p2wpkh_script(2)], script.clone(), capacity, 10).unwrap();
		// The smallest coins which do the job, skipping the one not worth spending.
		let picked: HashSet<u32> = proposal.utxos.iter().map(|u| u.outpoint.vout).collect();
		assert_eq!(picked, [0, 2].into_iter().collect());
		let required = capacity + max_member_fee(proposal.weight().unwrap(), 10);
		assert!(proposal.input_value().unwrap() >= required);

		let two_outputs = vec![p2wpkh_script(2), p2wpkh_script(3)];
		let proposal =
			select_coins(coins.clone(), two_outputs, script.clone(), capacity, 10).unwrap();
		assert_eq!(proposal.utxos.len(), 3);

		assert_eq!(
			select_coins(coins, vec![p2wpkh_script(2); 7], script, capacity, 10),
			Err(MemberError::InsufficientFunds)
		);
	}

	#[tokio::test]
	async fn three_member_ring() {
		let entropy = KeysEntropySource::new(&[1; 32]);
		let logger = TestLogger::new();
		let time = TestTimeProvider::new();
		let coordinator =
			GroupCoordinator::new(pubkey(1), CoordinatorConfig::default(), &entropy, &logger, &time);
		let group_id = coordinator.create_group(params(GroupKind::Channel, 3)).unwrap();

		let wallets: Vec<TestWallet> =
			(1..=3).map(|seed| TestWallet::new(seed, &[40_000, 1_000_000, 70_000])).collect();
		let nodes: Vec<TestNode> = (1..=3).map(|seed| TestNode::new(pubkey(seed))).collect();
		let transports: Vec<TestTransport> =
			(1..=3).map(|seed| TestTransport::new(&coordinator, pubkey(seed))).collect();
		let broadcaster = TestBroadcaster::new();
		let members: Vec<_> = (0..3)
			.map(|idx| {
				GroupMember::new(
					pubkey(idx as u8 + 1),
					pubkey(1),
					group_id,
					GroupKind::Channel,
					quick_config(),
					&transports[idx],
					&wallets[idx],
					&nodes[idx],
					&broadcaster,
					&logger,
				)
			})
			.collect();

		let (a, b, c) = tokio::join!(members[0].run(), members[1].run(), members[2].run());
		let outcomes = [a.unwrap(), b.unwrap(), c.unwrap()];
		let txid = outcomes[0].txid;
		assert!(outcomes.iter().all(|outcome| outcome.txid == txid));

		// Channels form a single ring.
		let mut counterparties = HashSet::new();
		for (idx, outcome) in outcomes.iter().enumerate() {
			let channel = outcome.channel.clone().unwrap();
			assert_ne!(channel.counterparty_node_id, pubkey(idx as u8 + 1));
			assert!(counterparties.insert(channel.counterparty_node_id));
			assert_eq!(*nodes[idx].opened.lock().unwrap(), vec![channel]);
			assert!(nodes[idx].cancelled.lock().unwrap().is_empty());
			// Two coins are enough, and they stay reserved for the joint transaction.
			assert_eq!(wallets[idx].locked_outpoints().len(), 2);
			let conflict = outcome.conflict_transaction.as_ref().unwrap();
			let spent: HashSet<OutPoint> = conflict.input.iter().map(|i| i.previous_output).collect();
			assert_eq!(spent, wallets[idx].locked_outpoints());
		}
		assert_eq!(counterparties.len(), 3);

		assert_eq!(coordinator.group_phase(&group_id), Some(GroupPhase::Signed));
		let events = coordinator.get_and_clear_pending_events();
		assert_eq!(events.len(), 4);
		assert!(matches!(events[0], Event::MembersJoined { .. }));
		assert_eq!(events[1], Event::MembersConnected { group_id });
		assert!(matches!(events[2], Event::FundingAssembled { .. }));
		assert_eq!(events[3], Event::SignaturesCollected { group_id });

		let tx = coordinator.combined_transaction(&group_id).unwrap();
		assert_eq!(tx.compute_txid(), txid);
		for outcome in outcomes.iter() {
			let script = &outcome.channel.as_ref().unwrap().funding_script;
			assert!(tx
				.output
				.iter()
				.any(|o| o.script_pubkey == *script && o.value == Amount::from_sat(100_000)));
		}

		// A rejected broadcast leaves the group in place to try again.
		let rejected = BroadcastError::Rejected { err: "min relay fee not met".to_owned() };
		broadcaster.fail_next(1, rejected.clone());
		assert_eq!(
			coordinator.broadcast_group(&group_id, &&broadcaster).await,
			Err(CompletionError::Broadcast(rejected))
		);
		assert_eq!(coordinator.group_phase(&group_id), Some(GroupPhase::Signed));
		assert_eq!(coordinator.broadcast_group(&group_id, &&broadcaster).await, Ok(txid));
		assert_eq!(broadcaster.txn_broadcasted(), vec![tx]);
		assert_eq!(broadcaster.attempts(), 2);
		assert_eq!(coordinator.group_phase(&group_id), None);
	}

	#[tokio::test]
	async fn slow_connection_keeps_membership_alive() {
		let entropy = KeysEntropySource::new(&[5; 32]);
		let logger = TestLogger::new();
		let time = Arc::new(TestTimeProvider::new());
		let coordinator =
			GroupCoordinator::new(pubkey(1), CoordinatorConfig::default(), &entropy, &logger, &*time);
		let group_id = coordinator.create_group(params(GroupKind::Channel, 3)).unwrap();

		let wallets: Vec<TestWallet> = (1..=3).map(|seed| TestWallet::new(seed, &[500_000])).collect();
		let nodes: Vec<TestNode> = (1..=3).map(|seed| TestNode::new(pubkey(seed))).collect();
		// The last member needs fourteen minutes to reach its partner, well past the ten the
		// coordinator waits for a silent member.
		nodes[2].slow_connect(6, Arc::clone(&time), Duration::from_secs(120));
		let transports: Vec<TestTransport> =
			(1..=3).map(|seed| TestTransport::new(&coordinator, pubkey(seed))).collect();
		let broadcaster = TestBroadcaster::new();
		let members: Vec<_> = (0..3)
			.map(|idx| {
				GroupMember::new(
					pubkey(idx as u8 + 1),
					pubkey(1),
					group_id,
					GroupKind::Channel,
					quick_config(),
					&transports[idx],
					&wallets[idx],
					&nodes[idx],
					&broadcaster,
					&logger,
				)
			})
			.collect();

		let done = AtomicBool::new(false);
		let group = async {
			let res = tokio::join!(members[0].run(), members[1].run(), members[2].run());
			done.store(true, Ordering::Release);
			res
		};
		let ticker = async {
			while !done.load(Ordering::Acquire) {
				coordinator.timer_tick_occurred();
				tokio::time::sleep(Duration::from_millis(1)).await;
			}
		};
		let ((a, b, c), ()) = tokio::join!(group, ticker);
		let txid = a.unwrap().txid;
		assert_eq!(b.unwrap().txid, txid);
		assert_eq!(c.unwrap().txid, txid);

		assert_eq!(*nodes[2].connected.lock().unwrap(), vec![pubkey(1)]);
		assert_eq!(coordinator.group_phase(&group_id), Some(GroupPhase::Signed));
		let events = coordinator.get_and_clear_pending_events();
		assert!(!events.iter().any(|event| matches!(event, Event::GroupFailed { .. })));
		logger.assert_log_contains("lightning_channel_group::coordinator", "dropped out", 0);
	}

	#[tokio::test]
	async fn pair_skips_partner_lookup() {
		let entropy = KeysEntropySource::new(&[2; 32]);
		let logger = TestLogger::new();
		let time = TestTimeProvider::new();
		let coordinator =
			GroupCoordinator::new(pubkey(1), CoordinatorConfig::default(), &entropy, &logger, &time);
		let group_id = coordinator.create_group(params(GroupKind::Channel, 2)).unwrap();

		let alice_wallet = TestWallet::new(1, &[300_000]);
		let bob_wallet = TestWallet::new_taproot(2, &[250_000]);
		let alice_node = TestNode::new(pubkey(1));
		let bob_node = TestNode::new(pubkey(2));
		let alice_transport = TestTransport::new(&coordinator, pubkey(1));
		let bob_transport = TestTransport::new(&coordinator, pubkey(2));
		// Lost requests are simply retried.
		bob_transport.drop_next(3);
		let broadcaster = TestBroadcaster::new();

		let alice = GroupMember::new(
			pubkey(1), pubkey(1), group_id, GroupKind::Channel, quick_config(),
			&alice_transport, &alice_wallet, &alice_node, &broadcaster, &logger,
		);
		let bob = GroupMember::new(
			pubkey(2), pubkey(1), group_id, GroupKind::Channel, quick_config(),
			&bob_transport, &bob_wallet, &bob_node, &broadcaster, &logger,
		);
		let (a, b) = tokio::join!(alice.run(), bob.run());
		let (a, b) = (a.unwrap(), b.unwrap());
		assert_eq!(a.txid, b.txid);
		assert_eq!(a.channel.unwrap().counterparty_node_id, pubkey(2));
		assert_eq!(b.channel.unwrap().counterparty_node_id, pubkey(1));
		// Neither side looks up the ring, and key origins stay with each signer.
		logger.assert_log_contains("lightning_channel_group::member", "Our partners are", 0);
		for transport in [&alice_transport, &bob_transport] {
			let sent = transport.sent.lock().unwrap();
			assert!(!sent.iter().any(|msg| matches!(msg, Message::FindPartners(_))));
			let signed: Vec<&Psbt> = sent
				.iter()
				.filter_map(|msg| match msg {
					Message::RegisterSignedOpen(funding) => Some(&funding.psbt),
					_ => None,
				})
				.collect();
			assert!(!signed.is_empty());
			for input in signed.iter().flat_map(|psbt| psbt.inputs.iter()) {
				assert!(input.bip32_derivation.is_empty());
				assert!(input.tap_internal_key.is_none());
				assert!(input.tap_key_origins.is_empty());
			}
		}

		let tx = coordinator.combined_transaction(&group_id).unwrap();
		assert_eq!(tx.output.iter().filter(|o| o.value == Amount::from_sat(100_000)).count(), 2);
	}

	#[tokio::test]
	async fn outsider_is_turned_away() {
		let entropy = KeysEntropySource::new(&[3; 32]);
		let logger = TestLogger::new();
		let time = TestTimeProvider::new();
		let coordinator =
			GroupCoordinator::new(pubkey(1), CoordinatorConfig::default(), &entropy, &logger, &time);
		let mut p = params(GroupKind::Channel, 3);
		p.allowed = Some(vec![pubkey(2), pubkey(3)]);
		let group_id = coordinator.create_group(p).unwrap();

		let wallet = TestWallet::new(4, &[1_000_000]);
		let node = TestNode::new(pubkey(4));
		let transport = TestTransport::new(&coordinator, pubkey(4));
		let broadcaster = TestBroadcaster::new();
		let outsider = GroupMember::new(
			pubkey(4), pubkey(1), group_id, GroupKind::Channel, quick_config(),
			&transport, &wallet, &node, &broadcaster, &logger,
		);
		assert_eq!(outsider.run().await, Err(MemberError::Rejected(GroupError::MembershipDenied)));
		assert!(node.opened.lock().unwrap().is_empty());
		assert!(wallet.locked_outpoints().is_empty());
		assert_eq!(coordinator.member_count(&group_id), Some(1));
	}

	#[tokio::test]
	async fn failed_signer_releases_and_others_reclaim() {
		let entropy = KeysEntropySource::new(&[4; 32]);
		let logger = TestLogger::new();
		let time = TestTimeProvider::new();
		let coordinator =
			GroupCoordinator::new(pubkey(1), CoordinatorConfig::default(), &entropy, &logger, &time);
		let group_id = coordinator.create_group(params(GroupKind::Fanout, 2)).unwrap();

		let hub_wallet = TestWallet::new_taproot(1, &[500_000]);
		let member_wallet = TestWallet::new(2, &[300_000]);
		member_wallet.fail_signing.store(true, core::sync::atomic::Ordering::Release);
		let hub_node = TestNode::new(pubkey(1));
		let member_node = TestNode::new(pubkey(2));
		let hub_transport = TestTransport::new(&coordinator, pubkey(1));
		let member_transport = TestTransport::new(&coordinator, pubkey(2));
		let broadcaster = TestBroadcaster::new();

		let mut hub_config = quick_config();
		hub_config.sign = RetryConfig::fixed(Duration::from_millis(1), 20);
		let hub = GroupMember::new(
			pubkey(1), pubkey(1), group_id, GroupKind::Fanout, hub_config,
			&hub_transport, &hub_wallet, &hub_node, &broadcaster, &logger,
		);
		let member = GroupMember::new(
			pubkey(2), pubkey(1), group_id, GroupKind::Fanout, quick_config(),
			&member_transport, &member_wallet, &member_node, &broadcaster, &logger,
		);
		let (hub_res, member_res) = tokio::join!(hub.run(), member.run());

		assert_eq!(member_res, Err(MemberError::Wallet));
		assert!(member_wallet.locked_outpoints().is_empty());
		assert_eq!(hub_res, Err(MemberError::RetriesExhausted { operation: "signatures" }));
		assert!(hub_wallet.locked_outpoints().is_empty());
		assert_eq!(coordinator.group_phase(&group_id), Some(GroupPhase::Signing));

		// Only the member which handed out its signatures reclaims its coins.
		let broadcast = broadcaster.txn_broadcasted();
		assert_eq!(broadcast.len(), 1);
		assert_eq!(broadcast[0].input.len(), 1);
		assert_eq!(broadcast[0].input[0].previous_output, hub_wallet.utxos()[0].outpoint);
		assert_eq!(broadcast[0].output[0].script_pubkey, hub_wallet.change_script());
		logger.assert_log_contains("lightning_channel_group::member", "Broadcasting conflict transaction", 1);
		assert!(hub_node.opened.lock().unwrap().is_empty());
	}
}
