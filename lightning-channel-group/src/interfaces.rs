// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits for the services a group needs from the node hosting it: randomness, a wallet, channel
//! management, transaction broadcast and a way to reach the coordinator.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction};

use core::future::Future;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::types::GroupId;
use crate::util::errors::{BroadcastError, TransportError};
use crate::utxo::UtxoDescriptor;
use crate::wire::Message;

/// A trait that describes a source of entropy.
pub trait EntropySource {
	/// Gets a unique, cryptographically-secure, random 32-byte value. This method must return a
	/// different value each time it is called.
	fn get_secure_random_bytes(&self) -> [u8; 32];
}

/// An [`EntropySource`] expanding a single secret seed with a counter.
///
/// The seed must be generated from a secure source of randomness and must not be reused across
/// instances, as two instances created from the same seed return the same bytes.
pub struct KeysEntropySource {
	seed: [u8; 32],
	index: AtomicU64,
}

impl KeysEntropySource {
	/// Creates a new entropy source from a 32-byte secret seed.
	pub fn new(seed: &[u8; 32]) -> Self {
		KeysEntropySource { seed: *seed, index: AtomicU64::new(0) }
	}
}

impl EntropySource for KeysEntropySource {
	fn get_secure_random_bytes(&self) -> [u8; 32] {
		let index = self.index.fetch_add(1, Ordering::AcqRel);
		let mut engine = Sha256::engine();
		engine.input(&self.seed);
		engine.input(&index.to_be_bytes());
		Sha256::from_engine(engine).to_byte_array()
	}
}

/// An interface to send a transaction to the Bitcoin network.
pub trait BroadcasterInterface {
	/// Sends a transaction out to (hopefully) be mined.
	///
	/// Implementations should return `Ok(())` if the transaction is already known to the
	/// backend, since members may broadcast the same joint transaction more than once.
	fn broadcast_transaction<'a>(
		&'a self, tx: &'a Transaction,
	) -> impl Future<Output = Result<(), BroadcastError>> + Send + 'a;
}

/// The wallet of a group member: coin inventory, fresh scripts and signing.
// Note that the coins listed must carry a `KeyOrigin` if the signer relies on PSBT derivation
// metadata to find its keys.
pub trait GroupWallet {
	/// Returns all coins, with at least 1 confirmation each, that are available to spend.
	fn list_confirmed_utxos<'a>(
		&'a self,
	) -> impl Future<Output = Result<Vec<UtxoDescriptor>, ()>> + Send + 'a;

	/// Returns a script to use for change.
	fn get_change_script<'a>(&'a self) -> impl Future<Output = Result<ScriptBuf, ()>> + Send + 'a;

	/// Returns a fresh script to receive one of our fanout outputs.
	fn get_new_script<'a>(&'a self) -> impl Future<Output = Result<ScriptBuf, ()>> + Send + 'a;

	/// Reserves coins so that nothing else spends them while the group runs.
	fn lock_utxos<'a>(
		&'a self, outpoints: &'a [OutPoint],
	) -> impl Future<Output = Result<(), ()>> + Send + 'a;

	/// Releases coins previously reserved with [`GroupWallet::lock_utxos`].
	fn unlock_utxos<'a>(
		&'a self, outpoints: &'a [OutPoint],
	) -> impl Future<Output = Result<(), ()>> + Send + 'a;

	/// Adds signatures for every input of `psbt` the wallet owns, leaving the others untouched.
	///
	/// Signatures may be returned either as partial signatures or as finalized witnesses, but
	/// must commit to the whole transaction (`SIGHASH_ALL` or, for Taproot, `SIGHASH_DEFAULT`).
	fn sign_psbt<'a>(&'a self, psbt: Psbt) -> impl Future<Output = Result<Psbt, ()>> + Send + 'a;
}

/// A channel whose funding output is awaiting the joint transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingChannel {
	/// The node's identifier for the channel.
	pub channel_id: [u8; 32],
	/// The peer the channel is opened to.
	pub counterparty_node_id: PublicKey,
	/// The script the joint transaction must pay the channel's capacity to.
	pub funding_script: ScriptBuf,
}

/// The Lightning node hosting a group member.
pub trait GroupNode {
	/// Connects to `node_id`, returning once the connection is established.
	fn connect_peer<'a>(
		&'a self, node_id: PublicKey,
	) -> impl Future<Output = Result<(), ()>> + Send + 'a;

	/// Starts opening a channel of `capacity` to `counterparty_node_id` whose funding is
	/// provided externally, returning the funding output script once both sides agreed on it.
	fn open_pending_channel<'a>(
		&'a self, counterparty_node_id: PublicKey, capacity: Amount, rate: u64,
	) -> impl Future<Output = Result<PendingChannel, ()>> + Send + 'a;

	/// Abandons a channel opened with [`GroupNode::open_pending_channel`] which will not be
	/// funded.
	fn cancel_pending_channel<'a>(
		&'a self, channel: &'a PendingChannel,
	) -> impl Future<Output = Result<(), ()>> + Send + 'a;
}

/// Delivers requests to a group's coordinator and returns its reply.
pub trait GroupTransport {
	/// Sends `request` to `coordinator` and waits for the reply.
	fn send_request<'a>(
		&'a self, coordinator: PublicKey, request: Message,
	) -> impl Future<Output = Result<Message, TransportError>> + Send + 'a;

	/// The locked members of `group_id` in join order, if its coordinator runs on this node and
	/// can tell without a request.
	///
	/// This lets the coordinator's own member find its partner in a pair group.
	fn local_members(&self, _group_id: &GroupId) -> Option<Vec<PublicKey>> {
		None
	}
}
