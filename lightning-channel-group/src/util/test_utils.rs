// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::psbt::Psbt;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Keypair, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::transaction::Version;
use bitcoin::{absolute::LockTime, ecdsa, key::TweakedPublicKey, taproot};
use bitcoin::{
	Amount, CompressedPublicKey, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
	Witness,
};

use core::future::Future;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::coordinator::GroupCoordinator;
use crate::interfaces::{
	BroadcasterInterface, GroupNode, GroupTransport, GroupWallet, KeysEntropySource,
	PendingChannel,
};
use crate::types::GroupId;
use crate::util::errors::{BroadcastError, TransportError};
use crate::util::logger::{Level, Logger, Record};
use crate::util::time::TimeProvider;
use crate::utxo::{KeyOrigin, UtxoDescriptor};
use crate::wire::{self, Message as WireMessage};

pub fn secret_key(seed: u8) -> SecretKey {
	SecretKey::from_slice(&[seed; 32]).unwrap()
}

pub fn pubkey(seed: u8) -> PublicKey {
	PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret_key(seed))
}

pub fn p2wpkh_script(seed: u8) -> ScriptBuf {
	ScriptBuf::new_p2wpkh(&CompressedPublicKey(pubkey(seed)).wpubkey_hash())
}

/// A key-path-only Taproot script, committing to the untweaked key so that tests can sign with
/// the plain secret key.
pub fn p2tr_script(seed: u8) -> ScriptBuf {
	let (xonly, _) = pubkey(seed).x_only_public_key();
	ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(xonly))
}

/// The 2-of-2 multisig P2WSH output of a channel opened by `opener` to `counterparty`.
pub fn channel_funding_script(opener: &PublicKey, counterparty: &PublicKey) -> ScriptBuf {
	let redeem_script = Builder::new()
		.push_int(2)
		.push_key(&bitcoin::PublicKey::new(*opener))
		.push_key(&bitcoin::PublicKey::new(*counterparty))
		.push_int(2)
		.push_opcode(OP_CHECKMULTISIG)
		.into_script();
	ScriptBuf::new_p2wsh(&redeem_script.wscript_hash())
}

pub fn funding_script(seed: u8) -> ScriptBuf {
	channel_funding_script(&pubkey(seed), &pubkey(seed.wrapping_add(100).max(1)))
}

pub fn prev_tx(script: ScriptBuf, value_sats: u64) -> Transaction {
	Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: OutPoint { txid: Txid::from_byte_array([0xaa; 32]), vout: 3 },
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness: Witness::new(),
		}],
		output: vec![TxOut { value: Amount::from_sat(value_sats), script_pubkey: script }],
	}
}

pub fn utxo(seed: u8, vout: u32, script: ScriptBuf, value: u64) -> UtxoDescriptor {
	UtxoDescriptor::new(
		OutPoint { txid: Txid::from_byte_array([seed; 32]), vout },
		TxOut { value: Amount::from_sat(value), script_pubkey: script },
	)
}

/// A single-input, single-output PSBT carrying the spent output but no signatures.
pub fn sample_psbt() -> Psbt {
	let tx = Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: OutPoint { txid: Txid::from_byte_array([7; 32]), vout: 0 },
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness: Witness::new(),
		}],
		output: vec![TxOut { value: Amount::from_sat(40_000), script_pubkey: funding_script(7) }],
	};
	let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
	psbt.inputs[0].witness_utxo =
		Some(TxOut { value: Amount::from_sat(50_000), script_pubkey: p2wpkh_script(7) });
	psbt
}

pub struct TestLogger {
	level: Level,
	id: String,
	pub lines: Mutex<HashMap<(String, String), usize>>,
	pub context: Mutex<HashMap<(String, Option<PublicKey>, Option<GroupId>), usize>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		Self::with_id("".to_owned())
	}
	pub fn with_id(id: String) -> TestLogger {
		TestLogger {
			level: Level::Trace,
			id,
			lines: Mutex::new(HashMap::new()),
			context: Mutex::new(HashMap::new()),
		}
	}
	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}

	/// Search for the number of occurrence of the logged lines which
	/// 1. belongs to the specified module and
	/// 2. contains `line` in it.
	/// And asserts if the number of occurrences is the same with the given `count`
	pub fn assert_log_contains(&self, module: &str, line: &str, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| m == module && l.contains(line))
			.map(|(_, c)| c)
			.sum();
		assert_eq!(l, count)
	}

	pub fn assert_log_context_contains(
		&self, module: &str, peer_id: Option<PublicKey>, group_id: Option<GroupId>, count: usize,
	) {
		let context_entries = self.context.lock().unwrap();
		let l = context_entries.get(&(module.to_string(), peer_id, group_id)).unwrap();
		assert_eq!(*l, count)
	}
}

impl Logger for TestLogger {
	fn log(&self, record: Record) {
		let context =
			format!("{} {} [{}:{}]", self.id, record.level, record.module_path, record.line);
		let s = record.args.to_string();
		*self
			.lines
			.lock()
			.unwrap()
			.entry((record.module_path.to_string(), s.clone()))
			.or_insert(0) += 1;
		*self
			.context
			.lock()
			.unwrap()
			.entry((record.module_path.to_string(), record.peer_id, record.group_id))
			.or_insert(0) += 1;
		if record.level >= self.level {
			println!("{:<55} {}", context, s);
		}
	}
}

pub struct TestTimeProvider {
	now: Mutex<Duration>,
}

impl TestTimeProvider {
	pub fn new() -> Self {
		TestTimeProvider { now: Mutex::new(Duration::from_secs(1_700_000_000)) }
	}
	pub fn advance(&self, by: Duration) {
		*self.now.lock().unwrap() += by;
	}
}

impl TimeProvider for TestTimeProvider {
	fn duration_since_epoch(&self) -> Duration {
		*self.now.lock().unwrap()
	}
}

/// A wallet holding coins of a single key, which produces real signatures.
pub struct TestWallet {
	seed: u8,
	taproot: bool,
	coins: Vec<UtxoDescriptor>,
	pub locked: Mutex<HashSet<OutPoint>>,
	next_script: AtomicU32,
	pub fail_signing: AtomicBool,
}

impl TestWallet {
	/// A wallet with one P2WPKH coin of each of `values`.
	pub fn new(seed: u8, values: &[u64]) -> Self {
		Self::with_script(seed, false, p2wpkh_script(seed), values)
	}

	/// A wallet with one Taproot key-path coin of each of `values`.
	pub fn new_taproot(seed: u8, values: &[u64]) -> Self {
		Self::with_script(seed, true, p2tr_script(seed), values)
	}

	fn with_script(seed: u8, taproot: bool, script: ScriptBuf, values: &[u64]) -> Self {
		let key_origin = KeyOrigin {
			public_key: pubkey(seed),
			source: (Fingerprint::from([seed; 4]), DerivationPath::master()),
		};
		let coins = values
			.iter()
			.enumerate()
			.map(|(vout, value)| {
				let mut coin = utxo(seed, vout as u32, script.clone(), *value);
				coin.key_origin = Some(key_origin.clone());
				coin
			})
			.collect();
		TestWallet {
			seed,
			taproot,
			coins,
			locked: Mutex::new(HashSet::new()),
			next_script: AtomicU32::new(0),
			fail_signing: AtomicBool::new(false),
		}
	}

	pub fn utxos(&self) -> Vec<UtxoDescriptor> {
		self.coins.clone()
	}

	pub fn change_script(&self) -> ScriptBuf {
		if self.taproot {
			p2tr_script(self.seed)
		} else {
			p2wpkh_script(self.seed)
		}
	}

	pub fn locked_outpoints(&self) -> HashSet<OutPoint> {
		self.locked.lock().unwrap().clone()
	}

	/// Signs every input spending one of our coins.
	pub fn sign(&self, mut psbt: Psbt) -> Psbt {
		let secp_ctx = Secp256k1::new();
		let secret = secret_key(self.seed);
		let owned: HashSet<OutPoint> = self.coins.iter().map(|coin| coin.outpoint).collect();
		let prevouts: Vec<TxOut> =
			psbt.inputs.iter().filter_map(|input| input.witness_utxo.clone()).collect();
		{
			let mut cache = SighashCache::new(&psbt.unsigned_tx);
			for idx in 0..psbt.inputs.len() {
				if !owned.contains(&psbt.unsigned_tx.input[idx].previous_output) {
					continue;
				}
				let output = match &psbt.inputs[idx].witness_utxo {
					Some(output) => output.clone(),
					None => continue,
				};
				if self.taproot {
					let sighash = cache
						.taproot_key_spend_signature_hash(
							idx,
							&Prevouts::All(&prevouts),
							TapSighashType::Default,
						)
						.unwrap();
					let msg = Message::from_digest(sighash.to_byte_array());
					let keypair = Keypair::from_secret_key(&secp_ctx, &secret);
					let signature = secp_ctx.sign_schnorr_no_aux_rand(&msg, &keypair);
					psbt.inputs[idx].tap_key_sig =
						Some(taproot::Signature { signature, sighash_type: TapSighashType::Default });
				} else {
					let sighash = cache
						.p2wpkh_signature_hash(
							idx,
							&output.script_pubkey,
							output.value,
							EcdsaSighashType::All,
						)
						.unwrap();
					let msg = Message::from_digest(sighash.to_byte_array());
					let signature = secp_ctx.sign_ecdsa(&msg, &secret);
					let public_key = bitcoin::PublicKey::new(PublicKey::from_secret_key(&secp_ctx, &secret));
					psbt.inputs[idx]
						.partial_sigs
						.insert(public_key, ecdsa::Signature { signature, sighash_type: EcdsaSighashType::All });
				}
			}
		}
		psbt
	}

	fn fresh_script(&self) -> ScriptBuf {
		let index = self.next_script.fetch_add(1, Ordering::AcqRel);
		let mut engine = Sha256::engine();
		engine.input(&[self.seed]);
		engine.input(&index.to_be_bytes());
		let secret = SecretKey::from_slice(&Sha256::from_engine(engine).to_byte_array()).unwrap();
		let public_key = PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret);
		ScriptBuf::new_p2wpkh(&CompressedPublicKey(public_key).wpubkey_hash())
	}
}

impl GroupWallet for TestWallet {
	fn list_confirmed_utxos<'a>(
		&'a self,
	) -> impl Future<Output = Result<Vec<UtxoDescriptor>, ()>> + Send + 'a {
		async move {
			let locked = self.locked.lock().unwrap();
			Ok(self.coins.iter().filter(|coin| !locked.contains(&coin.outpoint)).cloned().collect())
		}
	}

	fn get_change_script<'a>(&'a self) -> impl Future<Output = Result<ScriptBuf, ()>> + Send + 'a {
		async move { Ok(self.change_script()) }
	}

	fn get_new_script<'a>(&'a self) -> impl Future<Output = Result<ScriptBuf, ()>> + Send + 'a {
		async move { Ok(self.fresh_script()) }
	}

	fn lock_utxos<'a>(
		&'a self, outpoints: &'a [OutPoint],
	) -> impl Future<Output = Result<(), ()>> + Send + 'a {
		async move {
			self.locked.lock().unwrap().extend(outpoints.iter().copied());
			Ok(())
		}
	}

	fn unlock_utxos<'a>(
		&'a self, outpoints: &'a [OutPoint],
	) -> impl Future<Output = Result<(), ()>> + Send + 'a {
		async move {
			let mut locked = self.locked.lock().unwrap();
			for outpoint in outpoints {
				locked.remove(outpoint);
			}
			Ok(())
		}
	}

	fn sign_psbt<'a>(&'a self, psbt: Psbt) -> impl Future<Output = Result<Psbt, ()>> + Send + 'a {
		async move {
			if self.fail_signing.load(Ordering::Acquire) {
				return Err(());
			}
			Ok(self.sign(psbt))
		}
	}
}

/// A node which opens 2-of-2 channels instantly.
pub struct TestNode {
	node_id: PublicKey,
	pub connected: Mutex<Vec<PublicKey>>,
	pub opened: Mutex<Vec<PendingChannel>>,
	pub cancelled: Mutex<Vec<PendingChannel>>,
	pub fail_channel_open: AtomicBool,
	connect_failures: AtomicUsize,
	connect_clock: Mutex<Option<(Arc<TestTimeProvider>, Duration)>>,
}

impl TestNode {
	pub fn new(node_id: PublicKey) -> Self {
		TestNode {
			node_id,
			connected: Mutex::new(Vec::new()),
			opened: Mutex::new(Vec::new()),
			cancelled: Mutex::new(Vec::new()),
			fail_channel_open: AtomicBool::new(false),
			connect_failures: AtomicUsize::new(0),
			connect_clock: Mutex::new(None),
		}
	}

	/// Makes every connection attempt take `per_attempt` on `clock`, and the next `failures` of
	/// them fail.
	pub fn slow_connect(&self, failures: usize, clock: Arc<TestTimeProvider>, per_attempt: Duration) {
		self.connect_failures.store(failures, Ordering::Release);
		*self.connect_clock.lock().unwrap() = Some((clock, per_attempt));
	}
}

impl GroupNode for TestNode {
	fn connect_peer<'a>(
		&'a self, node_id: PublicKey,
	) -> impl Future<Output = Result<(), ()>> + Send + 'a {
		async move {
			if let Some((clock, per_attempt)) = self.connect_clock.lock().unwrap().as_ref() {
				clock.advance(*per_attempt);
			}
			let failed = self
				.connect_failures
				.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
				.is_ok();
			if failed {
				return Err(());
			}
			self.connected.lock().unwrap().push(node_id);
			Ok(())
		}
	}

	fn open_pending_channel<'a>(
		&'a self, counterparty_node_id: PublicKey, _capacity: Amount, _rate: u64,
	) -> impl Future<Output = Result<PendingChannel, ()>> + Send + 'a {
		async move {
			if self.fail_channel_open.load(Ordering::Acquire) {
				return Err(());
			}
			let mut engine = Sha256::engine();
			engine.input(&self.node_id.serialize());
			engine.input(&counterparty_node_id.serialize());
			let channel = PendingChannel {
				channel_id: Sha256::from_engine(engine).to_byte_array(),
				counterparty_node_id,
				funding_script: channel_funding_script(&self.node_id, &counterparty_node_id),
			};
			self.opened.lock().unwrap().push(channel.clone());
			Ok(channel)
		}
	}

	fn cancel_pending_channel<'a>(
		&'a self, channel: &'a PendingChannel,
	) -> impl Future<Output = Result<(), ()>> + Send + 'a {
		async move {
			self.cancelled.lock().unwrap().push(channel.clone());
			Ok(())
		}
	}
}

pub struct TestBroadcaster {
	pub txn_broadcasted: Mutex<Vec<Transaction>>,
	attempts: AtomicUsize,
	failures: Mutex<Option<(usize, BroadcastError)>>,
}

impl TestBroadcaster {
	pub fn new() -> Self {
		TestBroadcaster {
			txn_broadcasted: Mutex::new(Vec::new()),
			attempts: AtomicUsize::new(0),
			failures: Mutex::new(None),
		}
	}

	/// Fails the next `count` broadcasts with `err`.
	pub fn fail_next(&self, count: usize, err: BroadcastError) {
		*self.failures.lock().unwrap() = Some((count, err));
	}

	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::Acquire)
	}

	pub fn txn_broadcasted(&self) -> Vec<Transaction> {
		self.txn_broadcasted.lock().unwrap().clone()
	}
}

impl BroadcasterInterface for TestBroadcaster {
	fn broadcast_transaction<'a>(
		&'a self, tx: &'a Transaction,
	) -> impl Future<Output = Result<(), BroadcastError>> + Send + 'a {
		async move {
			self.attempts.fetch_add(1, Ordering::AcqRel);
			let mut failures = self.failures.lock().unwrap();
			if let Some((remaining, err)) = failures.as_mut() {
				if *remaining > 0 {
					*remaining -= 1;
					return Err(err.clone());
				}
			}
			self.txn_broadcasted.lock().unwrap().push(tx.clone());
			Ok(())
		}
	}
}

pub type TestCoordinator<'a> =
	GroupCoordinator<&'a KeysEntropySource, &'a TestLogger, &'a TestTimeProvider>;

/// Delivers requests from `node_id` straight to an in-process coordinator, passing every message
/// through the wire encoding.
pub struct TestTransport<'a> {
	coordinator: &'a TestCoordinator<'a>,
	node_id: PublicKey,
	drop_requests: AtomicUsize,
	pub requests: AtomicUsize,
	pub sent: Mutex<Vec<WireMessage>>,
}

impl<'a> TestTransport<'a> {
	pub fn new(coordinator: &'a TestCoordinator<'a>, node_id: PublicKey) -> Self {
		TestTransport {
			coordinator,
			node_id,
			drop_requests: AtomicUsize::new(0),
			requests: AtomicUsize::new(0),
			sent: Mutex::new(Vec::new()),
		}
	}

	/// Loses the next `count` requests, as if the coordinator never answered.
	pub fn drop_next(&self, count: usize) {
		self.drop_requests.store(count, Ordering::Release);
	}

	fn deliver(&self, coordinator_id: PublicKey, request: WireMessage) -> Result<WireMessage, TransportError> {
		self.requests.fetch_add(1, Ordering::AcqRel);
		self.sent.lock().unwrap().push(request.clone());
		if coordinator_id != self.coordinator.our_node_id() {
			return Err(TransportError::Disconnected);
		}
		let dropped = self
			.drop_requests
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
			.is_ok();
		if dropped {
			return Err(TransportError::Timeout);
		}
		let encoded = wire::encode(&request).map_err(|_| TransportError::Disconnected)?;
		let request = wire::read(&mut &encoded[..]).map_err(TransportError::Decode)?;
		let reply = self.coordinator.handle_message(&self.node_id, request).ok_or(TransportError::Timeout)?;
		let encoded = wire::encode(&reply).map_err(|_| TransportError::Disconnected)?;
		wire::read(&mut &encoded[..]).map_err(TransportError::Decode)
	}
}

impl<'a> GroupTransport for TestTransport<'a> {
	fn send_request<'b>(
		&'b self, coordinator: PublicKey, request: WireMessage,
	) -> impl Future<Output = Result<WireMessage, TransportError>> + Send + 'b {
		async move { self.deliver(coordinator, request) }
	}

	fn local_members(&self, group_id: &GroupId) -> Option<Vec<PublicKey>> {
		if self.node_id != self.coordinator.our_node_id() {
			return None;
		}
		self.coordinator.locked_members(group_id)
	}
}
