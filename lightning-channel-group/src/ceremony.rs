// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The signing ceremony: checking what members signed, combining their signatures into the final
//! transaction and getting it mined.
//!
//! Every input must be signed by the member which proposed it, and every signature must commit
//! to the whole transaction. Members additionally pre-sign a conflict transaction spending their
//! own inputs back to themselves, which they broadcast if the group fails after they signed.

use bitcoin::absolute::LockTime;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::psbt::{self, Psbt, PsbtSighashType};
use bitcoin::secp256k1::{Message, Secp256k1, Verification, XOnlyPublicKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot;
use bitcoin::transaction::Version;
use bitcoin::{
	Amount, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use core::ops::Deref;

use crate::assembler::overhead_weight;
use crate::interfaces::BroadcasterInterface;
use crate::util::config::RetryConfig;
use crate::util::errors::{AssemblyError, BroadcastError, SigningError};
use crate::util::logger::Logger;
use crate::util::retry::{retry_until_ready, Attempt};
use crate::utxo::{output_weight, InputType, UtxoDescriptor};

fn is_accepted_tap_sighash(sighash_type: TapSighashType) -> bool {
	matches!(sighash_type, TapSighashType::Default | TapSighashType::All)
}

/// Checks that `psbt` carries nothing but signatures we know how to combine: ECDSA partial
/// signatures with `SIGHASH_ALL`, Taproot key-path signatures with `SIGHASH_DEFAULT` or
/// `SIGHASH_ALL`, and final witnesses.
pub fn check_signature_types(psbt: &Psbt) -> Result<(), SigningError> {
	let ecdsa_all = PsbtSighashType::from(EcdsaSighashType::All);
	let tap_default = PsbtSighashType::from(TapSighashType::Default);
	for (idx, input) in psbt.inputs.iter().enumerate() {
		let unrecognized = SigningError::UnrecognizedSignatureType { input: idx };
		if !input.tap_script_sigs.is_empty()
			|| !input.unknown.is_empty()
			|| !input.proprietary.is_empty()
			|| input.final_script_sig.is_some()
		{
			return Err(unrecognized);
		}
		if let Some(sighash_type) = input.sighash_type {
			if sighash_type != ecdsa_all && sighash_type != tap_default {
				return Err(unrecognized);
			}
		}
		if input.partial_sigs.values().any(|sig| sig.sighash_type != EcdsaSighashType::All) {
			return Err(unrecognized);
		}
		if let Some(sig) = &input.tap_key_sig {
			if !is_accepted_tap_sighash(sig.sighash_type) {
				return Err(unrecognized);
			}
		}
	}
	Ok(())
}

fn has_signature_data(input: &psbt::Input) -> bool {
	!input.partial_sigs.is_empty()
		|| input.tap_key_sig.is_some()
		|| input.final_script_witness.is_some()
		|| input.final_script_sig.is_some()
}

fn p2wpkh_script_for(pk: &PublicKey) -> Option<ScriptBuf> {
	pk.wpubkey_hash().ok().map(|hash| ScriptBuf::new_p2wpkh(&hash))
}

/// The previous outputs of every input of `psbt`.
fn prevouts(psbt: &Psbt) -> Result<Vec<TxOut>, SigningError> {
	if psbt.inputs.len() != psbt.unsigned_tx.input.len() {
		return Err(SigningError::TransactionMismatch);
	}
	psbt.inputs
		.iter()
		.zip(psbt.unsigned_tx.input.iter())
		.enumerate()
		.map(|(idx, (input, txin))| {
			if let Some(output) = &input.witness_utxo {
				return Ok(output.clone());
			}
			input
				.non_witness_utxo
				.as_ref()
				.and_then(|tx| tx.output.get(txin.previous_output.vout as usize))
				.cloned()
				.ok_or(SigningError::UnknownInput { input: idx })
		})
		.collect()
}

/// Builds the final witness for an input from its signature data.
fn input_witness(input: &psbt::Input, prevout: &TxOut) -> Option<Witness> {
	if let Some(witness) = &input.final_script_witness {
		return Some(witness.clone());
	}
	match InputType::from_script(&prevout.script_pubkey)? {
		InputType::P2wpkh => input
			.partial_sigs
			.iter()
			.find(|(pk, _)| p2wpkh_script_for(pk).as_ref() == Some(&prevout.script_pubkey))
			.map(|(pk, sig)| Witness::p2wpkh(sig, &pk.inner)),
		InputType::P2tr => input.tap_key_sig.as_ref().map(Witness::p2tr_key_spend),
	}
}

/// Checks that `witness` validly spends input `idx` of `tx`.
fn verify_witness<C: Verification>(
	secp_ctx: &Secp256k1<C>, tx: &Transaction, idx: usize, prevouts: &[TxOut], witness: &Witness,
) -> bool {
	let prevout = match prevouts.get(idx) {
		Some(prevout) => prevout,
		None => return false,
	};
	match InputType::from_script(&prevout.script_pubkey) {
		Some(InputType::P2wpkh) => {
			if witness.len() != 2 {
				return false;
			}
			let sig = match ecdsa::Signature::from_slice(&witness[0]) {
				Ok(sig) if sig.sighash_type == EcdsaSighashType::All => sig,
				_ => return false,
			};
			let pk = match PublicKey::from_slice(&witness[1]) {
				Ok(pk) => pk,
				Err(_) => return false,
			};
			if p2wpkh_script_for(&pk).as_ref() != Some(&prevout.script_pubkey) {
				return false;
			}
			let sighash = match SighashCache::new(tx).p2wpkh_signature_hash(
				idx,
				&prevout.script_pubkey,
				prevout.value,
				EcdsaSighashType::All,
			) {
				Ok(sighash) => sighash,
				Err(_) => return false,
			};
			let msg = Message::from_digest(sighash.to_byte_array());
			secp_ctx.verify_ecdsa(&msg, &sig.signature, &pk.inner).is_ok()
		},
		Some(InputType::P2tr) => {
			if witness.len() != 1 {
				return false;
			}
			let sig = match taproot::Signature::from_slice(&witness[0]) {
				Ok(sig) if is_accepted_tap_sighash(sig.sighash_type) => sig,
				_ => return false,
			};
			let output_key = match XOnlyPublicKey::from_slice(&prevout.script_pubkey.as_bytes()[2..34]) {
				Ok(key) => key,
				Err(_) => return false,
			};
			let sighash = match SighashCache::new(tx).taproot_key_spend_signature_hash(
				idx,
				&Prevouts::All(prevouts),
				sig.sighash_type,
			) {
				Ok(sighash) => sighash,
				Err(_) => return false,
			};
			let msg = Message::from_digest(sighash.to_byte_array());
			secp_ctx.verify_schnorr(&sig.signature, &msg, &output_key).is_ok()
		},
		None => false,
	}
}

/// Checks a member's signed copy of the joint transaction: it must describe `unsigned` exactly,
/// carry valid signatures for every input spending one of `owned`, and nothing for the others.
pub fn verify_member_signatures(
	unsigned: &Psbt, signed: &Psbt, owned: &[OutPoint],
) -> Result<(), SigningError> {
	if signed.unsigned_tx != unsigned.unsigned_tx || signed.inputs.len() != unsigned.inputs.len() {
		return Err(SigningError::TransactionMismatch);
	}
	check_signature_types(signed)?;
	let prevouts = prevouts(unsigned)?;
	let secp_ctx = Secp256k1::verification_only();
	let tx = &unsigned.unsigned_tx;
	for (idx, (txin, input)) in tx.input.iter().zip(signed.inputs.iter()).enumerate() {
		if owned.contains(&txin.previous_output) {
			let witness = prevouts
				.get(idx)
				.and_then(|prevout| input_witness(input, prevout))
				.ok_or(SigningError::MissingSignature { input: idx })?;
			if !verify_witness(&secp_ctx, tx, idx, &prevouts, &witness) {
				return Err(SigningError::InvalidSignature { input: idx });
			}
		} else if has_signature_data(input) {
			return Err(SigningError::ForeignSignature { input: idx });
		}
	}
	Ok(())
}

/// Builds the fully signed transaction from every member's signed copy of `unsigned`.
///
/// Each submission is paired with the outpoints its member owns, and only signatures for those
/// inputs are taken from it.
pub fn combine_signatures(
	unsigned: &Psbt, submissions: &[(Vec<OutPoint>, Psbt)],
) -> Result<Transaction, SigningError> {
	let prevouts = prevouts(unsigned)?;
	let secp_ctx = Secp256k1::verification_only();
	let tx = &unsigned.unsigned_tx;
	let mut combined = unsigned.clone();
	for (idx, txin) in tx.input.iter().enumerate() {
		let (_, signed) = submissions
			.iter()
			.find(|(owned, _)| owned.contains(&txin.previous_output))
			.ok_or(SigningError::UnknownInput { input: idx })?;
		if signed.unsigned_tx != *tx {
			return Err(SigningError::TransactionMismatch);
		}
		let input = signed.inputs.get(idx).ok_or(SigningError::TransactionMismatch)?;
		let prevout = prevouts.get(idx).ok_or(SigningError::TransactionMismatch)?;
		let witness =
			input_witness(input, prevout).ok_or(SigningError::MissingSignature { input: idx })?;
		if !verify_witness(&secp_ctx, tx, idx, &prevouts, &witness) {
			return Err(SigningError::InvalidSignature { input: idx });
		}

		let finalized = combined.inputs.get_mut(idx).ok_or(SigningError::TransactionMismatch)?;
		finalized.final_script_witness = Some(witness);
		finalized.partial_sigs.clear();
		finalized.tap_key_sig = None;
		finalized.sighash_type = None;
		finalized.bip32_derivation.clear();
		finalized.tap_internal_key = None;
		finalized.tap_key_origins.clear();
	}
	Ok(combined.extract_tx_unchecked_fee_rate())
}

/// The feerate of a member's conflict transaction, in sat/vB.
pub fn conflict_feerate(rate: u64, divisor: u64) -> u64 {
	(rate / divisor.max(1)).max(1)
}

/// Builds a transaction spending `utxos` to `destination` at `rate` sat/vB, used to reclaim a
/// member's coins if the group stalls after it signed.
///
/// Returns `None` if nothing above the dust limit would be left after fees.
pub fn build_conflict_transaction(
	utxos: &[UtxoDescriptor], destination: &ScriptBuf, rate: u64,
) -> Result<Option<Psbt>, AssemblyError> {
	if utxos.is_empty() {
		return Ok(None);
	}
	let mut weight = overhead_weight(utxos.len() as u64, 1);
	let mut total = Amount::ZERO;
	for utxo in utxos.iter() {
		weight += utxo.input_weight()?;
		total = total.checked_add(utxo.value()).ok_or(AssemblyError::Overflow)?;
	}
	let output = TxOut { value: Amount::ZERO, script_pubkey: destination.clone() };
	weight += output_weight(&output);
	let fee = Amount::from_sat(weight.saturating_mul(rate).div_ceil(4));
	let value = match total.checked_sub(fee) {
		Some(value) if value >= destination.minimal_non_dust() => value,
		_ => return Ok(None),
	};

	let tx = Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: utxos
			.iter()
			.map(|utxo| TxIn {
				previous_output: utxo.outpoint,
				script_sig: ScriptBuf::new(),
				sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
				witness: Witness::new(),
			})
			.collect(),
		output: vec![TxOut { value, ..output }],
	};
	let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|_| AssemblyError::Psbt)?;
	for (input, utxo) in psbt.inputs.iter_mut().zip(utxos.iter()) {
		utxo.populate_psbt_input(input);
	}
	Ok(Some(psbt))
}

/// Finalizes a PSBT whose inputs were all signed by the same party.
pub fn finalize_own_psbt(psbt: &Psbt) -> Result<Transaction, SigningError> {
	let owned = psbt.unsigned_tx.input.iter().map(|txin| txin.previous_output).collect();
	combine_signatures(psbt, &[(owned, psbt.clone())])
}

/// Broadcasts `tx`, retrying with backoff while the backend is unavailable.
///
/// The transaction id is fixed before broadcast, so repeating a broadcast which actually
/// succeeded is harmless.
pub async fn broadcast_transaction<B: Deref, L: Deref>(
	broadcaster: &B, tx: &Transaction, config: &RetryConfig, logger: &L,
) -> Result<(), BroadcastError>
where
	B::Target: BroadcasterInterface,
	L::Target: Logger,
{
	log_info!(logger, "Broadcasting transaction {}", tx.compute_txid());
	log_trace!(logger, "Broadcast transaction: {}", log_tx!(tx));
	let res = retry_until_ready(config, "broadcast", logger, || async move {
		broadcaster.broadcast_transaction(tx).await.map(Attempt::Done)
	})
	.await;
	if let Err(e) = &res {
		log_error!(logger, "Failed to broadcast transaction {}: {:?}", tx.compute_txid(), e);
	}
	res
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::assembler::{assemble_joint_funding, MemberProposal};
	use crate::util::test_utils::{
		funding_script, p2wpkh_script, sample_psbt, TestBroadcaster, TestLogger, TestWallet,
	};

	use bitcoin::psbt::raw::ProprietaryKey;
	use core::time::Duration;

	fn proposal(wallet: &TestWallet, seed: u8) -> MemberProposal {
		MemberProposal {
			funding: vec![funding_script(seed)],
			change: Some(wallet.change_script()),
			utxos: wallet.utxos(),
		}
	}

	fn owned(proposal: &MemberProposal) -> Vec<OutPoint> {
		proposal.outpoints().collect()
	}

	fn two_member_funding() -> (Psbt, [(TestWallet, MemberProposal); 2]) {
		let alice = TestWallet::new(1, &[60_000, 70_000]);
		let bob = TestWallet::new_taproot(2, &[150_000]);
		let alice_proposal = proposal(&alice, 1);
		let bob_proposal = proposal(&bob, 2);
		let joint = assemble_joint_funding(
			Amount::from_sat(100_000),
			2,
			&[alice_proposal.clone(), bob_proposal.clone()],
			[3; 32],
		)
		.unwrap();
		(joint.psbt, [(alice, alice_proposal), (bob, bob_proposal)])
	}

	#[test]
	fn signature_types() {
		let mut psbt = sample_psbt();
		assert_eq!(check_signature_types(&psbt), Ok(()));

		psbt.inputs[0].sighash_type = Some(PsbtSighashType::from(EcdsaSighashType::SinglePlusAnyoneCanPay));
		assert_eq!(
			check_signature_types(&psbt),
			Err(SigningError::UnrecognizedSignatureType { input: 0 })
		);

		let mut psbt = sample_psbt();
		let key = ProprietaryKey { prefix: b"ext".to_vec(), subtype: 0, key: Vec::new() };
		psbt.inputs[0].proprietary.insert(key, vec![1]);
		assert_eq!(
			check_signature_types(&psbt),
			Err(SigningError::UnrecognizedSignatureType { input: 0 })
		);
	}

	#[test]
	fn members_sign_only_their_inputs() {
		let (unsigned, members) = two_member_funding();
		for (wallet, proposal) in members.iter() {
			let signed = wallet.sign(unsigned.clone());
			assert_eq!(verify_member_signatures(&unsigned, &signed, &owned(proposal)), Ok(()));
		}

		let (alice, alice_proposal) = &members[0];
		let (_, bob_proposal) = &members[1];
		let signed = alice.sign(unsigned.clone());
		// Alice's signatures are foreign from Bob's point of view, and Bob's are missing.
		match verify_member_signatures(&unsigned, &signed, &owned(bob_proposal)) {
			Err(SigningError::ForeignSignature { .. }) | Err(SigningError::MissingSignature { .. }) => {},
			res => panic!("Unexpected result {:?}", res),
		}

		// Signing a different transaction is caught.
		let mut other = unsigned.clone();
		other.unsigned_tx.lock_time = LockTime::from_consensus(1);
		let signed_other = alice.sign(other);
		assert_eq!(
			verify_member_signatures(&unsigned, &signed_other, &owned(alice_proposal)),
			Err(SigningError::TransactionMismatch)
		);
	}

	#[test]
	fn signatures_over_other_data_are_invalid() {
		let (unsigned, members) = two_member_funding();
		let (alice, alice_proposal) = &members[0];
		// Sign a transaction differing only in an output value, then graft the signatures on.
		let mut tampered = unsigned.clone();
		tampered.unsigned_tx.output[0].value += Amount::from_sat(1);
		let signed_tampered = alice.sign(tampered);
		let mut grafted = unsigned.clone();
		grafted.inputs = signed_tampered.inputs;
		match verify_member_signatures(&unsigned, &grafted, &owned(alice_proposal)) {
			Err(SigningError::InvalidSignature { .. }) => {},
			res => panic!("Unexpected result {:?}", res),
		}
	}

	#[test]
	fn combines_into_valid_transaction() {
		let (unsigned, members) = two_member_funding();
		let submissions: Vec<_> = members
			.iter()
			.map(|(wallet, proposal)| (owned(proposal), wallet.sign(unsigned.clone())))
			.collect();
		let tx = combine_signatures(&unsigned, &submissions).unwrap();
		assert_eq!(tx.compute_txid(), unsigned.unsigned_tx.compute_txid());

		let prevouts = prevouts(&unsigned).unwrap();
		let secp_ctx = Secp256k1::verification_only();
		for idx in 0..tx.input.len() {
			assert!(verify_witness(&secp_ctx, &tx, idx, &prevouts, &tx.input[idx].witness));
		}

		// Without Bob's submission the combination fails.
		assert!(matches!(
			combine_signatures(&unsigned, &submissions[..1]),
			Err(SigningError::UnknownInput { .. })
		));
	}

	#[test]
	fn input_count_mismatch_is_an_error() {
		let (unsigned, members) = two_member_funding();
		let (alice, alice_proposal) = &members[0];
		let mut truncated = alice.sign(unsigned.clone());
		truncated.inputs.pop();

		assert_eq!(
			verify_member_signatures(&truncated, &truncated, &owned(alice_proposal)),
			Err(SigningError::TransactionMismatch)
		);
		assert_eq!(
			combine_signatures(&truncated, &[(owned(alice_proposal), truncated.clone())]),
			Err(SigningError::TransactionMismatch)
		);
		assert_eq!(finalize_own_psbt(&truncated), Err(SigningError::TransactionMismatch));

		let prevouts = prevouts(&unsigned).unwrap();
		let secp_ctx = Secp256k1::verification_only();
		let tx = &unsigned.unsigned_tx;
		assert!(!verify_witness(&secp_ctx, tx, prevouts.len(), &prevouts, &Witness::new()));
	}

	#[test]
	fn conflict_transaction() {
		let wallet = TestWallet::new(4, &[30_000, 20_000]);
		let utxos = wallet.utxos();
		let destination = p2wpkh_script(4);
		let psbt = build_conflict_transaction(&utxos, &destination, 3).unwrap().unwrap();
		assert_eq!(psbt.unsigned_tx.input.len(), 2);
		assert_eq!(psbt.unsigned_tx.output.len(), 1);

		let tx = finalize_own_psbt(&wallet.sign(psbt)).unwrap();
		let fee = Amount::from_sat(50_000) - tx.output[0].value;
		// Worst-case witnesses are at least as large as the real ones.
		assert!(fee.to_sat() * 4 >= tx.weight().to_wu() * 3);
		assert!(fee.to_sat() <= (tx.vsize() as u64 + 2) * 3);

		let dust = TestWallet::new(5, &[300]);
		assert_eq!(build_conflict_transaction(&dust.utxos(), &destination, 1), Ok(None));
		assert_eq!(conflict_feerate(1, 2), 1);
		assert_eq!(conflict_feerate(10, 2), 5);
		assert_eq!(conflict_feerate(10, 0), 10);
	}

	#[tokio::test]
	async fn broadcast_retries_while_unavailable() {
		let logger = TestLogger::new();
		let broadcaster = TestBroadcaster::new();
		let tx = sample_psbt().unsigned_tx;
		let config = RetryConfig {
			interval: Duration::from_millis(1),
			max_interval: Duration::from_millis(4),
			max_attempts: 5,
		};

		broadcaster.fail_next(2, BroadcastError::Unavailable);
		assert_eq!(broadcast_transaction(&&broadcaster, &tx, &config, &&logger).await, Ok(()));
		assert_eq!(broadcaster.attempts(), 3);
		assert_eq!(broadcaster.txn_broadcasted(), vec![tx.clone()]);

		let rejected = BroadcastError::Rejected { err: "bad-txns".to_owned() };
		broadcaster.fail_next(1, rejected.clone());
		assert_eq!(broadcast_transaction(&&broadcaster, &tx, &config, &&logger).await, Err(rejected));

		broadcaster.fail_next(10, BroadcastError::Unavailable);
		assert_eq!(
			broadcast_transaction(&&broadcaster, &tx, &config, &&logger).await,
			Err(BroadcastError::Unavailable)
		);
		logger.assert_log_contains("lightning_channel_group::util::retry", "Giving up on broadcast", 1);
	}
}
