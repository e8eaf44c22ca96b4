// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Coins members spend into the joint transaction, and the weights used to price them.

use bitcoin::bip32::KeySource;
use bitcoin::psbt;
use bitcoin::secp256k1;
use bitcoin::{Amount, OutPoint, Script, Transaction, TxOut, Witness};

use crate::msgs::{DecodeError, UtxoRecord};
use crate::util::errors::AssemblyError;

/// The weight of a transaction input without its witness: the outpoint, an empty script_sig
/// and the sequence.
pub const BASE_INPUT_WEIGHT: u64 = (32 + 4 + 1 + 4) * 4;

/// The length of the largest DER-encoded ECDSA signature, including its sighash byte.
pub const MAX_ECDSA_SIGNATURE_LEN: usize = 73;

/// The length of a BIP 340 signature using the default sighash.
pub const SCHNORR_SIGNATURE_LEN: usize = 64;

/// The witness weight of a P2WPKH spend: element count, signature and compressed public key.
pub const P2WPKH_WITNESS_WEIGHT: u64 = 1 + 1 + MAX_ECDSA_SIGNATURE_LEN as u64 + 1 + 33;

/// The witness weight of a P2TR key-path spend: element count and signature.
pub const P2TR_KEY_PATH_WITNESS_WEIGHT: u64 = 1 + 1 + SCHNORR_SIGNATURE_LEN as u64;

/// The kinds of coins we know how to price and sign for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputType {
	/// Native SegWit v0 pay-to-witness-pubkey-hash.
	P2wpkh,
	/// Taproot, spent via the key path.
	P2tr,
}

impl InputType {
	/// Classifies a previous output script, returning `None` for scripts we cannot spend.
	pub fn from_script(script: &Script) -> Option<Self> {
		if script.is_p2wpkh() {
			Some(InputType::P2wpkh)
		} else if script.is_p2tr() {
			Some(InputType::P2tr)
		} else {
			None
		}
	}

	/// The witness weight a signed input of this type carries.
	pub fn satisfaction_weight(&self) -> u64 {
		match self {
			InputType::P2wpkh => P2WPKH_WITNESS_WEIGHT,
			InputType::P2tr => P2TR_KEY_PATH_WITNESS_WEIGHT,
		}
	}

	/// A witness of the same size as the real one, used to weigh unsigned transactions.
	pub(crate) fn dummy_witness(&self) -> Witness {
		match self {
			InputType::P2wpkh => {
				Witness::from_slice(&[vec![0u8; MAX_ECDSA_SIGNATURE_LEN], vec![0u8; 33]])
			},
			InputType::P2tr => Witness::from_slice(&[vec![0u8; SCHNORR_SIGNATURE_LEN]]),
		}
	}
}

/// The weight an output adds to a transaction.
pub fn output_weight(output: &TxOut) -> u64 {
	output.weight().to_wu()
}

/// Where the key for a coin comes from, so that signers can find it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyOrigin {
	/// The public key committed to by the coin. For Taproot coins this is the internal key.
	pub public_key: secp256k1::PublicKey,
	/// The BIP 32 derivation of the key.
	pub source: KeySource,
}

/// A coin which can be spent into a joint transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoDescriptor {
	/// The coin's outpoint.
	pub outpoint: OutPoint,
	/// The coin's script and value.
	pub output: TxOut,
	/// The full transaction creating the coin, if known.
	pub non_witness_tx: Option<Transaction>,
	/// Signing metadata. This stays with the member which owns the coin and is never sent to
	/// the coordinator.
	pub key_origin: Option<KeyOrigin>,
}

impl UtxoDescriptor {
	/// Describes a coin by its outpoint and output alone.
	pub fn new(outpoint: OutPoint, output: TxOut) -> Self {
		UtxoDescriptor { outpoint, output, non_witness_tx: None, key_origin: None }
	}

	/// The coin's value.
	pub fn value(&self) -> Amount {
		self.output.value
	}

	/// The coin's type, or `None` if we cannot spend it.
	pub fn input_type(&self) -> Option<InputType> {
		InputType::from_script(&self.output.script_pubkey)
	}

	/// The full weight this coin adds to a transaction once signed.
	pub fn input_weight(&self) -> Result<u64, AssemblyError> {
		let input_type = self
			.input_type()
			.ok_or(AssemblyError::UnsupportedInputType { outpoint: self.outpoint })?;
		Ok(BASE_INPUT_WEIGHT + input_type.satisfaction_weight())
	}

	/// The form in which the coin is sent to the coordinator.
	pub fn to_record(&self) -> UtxoRecord {
		UtxoRecord {
			non_witness_tx: self.non_witness_tx.clone(),
			script: self.output.script_pubkey.clone(),
			value: self.output.value.to_sat(),
			txid: self.outpoint.txid,
			vout: self.outpoint.vout,
		}
	}

	/// Reads a coin sent by a member, checking that any full transaction given actually
	/// creates it.
	pub fn from_record(record: UtxoRecord) -> Result<Self, DecodeError> {
		let outpoint = OutPoint { txid: record.txid, vout: record.vout };
		let output = TxOut { value: Amount::from_sat(record.value), script_pubkey: record.script };
		if let Some(tx) = &record.non_witness_tx {
			if tx.compute_txid() != outpoint.txid {
				return Err(DecodeError::InvalidValue);
			}
			match tx.output.get(outpoint.vout as usize) {
				Some(prev) if *prev == output => {},
				_ => return Err(DecodeError::InvalidValue),
			}
		}
		Ok(UtxoDescriptor { outpoint, output, non_witness_tx: record.non_witness_tx, key_origin: None })
	}

	/// Fills in what a signer needs to know about this coin.
	pub(crate) fn populate_psbt_input(&self, input: &mut psbt::Input) {
		input.witness_utxo = Some(self.output.clone());
		if let Some(tx) = &self.non_witness_tx {
			input.non_witness_utxo = Some(tx.clone());
		}
		if let Some(origin) = &self.key_origin {
			match self.input_type() {
				Some(InputType::P2wpkh) => {
					input.bip32_derivation.insert(origin.public_key, origin.source.clone());
				},
				Some(InputType::P2tr) => {
					let (internal_key, _) = origin.public_key.x_only_public_key();
					input.tap_internal_key = Some(internal_key);
					input.tap_key_origins.insert(internal_key, (Vec::new(), origin.source.clone()));
				},
				None => {},
			}
		}
	}
}

/// Removes the key origins `populate_psbt_input` added for our signer, so that
/// they are not handed to the coordinator along with our signatures.
pub(crate) fn strip_key_origins(input: &mut psbt::Input) {
	input.bip32_derivation.clear();
	input.tap_internal_key = None;
	input.tap_key_origins.clear();
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::{p2tr_script, p2wpkh_script, prev_tx};

	use bitcoin::{ScriptBuf, Sequence, TxIn};

	#[test]
	fn witness_weights_match_dummies() {
		for input_type in [InputType::P2wpkh, InputType::P2tr] {
			let witness = input_type.dummy_witness();
			assert_eq!(witness.size() as u64, input_type.satisfaction_weight());
		}
	}

	#[test]
	fn input_weight_matches_transaction_weight() {
		let tx_without = Transaction {
			version: bitcoin::transaction::Version::TWO,
			lock_time: bitcoin::absolute::LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint::null(),
				script_sig: ScriptBuf::new(),
				sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
				witness: InputType::P2tr.dummy_witness(),
			}],
			output: Vec::new(),
		};
		let mut tx_with = tx_without.clone();
		tx_with.input.push(TxIn {
			previous_output: OutPoint::null(),
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness: InputType::P2wpkh.dummy_witness(),
		});
		let added = tx_with.weight().to_wu() - tx_without.weight().to_wu();
		assert_eq!(added, BASE_INPUT_WEIGHT + P2WPKH_WITNESS_WEIGHT);
	}

	#[test]
	fn classifies_scripts() {
		assert_eq!(InputType::from_script(&p2wpkh_script(1)), Some(InputType::P2wpkh));
		assert_eq!(InputType::from_script(&p2tr_script(1)), Some(InputType::P2tr));
		let p2wsh = ScriptBuf::new_p2wsh(&ScriptBuf::new().wscript_hash());
		assert_eq!(InputType::from_script(&p2wsh), None);

		let utxo = UtxoDescriptor::new(
			OutPoint::null(),
			TxOut { value: Amount::from_sat(1000), script_pubkey: p2wsh },
		);
		assert_eq!(
			utxo.input_weight(),
			Err(AssemblyError::UnsupportedInputType { outpoint: OutPoint::null() })
		);
	}

	#[test]
	fn record_checks_previous_transaction() {
		let tx = prev_tx(p2wpkh_script(1), 50_000);
		let outpoint = OutPoint { txid: tx.compute_txid(), vout: 0 };
		let mut utxo = UtxoDescriptor::new(outpoint, tx.output[0].clone());
		utxo.non_witness_tx = Some(tx.clone());
		assert_eq!(UtxoDescriptor::from_record(utxo.to_record()), Ok(utxo.clone()));

		let mut wrong_value = utxo.to_record();
		wrong_value.value += 1;
		assert_eq!(UtxoDescriptor::from_record(wrong_value), Err(DecodeError::InvalidValue));

		let mut wrong_vout = utxo.to_record();
		wrong_vout.vout = 1;
		assert_eq!(UtxoDescriptor::from_record(wrong_vout), Err(DecodeError::InvalidValue));
	}
}
