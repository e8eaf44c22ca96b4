// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Assembly of the joint funding transaction from every member's proposal.
//!
//! Each member pays for the weight it adds to the transaction: its own inputs (priced with
//! worst-case witnesses), its funding outputs and its change output. The weight shared by
//! everyone (version, lock time, input and output counts and the SegWit marker) is split evenly,
//! rounding up. A member's fee is therefore
//!
//! ```text
//! ceil((member_weight + ceil(overhead_weight / members)) * rate / 4)
//! ```
//!
//! which depends only on the member's own proposal and the totals, not on the order in which
//! proposals arrived.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::Hash;
use bitcoin::policy::MAX_STANDARD_TX_WEIGHT;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use std::collections::HashSet;

use crate::msgs::{DecodeError, PendingProposal};
use crate::types::GroupId;
use crate::util::errors::AssemblyError;
use crate::util::shuffle::shuffle;
use crate::utxo::{output_weight, UtxoDescriptor};

/// The maximum number of inputs, or outputs, in a joint transaction.
pub const MAX_INPUTS_OUTPUTS_COUNT: usize = 4096;

/// The largest shared weight any transaction can have.
pub const MAX_OVERHEAD_WEIGHT: u64 = overhead_weight(u64::MAX, u64::MAX);

const fn compact_size_len(n: u64) -> u64 {
	match n {
		0..=0xfc => 1,
		0xfd..=0xffff => 3,
		0x10000..=0xffff_ffff => 5,
		_ => 9,
	}
}

/// The weight of a SegWit transaction which belongs to no input or output: version, lock time,
/// both counts and the marker and flag bytes.
pub const fn overhead_weight(inputs: u64, outputs: u64) -> u64 {
	(4 + 4 + compact_size_len(inputs) + compact_size_len(outputs)) * 4 + 2
}

/// The fee a member owes for adding `member_weight` to a transaction of `members` members whose
/// shared weight is `overhead_weight`, at `rate` sat/vB.
pub fn member_fee(member_weight: u64, overhead_weight: u64, members: usize, rate: u64) -> Amount {
	let share = overhead_weight.div_ceil(members.max(1) as u64);
	Amount::from_sat(member_weight.saturating_add(share).saturating_mul(rate).div_ceil(4))
}

/// The most a member could owe for `member_weight` in any group, at `rate` sat/vB.
pub fn max_member_fee(member_weight: u64, rate: u64) -> Amount {
	member_fee(member_weight, MAX_OVERHEAD_WEIGHT, 1, rate)
}

/// What a single member puts into the joint transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberProposal {
	/// Outputs to fund with the group's capacity each.
	pub funding: Vec<ScriptBuf>,
	/// Where the member's change goes. Without one, any excess is left as fee.
	pub change: Option<ScriptBuf>,
	/// The coins spent.
	pub utxos: Vec<UtxoDescriptor>,
}

impl MemberProposal {
	/// Reads a proposal received from a member.
	pub fn from_msg(msg: &PendingProposal) -> Result<Self, DecodeError> {
		let utxos = msg
			.utxos
			.iter()
			.cloned()
			.map(UtxoDescriptor::from_record)
			.collect::<Result<Vec<_>, _>>()?;
		Ok(MemberProposal { funding: msg.funding.clone(), change: msg.change.clone(), utxos })
	}

	/// The proposal as sent to the coordinator. Signing metadata is left out.
	pub fn to_msg(&self, group_id: GroupId) -> PendingProposal {
		PendingProposal {
			group_id,
			funding: self.funding.clone(),
			change: self.change.clone(),
			utxos: self.utxos.iter().map(|u| u.to_record()).collect(),
		}
	}

	/// The outpoints of the coins spent.
	pub fn outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
		self.utxos.iter().map(|u| u.outpoint)
	}

	/// The total value of the coins spent.
	pub fn input_value(&self) -> Result<Amount, AssemblyError> {
		self.utxos
			.iter()
			.try_fold(Amount::ZERO, |acc, u| acc.checked_add(u.value()))
			.ok_or(AssemblyError::Overflow)
	}

	/// The value the proposal commits to its funding outputs.
	pub fn committed_value(&self, capacity: Amount) -> Result<Amount, AssemblyError> {
		capacity.checked_mul(self.funding.len() as u64).ok_or(AssemblyError::Overflow)
	}

	/// The weight this proposal adds to the joint transaction, counting a change output whenever
	/// a change script is given.
	pub fn weight(&self) -> Result<u64, AssemblyError> {
		let mut weight = 0u64;
		for utxo in self.utxos.iter() {
			weight += utxo.input_weight()?;
		}
		for script in self.funding.iter() {
			weight += output_weight(&TxOut { value: Amount::ZERO, script_pubkey: script.clone() });
		}
		if let Some(script) = &self.change {
			weight += output_weight(&TxOut { value: Amount::ZERO, script_pubkey: script.clone() });
		}
		Ok(weight)
	}
}

/// How a single member's proposal was settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberContribution {
	/// The member's share of the transaction fee.
	pub fee: Amount,
	/// The member's change output, if one was created.
	pub change: Option<Amount>,
	/// Value left over which was too small for a change output, or which had nowhere to go,
	/// and is paid as additional fee.
	pub forgone: Amount,
}

/// An assembled joint transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JointFunding {
	/// The unsigned transaction, with the previous output of every input filled in.
	pub psbt: Psbt,
	/// How each proposal was settled, in the order the proposals were given.
	pub contributions: Vec<MemberContribution>,
}

fn dummy_signed_weight(tx: &Transaction, utxos: &[&UtxoDescriptor]) -> Result<u64, AssemblyError> {
	let mut weighed = tx.clone();
	for (txin, utxo) in weighed.input.iter_mut().zip(utxos.iter()) {
		let input_type = utxo
			.input_type()
			.ok_or(AssemblyError::UnsupportedInputType { outpoint: utxo.outpoint })?;
		txin.witness = input_type.dummy_witness();
	}
	Ok(weighed.weight().to_wu())
}

/// Builds the joint transaction paying `capacity` to every funding script of every proposal at
/// `rate` sat/vB.
///
/// Inputs and outputs are shuffled with `shuffle_seed` so their order reveals nothing about who
/// contributed them.
pub fn assemble_joint_funding(
	capacity: Amount, rate: u64, proposals: &[MemberProposal], shuffle_seed: [u8; 32],
) -> Result<JointFunding, AssemblyError> {
	if proposals.is_empty() {
		return Err(AssemblyError::NoProposals);
	}

	let mut seen = HashSet::new();
	for outpoint in proposals.iter().flat_map(|p| p.outpoints()) {
		if !seen.insert(outpoint) {
			return Err(AssemblyError::DuplicateInput { outpoint });
		}
	}
	let weights = proposals.iter().map(|p| p.weight()).collect::<Result<Vec<_>, _>>()?;

	let input_count = seen.len();
	let output_count: usize =
		proposals.iter().map(|p| p.funding.len() + p.change.is_some() as usize).sum();
	if input_count > MAX_INPUTS_OUTPUTS_COUNT || output_count > MAX_INPUTS_OUTPUTS_COUNT {
		return Err(AssemblyError::TooManyInputsOrOutputs);
	}
	// Change outputs which turn out to be dust are dropped later. The shared weight is fixed
	// before that so that no fee depends on another member's change.
	let overhead = overhead_weight(input_count as u64, output_count as u64);

	let mut inputs: Vec<(TxIn, &UtxoDescriptor)> = Vec::with_capacity(input_count);
	let mut outputs = Vec::with_capacity(output_count);
	let mut contributions = Vec::with_capacity(proposals.len());
	for (idx, (proposal, weight)) in proposals.iter().zip(weights).enumerate() {
		let fee = member_fee(weight, overhead, proposals.len(), rate);
		let committed = proposal.committed_value(capacity)?;
		let remainder = proposal
			.input_value()?
			.checked_sub(committed)
			.and_then(|v| v.checked_sub(fee))
			.ok_or(AssemblyError::InsufficientFunds { member: idx })?;

		for script in proposal.funding.iter() {
			outputs.push(TxOut { value: capacity, script_pubkey: script.clone() });
		}
		let contribution = match &proposal.change {
			Some(script) if remainder >= script.minimal_non_dust() => {
				outputs.push(TxOut { value: remainder, script_pubkey: script.clone() });
				MemberContribution { fee, change: Some(remainder), forgone: Amount::ZERO }
			},
			_ => MemberContribution { fee, change: None, forgone: remainder },
		};
		contributions.push(contribution);

		for utxo in proposal.utxos.iter() {
			let txin = TxIn {
				previous_output: utxo.outpoint,
				script_sig: ScriptBuf::new(),
				sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
				witness: Witness::new(),
			};
			inputs.push((txin, utxo));
		}
	}

	shuffle(&mut inputs, shuffle_seed);
	shuffle(&mut outputs, Sha256::hash(&shuffle_seed).to_byte_array());

	let utxos: Vec<&UtxoDescriptor> = inputs.iter().map(|(_, utxo)| *utxo).collect();
	let tx = Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: inputs.into_iter().map(|(txin, _)| txin).collect(),
		output: outputs,
	};
	if dummy_signed_weight(&tx, &utxos)? > MAX_STANDARD_TX_WEIGHT as u64 {
		return Err(AssemblyError::TransactionTooLarge);
	}

	let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|_| AssemblyError::Psbt)?;
	for (input, utxo) in psbt.inputs.iter_mut().zip(utxos.iter()) {
		utxo.populate_psbt_input(input);
	}
	Ok(JointFunding { psbt, contributions })
}

/// Checks that `psbt` spends the coins of `proposal`, pays its funding outputs in full and does
/// not charge it more than its fee share in a group of `members` members.
///
/// Without a change script the proposal accepts that all excess value goes to fees, so only
/// inputs and funding outputs are checked.
pub fn verify_contribution(
	psbt: &Psbt, proposal: &MemberProposal, capacity: Amount, rate: u64, members: usize,
) -> Result<(), String> {
	let tx = &psbt.unsigned_tx;
	if psbt.inputs.len() != tx.input.len() {
		return Err("PSBT input count does not match transaction".to_owned());
	}
	for utxo in proposal.utxos.iter() {
		let idx = tx
			.input
			.iter()
			.position(|txin| txin.previous_output == utxo.outpoint)
			.ok_or_else(|| format!("Input {} is missing", utxo.outpoint))?;
		if psbt.inputs[idx].witness_utxo.as_ref() != Some(&utxo.output) {
			return Err(format!("Input {} describes the wrong previous output", utxo.outpoint));
		}
	}

	let mut unclaimed: Vec<&TxOut> = tx.output.iter().collect();
	for script in proposal.funding.iter() {
		let pos = unclaimed
			.iter()
			.position(|o| o.script_pubkey == *script && o.value == capacity)
			.ok_or_else(|| format!("Funding output to {} is missing", script))?;
		unclaimed.swap_remove(pos);
	}

	let change_script = match &proposal.change {
		Some(script) => script,
		None => return Ok(()),
	};
	let change = unclaimed
		.iter()
		.filter(|o| o.script_pubkey == *change_script)
		.try_fold(Amount::ZERO, |acc, o| acc.checked_add(o.value))
		.ok_or_else(|| "Change overflow".to_owned())?;

	let weight = proposal.weight().map_err(|e| format!("{:?}", e))?;
	// Up to one change output per member may have been dropped, so the output count we price
	// the shared weight at is an upper bound.
	let overhead =
		overhead_weight(tx.input.len() as u64, (tx.output.len() + members) as u64);
	let fee = member_fee(weight, overhead, members, rate);
	let committed = proposal.committed_value(capacity).map_err(|e| format!("{:?}", e))?;
	let spent = proposal
		.input_value()
		.map_err(|e| format!("{:?}", e))?
		.checked_sub(change)
		.ok_or_else(|| "Change exceeds inputs".to_owned())?;
	let mut allowed =
		committed.checked_add(fee).ok_or_else(|| "Allowance overflow".to_owned())?;
	if change == Amount::ZERO {
		// A change output below the dust limit is forgone.
		allowed += change_script.minimal_non_dust();
	}
	if spent > allowed {
		return Err(format!("Spending {} exceeds allowance of {}", spent, allowed));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::{funding_script, p2tr_script, p2wpkh_script, utxo};

	fn proposal(seed: u8, values: &[u64], change: bool) -> MemberProposal {
		MemberProposal {
			funding: vec![funding_script(seed)],
			change: if change { Some(p2wpkh_script(seed)) } else { None },
			utxos: values
				.iter()
				.enumerate()
				.map(|(i, v)| utxo(seed, i as u32, p2wpkh_script(seed), *v))
				.collect(),
		}
	}

	fn totals(psbt: &Psbt) -> (Amount, Amount) {
		let inputs =
			psbt.inputs.iter().map(|i| i.witness_utxo.as_ref().unwrap().value).sum::<Amount>();
		let outputs = psbt.unsigned_tx.output.iter().map(|o| o.value).sum::<Amount>();
		(inputs, outputs)
	}

	#[test]
	fn three_members_at_one_sat_per_vbyte() {
		let capacity = Amount::from_sat(100_000);
		let proposals = vec![
			proposal(1, &[1_000_000], true),
			proposal(2, &[1_000_000], true),
			proposal(3, &[1_000_000], true),
		];
		let joint = assemble_joint_funding(capacity, 1, &proposals, [0; 32]).unwrap();
		let tx = &joint.psbt.unsigned_tx;
		assert_eq!(tx.input.len(), 3);
		assert_eq!(tx.output.len(), 6);
		assert_eq!(tx.output.iter().filter(|o| o.value == capacity).count(), 3);
		assert_eq!(tx.version, Version::TWO);
		assert_eq!(tx.lock_time, LockTime::ZERO);

		// Value is conserved: everything not paid out is fee or forgone.
		let (inputs, outputs) = totals(&joint.psbt);
		let fees: Amount = joint.contributions.iter().map(|c| c.fee + c.forgone).sum();
		assert_eq!(inputs, outputs + fees);

		// Identical proposals pay identical fees.
		assert!(joint.contributions.windows(2).all(|w| w[0] == w[1]));

		// Fees cover the worst-case signed size at the requested rate.
		let utxos: Vec<&UtxoDescriptor> =
			proposals.iter().flat_map(|p| p.utxos.iter()).collect();
		let mut ordered = Vec::new();
		for txin in tx.input.iter() {
			ordered.push(*utxos.iter().find(|u| u.outpoint == txin.previous_output).unwrap());
		}
		let weight = dummy_signed_weight(tx, &ordered).unwrap();
		assert!(fees.to_sat() * 4 >= weight);

		// The shared weight is exactly what remains after every member's own weight.
		let member_weights: u64 = proposals.iter().map(|p| p.weight().unwrap()).sum();
		assert_eq!(weight - member_weights, overhead_weight(3, 6));
	}

	#[test]
	fn fees_do_not_depend_on_proposal_order() {
		let capacity = Amount::from_sat(50_000);
		let a = proposal(1, &[200_000, 30_000], true);
		let b = proposal(2, &[400_000], true);
		let mut c = proposal(3, &[90_000], true);
		c.utxos[0].output.script_pubkey = p2tr_script(3);

		let forward =
			assemble_joint_funding(capacity, 7, &[a.clone(), b.clone(), c.clone()], [1; 32])
				.unwrap();
		let backward = assemble_joint_funding(capacity, 7, &[c, b, a], [1; 32]).unwrap();
		assert_eq!(forward.contributions[0], backward.contributions[2]);
		assert_eq!(forward.contributions[1], backward.contributions[1]);
		assert_eq!(forward.contributions[2], backward.contributions[0]);
		// The taproot spender pays less than the member with two P2WPKH inputs.
		assert!(forward.contributions[2].fee < forward.contributions[0].fee);
	}

	#[test]
	fn shuffle_seed_only_changes_order() {
		let capacity = Amount::from_sat(60_000);
		let proposals = vec![
			proposal(1, &[150_000, 20_000], true),
			proposal(2, &[300_000], true),
			proposal(3, &[80_000], false),
		];
		let outputs = |psbt: &Psbt| {
			let mut outputs: Vec<(Amount, ScriptBuf)> = psbt
				.unsigned_tx
				.output
				.iter()
				.map(|o| (o.value, o.script_pubkey.clone()))
				.collect();
			outputs.sort();
			outputs
		};
		let inputs = |psbt: &Psbt| -> HashSet<OutPoint> {
			psbt.unsigned_tx.input.iter().map(|txin| txin.previous_output).collect()
		};

		let base = assemble_joint_funding(capacity, 3, &proposals, [1; 32]).unwrap();
		let mut reordered = false;
		for seed in 2..10 {
			let other = assemble_joint_funding(capacity, 3, &proposals, [seed; 32]).unwrap();
			assert_eq!(outputs(&other.psbt), outputs(&base.psbt));
			assert_eq!(inputs(&other.psbt), inputs(&base.psbt));
			assert_eq!(other.contributions, base.contributions);
			// Previous outputs move along with their inputs.
			for (txin, input) in other.psbt.unsigned_tx.input.iter().zip(other.psbt.inputs.iter()) {
				let utxo = proposals
					.iter()
					.flat_map(|p| p.utxos.iter())
					.find(|utxo| utxo.outpoint == txin.previous_output)
					.unwrap();
				assert_eq!(input.witness_utxo.as_ref(), Some(&utxo.output));
			}
			reordered |= other.psbt.unsigned_tx != base.psbt.unsigned_tx;
		}
		assert!(reordered);
	}

	#[test]
	fn change_below_dust_is_forgone() {
		let capacity = Amount::from_sat(100_000);
		let fee_upper = max_member_fee(proposal(1, &[1], true).weight().unwrap(), 1);
		let values = [100_000 + fee_upper.to_sat() + 100];
		let joint =
			assemble_joint_funding(capacity, 1, &[proposal(1, &values, true)], [0; 32]).unwrap();
		assert_eq!(joint.psbt.unsigned_tx.output.len(), 1);
		assert_eq!(joint.contributions[0].change, None);
		assert!(joint.contributions[0].forgone > Amount::ZERO);

		let (inputs, outputs) = totals(&joint.psbt);
		assert_eq!(inputs - outputs, joint.contributions[0].fee + joint.contributions[0].forgone);
	}

	#[test]
	fn without_change_script_excess_is_fee() {
		let capacity = Amount::from_sat(100_000);
		let joint =
			assemble_joint_funding(capacity, 2, &[proposal(1, &[150_000], false)], [0; 32])
				.unwrap();
		assert_eq!(joint.psbt.unsigned_tx.output.len(), 1);
		let c = &joint.contributions[0];
		assert_eq!(c.fee + c.forgone, Amount::from_sat(50_000));
	}

	#[test]
	fn insufficient_funds() {
		let capacity = Amount::from_sat(100_000);
		let proposals = [proposal(1, &[1_000_000], true), proposal(2, &[100_000], true)];
		assert_eq!(
			assemble_joint_funding(capacity, 1, &proposals, [0; 32]),
			Err(AssemblyError::InsufficientFunds { member: 1 })
		);
	}

	#[test]
	fn duplicate_and_unsupported_inputs() {
		let capacity = Amount::from_sat(10_000);
		let a = proposal(1, &[100_000], true);
		let mut b = proposal(2, &[100_000], true);
		b.utxos.push(a.utxos[0].clone());
		assert_eq!(
			assemble_joint_funding(capacity, 1, &[a.clone(), b], [0; 32]),
			Err(AssemblyError::DuplicateInput { outpoint: a.utxos[0].outpoint })
		);

		let mut c = proposal(3, &[100_000], true);
		c.utxos[0].output.script_pubkey = funding_script(3);
		assert_eq!(
			assemble_joint_funding(capacity, 1, &[c.clone()], [0; 32]),
			Err(AssemblyError::UnsupportedInputType { outpoint: c.utxos[0].outpoint })
		);
		assert_eq!(assemble_joint_funding(capacity, 1, &[], [0; 32]), Err(AssemblyError::NoProposals));
	}

	#[test]
	fn oversized_transaction() {
		let capacity = Amount::from_sat(1_000);
		let values = vec![10_000u64; 2000];
		let proposals = [proposal(1, &values, true)];
		assert_eq!(
			assemble_joint_funding(capacity, 1, &proposals, [0; 32]),
			Err(AssemblyError::TransactionTooLarge)
		);
	}

	#[test]
	fn fanout_outputs() {
		let capacity = Amount::from_sat(25_000);
		let mut p = proposal(1, &[500_000], true);
		p.funding = (10..15).map(funding_script).collect();
		let joint = assemble_joint_funding(capacity, 3, &[p.clone(), proposal(2, &[90_000], true)], [4; 32])
			.unwrap();
		assert_eq!(joint.psbt.unsigned_tx.output.iter().filter(|o| o.value == capacity).count(), 6);
		assert_eq!(verify_contribution(&joint.psbt, &p, capacity, 3, 2), Ok(()));
	}

	#[test]
	fn verification_accepts_honest_and_rejects_greedy_transactions() {
		let capacity = Amount::from_sat(100_000);
		let proposals = vec![proposal(1, &[1_000_000], true), proposal(2, &[700_000], true)];
		let joint = assemble_joint_funding(capacity, 5, &proposals, [9; 32]).unwrap();
		for p in proposals.iter() {
			assert_eq!(verify_contribution(&joint.psbt, p, capacity, 5, 2), Ok(()));
		}

		// Shaving our change is caught.
		let mut greedy = joint.psbt.clone();
		let change_script = proposals[0].change.clone().unwrap();
		for output in greedy.unsigned_tx.output.iter_mut() {
			if output.script_pubkey == change_script {
				output.value -= Amount::from_sat(1_000);
			}
		}
		assert!(verify_contribution(&greedy, &proposals[0], capacity, 5, 2).is_err());

		// A missing funding output is caught.
		let mut missing = joint.psbt.clone();
		let funding = proposals[1].funding[0].clone();
		missing.unsigned_tx.output.retain(|o| o.script_pubkey != funding);
		assert!(verify_contribution(&missing, &proposals[1], capacity, 5, 2).is_err());

		// So is a missing input.
		let other = proposal(3, &[1_000_000], true);
		assert!(verify_contribution(&joint.psbt, &other, capacity, 5, 2).is_err());
	}

	#[test]
	fn proposal_messages() {
		let p = proposal(1, &[10_000, 20_000], true);
		let msg = p.to_msg(GroupId([1; 32]));
		assert_eq!(msg.utxos.len(), 2);
		assert_eq!(MemberProposal::from_msg(&msg), Ok(p));
	}
}
