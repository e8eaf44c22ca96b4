// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages, traits representing wire message handlers, and a few error types live here.
//!
//! Every message body is a TLV stream. Record `0` carries the protocol version, which must be `0`,
//! and record `2` carries the 32-byte [`GroupId`] the message refers to. Message specific records
//! start at type `4`. Types are strictly increasing, unknown even types are rejected and unknown
//! odd types are ignored, so fields can be added in a backwards compatible way.
//!
//! We always write the version record but accept messages without one. Unknown odd records are
//! not kept, so writing a decoded message gives its canonical encoding, which reads back to the
//! same bytes.
//!
//! Numeric records are `BigSize` integers which are checked against the protocol bounds in
//! [`crate::types`] when read.

use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, Transaction, Txid};

use core::fmt;
use std::io::{self, Read};

use crate::types::{
	GroupId, MAX_CAPACITY_SATS, MAX_FEE_RATE, MAX_FUNDING_SCRIPTS, MAX_GROUP_COUNT,
	MAX_PROPOSAL_UTXOS, MAX_REPORTED_COUNT, MAX_UTXO_VALUE_SATS, MAX_VOUT,
};
use crate::util::errors::GroupError;
use crate::util::ser::{
	BigSize, BoundedBigSize, BoundedVec, FixedLengthReader, Readable, WithoutLength, Writeable,
	Writer,
};

/// The only protocol version we know.
pub const PROTOCOL_VERSION: u64 = 0;

/// An error in decoding a message or struct.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum DecodeError {
	/// A version byte specified something we don't know how to handle.
	UnknownVersion,
	/// Unknown feature mandating we fail to parse message (e.g., TLV with an even, unknown type)
	UnknownRequiredFeature,
	/// Value was invalid.
	///
	/// For example, a byte which was supposed to be a bool was something other than a 0
	/// or 1, a public key/private key/signature was invalid, text wasn't UTF-8, TLV was
	/// syntactically incorrect, a numeric value exceeded its bound, etc.
	InvalidValue,
	/// The buffer to be read was too short.
	ShortRead,
	/// Error from [`std::io`].
	Io(io::ErrorKind),
}

impl From<io::Error> for DecodeError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e.kind())
		}
	}
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			DecodeError::UnknownVersion => f.write_str("Unknown version"),
			DecodeError::UnknownRequiredFeature => {
				f.write_str("Unknown required feature preventing decode")
			},
			DecodeError::InvalidValue => f.write_str("Nonsense bytes didn't map to the type they were interpreted as"),
			DecodeError::ShortRead => f.write_str("Packet extended beyond the provided bytes"),
			DecodeError::Io(ref e) => fmt::Debug::fmt(e, f),
		}
	}
}

fn check_version(version: Option<BigSize>) -> Result<(), DecodeError> {
	match version {
		Some(BigSize(v)) if v != PROTOCOL_VERSION => Err(DecodeError::UnknownVersion),
		_ => Ok(()),
	}
}

macro_rules! required {
	($field: expr) => {
		$field.ok_or(DecodeError::InvalidValue)?
	};
}

/// A request for the parameters of a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetGroupDetails {
	/// The group
	pub group_id: GroupId,
}

/// The parameters of a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupDetails {
	/// The group
	pub group_id: GroupId,
	/// The value of every funding output, in satoshis.
	pub capacity: u64,
	/// The number of members the group needs.
	pub count: u64,
	/// The feerate of the joint transaction, in sat/vB.
	pub rate: u64,
}

/// A member asking to join a group, or confirming it is still waiting for the group to fill.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmMembership {
	/// The group
	pub group_id: GroupId,
}

/// A member reporting it is connected to its ring partners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmConnected {
	/// The group
	pub group_id: GroupId,
}

/// How many members have joined, or confirmed their connections, so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectedCount {
	/// The group
	pub group_id: GroupId,
	/// The number of members
	pub count: u64,
}

/// A member asking who its ring partners are.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FindPartners {
	/// The group
	pub group_id: GroupId,
}

/// A member's ring partners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartnersRecord {
	/// The group
	pub group_id: GroupId,
	/// The member which opens a channel to the requester.
	pub inbound: PublicKey,
	/// The member the requester opens a channel to.
	pub outbound: PublicKey,
}

/// A coin a member offers to spend into the joint transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoRecord {
	/// The full transaction creating the coin, if the member provides it.
	pub non_witness_tx: Option<Transaction>,
	/// The script of the coin.
	pub script: ScriptBuf,
	/// The value of the coin, in satoshis.
	pub value: u64,
	/// The transaction which created the coin.
	pub txid: Txid,
	/// The output index of the coin.
	pub vout: u32,
}

/// A member's contribution to the joint transaction: the outputs it wants funded, where its
/// change goes and the coins it spends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingProposal {
	/// The group
	pub group_id: GroupId,
	/// The outputs to create, each funded with the group's capacity.
	pub funding: Vec<ScriptBuf>,
	/// Where any value left over after funding and fees goes.
	pub change: Option<ScriptBuf>,
	/// The coins spent.
	pub utxos: Vec<UtxoRecord>,
}

/// The joint transaction, unsigned, ready for every member to sign its own inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsignedFunding {
	/// The group
	pub group_id: GroupId,
	/// The unsigned joint transaction
	pub psbt: Psbt,
}

/// Sent in reply to a proposal while other members have yet to propose.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingPending {
	/// The group
	pub group_id: GroupId,
}

/// A member's signatures for its own inputs of the joint transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedFunding {
	/// The group
	pub group_id: GroupId,
	/// The joint transaction with signatures on the member's inputs.
	pub psbt: Psbt,
}

/// How many members have submitted their signatures so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedCount {
	/// The group
	pub group_id: GroupId,
	/// The number of members
	pub count: u64,
}

/// A request was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupErrorMessage {
	/// The group
	pub group_id: GroupId,
	/// Why the request was refused.
	pub error: GroupError,
}

macro_rules! impl_group_id_only_msg {
	($st: ident) => {
		impl Writeable for $st {
			fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
				encode_tlv_stream!(w, {
					(0, BigSize(PROTOCOL_VERSION), required),
					(2, self.group_id.0, required),
				});
				Ok(())
			}
		}

		impl Readable for $st {
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				let mut version: Option<BigSize> = None;
				let mut group_id: Option<[u8; 32]> = None;
				decode_tlv_stream!(r, {
					(0, version, option),
					(2, group_id, required),
				});
				check_version(version)?;
				Ok($st { group_id: GroupId(required!(group_id)) })
			}
		}
	};
}

impl_group_id_only_msg!(GetGroupDetails);
impl_group_id_only_msg!(ConfirmMembership);
impl_group_id_only_msg!(ConfirmConnected);
impl_group_id_only_msg!(FindPartners);
impl_group_id_only_msg!(FundingPending);

macro_rules! impl_count_msg {
	($st: ident) => {
		impl Writeable for $st {
			fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
				encode_tlv_stream!(w, {
					(0, BigSize(PROTOCOL_VERSION), required),
					(2, self.group_id.0, required),
					(4, BigSize(self.count), required),
				});
				Ok(())
			}
		}

		impl Readable for $st {
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				let mut version: Option<BigSize> = None;
				let mut group_id: Option<[u8; 32]> = None;
				let mut count: Option<BoundedBigSize<MAX_REPORTED_COUNT>> = None;
				decode_tlv_stream!(r, {
					(0, version, option),
					(2, group_id, required),
					(4, count, required),
				});
				check_version(version)?;
				Ok($st { group_id: GroupId(required!(group_id)), count: required!(count).0 })
			}
		}
	};
}

impl_count_msg!(ConnectedCount);
impl_count_msg!(SignedCount);

impl Writeable for GroupDetails {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		encode_tlv_stream!(w, {
			(0, BigSize(PROTOCOL_VERSION), required),
			(2, self.group_id.0, required),
			(4, BigSize(self.capacity), required),
			(6, BigSize(self.count), required),
			(8, BigSize(self.rate), required),
		});
		Ok(())
	}
}

impl Readable for GroupDetails {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let mut version: Option<BigSize> = None;
		let mut group_id: Option<[u8; 32]> = None;
		let mut capacity: Option<BoundedBigSize<MAX_CAPACITY_SATS>> = None;
		let mut count: Option<BoundedBigSize<MAX_GROUP_COUNT>> = None;
		let mut rate: Option<BoundedBigSize<MAX_FEE_RATE>> = None;
		decode_tlv_stream!(r, {
			(0, version, option),
			(2, group_id, required),
			(4, capacity, required),
			(6, count, required),
			(8, rate, required),
		});
		check_version(version)?;
		Ok(GroupDetails {
			group_id: GroupId(required!(group_id)),
			capacity: required!(capacity).0,
			count: required!(count).0,
			rate: required!(rate).0,
		})
	}
}

struct PartnerKeys(PublicKey, PublicKey);

impl Writeable for PartnerKeys {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.0.write(w)?;
		self.1.write(w)
	}
}

impl Readable for PartnerKeys {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(PartnerKeys(Readable::read(r)?, Readable::read(r)?))
	}
}

impl Writeable for PartnersRecord {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		encode_tlv_stream!(w, {
			(0, BigSize(PROTOCOL_VERSION), required),
			(2, self.group_id.0, required),
			(4, PartnerKeys(self.inbound, self.outbound), required),
		});
		Ok(())
	}
}

impl Readable for PartnersRecord {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let mut version: Option<BigSize> = None;
		let mut group_id: Option<[u8; 32]> = None;
		let mut partners: Option<PartnerKeys> = None;
		decode_tlv_stream!(r, {
			(0, version, option),
			(2, group_id, required),
			(4, partners, required),
		});
		check_version(version)?;
		let partners = required!(partners);
		Ok(PartnersRecord {
			group_id: GroupId(required!(group_id)),
			inbound: partners.0,
			outbound: partners.1,
		})
	}
}

/// A UTXO record is itself a TLV stream, prefixed by its length so it can sit in a list.
impl Writeable for UtxoRecord {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		let mut body = Vec::new();
		let non_witness_tx = self.non_witness_tx.as_ref().map(WithoutLength);
		{
			let body = &mut body;
			encode_tlv_stream!(body, {
				(1, non_witness_tx, option),
				(2, self.script, required),
				(4, BigSize(self.value), required),
				(6, self.txid, required),
				(8, BigSize(self.vout as u64), required),
			});
		}
		BigSize(body.len() as u64).write(w)?;
		w.write_all(&body)
	}
}

impl Readable for UtxoRecord {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len: BigSize = Readable::read(r)?;
		let mut record = FixedLengthReader::new(r, len.0);
		let mut non_witness_tx: Option<WithoutLength<Transaction>> = None;
		let mut script: Option<ScriptBuf> = None;
		let mut value: Option<BoundedBigSize<MAX_UTXO_VALUE_SATS>> = None;
		let mut txid: Option<Txid> = None;
		let mut vout: Option<BoundedBigSize<MAX_VOUT>> = None;
		decode_tlv_stream!(&mut record, {
			(1, non_witness_tx, option),
			(2, script, required),
			(4, value, required),
			(6, txid, required),
			(8, vout, required),
		});
		Ok(UtxoRecord {
			non_witness_tx: non_witness_tx.map(|tx| tx.0),
			script: required!(script),
			value: required!(value).0,
			txid: required!(txid),
			vout: required!(vout).0 as u32,
		})
	}
}

impl Writeable for PendingProposal {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		encode_tlv_stream!(w, {
			(0, BigSize(PROTOCOL_VERSION), required),
			(2, self.group_id.0, required),
			(4, self.funding, required),
			(5, self.change, option),
			(6, self.utxos, required),
		});
		Ok(())
	}
}

impl Readable for PendingProposal {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let mut version: Option<BigSize> = None;
		let mut group_id: Option<[u8; 32]> = None;
		let mut funding: Option<BoundedVec<ScriptBuf, MAX_FUNDING_SCRIPTS>> = None;
		let mut change: Option<ScriptBuf> = None;
		let mut utxos: Option<BoundedVec<UtxoRecord, MAX_PROPOSAL_UTXOS>> = None;
		decode_tlv_stream!(r, {
			(0, version, option),
			(2, group_id, required),
			(4, funding, required),
			(5, change, option),
			(6, utxos, required),
		});
		check_version(version)?;
		Ok(PendingProposal {
			group_id: GroupId(required!(group_id)),
			funding: required!(funding).0,
			change,
			utxos: required!(utxos).0,
		})
	}
}

impl Writeable for UnsignedFunding {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		encode_tlv_stream!(w, {
			(0, BigSize(PROTOCOL_VERSION), required),
			(2, self.group_id.0, required),
			(4, WithoutLength(&self.psbt), required),
		});
		Ok(())
	}
}

impl Readable for UnsignedFunding {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let mut version: Option<BigSize> = None;
		let mut group_id: Option<[u8; 32]> = None;
		let mut psbt: Option<WithoutLength<Psbt>> = None;
		decode_tlv_stream!(r, {
			(0, version, option),
			(2, group_id, required),
			(4, psbt, required),
		});
		check_version(version)?;
		Ok(UnsignedFunding { group_id: GroupId(required!(group_id)), psbt: required!(psbt).0 })
	}
}

impl Writeable for SignedFunding {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		encode_tlv_stream!(w, {
			(0, BigSize(PROTOCOL_VERSION), required),
			(2, self.group_id.0, required),
			(4, WithoutLength(&self.psbt), required),
		});
		Ok(())
	}
}

impl Readable for SignedFunding {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let mut version: Option<BigSize> = None;
		let mut group_id: Option<[u8; 32]> = None;
		let mut psbt: Option<WithoutLength<Psbt>> = None;
		decode_tlv_stream!(r, {
			(0, version, option),
			(2, group_id, required),
			(4, psbt, required),
		});
		check_version(version)?;
		let psbt = required!(psbt).0;
		// Only plain key signatures, or finished witnesses, may be carried.
		crate::ceremony::check_signature_types(&psbt).map_err(|_| DecodeError::InvalidValue)?;
		Ok(SignedFunding { group_id: GroupId(required!(group_id)), psbt })
	}
}

impl Writeable for GroupErrorMessage {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		let reason = match self.error.reason() {
			Some(reason) => reason,
			None => {
				return Err(io::Error::new(
					io::ErrorKind::InvalidInput,
					"error cannot be sent to a peer",
				))
			},
		};
		let detail = self.error.detail();
		let detail = detail.as_ref().map(WithoutLength);
		encode_tlv_stream!(w, {
			(0, BigSize(PROTOCOL_VERSION), required),
			(2, self.group_id.0, required),
			(4, BigSize(reason as u64), required),
			(5, detail, option),
		});
		Ok(())
	}
}

impl Readable for GroupErrorMessage {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let mut version: Option<BigSize> = None;
		let mut group_id: Option<[u8; 32]> = None;
		let mut reason: Option<BoundedBigSize<{ u16::MAX as u64 }>> = None;
		let mut detail: Option<WithoutLength<String>> = None;
		decode_tlv_stream!(r, {
			(0, version, option),
			(2, group_id, required),
			(4, reason, required),
			(5, detail, option),
		});
		check_version(version)?;
		let error = GroupError::from_reason(required!(reason).0 as u16, detail.map(|d| d.0))?;
		Ok(GroupErrorMessage { group_id: GroupId(required!(group_id)), error })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::{pubkey, sample_psbt};

	use bitcoin::hashes::Hash;

	fn group_id() -> GroupId {
		GroupId([0x11; 32])
	}

	fn decode<T: Readable>(bytes: &[u8]) -> Result<T, DecodeError> {
		T::read(&mut &bytes[..])
	}

	#[test]
	fn group_details_layout() {
		let details =
			GroupDetails { group_id: group_id(), capacity: 100_000, count: 3, rate: 1 };
		let encoded = details.encode();
		let mut expected = vec![0, 1, 0, 2, 32];
		expected.extend_from_slice(&[0x11; 32]);
		expected.extend_from_slice(&[4, 5, 0xfe, 0x00, 0x01, 0x86, 0xa0]);
		expected.extend_from_slice(&[6, 1, 3]);
		expected.extend_from_slice(&[8, 1, 1]);
		assert_eq!(encoded, expected);
		assert_eq!(decode::<GroupDetails>(&encoded), Ok(details));
	}

	#[test]
	fn group_details_bounds() {
		let too_many = GroupDetails { group_id: group_id(), capacity: 1, count: 651, rate: 1 };
		assert_eq!(decode::<GroupDetails>(&too_many.encode()), Err(DecodeError::InvalidValue));

		let too_expensive =
			GroupDetails { group_id: group_id(), capacity: 1, count: 2, rate: MAX_FEE_RATE + 1 };
		assert_eq!(decode::<GroupDetails>(&too_expensive.encode()), Err(DecodeError::InvalidValue));

		let too_large = GroupDetails {
			group_id: group_id(),
			capacity: MAX_CAPACITY_SATS + 1,
			count: 2,
			rate: 1,
		};
		assert_eq!(decode::<GroupDetails>(&too_large.encode()), Err(DecodeError::InvalidValue));
	}

	#[test]
	fn version_record() {
		let mut bytes = vec![0, 1, 0, 2, 32];
		bytes.extend_from_slice(&[0x11; 32]);
		assert_eq!(
			decode::<ConfirmMembership>(&bytes),
			Ok(ConfirmMembership { group_id: group_id() })
		);

		bytes[2] = 1;
		assert_eq!(decode::<ConfirmMembership>(&bytes), Err(DecodeError::UnknownVersion));
	}

	#[test]
	fn version_is_always_written() {
		let mut bytes = vec![0, 1, 0, 2, 32];
		bytes.extend_from_slice(&[0x11; 32]);
		let msg: ConfirmMembership = decode(&bytes).unwrap();
		assert_eq!(msg.encode(), bytes);

		// A message without a version record reads back in its canonical form.
		let canonical = msg.encode();
		let msg: ConfirmMembership = decode(&bytes[3..]).unwrap();
		assert_eq!(msg.encode(), canonical);
	}

	#[test]
	fn decoding_canonical_bytes_is_lossless() {
		fn reencode<T: Readable + Writeable>(bytes: &[u8]) -> Vec<u8> {
			decode::<T>(bytes).unwrap().encode()
		}
		let details = GroupDetails { group_id: group_id(), capacity: 100_000, count: 3, rate: 1 };
		let bytes = details.encode();
		assert_eq!(reencode::<GroupDetails>(&bytes), bytes);

		let proposal = PendingProposal {
			group_id: group_id(),
			funding: vec![utxo(3).script],
			change: Some(utxo(4).script),
			utxos: vec![utxo(0), utxo(1)],
		};
		let bytes = proposal.encode();
		assert_eq!(reencode::<PendingProposal>(&bytes), bytes);

		let signed = SignedFunding { group_id: group_id(), psbt: sample_psbt() };
		let bytes = signed.encode();
		assert_eq!(reencode::<SignedFunding>(&bytes), bytes);

		let error = GroupErrorMessage {
			group_id: group_id(),
			error: GroupError::InsufficientFunds { err: "short".to_owned() },
		};
		let bytes = error.encode();
		assert_eq!(reencode::<GroupErrorMessage>(&bytes), bytes);

		// Skipped odd records are dropped from the re-encoding.
		let mut extended = ConnectedCount { group_id: group_id(), count: 2 }.encode();
		let canonical = extended.clone();
		extended.extend_from_slice(&[7, 2, 0xaa, 0xbb]);
		assert_eq!(reencode::<ConnectedCount>(&extended), canonical);
	}

	#[test]
	fn missing_group_id() {
		assert_eq!(decode::<FindPartners>(&[]), Err(DecodeError::InvalidValue));
		assert_eq!(decode::<FindPartners>(&[2, 31]), Err(DecodeError::ShortRead));
	}

	#[test]
	fn forward_compatible_records() {
		let mut bytes = ConnectedCount { group_id: group_id(), count: 2 }.encode();
		// An unknown odd record is skipped.
		bytes.extend_from_slice(&[7, 2, 0xaa, 0xbb]);
		assert_eq!(
			decode::<ConnectedCount>(&bytes),
			Ok(ConnectedCount { group_id: group_id(), count: 2 })
		);
		// An unknown even record is not.
		bytes.extend_from_slice(&[10, 0]);
		assert_eq!(decode::<ConnectedCount>(&bytes), Err(DecodeError::UnknownRequiredFeature));
	}

	#[test]
	fn count_bounds() {
		let msg = SignedCount { group_id: group_id(), count: MAX_REPORTED_COUNT + 1 };
		assert_eq!(decode::<SignedCount>(&msg.encode()), Err(DecodeError::InvalidValue));
	}

	#[test]
	fn partners_record_is_two_keys() {
		let msg = PartnersRecord { group_id: group_id(), inbound: pubkey(1), outbound: pubkey(2) };
		let encoded = msg.encode();
		// version and group id records, then type 4 with a 66 byte value
		assert_eq!(encoded[37], 4);
		assert_eq!(encoded[38], 66);
		assert_eq!(encoded.len(), 3 + 34 + 2 + 66);
		assert_eq!(decode::<PartnersRecord>(&encoded), Ok(msg));
	}

	fn utxo(vout: u32) -> UtxoRecord {
		UtxoRecord {
			non_witness_tx: None,
			script: ScriptBuf::from(vec![0x00, 0x14].into_iter().chain([7u8; 20]).collect::<Vec<_>>()),
			value: 50_000,
			txid: Txid::from_byte_array([9; 32]),
			vout,
		}
	}

	#[test]
	fn pending_proposal() {
		let proposal = PendingProposal {
			group_id: group_id(),
			funding: vec![ScriptBuf::from(vec![0x00, 0x20].into_iter().chain([3u8; 32]).collect::<Vec<_>>())],
			change: None,
			utxos: vec![utxo(0), utxo(1)],
		};
		assert_eq!(decode::<PendingProposal>(&proposal.encode()), Ok(proposal.clone()));

		let mut with_change = proposal.clone();
		with_change.change = Some(utxo(0).script);
		assert_eq!(decode::<PendingProposal>(&with_change.encode()), Ok(with_change));

		let mut bad_vout = proposal.clone();
		bad_vout.utxos[0].vout = MAX_VOUT as u32 + 1;
		assert_eq!(decode::<PendingProposal>(&bad_vout.encode()), Err(DecodeError::InvalidValue));

		let mut too_many = proposal;
		too_many.utxos = (0..MAX_PROPOSAL_UTXOS as u32 + 1).map(utxo).collect();
		assert_eq!(decode::<PendingProposal>(&too_many.encode()), Err(DecodeError::InvalidValue));
	}

	#[test]
	fn utxo_record_with_previous_transaction() {
		let psbt = sample_psbt();
		let mut record = utxo(0);
		record.non_witness_tx = Some(psbt.unsigned_tx.clone());
		let proposal =
			PendingProposal { group_id: group_id(), funding: Vec::new(), change: None, utxos: vec![record] };
		assert_eq!(decode::<PendingProposal>(&proposal.encode()), Ok(proposal));
	}

	#[test]
	fn funding_psbts() {
		let psbt = sample_psbt();
		let unsigned = UnsignedFunding { group_id: group_id(), psbt: psbt.clone() };
		assert_eq!(decode::<UnsignedFunding>(&unsigned.encode()), Ok(unsigned));
		let signed = SignedFunding { group_id: group_id(), psbt };
		assert_eq!(decode::<SignedFunding>(&signed.encode()), Ok(signed));
	}

	#[test]
	fn signed_funding_rejects_script_path_data() {
		let mut psbt = sample_psbt();
		psbt.inputs[0].unknown.insert(
			bitcoin::psbt::raw::Key { type_value: 0xf0, key: Vec::new() },
			vec![1, 2, 3],
		);
		let signed = SignedFunding { group_id: group_id(), psbt };
		assert_eq!(decode::<SignedFunding>(&signed.encode()), Err(DecodeError::InvalidValue));
	}

	#[test]
	fn group_error_message() {
		let msg = GroupErrorMessage {
			group_id: group_id(),
			error: GroupError::InvalidRequest { err: "no".to_owned() },
		};
		assert_eq!(decode::<GroupErrorMessage>(&msg.encode()), Ok(msg));

		let msg = GroupErrorMessage { group_id: group_id(), error: GroupError::GroupFull };
		assert_eq!(decode::<GroupErrorMessage>(&msg.encode()), Ok(msg));

		let unknown = GroupErrorMessage { group_id: group_id(), error: GroupError::UnknownGroup };
		assert!(unknown.write(&mut Vec::new()).is_err());
	}
}
