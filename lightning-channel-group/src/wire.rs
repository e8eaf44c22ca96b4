// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire encoding/decoding for group coordination messages.
//!
//! Messages known by this module can be read from the wire using [`read`].
//! The [`Message`] enum returned by [`read`] wraps the decoded message or the message type (if
//! unknown) to use with pattern matching.
//!
//! Every message is a 2-byte big-endian type followed by the message's TLV stream. Requests sent
//! by members use odd types, the coordinator's replies use even types.

use std::io;

use crate::msgs;
use crate::types::GroupId;
use crate::util::ser::{Readable, Writeable, Writer};

/// Requests the group parameters, answered with [`GROUP_DETAILS`].
pub const GET_GROUP_DETAILS: u16 = 40101;
/// The group parameters.
pub const GROUP_DETAILS: u16 = 40102;
/// Joins a group, answered with [`CONNECTED_COUNT`].
pub const CONFIRM_MEMBERSHIP: u16 = 40103;
/// The number of joined, or connected, members.
pub const CONNECTED_COUNT: u16 = 40104;
/// Reports connection to the ring partners, answered with [`CONNECTED_COUNT`].
pub const CONFIRM_CONNECTED: u16 = 40105;
/// Requests the ring partners, answered with [`PARTNERS_RECORD`].
pub const FIND_PARTNERS: u16 = 40107;
/// The requester's ring partners.
pub const PARTNERS_RECORD: u16 = 40108;
/// Registers a channel group proposal, answered with [`UNSIGNED_FUNDING`] or
/// [`FUNDING_PENDING`].
pub const REGISTER_PENDING_OPEN: u16 = 40109;
/// The unsigned joint transaction.
pub const UNSIGNED_FUNDING: u16 = 40110;
/// Registers a fanout group proposal, answered with [`UNSIGNED_FUNDING`] or
/// [`FUNDING_PENDING`].
pub const REGISTER_PENDING_FANOUT: u16 = 40111;
/// Not every member has proposed yet.
pub const FUNDING_PENDING: u16 = 40112;
/// Submits channel group signatures, answered with [`SIGNED_COUNT`].
pub const REGISTER_SIGNED_OPEN: u16 = 40113;
/// The number of members which have signed.
pub const SIGNED_COUNT: u16 = 40114;
/// Submits fanout group signatures, answered with [`SIGNED_COUNT`].
pub const REGISTER_SIGNED_FANOUT: u16 = 40115;
/// A request was refused.
pub const GROUP_ERROR: u16 = 40116;

/// A group coordination message returned by [`read`] when decoding bytes received over the
/// wire. Each variant contains a message from [`msgs`] or otherwise the message type if
/// unknown.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Message {
	GetGroupDetails(msgs::GetGroupDetails),
	GroupDetails(msgs::GroupDetails),
	ConfirmMembership(msgs::ConfirmMembership),
	ConnectedCount(msgs::ConnectedCount),
	ConfirmConnected(msgs::ConfirmConnected),
	FindPartners(msgs::FindPartners),
	PartnersRecord(msgs::PartnersRecord),
	RegisterPendingOpen(msgs::PendingProposal),
	RegisterPendingFanout(msgs::PendingProposal),
	UnsignedFunding(msgs::UnsignedFunding),
	FundingPending(msgs::FundingPending),
	RegisterSignedOpen(msgs::SignedFunding),
	RegisterSignedFanout(msgs::SignedFunding),
	SignedCount(msgs::SignedCount),
	GroupError(msgs::GroupErrorMessage),
	/// A message that could not be decoded because its type is unknown.
	Unknown(MessageType),
}

/// A number identifying a message to determine how it is encoded on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageType(pub u16);

impl Message {
	/// Returns the type that was used to decode the message payload.
	pub fn type_id(&self) -> MessageType {
		MessageType(match self {
			Message::GetGroupDetails(_) => GET_GROUP_DETAILS,
			Message::GroupDetails(_) => GROUP_DETAILS,
			Message::ConfirmMembership(_) => CONFIRM_MEMBERSHIP,
			Message::ConnectedCount(_) => CONNECTED_COUNT,
			Message::ConfirmConnected(_) => CONFIRM_CONNECTED,
			Message::FindPartners(_) => FIND_PARTNERS,
			Message::PartnersRecord(_) => PARTNERS_RECORD,
			Message::RegisterPendingOpen(_) => REGISTER_PENDING_OPEN,
			Message::RegisterPendingFanout(_) => REGISTER_PENDING_FANOUT,
			Message::UnsignedFunding(_) => UNSIGNED_FUNDING,
			Message::FundingPending(_) => FUNDING_PENDING,
			Message::RegisterSignedOpen(_) => REGISTER_SIGNED_OPEN,
			Message::RegisterSignedFanout(_) => REGISTER_SIGNED_FANOUT,
			Message::SignedCount(_) => SIGNED_COUNT,
			Message::GroupError(_) => GROUP_ERROR,
			Message::Unknown(type_id) => return *type_id,
		})
	}

	/// The group the message refers to, if the message is known.
	pub fn group_id(&self) -> Option<GroupId> {
		Some(match self {
			Message::GetGroupDetails(msg) => msg.group_id,
			Message::GroupDetails(msg) => msg.group_id,
			Message::ConfirmMembership(msg) => msg.group_id,
			Message::ConnectedCount(msg) => msg.group_id,
			Message::ConfirmConnected(msg) => msg.group_id,
			Message::FindPartners(msg) => msg.group_id,
			Message::PartnersRecord(msg) => msg.group_id,
			Message::RegisterPendingOpen(msg) | Message::RegisterPendingFanout(msg) => {
				msg.group_id
			},
			Message::UnsignedFunding(msg) => msg.group_id,
			Message::FundingPending(msg) => msg.group_id,
			Message::RegisterSignedOpen(msg) | Message::RegisterSignedFanout(msg) => msg.group_id,
			Message::SignedCount(msg) => msg.group_id,
			Message::GroupError(msg) => msg.group_id,
			Message::Unknown(_) => return None,
		})
	}
}

impl MessageType {
	/// Returns whether the message type is even, indicating it is a reply from the coordinator.
	pub fn is_even(&self) -> bool {
		(self.0 & 1) == 0
	}
}

impl core::fmt::Display for MessageType {
	fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Reads a message from the data buffer consisting of a 2-byte big-endian type and a TLV stream
/// conforming to the type.
///
/// # Errors
///
/// Returns an error if the message payload could not be decoded as the specified type.
pub fn read<R: io::Read>(buffer: &mut R) -> Result<Message, msgs::DecodeError> {
	let message_type = <u16 as Readable>::read(buffer)?;
	match message_type {
		GET_GROUP_DETAILS => Ok(Message::GetGroupDetails(Readable::read(buffer)?)),
		GROUP_DETAILS => Ok(Message::GroupDetails(Readable::read(buffer)?)),
		CONFIRM_MEMBERSHIP => Ok(Message::ConfirmMembership(Readable::read(buffer)?)),
		CONNECTED_COUNT => Ok(Message::ConnectedCount(Readable::read(buffer)?)),
		CONFIRM_CONNECTED => Ok(Message::ConfirmConnected(Readable::read(buffer)?)),
		FIND_PARTNERS => Ok(Message::FindPartners(Readable::read(buffer)?)),
		PARTNERS_RECORD => Ok(Message::PartnersRecord(Readable::read(buffer)?)),
		REGISTER_PENDING_OPEN => Ok(Message::RegisterPendingOpen(Readable::read(buffer)?)),
		REGISTER_PENDING_FANOUT => Ok(Message::RegisterPendingFanout(Readable::read(buffer)?)),
		UNSIGNED_FUNDING => Ok(Message::UnsignedFunding(Readable::read(buffer)?)),
		FUNDING_PENDING => Ok(Message::FundingPending(Readable::read(buffer)?)),
		REGISTER_SIGNED_OPEN => Ok(Message::RegisterSignedOpen(Readable::read(buffer)?)),
		REGISTER_SIGNED_FANOUT => Ok(Message::RegisterSignedFanout(Readable::read(buffer)?)),
		SIGNED_COUNT => Ok(Message::SignedCount(Readable::read(buffer)?)),
		GROUP_ERROR => Ok(Message::GroupError(Readable::read(buffer)?)),
		_ => Ok(Message::Unknown(MessageType(message_type))),
	}
}

/// Writes a message to the data buffer encoded as a 2-byte big-endian type and a TLV stream.
///
/// # Errors
///
/// Returns an I/O error if the write could not be completed, or if the message is of an unknown
/// type.
pub fn write<W: Writer>(message: &Message, buffer: &mut W) -> Result<(), io::Error> {
	message.type_id().0.write(buffer)?;
	match message {
		Message::GetGroupDetails(msg) => msg.write(buffer),
		Message::GroupDetails(msg) => msg.write(buffer),
		Message::ConfirmMembership(msg) => msg.write(buffer),
		Message::ConnectedCount(msg) => msg.write(buffer),
		Message::ConfirmConnected(msg) => msg.write(buffer),
		Message::FindPartners(msg) => msg.write(buffer),
		Message::PartnersRecord(msg) => msg.write(buffer),
		Message::RegisterPendingOpen(msg) | Message::RegisterPendingFanout(msg) => msg.write(buffer),
		Message::UnsignedFunding(msg) => msg.write(buffer),
		Message::FundingPending(msg) => msg.write(buffer),
		Message::RegisterSignedOpen(msg) | Message::RegisterSignedFanout(msg) => msg.write(buffer),
		Message::SignedCount(msg) => msg.write(buffer),
		Message::GroupError(msg) => msg.write(buffer),
		Message::Unknown(_) => {
			Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot write unknown message"))
		},
	}
}

/// Encodes a message into a new buffer.
pub fn encode(message: &Message) -> Result<Vec<u8>, io::Error> {
	let mut buffer = Vec::new();
	write(message, &mut buffer)?;
	Ok(buffer)
}
