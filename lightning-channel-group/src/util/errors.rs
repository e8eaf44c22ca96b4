// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Error types live here.

use bitcoin::secp256k1::PublicKey;
use bitcoin::OutPoint;

use core::fmt;

use crate::msgs::DecodeError;

/// Indicates why the coordinator refused a member's request.
///
/// Every variant maps onto an HTTP-style status via [`GroupError::code`]: `400` for malformed or
/// invalid requests, `403` for callers which may not take part in the group and `503` for
/// requests which arrived while the group could not serve them.
#[derive(Clone, PartialEq, Eq)]
pub enum GroupError {
	/// The request was malformed or does not fit the group's parameters.
	InvalidRequest {
		/// A human-readable error message
		err: String,
	},
	/// The proposal does not carry enough value to cover its outputs and fee share.
	InsufficientFunds {
		/// A human-readable error message
		err: String,
	},
	/// The caller is not allow-listed for this group, or is not one of its locked members.
	MembershipDenied,
	/// The group already has as many members as it was created for.
	GroupFull,
	/// The membership list is locked and the caller is not on it.
	GroupLocked,
	/// The group has not yet reached the phase in which the request can be served. Retry later.
	NotReady,
	/// A locked member stopped polling and the group was abandoned.
	MemberDropout {
		/// The member which stopped responding.
		member: PublicKey,
	},
	/// The joint transaction could not be built from the registered proposals.
	AssemblyFailed {
		/// A human-readable error message
		err: String,
	},
	/// No group with the requested id exists. Requests for unknown groups are dropped without a
	/// reply, so this never appears on the wire.
	UnknownGroup,
}

impl GroupError {
	/// The HTTP-style status code for this error.
	pub fn code(&self) -> u16 {
		match self {
			GroupError::InvalidRequest { .. } | GroupError::InsufficientFunds { .. } => 400,
			GroupError::MembershipDenied => 403,
			GroupError::UnknownGroup => 404,
			GroupError::GroupFull
			| GroupError::GroupLocked
			| GroupError::NotReady
			| GroupError::MemberDropout { .. }
			| GroupError::AssemblyFailed { .. } => 503,
		}
	}

	/// Whether the group can no longer complete. Members should stop retrying and clean up.
	pub fn is_terminal(&self) -> bool {
		matches!(self, GroupError::MemberDropout { .. } | GroupError::AssemblyFailed { .. })
	}

	/// Whether the same request may succeed if repeated later.
	pub fn is_retryable(&self) -> bool {
		self.code() == 503 && !self.is_terminal()
	}

	pub(crate) fn reason(&self) -> Option<u16> {
		match self {
			GroupError::InvalidRequest { .. } => Some(0),
			GroupError::InsufficientFunds { .. } => Some(1),
			GroupError::MembershipDenied => Some(2),
			GroupError::GroupFull => Some(3),
			GroupError::GroupLocked => Some(4),
			GroupError::NotReady => Some(5),
			GroupError::MemberDropout { .. } => Some(6),
			GroupError::AssemblyFailed { .. } => Some(7),
			GroupError::UnknownGroup => None,
		}
	}

	pub(crate) fn detail(&self) -> Option<String> {
		match self {
			GroupError::InvalidRequest { err }
			| GroupError::InsufficientFunds { err }
			| GroupError::AssemblyFailed { err } => Some(err.clone()),
			GroupError::MemberDropout { member } => Some(member.to_string()),
			_ => None,
		}
	}

	pub(crate) fn from_reason(reason: u16, detail: Option<String>) -> Result<Self, DecodeError> {
		let err = detail.clone().unwrap_or_default();
		match reason {
			0 => Ok(GroupError::InvalidRequest { err }),
			1 => Ok(GroupError::InsufficientFunds { err }),
			2 => Ok(GroupError::MembershipDenied),
			3 => Ok(GroupError::GroupFull),
			4 => Ok(GroupError::GroupLocked),
			5 => Ok(GroupError::NotReady),
			6 => {
				let member = detail
					.and_then(|d| d.parse::<PublicKey>().ok())
					.ok_or(DecodeError::InvalidValue)?;
				Ok(GroupError::MemberDropout { member })
			},
			7 => Ok(GroupError::AssemblyFailed { err }),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl fmt::Debug for GroupError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			GroupError::InvalidRequest { ref err } => write!(f, "Invalid request: {}", err),
			GroupError::InsufficientFunds { ref err } => write!(f, "Insufficient funds: {}", err),
			GroupError::MembershipDenied => f.write_str("Membership denied"),
			GroupError::GroupFull => f.write_str("Group is full"),
			GroupError::GroupLocked => f.write_str("Group membership is locked"),
			GroupError::NotReady => f.write_str("Group is not ready for this request yet"),
			GroupError::MemberDropout { ref member } => {
				write!(f, "Member {} dropped out of the group", member)
			},
			GroupError::AssemblyFailed { ref err } => write!(f, "Assembly failed: {}", err),
			GroupError::UnknownGroup => f.write_str("Unknown group"),
		}
	}
}

impl fmt::Display for GroupError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{} {:?}", self.code(), self)
	}
}

/// Reasons the joint transaction could not be assembled from member proposals.
#[derive(Clone, PartialEq, Eq)]
pub enum AssemblyError {
	/// No proposals were given.
	NoProposals,
	/// A proposal spends an output whose script we cannot estimate a witness for.
	UnsupportedInputType {
		/// The offending input.
		outpoint: OutPoint,
	},
	/// A member's inputs do not cover its committed outputs plus its fee share.
	InsufficientFunds {
		/// Index of the member's proposal.
		member: usize,
	},
	/// Summing values overflowed.
	Overflow,
	/// The same input appears more than once across all proposals.
	DuplicateInput {
		/// The input spent more than once.
		outpoint: OutPoint,
	},
	/// The transaction exceeds the maximum number of inputs or outputs.
	TooManyInputsOrOutputs,
	/// The transaction would exceed the standard weight limit.
	TransactionTooLarge,
	/// The PSBT could not be constructed.
	Psbt,
}

impl fmt::Debug for AssemblyError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			AssemblyError::NoProposals => f.write_str("No proposals to assemble"),
			AssemblyError::UnsupportedInputType { ref outpoint } => {
				write!(f, "Input {} has an unsupported script type", outpoint)
			},
			AssemblyError::InsufficientFunds { member } => {
				write!(f, "Member {} cannot cover its outputs and fee share", member)
			},
			AssemblyError::Overflow => f.write_str("Value overflow"),
			AssemblyError::DuplicateInput { ref outpoint } => {
				write!(f, "Input {} is spent more than once", outpoint)
			},
			AssemblyError::TooManyInputsOrOutputs => f.write_str("Too many inputs or outputs"),
			AssemblyError::TransactionTooLarge => f.write_str("Transaction exceeds weight limit"),
			AssemblyError::Psbt => f.write_str("Unable to build PSBT"),
		}
	}
}

/// Reasons a signed contribution could not be accepted or combined.
#[derive(Clone, PartialEq, Eq)]
pub enum SigningError {
	/// The signed PSBT does not describe the agreed unsigned transaction.
	TransactionMismatch,
	/// No signature was provided for the input at the given index.
	MissingSignature {
		/// Index of the input.
		input: usize,
	},
	/// A member provided signature data for an input it does not own.
	ForeignSignature {
		/// Index of the input.
		input: usize,
	},
	/// Signature data of a type we do not accept (script-path, non-default sighash, unknown or
	/// proprietary fields).
	UnrecognizedSignatureType {
		/// Index of the input.
		input: usize,
	},
	/// A signature failed to verify.
	InvalidSignature {
		/// Index of the input.
		input: usize,
	},
	/// An input is not owned by any member.
	UnknownInput {
		/// Index of the input.
		input: usize,
	},
}

impl fmt::Debug for SigningError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			SigningError::TransactionMismatch => f.write_str("Signed transaction does not match"),
			SigningError::MissingSignature { input } => {
				write!(f, "Missing signature for input {}", input)
			},
			SigningError::ForeignSignature { input } => {
				write!(f, "Signature provided for foreign input {}", input)
			},
			SigningError::UnrecognizedSignatureType { input } => {
				write!(f, "Unrecognized signature type on input {}", input)
			},
			SigningError::InvalidSignature { input } => {
				write!(f, "Invalid signature on input {}", input)
			},
			SigningError::UnknownInput { input } => {
				write!(f, "Input {} has no owning member", input)
			},
		}
	}
}

/// Failures to deliver a request to the coordinator and get its reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
	/// No reply arrived in time.
	Timeout,
	/// The coordinator is not connected.
	Disconnected,
	/// The reply could not be decoded.
	Decode(DecodeError),
}

/// Failures to publish a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastError {
	/// The transaction was rejected and will not be accepted if resent.
	Rejected {
		/// A human-readable error message
		err: String,
	},
	/// The backend could not be reached. Retry later.
	Unavailable,
}

/// Errors encountered by a member taking part in a group.
#[derive(Clone, PartialEq, Eq)]
pub enum MemberError {
	/// A request could not be delivered.
	Transport(TransportError),
	/// The coordinator refused a request.
	Rejected(GroupError),
	/// The coordinator replied with an unexpected message.
	UnexpectedResponse,
	/// The wallet failed to list, reserve or sign.
	Wallet,
	/// The node failed to connect to a peer or manage a pending channel.
	Node,
	/// Not enough confirmed coins to fund our contribution.
	InsufficientFunds,
	/// Our own contribution could not be assembled.
	Assembly(AssemblyError),
	/// Our own signatures could not be produced.
	Signing(SigningError),
	/// The unsigned transaction sent by the coordinator does not pay what we asked for.
	VerificationFailed {
		/// A human-readable error message
		err: String,
	},
	/// The operation did not complete within the configured number of attempts.
	RetriesExhausted {
		/// The operation which was being retried.
		operation: &'static str,
	},
	/// The finished transaction could not be published.
	Broadcast(BroadcastError),
}

impl MemberError {
	/// Whether retrying the step which produced this error may succeed.
	pub fn is_retryable(&self) -> bool {
		match self {
			MemberError::Transport(_) => true,
			MemberError::Rejected(e) => e.is_retryable(),
			MemberError::Broadcast(BroadcastError::Unavailable) => true,
			_ => false,
		}
	}
}

impl fmt::Debug for MemberError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			MemberError::Transport(ref e) => write!(f, "Transport error: {:?}", e),
			MemberError::Rejected(ref e) => write!(f, "Rejected by coordinator: {}", e),
			MemberError::UnexpectedResponse => f.write_str("Unexpected response from coordinator"),
			MemberError::Wallet => f.write_str("Wallet operation failed"),
			MemberError::Node => f.write_str("Node operation failed"),
			MemberError::InsufficientFunds => f.write_str("Not enough confirmed funds"),
			MemberError::Assembly(ref e) => write!(f, "Assembly error: {:?}", e),
			MemberError::Signing(ref e) => write!(f, "Signing error: {:?}", e),
			MemberError::VerificationFailed { ref err } => {
				write!(f, "Unsigned transaction failed verification: {}", err)
			},
			MemberError::RetriesExhausted { operation } => {
				write!(f, "Gave up on {} after too many attempts", operation)
			},
			MemberError::Broadcast(ref e) => write!(f, "Broadcast error: {:?}", e),
		}
	}
}

impl From<TransportError> for MemberError {
	fn from(e: TransportError) -> Self {
		MemberError::Transport(e)
	}
}

impl From<GroupError> for MemberError {
	fn from(e: GroupError) -> Self {
		MemberError::Rejected(e)
	}
}

impl From<AssemblyError> for MemberError {
	fn from(e: AssemblyError) -> Self {
		MemberError::Assembly(e)
	}
}

impl From<SigningError> for MemberError {
	fn from(e: SigningError) -> Self {
		MemberError::Signing(e)
	}
}

/// Errors encountered by the coordinator finishing a signed group.
#[derive(Clone, PartialEq, Eq)]
pub enum CompletionError {
	/// The group is unknown or its signatures are not all in.
	Group(GroupError),
	/// The joint transaction could not be published. The group is kept so that broadcasting
	/// can be tried again.
	Broadcast(BroadcastError),
}

impl fmt::Debug for CompletionError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			CompletionError::Group(ref e) => write!(f, "Group not ready to complete: {}", e),
			CompletionError::Broadcast(ref e) => write!(f, "Broadcast error: {:?}", e),
		}
	}
}

impl From<GroupError> for CompletionError {
	fn from(e: GroupError) -> Self {
		CompletionError::Group(e)
	}
}

impl From<BroadcastError> for CompletionError {
	fn from(e: BroadcastError) -> Self {
		CompletionError::Broadcast(e)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_codes() {
		assert_eq!(GroupError::InvalidRequest { err: String::new() }.code(), 400);
		assert_eq!(GroupError::InsufficientFunds { err: String::new() }.code(), 400);
		assert_eq!(GroupError::MembershipDenied.code(), 403);
		assert_eq!(GroupError::GroupFull.code(), 503);
		assert_eq!(GroupError::GroupLocked.code(), 503);
		assert_eq!(GroupError::NotReady.code(), 503);
		assert!(GroupError::NotReady.is_retryable());
		assert!(!GroupError::MembershipDenied.is_retryable());
		let failed = GroupError::AssemblyFailed { err: String::new() };
		assert_eq!(failed.code(), 503);
		assert!(failed.is_terminal());
		assert!(!failed.is_retryable());
	}

	#[test]
	fn reasons_survive_the_wire() {
		let member = "02eec7245d6b7d2ccb30380bfbe2a3648cd7a942653f5aa340edcea1f283686619"
			.parse::<PublicKey>()
			.unwrap();
		for err in [
			GroupError::InvalidRequest { err: "bad".to_owned() },
			GroupError::InsufficientFunds { err: "short".to_owned() },
			GroupError::MembershipDenied,
			GroupError::GroupFull,
			GroupError::GroupLocked,
			GroupError::NotReady,
			GroupError::MemberDropout { member },
			GroupError::AssemblyFailed { err: "too large".to_owned() },
		] {
			let reason = err.reason().unwrap();
			assert_eq!(GroupError::from_reason(reason, err.detail()), Ok(err));
		}
		assert_eq!(GroupError::UnknownGroup.reason(), None);
		assert_eq!(GroupError::from_reason(8, None), Err(DecodeError::InvalidValue));
	}

	#[test]
	fn member_error_retryability() {
		assert!(MemberError::Transport(TransportError::Timeout).is_retryable());
		assert!(MemberError::Rejected(GroupError::GroupFull).is_retryable());
		assert!(!MemberError::Rejected(GroupError::MembershipDenied).is_retryable());
		assert!(!MemberError::Rejected(GroupError::MemberDropout {
			member: "02eec7245d6b7d2ccb30380bfbe2a3648cd7a942653f5aa340edcea1f283686619"
				.parse()
				.unwrap()
		})
		.is_retryable());
		assert!(!MemberError::Wallet.is_retryable());
	}
}
