// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.
#![crate_name = "lightning_channel_group"]

//! Coordination of jointly-funded channel groups.
//!
//! A set of Lightning nodes agrees to open channels to each other, or to split funds into equal
//! outputs for unrelated parties, using a single on-chain transaction which every participant
//! funds and signs. One node hosts the [`GroupCoordinator`]: it admits members, locks the
//! membership list, hands out ring partners, assembles the joint funding transaction from every
//! member's proposal and collects their signatures. Every participant, the coordinator's own
//! node included, drives its side of the protocol with a [`GroupMember`].
//!
//! The coordinator is a message handler: feed every [`wire::Message`] received from a member to
//! [`GroupCoordinator::handle_message`] and send the returned reply back. Members reach the
//! coordinator through a [`GroupTransport`] and interact with their own wallet and node through
//! the [`GroupWallet`] and [`GroupNode`] traits.
//!
//! Once every member has signed, [`GroupCoordinator::broadcast_group`] combines the signatures,
//! publishes the joint transaction and retires the group. [`GroupCoordinator::combined_transaction`]
//! returns the fully signed transaction for callers which publish it themselves.
//!
//! [`GroupCoordinator`]: crate::coordinator::GroupCoordinator
//! [`GroupCoordinator::handle_message`]: crate::coordinator::GroupCoordinator::handle_message
//! [`GroupCoordinator::combined_transaction`]: crate::coordinator::GroupCoordinator::combined_transaction
//! [`GroupCoordinator::broadcast_group`]: crate::coordinator::GroupCoordinator::broadcast_group
//! [`GroupMember`]: crate::member::GroupMember
//! [`GroupTransport`]: crate::interfaces::GroupTransport
//! [`GroupWallet`]: crate::interfaces::GroupWallet
//! [`GroupNode`]: crate::interfaces::GroupNode
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![allow(clippy::drop_non_drop)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[macro_use]
pub mod util;

pub mod assembler;
pub mod ceremony;
pub mod coordinator;
pub mod events;
pub mod interfaces;
pub mod member;
pub mod msgs;
pub mod topology;
pub mod types;
pub mod utxo;
pub mod wire;
