// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Events surfaced by the [`GroupCoordinator`] as groups move through their lifecycle.
//!
//! The events a request produces are queued together once the request was handled. They can be
//! consumed through [`GroupCoordinator::next_event`], [`GroupCoordinator::next_event_async`],
//! [`GroupCoordinator::wait_next_event`] or [`GroupCoordinator::get_and_clear_pending_events`], or
//! for a single group through [`GroupCoordinator::get_and_clear_group_events`].
//!
//! [`GroupCoordinator`]: crate::coordinator::GroupCoordinator
//! [`GroupCoordinator::next_event`]: crate::coordinator::GroupCoordinator::next_event
//! [`GroupCoordinator::next_event_async`]: crate::coordinator::GroupCoordinator::next_event_async
//! [`GroupCoordinator::wait_next_event`]: crate::coordinator::GroupCoordinator::wait_next_event
//! [`GroupCoordinator::get_and_clear_pending_events`]: crate::coordinator::GroupCoordinator::get_and_clear_pending_events
//! [`GroupCoordinator::get_and_clear_group_events`]: crate::coordinator::GroupCoordinator::get_and_clear_group_events

use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::types::GroupId;
use crate::util::errors::GroupError;

/// The maximum queue size we allow before starting to drop events.
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;

/// A lifecycle step of a group the coordinator runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
	/// The group reached its member count and its membership is now locked.
	MembersJoined {
		/// The group
		group_id: GroupId,
		/// The locked members, in the order they joined.
		members: Vec<PublicKey>,
	},
	/// Every member confirmed it is connected to its ring partners.
	MembersConnected {
		/// The group
		group_id: GroupId,
	},
	/// Every member proposed and the joint transaction was built.
	FundingAssembled {
		/// The group
		group_id: GroupId,
		/// The unsigned joint transaction, as handed to every member.
		psbt: Psbt,
	},
	/// Every member submitted its signatures.
	///
	/// The joint transaction can now be published with [`GroupCoordinator::broadcast_group`].
	///
	/// [`GroupCoordinator::broadcast_group`]: crate::coordinator::GroupCoordinator::broadcast_group
	SignaturesCollected {
		/// The group
		group_id: GroupId,
	},
	/// The group can no longer complete.
	GroupFailed {
		/// The group
		group_id: GroupId,
		/// Why the group failed.
		reason: GroupError,
	},
}

impl Event {
	/// The group this event is about.
	pub fn group_id(&self) -> GroupId {
		match self {
			Event::MembersJoined { group_id, .. }
			| Event::MembersConnected { group_id }
			| Event::FundingAssembled { group_id, .. }
			| Event::SignaturesCollected { group_id }
			| Event::GroupFailed { group_id, .. } => *group_id,
		}
	}
}

struct PendingEvents {
	events: VecDeque<Event>,
	waker: Option<Waker>,
}

/// Holds events until the user consumes them, either all at once, one at a time or per group.
pub(crate) struct EventQueue {
	pending: Mutex<PendingEvents>,
	condvar: Condvar,
}

impl EventQueue {
	pub fn new() -> Self {
		let pending = PendingEvents { events: VecDeque::new(), waker: None };
		Self { pending: Mutex::new(pending), condvar: Condvar::new() }
	}

	/// Queues the events a single request produced and wakes consumers once.
	///
	/// Returns the number of events which did not fit in the queue and were dropped.
	pub fn enqueue_all(&self, events: Vec<Event>) -> usize {
		if events.is_empty() {
			return 0;
		}
		let (waker, dropped) = {
			let mut pending = self.pending.lock().unwrap();
			let room = MAX_EVENT_QUEUE_SIZE.saturating_sub(pending.events.len());
			let dropped = events.len().saturating_sub(room);
			pending.events.extend(events.into_iter().take(room));
			(pending.waker.take(), dropped)
		};
		if let Some(waker) = waker {
			waker.wake();
		}
		self.condvar.notify_all();
		dropped
	}

	pub fn next_event(&self) -> Option<Event> {
		self.pending.lock().unwrap().events.pop_front()
	}

	pub fn next_event_async(&self) -> EventFuture<'_> {
		EventFuture { queue: self }
	}

	pub fn wait_next_event(&self) -> Event {
		let mut pending = self.pending.lock().unwrap();
		loop {
			if let Some(event) = pending.events.pop_front() {
				return event;
			}
			pending = self.condvar.wait(pending).unwrap();
		}
	}

	pub fn get_and_clear_pending_events(&self) -> Vec<Event> {
		self.pending.lock().unwrap().events.drain(..).collect()
	}

	/// Removes and returns the events about `group_id`, leaving those of other groups queued in
	/// their order.
	pub fn get_and_clear_group_events(&self, group_id: &GroupId) -> Vec<Event> {
		let mut pending = self.pending.lock().unwrap();
		let (ours, others): (Vec<Event>, Vec<Event>) =
			pending.events.drain(..).partition(|event| event.group_id() == *group_id);
		pending.events = others.into();
		ours
	}
}

/// Resolves to the next queued event.
pub(crate) struct EventFuture<'a> {
	queue: &'a EventQueue,
}

impl<'a> Future for EventFuture<'a> {
	type Output = Event;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Event> {
		let mut pending = self.queue.pending.lock().unwrap();
		match pending.events.pop_front() {
			Some(event) => {
				// Another task may be parked on what is left.
				if !pending.events.is_empty() {
					if let Some(waker) = pending.waker.take() {
						waker.wake();
					}
				}
				Poll::Ready(event)
			},
			None => {
				pending.waker = Some(cx.waker().clone());
				Poll::Pending
			},
		}
	}
}
