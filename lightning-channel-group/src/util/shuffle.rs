// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Uniform shuffling of transaction inputs and outputs, so that their order does not reveal
//! which member contributed them.

use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::{Hash, HashEngine};

/// A deterministic stream of random words expanded from a 32-byte seed.
pub(crate) struct SeededRng {
	seed: [u8; 32],
	counter: u64,
	buf: [u8; 32],
	pos: usize,
}

impl SeededRng {
	pub fn new(seed: [u8; 32]) -> Self {
		SeededRng { seed, counter: 0, buf: [0; 32], pos: 32 }
	}

	fn next_u64(&mut self) -> u64 {
		if self.pos + 8 > self.buf.len() {
			let mut engine = Sha256::engine();
			engine.input(&self.seed);
			engine.input(&self.counter.to_be_bytes());
			self.buf = Sha256::from_engine(engine).to_byte_array();
			self.counter += 1;
			self.pos = 0;
		}
		let mut word = [0; 8];
		word.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
		self.pos += 8;
		u64::from_le_bytes(word)
	}

	/// Returns a uniformly distributed value in `0..max`. `max` must be non-zero.
	pub fn below(&mut self, max: u64) -> u64 {
		debug_assert!(max > 0);
		loop {
			let rand = self.next_u64();
			// Reject the tail of the range so every residue is equally likely.
			if rand < u64::MAX / max * max {
				return rand % max;
			}
		}
	}
}

/// Fisher-Yates shuffle of `items` driven by `seed`.
pub(crate) fn shuffle<T>(items: &mut [T], seed: [u8; 32]) {
	let mut rng = SeededRng::new(seed);
	let len = items.len();
	for i in 0..len.saturating_sub(1) {
		let pick = i + rng.below((len - i) as u64) as usize;
		items.swap(i, pick);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn shuffle_is_a_permutation() {
		let mut items: Vec<u32> = (0..100).collect();
		shuffle(&mut items, [7; 32]);
		let mut sorted = items.clone();
		sorted.sort();
		assert_eq!(sorted, (0..100).collect::<Vec<_>>());
		assert_ne!(items, sorted);
	}

	#[test]
	fn shuffle_depends_on_seed() {
		let mut a: Vec<u32> = (0..50).collect();
		let mut b = a.clone();
		let mut c = a.clone();
		shuffle(&mut a, [1; 32]);
		shuffle(&mut b, [1; 32]);
		shuffle(&mut c, [2; 32]);
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn every_position_is_reachable() {
		// Over many seeds, the first element lands in each slot.
		let mut seen = [false; 4];
		for i in 0..200u8 {
			let mut items = [0u8, 1, 2, 3];
			shuffle(&mut items, [i; 32]);
			let pos = items.iter().position(|v| *v == 0).unwrap();
			seen[pos] = true;
		}
		assert!(seen.iter().all(|s| *s));
	}

	#[test]
	fn below_stays_in_range() {
		let mut rng = SeededRng::new([3; 32]);
		for max in 1..64 {
			assert!(rng.below(max) < max);
		}
	}
}
