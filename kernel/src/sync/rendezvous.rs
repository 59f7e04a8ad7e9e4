//! Synchronous two-party value exchange.
//!
//! `exchange(tag, value)` blocks until another thread calls `exchange` with
//! the same tag; each then returns the other's value. Tags are independent of
//! each other and may be reused: callers on one tag pair up two at a time in
//! arrival order.
//!
//! Each pairing gets its own result cell, created by the first party and
//! filled by the second, and the second party returns the slot to `Empty`
//! before it lets go of the slot lock. A later caller on the same tag
//! therefore always starts a fresh pairing and can never see or overwrite the
//! state of one still in flight.
//!
//! A tag's slot lives in the map only while some caller holds it. Each party
//! drops its handle under the map lock on the way out, and whoever leaves the
//! map holding the last one removes the entry.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use super::condition::Condition;
use super::mutex::Mutex;

pub struct Rendezvous<K, V> {
	slots: Mutex<BTreeMap<K, Arc<Slot<V>>>>,
}

struct Slot<V> {
	state: Mutex<SlotState<V>>,
}

enum SlotState<V> {
	Empty,
	OneWaiting { value: V, exchange: Arc<Exchange<V>> },
}

/// One pairing in progress.
struct Exchange<V> {
	/// The first party's result, written by the second party.
	result: spin::Mutex<Option<V>>,
	paired: Condition,
}

impl<K: Ord + Clone, V: Send> Rendezvous<K, V> {
	pub fn new() -> Self {
		Self {
			slots: Mutex::named("rendezvous", BTreeMap::new()),
		}
	}

	/// Trade `value` for the value of the next thread to arrive on `tag`.
	pub fn exchange(&self, tag: K, value: V) -> V {
		let slot = {
			let mut slots = self.slots.lock();
			slots
				.entry(tag.clone())
				.or_insert_with(|| Arc::new(Slot::new()))
				.clone()
		};
		let theirs = slot.exchange(value);

		let mut slots = self.slots.lock();
		drop(slot);
		if slots.get(&tag).is_some_and(|slot| Arc::strong_count(slot) == 1) {
			slots.remove(&tag);
		}
		theirs
	}

	/// Tags with an exchange in progress.
	pub fn active_tags(&self) -> usize {
		self.slots.lock().len()
	}
}

impl<K: Ord + Clone, V: Send> Default for Rendezvous<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<V: Send> Slot<V> {
	fn new() -> Self {
		Self {
			state: Mutex::new(SlotState::Empty),
		}
	}

	fn exchange(&self, value: V) -> V {
		let mut state = self.state.lock();
		match mem::replace(&mut *state, SlotState::Empty) {
			SlotState::Empty => {
				let exchange = Arc::new(Exchange {
					result: spin::Mutex::new(None),
					paired: Condition::new(self.state.raw().clone()),
				});
				*state = SlotState::OneWaiting {
					value,
					exchange: exchange.clone(),
				};
				loop {
					if let Some(theirs) = exchange.result.lock().take() {
						return theirs;
					}
					state = exchange.paired.wait(state);
				}
			}
			SlotState::OneWaiting {
				value: theirs,
				exchange,
			} => {
				// The slot is already Empty again.
				*exchange.result.lock() = Some(value);
				exchange.paired.wake();
				theirs
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use khal::{KThread, MachineBuilder};
	use spin::Mutex as SpinMutex;

	fn spawn(
		rendezvous: &Arc<Rendezvous<i32, i32>>,
		results: &Arc<SpinMutex<Vec<(i32, i32)>>>,
		tag: i32,
		value: i32,
	) -> KThread {
		let (r, out) = (rendezvous.clone(), results.clone());
		let t = KThread::new(&format!("exchange {}", value), move || {
			let got = r.exchange(tag, value);
			out.lock().push((value, got));
		});
		t.fork();
		t
	}

	#[test]
	fn two_parties_swap_values() {
		let machine = MachineBuilder::new().build();
		let results = Arc::new(SpinMutex::new(Vec::new()));
		let out = results.clone();
		machine.boot(move || {
			let r = Arc::new(Rendezvous::new());
			let a = spawn(&r, &out, 0, -1);
			while !a.is_blocked() {
				KThread::yield_now();
			}
			// The first party waits for a partner.
			assert!(out.lock().is_empty());
			assert_eq!(r.active_tags(), 1);
			let b = spawn(&r, &out, 0, 1);
			a.join();
			b.join();
			// Finished pairings leave nothing behind.
			assert_eq!(r.active_tags(), 0);
		});
		let mut results = results.lock().clone();
		results.sort();
		assert_eq!(results, vec![(-1, 1), (1, -1)]);
	}

	#[test]
	fn same_tag_pairs_two_at_a_time() {
		let machine = MachineBuilder::new().build();
		let results = Arc::new(SpinMutex::new(Vec::new()));
		let out = results.clone();
		machine.boot(move || {
			let r = Arc::new(Rendezvous::new());
			let threads: Vec<KThread> = (1..=6).map(|v| spawn(&r, &out, 7, v)).collect();
			for t in &threads {
				t.join();
			}
			assert_eq!(r.active_tags(), 0);
		});
		// Preemption decides who meets whom; every caller must still end up
		// in exactly one pair.
		let results = results.lock().clone();
		assert_eq!(results.len(), 6);
		for &(mine, theirs) in &results {
			assert_ne!(mine, theirs);
			assert!(results.contains(&(theirs, mine)));
		}
	}

	#[test]
	fn tags_are_independent() {
		let machine = MachineBuilder::new().build();
		let results = Arc::new(SpinMutex::new(Vec::new()));
		let out = results.clone();
		machine.boot(move || {
			let r = Arc::new(Rendezvous::new());
			let threads = [
				spawn(&r, &out, 1, 10),
				spawn(&r, &out, 2, 20),
				spawn(&r, &out, 1, 11),
				spawn(&r, &out, 2, 21),
			];
			for t in &threads {
				t.join();
			}
			assert_eq!(r.active_tags(), 0);
		});
		let mut results = results.lock().clone();
		results.sort();
		assert_eq!(results, vec![(10, 11), (11, 10), (20, 21), (21, 20)]);
	}
}
