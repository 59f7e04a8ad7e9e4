//! Producers and consumers over a bounded queue built from the kernel's
//! Mutex and Condition.

use std::collections::VecDeque;
use std::sync::Arc;

use edukern::sync::{Condition, Mutex};
use edukern::ThreadedKernel;
use khal::{HaltReason, KThread, MachineBuilder};

const CAPACITY: usize = 5;
const WORKERS: u32 = 20;
const ITEMS: u32 = 20;

struct Buffer {
	items: Mutex<VecDeque<u32>>,
	not_full: Condition,
	not_empty: Condition,
	/// Largest length ever observed.
	high_water: spin::Mutex<usize>,
}

impl Buffer {
	fn new() -> Self {
		let items = Mutex::named("buffer", VecDeque::new());
		let lock = items.raw().clone();
		Self {
			items,
			not_full: Condition::new(lock.clone()),
			not_empty: Condition::new(lock),
			high_water: spin::Mutex::new(0),
		}
	}

	fn put(&self, value: u32) {
		let mut items = self.items.lock();
		while items.len() == CAPACITY {
			items = self.not_full.wait(items);
		}
		items.push_back(value);
		let len = items.len();
		let mut high = self.high_water.lock();
		*high = (*high).max(len);
		drop(high);
		self.not_empty.wake();
	}

	fn take(&self) -> u32 {
		let mut items = self.items.lock();
		while items.is_empty() {
			items = self.not_empty.wait(items);
		}
		let value = items.pop_front().unwrap_or_default();
		self.not_full.wake();
		value
	}
}

#[test]
fn every_item_is_consumed_once() {
	let machine = MachineBuilder::new().build();
	let totals = Arc::new(spin::Mutex::new((0u64, 0u32, 0usize)));
	let out = totals.clone();

	let report = machine.boot(move || {
		let _kernel = ThreadedKernel::initialize();
		let buffer = Arc::new(Buffer::new());
		let consumed = Arc::new(spin::Mutex::new(Vec::new()));
		let mut threads = Vec::new();

		for p in 0..WORKERS {
			let buffer = buffer.clone();
			threads.push(KThread::new(&format!("producer {}", p), move || {
				for i in 0..ITEMS {
					buffer.put(p * ITEMS + i);
				}
			}));
		}
		for c in 0..WORKERS {
			let (buffer, consumed) = (buffer.clone(), consumed.clone());
			threads.push(KThread::new(&format!("consumer {}", c), move || {
				for _ in 0..ITEMS {
					let value = buffer.take();
					consumed.lock().push(value);
				}
			}));
		}
		for t in &threads {
			t.fork();
		}
		for t in &threads {
			t.join();
		}

		let mut values = consumed.lock().clone();
		values.sort_unstable();
		values.dedup();
		let sum = values.iter().map(|&v| v as u64).sum();
		*out.lock() = (sum, values.len() as u32, *buffer.high_water.lock());
	});

	assert_eq!(report.reason, HaltReason::Idle);
	let (sum, distinct, high_water) = *totals.lock();
	let n = (WORKERS * ITEMS) as u64;
	assert_eq!(distinct, WORKERS * ITEMS);
	assert_eq!(sum, n * (n - 1) / 2);
	assert!(high_water <= CAPACITY);
}
