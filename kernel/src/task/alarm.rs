//! Timer-driven sleep queue.
//!
//! Threads park themselves until a given tick; the periodic timer interrupt
//! readies every thread whose wake time has passed, in wake-time order with
//! ties broken by registration order. A pending wait can be cancelled, which
//! is how a condition variable keeps a thread that was both signalled and
//! timing out from being readied twice.

use std::collections::BTreeMap;
use std::sync::Arc;

use khal::{interrupt, machine, timer, KThread};

use crate::sync::IrqSpinLock;

struct Queue {
	/// Keyed by (wake tick, registration order).
	sleepers: BTreeMap<(u64, u64), KThread>,
	seq: u64,
}

pub struct Alarm {
	queue: IrqSpinLock<Queue>,
}

impl Alarm {
	pub fn new() -> Self {
		Self {
			queue: IrqSpinLock::new(Queue {
				sleepers: BTreeMap::new(),
				seq: 0,
			}),
		}
	}

	/// Create an alarm for the current machine: it becomes the timer's
	/// interrupt handler and the machine's `Alarm` extension.
	pub fn install() -> Arc<Alarm> {
		let machine = machine::current();
		let alarm = Arc::new(Alarm::new());
		let handler = alarm.clone();
		machine
			.timer()
			.set_interrupt_handler(Arc::new(move || handler.timer_interrupt()));
		machine.install(alarm.clone());
		alarm
	}

	/// The alarm installed on the current machine, if any.
	pub fn current() -> Option<Arc<Alarm>> {
		machine::current().extension::<Alarm>()
	}

	/// Timer callback. Readies every thread whose time has come, then forces
	/// a context switch so the timer keeps preempting.
	pub fn timer_interrupt(&self) {
		let now = timer::now();
		{
			let mut queue = self.queue.lock();
			while let Some(entry) = queue.sleepers.first_entry() {
				if entry.key().0 > now {
					break;
				}
				entry.remove().ready();
			}
		}

		if interrupt::in_handler() {
			interrupt::yield_on_return();
		} else {
			KThread::yield_now();
		}
	}

	/// Block the current thread for at least `ticks` ticks. Returns at once
	/// for `ticks <= 0`.
	pub fn wait_until(&self, ticks: i64) {
		if ticks <= 0 {
			return;
		}
		let wake = timer::now() + ticks as u64;
		let current = KThread::current();

		let mut queue = self.queue.lock();
		let seq = queue.seq;
		queue.seq += 1;
		queue.sleepers.insert((wake, seq), current);
		let prev = queue.unlock_masked();
		KThread::sleep();
		interrupt::restore(prev);
	}

	/// Drop `thread`'s pending wait and ready it now. Returns false, doing
	/// nothing, when it has no pending wait.
	pub fn cancel(&self, thread: &KThread) -> bool {
		let mut queue = self.queue.lock();
		let key = queue
			.sleepers
			.iter()
			.find(|(_, sleeper)| *sleeper == thread)
			.map(|(key, _)| *key);
		match key.and_then(|key| queue.sleepers.remove(&key)) {
			Some(sleeper) => {
				sleeper.ready();
				true
			}
			None => false,
		}
	}

	/// Number of threads waiting for their time.
	pub fn pending(&self) -> usize {
		self.queue.lock().sleepers.len()
	}
}

impl Default for Alarm {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use khal::MachineBuilder;
	use spin::Mutex;

	#[test]
	fn non_positive_waits_do_not_block() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let alarm = Alarm::install();
			alarm.wait_until(0);
			alarm.wait_until(-5);
			assert_eq!(alarm.pending(), 0);
		});
	}

	#[test]
	fn waits_at_least_the_requested_time() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let alarm = Alarm::install();
			for ticks in [1, 499, 500, 1234] {
				let start = timer::now();
				alarm.wait_until(ticks);
				assert!(timer::now() >= start + ticks as u64);
			}
		});
	}

	#[test]
	fn wakes_in_time_order() {
		let machine = MachineBuilder::new().build();
		let order = Arc::new(Mutex::new(Vec::new()));
		let o = order.clone();
		machine.boot(move || {
			let alarm = Alarm::install();
			let threads: Vec<KThread> = [3000i64, 1000, 2000, 1000]
				.into_iter()
				.enumerate()
				.map(|(n, ticks)| {
					let (alarm, order) = (alarm.clone(), o.clone());
					let t = KThread::new(&format!("sleeper {}", n), move || {
						alarm.wait_until(ticks);
						order.lock().push(n);
					});
					t.fork();
					t
				})
				.collect();
			for t in &threads {
				t.join();
			}
		});
		assert_eq!(*order.lock(), vec![1, 3, 2, 0]);
	}

	#[test]
	fn cancel_wakes_early_exactly_once() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let alarm = Alarm::install();
			let a = alarm.clone();
			let sleeper = KThread::new("sleeper", move || a.wait_until(1_000_000));
			sleeper.fork();
			while !sleeper.is_blocked() {
				KThread::yield_now();
			}

			let start = timer::now();
			assert!(alarm.cancel(&sleeper));
			assert!(!alarm.cancel(&sleeper));
			sleeper.join();
			assert!(timer::now() < start + 1_000_000);
			assert_eq!(alarm.pending(), 0);
		});
	}

	#[test]
	fn cancel_without_a_pending_wait_is_a_no_op() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let alarm = Alarm::install();
			assert!(!alarm.cancel(&KThread::current()));
		});
	}
}
