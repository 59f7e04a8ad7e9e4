//! Monitor-style condition variable.
//!
//! A `Condition` is bound to one `Lock` for its whole life, and every
//! operation requires the caller to hold that lock. Waiters are woken in the
//! order the machine's scheduler chooses, FIFO under round robin. `sleep_for` adds a timeout through the machine's `Alarm`; an
//! explicit wake cancels the pending timeout so the thread is readied only
//! once.

use std::sync::Arc;

use khal::sched::ThreadQueue;
use khal::{interrupt, machine, KThread};

use super::lock::Lock;
use super::mutex::MutexGuard;
use super::spinlock::IrqSpinLock;
use crate::task::alarm::Alarm;

pub struct Condition {
	lock: Arc<Lock>,
	waiters: IrqSpinLock<Box<dyn ThreadQueue>>,
}

impl Condition {
	/// A condition on `lock`. Must be called on a simulated thread: the
	/// waiter queue comes from that machine's scheduler.
	pub fn new(lock: Arc<Lock>) -> Self {
		let waiters = machine::current().scheduler().new_thread_queue(false);
		Self {
			lock,
			waiters: IrqSpinLock::new(waiters),
		}
	}

	pub fn lock(&self) -> &Arc<Lock> {
		&self.lock
	}

	/// Atomically release the lock and block until woken, then take the lock
	/// back.
	pub fn sleep(&self) {
		self.assert_held("sleep");
		let current = KThread::current();

		let prev = interrupt::disable();
		self.waiters.lock().wait_for_access(current);
		self.lock.release();
		KThread::sleep();
		interrupt::restore(prev);

		self.lock.acquire();
	}

	/// Like `sleep`, but give up after `timeout` ticks. Returns either way.
	///
	/// Panics if no `Alarm` is installed on the machine.
	pub fn sleep_for(&self, timeout: i64) {
		self.assert_held("sleep_for");
		let Some(alarm) = Alarm::current() else {
			panic!("Condition::sleep_for without an alarm installed");
		};
		let current = KThread::current();

		let prev = interrupt::disable();
		self.waiters.lock().wait_for_access(current.clone());
		self.lock.release();
		alarm.wait_until(timeout);
		// Still queued if the timeout fired first.
		self.waiters.lock().remove(&current);
		interrupt::restore(prev);

		self.lock.acquire();
	}

	/// Wake the next waiting thread, if any.
	pub fn wake(&self) {
		self.assert_held("wake");
		let alarm = Alarm::current();

		let prev = interrupt::disable();
		loop {
			let next = self.waiters.lock().next_thread();
			let Some(thread) = next else {
				break;
			};
			// A thread whose timeout already fired is on its way out of the
			// queue; it does not count as waiting.
			if thread.is_blocked() {
				Self::ready(alarm.as_deref(), &thread);
				break;
			}
		}
		interrupt::restore(prev);
	}

	/// Wake every waiting thread.
	pub fn wake_all(&self) {
		self.assert_held("wake_all");
		let alarm = Alarm::current();

		let prev = interrupt::disable();
		loop {
			let next = self.waiters.lock().next_thread();
			let Some(thread) = next else {
				break;
			};
			if thread.is_blocked() {
				Self::ready(alarm.as_deref(), &thread);
			}
		}
		interrupt::restore(prev);
	}

	/// `sleep` for a caller holding the lock through a `MutexGuard`.
	pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
		self.assert_same_lock(&guard);
		self.sleep();
		guard
	}

	/// `sleep_for` for a caller holding the lock through a `MutexGuard`.
	pub fn wait_for<'a, T>(&self, guard: MutexGuard<'a, T>, timeout: i64) -> MutexGuard<'a, T> {
		self.assert_same_lock(&guard);
		self.sleep_for(timeout);
		guard
	}

	/// Number of queued waiters.
	pub fn waiting(&self) -> usize {
		self.waiters.lock().len()
	}

	/// Cancel a pending timeout, or ready the thread directly.
	fn ready(alarm: Option<&Alarm>, thread: &KThread) {
		let cancelled = alarm.is_some_and(|alarm| alarm.cancel(thread));
		if !cancelled {
			thread.ready();
		}
	}

	fn assert_held(&self, op: &str) {
		assert!(
			self.lock.is_held_by_current_thread(),
			"Condition::{} without holding {}",
			op,
			self.lock
		);
	}

	fn assert_same_lock<T>(&self, guard: &MutexGuard<'_, T>) {
		assert!(
			Arc::ptr_eq(guard.mutex().raw(), &self.lock),
			"Condition waited on with a guard for another mutex"
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sync::Mutex;
	use khal::{timer, MachineBuilder, MachineConfig};
	use spin::Mutex as SpinMutex;

	#[test]
	fn wake_is_fifo() {
		let machine = MachineBuilder::new().build();
		let order = Arc::new(SpinMutex::new(Vec::new()));
		let o = order.clone();
		machine.boot(move || {
			let lock = Arc::new(Lock::new());
			let cond = Arc::new(Condition::new(lock.clone()));
			let threads: Vec<KThread> = (0..3)
				.map(|n| {
					let (lock, cond, order) = (lock.clone(), cond.clone(), o.clone());
					let t = KThread::new(&format!("waiter {}", n), move || {
						lock.acquire();
						cond.sleep();
						order.lock().push(n);
						lock.release();
					});
					t.fork();
					t
				})
				.collect();
			while threads.iter().any(|t| !t.is_blocked()) {
				KThread::yield_now();
			}

			lock.acquire();
			assert_eq!(cond.waiting(), 3);
			cond.wake();
			cond.wake();
			cond.wake();
			// Nobody left: a no-op.
			cond.wake();
			lock.release();
			for t in &threads {
				t.join();
			}
		});
		assert_eq!(*order.lock(), vec![0, 1, 2]);
	}

	#[test]
	fn wake_all_releases_everyone() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let state = Arc::new(Mutex::new(0u32));
			let cond = Arc::new(Condition::new(state.raw().clone()));
			let threads: Vec<KThread> = (0..4)
				.map(|n| {
					let (state, cond) = (state.clone(), cond.clone());
					let t = KThread::new(&format!("waiter {}", n), move || {
						let mut guard = state.lock();
						while *guard == 0 {
							guard = cond.wait(guard);
						}
						*guard += 1;
					});
					t.fork();
					t
				})
				.collect();
			while threads.iter().any(|t| !t.is_blocked()) {
				KThread::yield_now();
			}

			{
				let mut guard = state.lock();
				*guard = 1;
				cond.wake_all();
			}
			for t in &threads {
				t.join();
			}
			assert_eq!(*state.lock(), 5);
		});
	}

	#[test]
	fn sleep_for_times_out() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			Alarm::install();
			let lock = Arc::new(Lock::new());
			let cond = Condition::new(lock.clone());

			lock.acquire();
			let start = timer::now();
			cond.sleep_for(2000);
			assert!(timer::now() >= start + 2000);
			assert!(lock.is_held_by_current_thread());
			assert_eq!(cond.waiting(), 0);
			lock.release();
		});
	}

	#[test]
	fn wake_beats_the_timeout() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let alarm = Alarm::install();
			let lock = Arc::new(Lock::new());
			let cond = Arc::new(Condition::new(lock.clone()));

			let (l, c) = (lock.clone(), cond.clone());
			let sleeper = KThread::new("sleeper", move || {
				l.acquire();
				let start = timer::now();
				c.sleep_for(1_000_000);
				assert!(timer::now() < start + 1_000_000);
				l.release();
			});
			sleeper.fork();
			while !sleeper.is_blocked() {
				KThread::yield_now();
			}

			lock.acquire();
			assert_eq!(alarm.pending(), 1);
			cond.wake();
			assert_eq!(alarm.pending(), 0);
			lock.release();
			sleeper.join();
		});
	}

	#[test]
	fn wake_skips_a_waiter_whose_timeout_fired() {
		// One timer interrupt for the whole test, so every pending wait ends
		// in the same interrupt, earliest first.
		let machine = MachineBuilder::new()
			.config(MachineConfig {
				timer_interval: 100_000,
				..MachineConfig::default()
			})
			.build();
		let woken = Arc::new(SpinMutex::new(Vec::new()));
		let out = woken.clone();
		machine.boot(move || {
			let alarm = Alarm::install();
			let lock = Arc::new(Lock::new());
			let cond = Arc::new(Condition::new(lock.clone()));

			let (l, c, w) = (lock.clone(), cond.clone(), out.clone());
			let timed = KThread::new("timed", move || {
				l.acquire();
				let start = timer::now();
				c.sleep_for(5_000);
				assert!(timer::now() >= start + 5_000);
				w.lock().push("timed");
				l.release();
			});
			let (l, c, w) = (lock.clone(), cond.clone(), out.clone());
			let plain = KThread::new("plain", move || {
				l.acquire();
				c.sleep();
				w.lock().push("plain");
				l.release();
			});
			timed.fork();
			plain.fork();
			while cond.waiting() < 2 {
				KThread::yield_now();
			}

			// Wakes in the same interrupt as the timeout, just ahead of it.
			alarm.wait_until(1);
			assert_eq!(alarm.pending(), 0);
			assert!(!timed.is_blocked());
			assert_eq!(cond.waiting(), 2);

			lock.acquire();
			cond.wake();
			assert_eq!(cond.waiting(), 0);
			assert!(!plain.is_blocked());
			lock.release();

			timed.join();
			plain.join();
		});
		let mut woken = woken.lock().clone();
		woken.sort();
		assert_eq!(woken, vec!["plain", "timed"]);
	}

	#[test]
	#[should_panic(expected = "without holding")]
	fn sleep_without_the_lock_panics() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let cond = Condition::new(Arc::new(Lock::named("monitor")));
			cond.sleep();
		});
	}
}
