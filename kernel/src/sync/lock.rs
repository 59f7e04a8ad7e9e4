//! Blocking mutual exclusion.
//!
//! A `Lock` has at most one holder. Threads that find it held are queued on a
//! wait queue obtained from the machine's scheduler and block; `release` hands
//! the lock directly to the next waiter, so the woken thread already holds it
//! when it runs again.
//!
//! Misuse (re-acquiring a held lock, releasing one you do not hold) is a
//! kernel bug and panics, which halts the machine.

use core::fmt;

use khal::interrupt;
use khal::machine;
use khal::sched::ThreadQueue;
use khal::KThread;

use super::spinlock::IrqSpinLock;

struct LockState {
	holder: Option<KThread>,
	waiters: Box<dyn ThreadQueue>,
}

pub struct Lock {
	name: Option<String>,
	state: IrqSpinLock<LockState>,
}

impl Lock {
	/// A free lock. Must be called on a simulated thread: the wait queue
	/// comes from that machine's scheduler.
	pub fn new() -> Self {
		Self::build(None)
	}

	/// A free lock with a name for diagnostics.
	pub fn named(name: &str) -> Self {
		Self::build(Some(name.to_string()))
	}

	fn build(name: Option<String>) -> Self {
		let waiters = machine::current().scheduler().new_thread_queue(true);
		Self {
			name,
			state: IrqSpinLock::new(LockState {
				holder: None,
				waiters,
			}),
		}
	}

	pub fn name(&self) -> Option<&str> {
		self.name.as_deref()
	}

	/// Take the lock, blocking until it is free.
	pub fn acquire(&self) {
		let current = KThread::current();
		let mut state = self.state.lock();
		assert!(
			state.holder.as_ref() != Some(&current),
			"{}: acquired again by its holder {}",
			self,
			current
		);

		if state.holder.is_none() {
			state.waiters.acquire(current.clone());
			state.holder = Some(current);
			return;
		}

		state.waiters.wait_for_access(current);
		let prev = state.unlock_masked();
		KThread::sleep();
		interrupt::restore(prev);

		assert!(
			self.is_held_by_current_thread(),
			"{}: woken without being handed the lock",
			self
		);
	}

	/// Give the lock up. The next waiter, if any, becomes the holder.
	pub fn release(&self) {
		let current = KThread::current();
		let mut state = self.state.lock();
		assert!(
			state.holder.as_ref() == Some(&current),
			"{}: released by {}, which does not hold it",
			self,
			current
		);

		state.holder = state.waiters.next_thread();
		if let Some(next) = &state.holder {
			next.ready();
		}
	}

	pub fn is_held_by_current_thread(&self) -> bool {
		let current = KThread::current();
		self.state.lock().holder.as_ref() == Some(&current)
	}
}

impl Default for Lock {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for Lock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.name {
			Some(name) => write!(f, "lock {}", name),
			None => f.write_str("lock"),
		}
	}
}

impl fmt::Debug for Lock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Lock").field("name", &self.name).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use khal::MachineBuilder;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	#[test]
	fn uncontended_acquire_release() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let lock = Lock::named("test");
			assert!(!lock.is_held_by_current_thread());
			lock.acquire();
			assert!(lock.is_held_by_current_thread());
			lock.release();
			assert!(!lock.is_held_by_current_thread());
		});
	}

	#[test]
	fn holders_never_overlap() {
		let machine = MachineBuilder::new().build();
		let inside = Arc::new(AtomicUsize::new(0));
		let rounds = Arc::new(AtomicUsize::new(0));
		let (i, r) = (inside.clone(), rounds.clone());
		machine.boot(move || {
			let lock = Arc::new(Lock::new());
			let workers: Vec<KThread> = (0..5)
				.map(|n| {
					let (lock, inside, rounds) = (lock.clone(), i.clone(), r.clone());
					let t = KThread::new(&format!("worker {}", n), move || {
						for _ in 0..10 {
							lock.acquire();
							assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
							KThread::yield_now();
							inside.fetch_sub(1, Ordering::SeqCst);
							rounds.fetch_add(1, Ordering::SeqCst);
							lock.release();
							KThread::yield_now();
						}
					});
					t.fork();
					t
				})
				.collect();
			for worker in &workers {
				worker.join();
			}
		});
		assert_eq!(rounds.load(Ordering::SeqCst), 50);
	}

	#[test]
	#[should_panic(expected = "acquired again by its holder")]
	fn double_acquire_panics() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let lock = Lock::new();
			lock.acquire();
			lock.acquire();
		});
	}

	#[test]
	#[should_panic(expected = "does not hold it")]
	fn release_by_non_holder_panics() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			Lock::named("free").release();
		});
	}
}
