//! A data-owning blocking mutex built on `Lock`.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use std::sync::Arc;

use khal::thread;

use super::lock::Lock;

pub struct Mutex<T> {
	lock: Arc<Lock>,
	data: UnsafeCell<T>,
}

// SAFETY: `data` is only reached through a guard, and a guard exists only
// while `lock` is held.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
	pub fn new(value: T) -> Self {
		Self::with_lock(Arc::new(Lock::new()), value)
	}

	pub fn named(name: &str, value: T) -> Self {
		Self::with_lock(Arc::new(Lock::named(name)), value)
	}

	fn with_lock(lock: Arc<Lock>, value: T) -> Self {
		Self {
			lock,
			data: UnsafeCell::new(value),
		}
	}

	pub fn lock(&self) -> MutexGuard<'_, T> {
		self.lock.acquire();
		MutexGuard { mutex: self }
	}

	/// The underlying lock, for building a `Condition` on it.
	pub fn raw(&self) -> &Arc<Lock> {
		&self.lock
	}
}

pub struct MutexGuard<'a, T> {
	mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
	pub(super) fn mutex(&self) -> &'a Mutex<T> {
		self.mutex
	}
}

impl<T> Deref for MutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		// SAFETY: the guard holds the lock.
		unsafe { &*self.mutex.data.get() }
	}
}

impl<T> DerefMut for MutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		// SAFETY: the guard holds the lock.
		unsafe { &mut *self.mutex.data.get() }
	}
}

impl<T> Drop for MutexGuard<'_, T> {
	fn drop(&mut self) {
		// A thread torn down mid-section cannot hand the lock on; the machine
		// is stopping or the thread is gone for good.
		if !thread::is_exiting() {
			self.mutex.lock.release();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use khal::{KThread, MachineBuilder};

	#[test]
	fn guards_serialize_updates() {
		let machine = MachineBuilder::new().build();
		let report = machine.boot(|| {
			let total = Arc::new(Mutex::named("total", 0u32));
			let threads: Vec<KThread> = (0..4)
				.map(|n| {
					let total = total.clone();
					let t = KThread::new(&format!("adder {}", n), move || {
						for _ in 0..25 {
							let mut guard = total.lock();
							let seen = *guard;
							KThread::yield_now();
							*guard = seen + 1;
						}
					});
					t.fork();
					t
				})
				.collect();
			for t in &threads {
				t.join();
			}
			assert_eq!(*total.lock(), 100);
		});
		assert_eq!(report.reason, khal::HaltReason::Idle);
	}
}
