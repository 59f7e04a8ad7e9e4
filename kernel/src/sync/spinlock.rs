// =============================================================================
// edukern: Interrupt-Masking Ticket Spinlock
// =============================================================================
//
// The innermost kernel lock. Taking it masks interrupts first, so a timer
// handler can never observe the protected state half-updated, and the ticket
// pair keeps acquisition FIFO.
//
// HOW IT WORKS:
//   - Two counters: `next_ticket` and `now_serving`
//   - To lock: mask interrupts, take a ticket, wait until it is served.
//   - To unlock: increment `now_serving`, then restore the interrupt mask.
//
// On the simulated machine only one thread ever runs, so the wait loop never
// actually spins. A thread that spins here would be holding the CPU while the
// holder is blocked, which is a kernel bug: never sleep with the guard alive.
//
// BLOCKING WITH THE STATE UPDATED:
//   The usual pattern for a primitive that enqueues the current thread and
//   blocks is
//
//       let mut state = lock.lock();
//       state.waiters.push(current);
//       let prev = state.unlock_masked();   // lock free, interrupts still off
//       KThread::sleep();
//       interrupt::restore(prev);
//
//   Releasing the ticket before sleeping lets the thread that wakes us take
//   the lock; keeping interrupts masked until `sleep` closes the window in
//   which a wake-up could be lost.
// =============================================================================

use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use khal::interrupt;

/// A ticket lock that keeps interrupts masked while held.
pub struct IrqSpinLock<T> {
	/// The next ticket to be dispensed.
	next_ticket: AtomicU32,
	/// The ticket currently being served.
	now_serving: AtomicU32,
	data: UnsafeCell<T>,
}

// SAFETY: the ticket protocol gives one thread at a time access to `data`.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
	pub const fn new(value: T) -> Self {
		Self {
			next_ticket: AtomicU32::new(0),
			now_serving: AtomicU32::new(0),
			data: UnsafeCell::new(value),
		}
	}

	/// Mask interrupts and take the lock. The previous mask is restored when
	/// the guard drops.
	pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
		let irq_was_enabled = interrupt::disable();

		let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
		while self.now_serving.load(Ordering::Acquire) != my_ticket {
			core::hint::spin_loop();
		}

		IrqSpinLockGuard {
			lock: self,
			irq_was_enabled,
		}
	}

	pub fn get_mut(&mut self) -> &mut T {
		self.data.get_mut()
	}

	fn unlock(&self) {
		self.now_serving.fetch_add(1, Ordering::Release);
	}
}

/// RAII guard for a held `IrqSpinLock`.
pub struct IrqSpinLockGuard<'a, T> {
	lock: &'a IrqSpinLock<T>,
	/// Whether interrupts were enabled before the lock was taken.
	irq_was_enabled: bool,
}

impl<T> IrqSpinLockGuard<'_, T> {
	/// Release the lock but leave interrupts masked. Returns the mask state
	/// to hand to `interrupt::restore` once the caller is done.
	pub fn unlock_masked(self) -> bool {
		let guard = ManuallyDrop::new(self);
		guard.lock.unlock();
		guard.irq_was_enabled
	}
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		// SAFETY: we hold the ticket being served.
		unsafe { &*self.lock.data.get() }
	}
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		// SAFETY: we hold the ticket being served.
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.unlock();
		interrupt::restore(self.irq_was_enabled);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use khal::MachineBuilder;

	#[test]
	fn masks_interrupts_while_held() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let lock = IrqSpinLock::new(0u32);
			assert!(interrupt::enabled());
			{
				let mut guard = lock.lock();
				*guard += 1;
				assert!(interrupt::disabled());
			}
			assert!(interrupt::enabled());
			assert_eq!(*lock.lock(), 1);
		});
	}

	#[test]
	fn nested_locks_restore_the_outer_state() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let a = IrqSpinLock::new(());
			let b = IrqSpinLock::new(());
			let outer = a.lock();
			{
				let _inner = b.lock();
			}
			assert!(interrupt::disabled());
			drop(outer);
			assert!(interrupt::enabled());
		});
	}

	#[test]
	fn unlock_masked_keeps_interrupts_off() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let lock = IrqSpinLock::new(5);
			let prev = lock.lock().unlock_masked();
			assert!(prev);
			assert!(interrupt::disabled());
			// The lock itself is free again.
			assert_eq!(*lock.lock(), 5);
			interrupt::restore(prev);
			assert!(interrupt::enabled());
		});
	}
}
