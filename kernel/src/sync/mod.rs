// =============================================================================
// edukern: Kernel Synchronization Primitives
// =============================================================================
//
// Every primitive here is built from two things the machine provides:
// interrupt masking and the raw block/ready thread operations. There is one
// core, so masking interrupts is enough to make a read-modify-write atomic.
//
// Layers:
//   IrqSpinLock   interrupts masked while the guard lives; never blocks
//   Lock          blocking mutual exclusion with a scheduler wait queue
//   Mutex<T>      data-owning wrapper over Lock
//   Condition     monitor wait/signal over a Lock, with timeouts via Alarm
//   Rendezvous    two-party value exchange keyed by tag
//
// Lock ordering:
//   Level 1 (innermost): IrqSpinLock state (alarm queue, lock internals)
//   Level 2: Mutex-protected kernel data (free pages, process table)
//   Level 3 (outermost): Rendezvous map, then a slot
//
// A thread must never block while holding an IrqSpinLock. Use
// `IrqSpinLockGuard::unlock_masked` to drop the lock but keep interrupts
// masked up to the `KThread::sleep` call.
// =============================================================================

pub mod condition;
pub mod lock;
pub mod mutex;
pub mod rendezvous;
pub mod spinlock;

pub use condition::Condition;
pub use lock::Lock;
pub use mutex::{Mutex, MutexGuard};
pub use rendezvous::Rendezvous;
pub use spinlock::IrqSpinLock;
