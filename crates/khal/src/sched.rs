//! Scheduling policy seam.
//!
//! The machine's ready queue and every kernel wait queue come from the
//! installed `Scheduler`, so a different policy changes wake order everywhere
//! without touching the primitives that use the queues.

use std::collections::VecDeque;

use crate::thread::KThread;

/// An ordered collection of threads waiting for some resource.
pub trait ThreadQueue: Send {
	/// Add a thread that wants the resource.
	fn wait_for_access(&mut self, thread: KThread);
	/// Remove and return the thread that should get the resource next.
	fn next_thread(&mut self) -> Option<KThread>;
	/// Note that `thread` obtained the resource without waiting.
	fn acquire(&mut self, thread: KThread);
	/// Take `thread` out of the queue without granting it anything. Returns
	/// false if it was not queued.
	fn remove(&mut self, thread: &KThread) -> bool;
	fn len(&self) -> usize;
	fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

pub trait Scheduler: Send + Sync {
	/// A fresh queue. `transfer_priority` asks for priority donation from
	/// waiters to the holder on policies that support it.
	fn new_thread_queue(&self, transfer_priority: bool) -> Box<dyn ThreadQueue>;
}

/// First come, first served.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinScheduler;

impl Scheduler for RoundRobinScheduler {
	fn new_thread_queue(&self, _transfer_priority: bool) -> Box<dyn ThreadQueue> {
		Box::new(FifoQueue::default())
	}
}

#[derive(Default)]
pub struct FifoQueue {
	waiting: VecDeque<KThread>,
}

impl ThreadQueue for FifoQueue {
	fn wait_for_access(&mut self, thread: KThread) {
		self.waiting.push_back(thread);
	}

	fn next_thread(&mut self) -> Option<KThread> {
		self.waiting.pop_front()
	}

	fn acquire(&mut self, _thread: KThread) {
		debug_assert!(self.waiting.is_empty());
	}

	fn remove(&mut self, thread: &KThread) -> bool {
		let before = self.waiting.len();
		self.waiting.retain(|t| t != thread);
		self.waiting.len() != before
	}

	fn len(&self) -> usize {
		self.waiting.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fifo_order() {
		let a = KThread::new("a", || {});
		let b = KThread::new("b", || {});
		let mut q = RoundRobinScheduler.new_thread_queue(false);
		assert!(q.is_empty());
		q.wait_for_access(a.clone());
		q.wait_for_access(b.clone());
		assert_eq!(q.next_thread(), Some(a));
		assert_eq!(q.next_thread(), Some(b));
		assert_eq!(q.next_thread(), None);
	}

	#[test]
	fn remove_keeps_the_rest_in_order() {
		let [a, b, c] = ["a", "b", "c"].map(|name| KThread::new(name, || {}));
		let mut q = RoundRobinScheduler.new_thread_queue(false);
		for t in [&a, &b, &c] {
			q.wait_for_access(t.clone());
		}
		assert!(q.remove(&b));
		assert!(!q.remove(&b));
		assert_eq!(q.len(), 2);
		assert_eq!(q.next_thread(), Some(a));
		assert_eq!(q.next_thread(), Some(c));
		assert!(q.is_empty());
	}
}
