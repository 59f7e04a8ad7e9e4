//! Physical page allocator.
//!
//! Keeps the set of free physical page numbers. Pages are handed out oldest
//! first: a freed page goes to the back of the list, so a page that was just
//! released is the last to be reused. Every operation runs under one kernel
//! `Mutex`, so callers may block briefly but never see the free list
//! half-updated.

use std::collections::VecDeque;

use crate::sync::Mutex;

pub struct PageAllocator {
	free: Mutex<VecDeque<u32>>,
	total: usize,
}

impl PageAllocator {
	/// An allocator owning physical pages `0..num_pages`.
	pub fn new(num_pages: usize) -> Self {
		Self {
			free: Mutex::named("free pages", (0..num_pages as u32).collect()),
			total: num_pages,
		}
	}

	/// Take one free page, or `None` when memory is exhausted.
	pub fn get_free_page(&self) -> Option<u32> {
		self.free.lock().pop_front()
	}

	/// Return `ppn` to the free set.
	///
	/// Panics on a page this allocator does not own or one that is already
	/// free: either means two owners believed they held the same page.
	pub fn release_page(&self, ppn: u32) {
		assert!((ppn as usize) < self.total, "released page {} out of range", ppn);
		let mut free = self.free.lock();
		assert!(!free.contains(&ppn), "page {} released twice", ppn);
		free.push_back(ppn);
	}

	pub fn free_pages(&self) -> usize {
		self.free.lock().len()
	}

	pub fn total_pages(&self) -> usize {
		self.total
	}
}
