//! Per-process file descriptor table.
//!
//! Descriptors index a fixed-size table of open files. Slots 0 and 1 start
//! out as console input and output; new files take the lowest free slot from
//! 2 upwards.

use std::sync::Arc;

use khal::console::Console;
use khal::fs::OpenFile;

pub const STDIN: usize = 0;
pub const STDOUT: usize = 1;

/// First descriptor handed out by `open`/`create`.
const FIRST_FILE: usize = 2;

pub struct FdTable {
	slots: Vec<Option<Box<dyn OpenFile>>>,
}

impl FdTable {
	/// A table of `size` slots with the console on 0 and 1.
	pub fn new(size: usize, console: &Arc<Console>) -> Self {
		let mut slots: Vec<Option<Box<dyn OpenFile>>> = (0..size.max(FIRST_FILE)).map(|_| None).collect();
		slots[STDIN] = Some(console.open_for_reading());
		slots[STDOUT] = Some(console.open_for_writing());
		Self { slots }
	}

	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	/// Store `file` in the lowest free slot. Hands the file back when the
	/// table is full.
	pub fn insert(&mut self, file: Box<dyn OpenFile>) -> Result<usize, Box<dyn OpenFile>> {
		match self.slots[FIRST_FILE..].iter().position(Option::is_none) {
			Some(i) => {
				self.slots[FIRST_FILE + i] = Some(file);
				Ok(FIRST_FILE + i)
			}
			None => Err(file),
		}
	}

	/// The file open on `fd`, if `fd` is in range and in use.
	pub fn get_mut(&mut self, fd: i32) -> Option<&mut Box<dyn OpenFile>> {
		let fd = usize::try_from(fd).ok()?;
		self.slots.get_mut(fd)?.as_mut()
	}

	/// Close `fd`. False if it was not open.
	pub fn close(&mut self, fd: i32) -> bool {
		let Ok(fd) = usize::try_from(fd) else {
			return false;
		};
		match self.slots.get_mut(fd).and_then(Option::take) {
			Some(mut file) => {
				file.close();
				true
			}
			None => false,
		}
	}

	/// Close every descriptor from 2 upwards, leaving the console alone.
	pub fn close_files(&mut self) {
		for slot in &mut self.slots[FIRST_FILE..] {
			if let Some(mut file) = slot.take() {
				file.close();
			}
		}
	}

	/// Number of descriptors in use, console included.
	pub fn open_count(&self) -> usize {
		self.slots.iter().filter(|s| s.is_some()).count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use khal::fs::{FileSystem, MemFileSystem};
	use khal::MachineBuilder;

	fn console() -> Arc<Console> {
		MachineBuilder::new().build().console().clone()
	}

	#[test]
	fn console_occupies_the_first_two_slots() {
		let mut table = FdTable::new(16, &console());
		assert_eq!(table.capacity(), 16);
		assert_eq!(table.open_count(), 2);
		assert_eq!(table.get_mut(0).map(|f| f.name().to_string()).as_deref(), Some("console:in"));
		assert!(table.get_mut(1).is_some());
		assert!(table.get_mut(2).is_none());
		assert!(table.get_mut(-1).is_none());
		assert!(table.get_mut(16).is_none());
	}

	#[test]
	fn lowest_free_slot_wins_until_full() {
		let fs = MemFileSystem::new();
		let mut table = FdTable::new(4, &console());
		let open = |name: &str| fs.open(name, true).unwrap();

		assert_eq!(table.insert(open("a")).ok(), Some(2));
		assert_eq!(table.insert(open("b")).ok(), Some(3));
		assert!(table.insert(open("c")).is_err());

		assert!(table.close(2));
		assert!(!table.close(2));
		assert_eq!(table.insert(open("d")).ok(), Some(2));
	}

	#[test]
	fn close_files_spares_the_console() {
		let fs = MemFileSystem::new();
		let mut table = FdTable::new(8, &console());
		for name in ["a", "b", "c"] {
			table.insert(fs.open(name, true).unwrap()).ok();
		}
		assert_eq!(table.open_count(), 5);
		table.close_files();
		assert_eq!(table.open_count(), 2);
	}
}
