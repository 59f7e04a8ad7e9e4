// =============================================================================
// edukern: Virtual Memory Manager
// =============================================================================
//
// Each user process gets a single-level page table: one entry per virtual
// page, indexed by virtual page number. There is no demand paging, so every
// entry of a live process is valid and pinned to its physical page until the
// process exits.
//
// ADDRESS TRANSLATION:
//
//   vaddr ──► vpn = vaddr / page_size, offset = vaddr % page_size
//         ──► entry = table[vpn]
//         ──► paddr = entry.ppn * page_size + offset
//
//   Failures, in the order they are checked:
//     vpn beyond the table        → AddressError
//     entry not VALID             → PageFault
//     write to a READ_ONLY page   → ReadOnly
//
//   A successful access sets USED, and a write also sets DIRTY.
//
// KERNEL ACCESS TO USER MEMORY:
//   Syscalls move bytes between kernel buffers and user memory through
//   `AddressSpace::read` / `write`. Those never fault: a transfer that runs
//   into an unmapped or read-only page, or off the end of the address space,
//   stops there and reports how many bytes it moved. Transfers are split at
//   page boundaries since neighbouring virtual pages are rarely neighbours in
//   physical memory.
// =============================================================================

use std::sync::Arc;

use bitflags::bitflags;
use khal::machine;
use khal::processor::{Exception, Mmu};

use crate::memory::pmm::PageAllocator;

// =============================================================================
// Page Table Entries
// =============================================================================

bitflags! {
	/// Per-page permission and status bits.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PteFlags: u8 {
		/// The entry maps a physical page. If clear, any access is a page
		/// fault.
		const VALID     = 1 << 0;

		/// Writes through this entry fault with `ReadOnly`.
		/// Set for code sections the executable marks read-only.
		const READ_ONLY = 1 << 1;

		/// Set on any successful access.
		const USED      = 1 << 2;

		/// Set on a successful write.
		const DIRTY     = 1 << 3;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
	pub vpn: u32,
	pub ppn: u32,
	pub flags: PteFlags,
}

impl PteFlags {
	/// Status bits a successful access sets.
	fn accessed(writing: bool) -> Self {
		if writing {
			Self::USED | Self::DIRTY
		} else {
			Self::USED
		}
	}
}

impl PageTableEntry {
	/// A valid, writable mapping of `vpn` onto `ppn`.
	pub fn new(vpn: u32, ppn: u32) -> Self {
		Self {
			vpn,
			ppn,
			flags: PteFlags::VALID,
		}
	}

	pub fn is_valid(&self) -> bool {
		self.flags.contains(PteFlags::VALID)
	}

	pub fn is_read_only(&self) -> bool {
		self.flags.contains(PteFlags::READ_ONLY)
	}
}

// =============================================================================
// Page Table
// =============================================================================

/// A process's page table. Also the MMU its user context translates through.
pub struct PageTable {
	page_size: usize,
	entries: spin::Mutex<Vec<PageTableEntry>>,
}

impl PageTable {
	pub fn new(page_size: usize, entries: Vec<PageTableEntry>) -> Self {
		Self {
			page_size,
			entries: spin::Mutex::new(entries),
		}
	}

	pub fn page_size(&self) -> usize {
		self.page_size
	}

	pub fn num_pages(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn entry(&self, vpn: u32) -> Option<PageTableEntry> {
		self.entries.lock().get(vpn as usize).copied()
	}

	pub fn set_read_only(&self, vpn: u32, read_only: bool) {
		if let Some(entry) = self.entries.lock().get_mut(vpn as usize) {
			entry.flags.set(PteFlags::READ_ONLY, read_only);
		}
	}

	/// Set USED, and DIRTY for a write, on `vpn`'s entry.
	pub fn mark_accessed(&self, vpn: u32, writing: bool) {
		if let Some(entry) = self.entries.lock().get_mut(vpn as usize) {
			entry.flags.insert(PteFlags::accessed(writing));
		}
	}

	/// Invalidate every entry; returns the physical pages that were mapped.
	pub fn unmap_all(&self) -> Vec<u32> {
		let mut entries = self.entries.lock();
		let mut freed = Vec::with_capacity(entries.len());
		for entry in entries.iter_mut().filter(|e| e.is_valid()) {
			entry.flags.remove(PteFlags::VALID);
			freed.push(entry.ppn);
		}
		freed
	}

	/// Look up the physical address for `vaddr`, recording the access.
	pub fn translate(&self, vaddr: u32, writing: bool) -> Result<u32, Exception> {
		let vpn = vaddr as usize / self.page_size;
		let offset = vaddr as usize % self.page_size;

		let mut entries = self.entries.lock();
		let entry = entries.get_mut(vpn).ok_or(Exception::AddressError)?;
		if !entry.is_valid() {
			return Err(Exception::PageFault);
		}
		if writing && entry.is_read_only() {
			return Err(Exception::ReadOnly);
		}

		entry.flags.insert(PteFlags::accessed(writing));
		Ok((entry.ppn as usize * self.page_size + offset) as u32)
	}
}

impl Mmu for PageTable {
	fn translate(&self, vaddr: u32, writing: bool) -> Result<u32, Exception> {
		PageTable::translate(self, vaddr, writing)
	}
}

// =============================================================================
// Address Space
// =============================================================================

/// The virtual memory of one process.
pub struct AddressSpace {
	table: Arc<PageTable>,
}

impl AddressSpace {
	/// Map `num_pages` virtual pages onto fresh physical pages. On
	/// exhaustion every page taken so far is given back and `None` returned.
	pub fn allocate(pages: &PageAllocator, num_pages: usize, page_size: usize) -> Option<Self> {
		let mut entries = Vec::with_capacity(num_pages);
		for vpn in 0..num_pages as u32 {
			match pages.get_free_page() {
				Some(ppn) => entries.push(PageTableEntry::new(vpn, ppn)),
				None => {
					klog::debug!(
						"address space: out of physical pages after {} of {}",
						vpn,
						num_pages
					);
					for entry in &entries {
						pages.release_page(entry.ppn);
					}
					return None;
				}
			}
		}
		Some(Self {
			table: Arc::new(PageTable::new(page_size, entries)),
		})
	}

	pub fn num_pages(&self) -> usize {
		self.table.num_pages()
	}

	pub fn page_size(&self) -> usize {
		self.table.page_size()
	}

	/// One past the highest valid virtual address.
	pub fn size(&self) -> usize {
		self.num_pages() * self.page_size()
	}

	pub fn page_table(&self) -> &Arc<PageTable> {
		&self.table
	}

	/// The translation a user context of this process runs under.
	pub fn mmu(&self) -> Arc<dyn Mmu> {
		self.table.clone()
	}

	/// Physical page backing `vpn`, if mapped.
	pub fn ppn(&self, vpn: u32) -> Option<u32> {
		self.table.entry(vpn).filter(|e| e.is_valid()).map(|e| e.ppn)
	}

	pub fn set_read_only(&self, vpn: u32, read_only: bool) {
		self.table.set_read_only(vpn, read_only);
	}

	/// Give every mapped page back to `pages`. The address space is empty
	/// afterwards, so a second call releases nothing.
	pub fn release(&self, pages: &PageAllocator) {
		for ppn in self.table.unmap_all() {
			pages.release_page(ppn);
		}
	}

	/// Copy user memory at `vaddr` into `buf`. Returns the number of bytes
	/// copied, which is short if the range leaves the mapped pages.
	pub fn read(&self, vaddr: u32, buf: &mut [u8]) -> usize {
		self.transfer(vaddr, buf.len(), false, |memory, done| {
			let n = memory.len();
			buf[done..done + n].copy_from_slice(memory);
		})
	}

	/// Copy `buf` into user memory at `vaddr`. Stops at the first page that
	/// is unmapped or read-only; returns the number of bytes copied.
	pub fn write(&self, vaddr: u32, buf: &[u8]) -> usize {
		self.transfer(vaddr, buf.len(), true, |memory, done| {
			let n = memory.len();
			memory.copy_from_slice(&buf[done..done + n]);
		})
	}

	/// Read a NUL-terminated string of at most `max_len` bytes (terminator
	/// excluded). `None` if no terminator turns up in time.
	pub fn read_string(&self, vaddr: u32, max_len: usize) -> Option<String> {
		let mut bytes = vec![0u8; max_len + 1];
		let read = self.read(vaddr, &mut bytes);
		let len = bytes[..read].iter().position(|&b| b == 0)?;
		Some(String::from_utf8_lossy(&bytes[..len]).into_owned())
	}

	/// Walk `len` bytes from `vaddr` page by page, handing each in-page
	/// chunk of physical memory to `copy` along with the bytes done so far.
	fn transfer<F>(&self, vaddr: u32, len: usize, writing: bool, mut copy: F) -> usize
	where
		F: FnMut(&mut [u8], usize),
	{
		let page_size = self.page_size();
		let limit = self.size();
		let machine = machine::current();
		let processor = machine.processor();

		let mut done = 0;
		while done < len {
			let va = vaddr as usize + done;
			if va >= limit {
				break;
			}
			let vpn = (va / page_size) as u32;
			let offset = va % page_size;
			let Some(entry) = self.table.entry(vpn) else {
				break;
			};
			if !entry.is_valid() || (writing && entry.is_read_only()) {
				break;
			}

			let n = (page_size - offset).min(len - done);
			let paddr = entry.ppn as usize * page_size + offset;
			let copied = processor.with_memory(|memory| match memory.get_mut(paddr..paddr + n) {
				Some(chunk) => {
					copy(chunk, done);
					true
				}
				None => false,
			});
			if !copied {
				break;
			}
			self.table.mark_accessed(vpn, writing);
			done += n;
		}
		done
	}
}
