//! Physical and virtual memory management.
//!
//! `pmm` hands out physical pages; `vmm` maps a process's virtual pages onto
//! them and moves bytes between kernel buffers and user memory.

pub mod pmm;
pub mod vmm;

pub use pmm::PageAllocator;
pub use vmm::{AddressSpace, PageTable, PageTableEntry, PteFlags};
