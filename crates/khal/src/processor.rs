//! The simulated processor.
//!
//! `Processor` is the shared part: physical memory and the table of native
//! routines that stand in for machine code. `Cpu` is one user-mode register
//! context. It executes the routine named by the bytes at PC, and every user
//! memory access goes through the `Mmu` the kernel supplied. Faults and
//! syscalls are raised into the kernel's `ExceptionHandler`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use spin::Mutex;

use crate::interrupt;
use crate::machine::{self, Machine};

/// Register numbers.
pub mod reg {
	pub const V0: usize = 2;
	pub const V1: usize = 3;
	pub const A0: usize = 4;
	pub const A1: usize = 5;
	pub const A2: usize = 6;
	pub const A3: usize = 7;
	pub const SP: usize = 29;
	pub const RA: usize = 31;
	pub const PC: usize = 34;
	pub const NEXT_PC: usize = 35;
	pub const PREV_PC: usize = 36;
	pub const CAUSE: usize = 37;
	pub const BAD_VADDR: usize = 38;

	pub const COUNT: usize = 40;
}

/// Longest routine name the CPU will fetch.
const MAX_ROUTINE_NAME: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
	Syscall,
	PageFault,
	TlbMiss,
	ReadOnly,
	BusError,
	AddressError,
	Overflow,
	IllegalInstruction,
}

impl Exception {
	pub fn code(&self) -> u32 {
		match self {
			Exception::Syscall => 0,
			Exception::PageFault => 1,
			Exception::TlbMiss => 2,
			Exception::ReadOnly => 3,
			Exception::BusError => 4,
			Exception::AddressError => 5,
			Exception::Overflow => 6,
			Exception::IllegalInstruction => 7,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Exception::Syscall => "syscall",
			Exception::PageFault => "page fault",
			Exception::TlbMiss => "TLB miss",
			Exception::ReadOnly => "read-only",
			Exception::BusError => "bus error",
			Exception::AddressError => "address error",
			Exception::Overflow => "overflow",
			Exception::IllegalInstruction => "illegal instruction",
		}
	}
}

impl fmt::Display for Exception {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Address translation for one user context.
pub trait Mmu: Send + Sync {
	/// Translate `vaddr` to a physical address, or say why it cannot be.
	fn translate(&self, vaddr: u32, writing: bool) -> Result<u32, Exception>;
}

/// The kernel's entry point for traps.
pub trait ExceptionHandler: Send + Sync {
	fn handle_exception(&self, cpu: &mut Cpu, cause: Exception);
}

/// Native code standing in for a user program.
pub type Routine = Arc<dyn Fn(&mut Cpu) + Send + Sync>;

pub struct Processor {
	page_size: usize,
	num_phys_pages: usize,
	memory: Mutex<Vec<u8>>,
	routines: Mutex<BTreeMap<String, Routine>>,
}

impl Processor {
	pub(crate) fn new(num_phys_pages: usize, page_size: usize) -> Self {
		Self {
			page_size,
			num_phys_pages,
			memory: Mutex::new(vec![0; num_phys_pages * page_size]),
			routines: Mutex::new(BTreeMap::new()),
		}
	}

	pub fn page_size(&self) -> usize {
		self.page_size
	}

	pub fn num_phys_pages(&self) -> usize {
		self.num_phys_pages
	}

	pub fn page_from_address(&self, addr: u32) -> u32 {
		addr / self.page_size as u32
	}

	pub fn offset_from_address(&self, addr: u32) -> u32 {
		addr % self.page_size as u32
	}

	pub fn make_address(&self, page: u32, offset: u32) -> u32 {
		page * self.page_size as u32 + offset
	}

	/// Run `f` with exclusive access to physical memory.
	pub fn with_memory<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
		let mut memory = self.memory.lock();
		f(&mut memory)
	}

	/// Make `routine` executable under `name`.
	pub fn register_routine(&self, name: &str, routine: Routine) {
		self.routines.lock().insert(name.to_string(), routine);
	}

	pub fn routine(&self, name: &str) -> Option<Routine> {
		self.routines.lock().get(name).cloned()
	}
}

/// One user-mode register context.
pub struct Cpu {
	regs: [u32; reg::COUNT],
	mmu: Arc<dyn Mmu>,
	handler: Arc<dyn ExceptionHandler>,
	machine: Arc<Machine>,
}

impl Cpu {
	/// A context with all registers zero, on the calling thread's machine.
	pub fn new(mmu: Arc<dyn Mmu>, handler: Arc<dyn ExceptionHandler>) -> Self {
		Self {
			regs: [0; reg::COUNT],
			mmu,
			handler,
			machine: machine::current(),
		}
	}

	pub fn read_register(&self, r: usize) -> u32 {
		self.regs[r]
	}

	pub fn write_register(&mut self, r: usize, value: u32) {
		self.regs[r] = value;
	}

	pub fn processor(&self) -> &Processor {
		self.machine.processor()
	}

	/// Step PC past the current instruction.
	pub fn advance_pc(&mut self) {
		self.regs[reg::PREV_PC] = self.regs[reg::PC];
		self.regs[reg::PC] = self.regs[reg::NEXT_PC];
		self.regs[reg::NEXT_PC] = self.regs[reg::NEXT_PC].wrapping_add(4);
	}

	/// Deliver `cause` to the kernel.
	pub fn raise(&mut self, cause: Exception) {
		self.regs[reg::CAUSE] = cause.code();
		let handler = self.handler.clone();
		handler.handle_exception(self, cause);
	}

	/// Execute user code starting at PC. Only leaves through the kernel, by
	/// way of an exiting process.
	pub fn run(&mut self) -> ! {
		loop {
			let pc = self.regs[reg::PC];
			match self.fetch(pc) {
				Ok(routine) => {
					routine(self);
					// Fell off the end of the program.
					self.raise(Exception::IllegalInstruction);
				}
				Err(cause) => {
					self.regs[reg::BAD_VADDR] = pc;
					self.raise(cause);
				}
			}
		}
	}

	/// Charge one instruction of user time.
	pub fn step(&mut self) {
		interrupt::tick_user();
	}

	/// Trap into the kernel with syscall number `nr`; returns v0.
	pub fn syscall(&mut self, nr: u32, args: [u32; 4]) -> i32 {
		self.step();
		self.regs[reg::V0] = nr;
		self.regs[reg::A0] = args[0];
		self.regs[reg::A1] = args[1];
		self.regs[reg::A2] = args[2];
		self.regs[reg::A3] = args[3];
		self.raise(Exception::Syscall);
		self.regs[reg::V0] as i32
	}

	/// Load `buf.len()` bytes from user memory. A fault is raised into the
	/// kernel; if the kernel lets the program continue, the fault is
	/// returned.
	pub fn read_mem(&mut self, vaddr: u32, buf: &mut [u8]) -> Result<(), Exception> {
		self.step();
		for (i, byte) in buf.iter_mut().enumerate() {
			let paddr = self.translate(vaddr.wrapping_add(i as u32), false)?;
			*byte = self.processor().with_memory(|m| m[paddr as usize]);
		}
		Ok(())
	}

	/// Store `buf` into user memory; faults as for `read_mem`.
	pub fn write_mem(&mut self, vaddr: u32, buf: &[u8]) -> Result<(), Exception> {
		self.step();
		for (i, byte) in buf.iter().enumerate() {
			let paddr = self.translate(vaddr.wrapping_add(i as u32), true)?;
			self.processor().with_memory(|m| m[paddr as usize] = *byte);
		}
		Ok(())
	}

	pub fn read_word(&mut self, vaddr: u32) -> Result<u32, Exception> {
		let mut word = [0u8; 4];
		self.read_mem(vaddr, &mut word)?;
		Ok(u32::from_le_bytes(word))
	}

	pub fn write_word(&mut self, vaddr: u32, value: u32) -> Result<(), Exception> {
		self.write_mem(vaddr, &value.to_le_bytes())
	}

	fn translate(&mut self, vaddr: u32, writing: bool) -> Result<u32, Exception> {
		let translated = self.mmu.translate(vaddr, writing).and_then(|paddr| {
			let memory_size = self.processor().num_phys_pages() * self.processor().page_size();
			if (paddr as usize) < memory_size {
				Ok(paddr)
			} else {
				Err(Exception::BusError)
			}
		});
		if let Err(cause) = translated {
			self.regs[reg::BAD_VADDR] = vaddr;
			self.raise(cause);
		}
		translated
	}

	fn fetch(&mut self, pc: u32) -> Result<Routine, Exception> {
		let mut name = Vec::new();
		for i in 0..MAX_ROUTINE_NAME as u32 {
			let paddr = self.mmu.translate(pc.wrapping_add(i), false)?;
			let byte = self.processor().with_memory(|m| m.get(paddr as usize).copied());
			match byte {
				Some(0) => break,
				Some(b) => name.push(b),
				None => return Err(Exception::BusError),
			}
		}
		let name = String::from_utf8(name).map_err(|_| Exception::IllegalInstruction)?;
		self.processor()
			.routine(&name)
			.ok_or(Exception::IllegalInstruction)
	}
}
