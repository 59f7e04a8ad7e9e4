//! User processes.
//!
//! A process is a loaded program image (address space plus executable), a
//! file descriptor table, and the kernel thread that runs the program on a
//! user-mode CPU context. Processes form a tree: `exec` makes the caller the
//! parent of the new process, only a parent may `join` a child, and a parent
//! that exits leaves its children orphaned but running.
//!
//! # Layout of a process's virtual memory
//!
//! ```text
//! vpn 0 ..                 executable sections, contiguous from page 0
//!      .. + stack_pages    stack, growing down from the top
//!      last page           argv: argc pointers, then the NUL-terminated strings
//! ```
//!
//! # Ownership
//!
//! Processes live in the kernel's `ProcessTable`, keyed by PID. Parent and
//! child links are PIDs held in the table, so no process owns another. An
//! exited process stays in the table until its parent joins it or exits
//! itself; an exited process without a parent is dropped from the table
//! straight away.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::Arc;

use khal::coff::{Coff, CoffError};
use khal::fs::OpenFile;
use khal::processor::{reg, Cpu};
use khal::{machine, KThread};

use crate::fs::FdTable;
use crate::kernel::UserKernel;
use crate::memory::AddressSpace;
use crate::sync::Mutex;
use crate::traps::ProcessTrap;

/// Process identifier. The first process is 0.
pub type Pid = i32;

/// Exit status of a process killed by the kernel.
pub const ABNORMAL_EXIT: i32 = i32::MIN;

// ── Loading ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
	/// No file by that name.
	NotFound(String),
	/// The file is not a valid executable.
	BadImage(CoffError),
	/// Sections must tile the pages from 0 without gaps.
	Fragmented { section: String, first_vpn: u32, expected: u32 },
	/// The argument block must fit in one page.
	ArgumentsTooLong { size: usize, limit: usize },
	/// More pages than the machine has, even when idle.
	TooLarge { pages: usize, available: usize },
	/// Not enough free physical pages right now.
	OutOfMemory { pages: usize },
}

impl fmt::Display for LoadError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			LoadError::NotFound(name) => write!(f, "{}: no such file", name),
			LoadError::BadImage(e) => write!(f, "bad executable: {}", e),
			LoadError::Fragmented {
				section,
				first_vpn,
				expected,
			} => write!(
				f,
				"fragmented executable: section {} starts at page {}, expected {}",
				section, first_vpn, expected
			),
			LoadError::ArgumentsTooLong { size, limit } => {
				write!(f, "arguments take {} bytes, limit is {}", size, limit)
			}
			LoadError::TooLarge { pages, available } => {
				write!(f, "needs {} pages, machine has {}", pages, available)
			}
			LoadError::OutOfMemory { pages } => write!(f, "cannot allocate {} pages", pages),
		}
	}
}

impl std::error::Error for LoadError {}

impl From<CoffError> for LoadError {
	fn from(e: CoffError) -> Self {
		LoadError::BadImage(e)
	}
}

/// A program loaded into memory, ready to become a process.
pub struct Image {
	space: AddressSpace,
	executable: Box<dyn OpenFile>,
	entry: u32,
	initial_sp: u32,
	argc: u32,
	argv: u32,
}

impl Image {
	/// Open `name`, build an address space for it, copy its sections in and
	/// write `args` into the argument page. On failure every page taken is
	/// given back.
	pub fn load(kernel: &UserKernel, name: &str, args: &[String]) -> Result<Self, LoadError> {
		klog::debug!("load {:?} {:?}", name, args);
		let machine = machine::current();
		let processor = machine.processor();
		let page_size = processor.page_size();

		let mut executable = machine
			.file_system()
			.open(name, false)
			.ok_or_else(|| LoadError::NotFound(name.to_string()))?;
		let coff = match Coff::load(&mut *executable, page_size) {
			Ok(coff) => coff,
			Err(e) => {
				executable.close();
				return Err(e.into());
			}
		};

		let layout = match Layout::plan(kernel, &coff, args, page_size, processor.num_phys_pages()) {
			Ok(layout) => layout,
			Err(e) => {
				executable.close();
				return Err(e);
			}
		};

		let Some(space) = AddressSpace::allocate(kernel.pages(), layout.num_pages, page_size) else {
			executable.close();
			return Err(LoadError::OutOfMemory {
				pages: layout.num_pages,
			});
		};

		for section in coff.sections() {
			klog::trace!(
				"  {} section: pages {}..{}{}",
				section.name(),
				section.first_vpn(),
				section.first_vpn() + section.length(),
				if section.is_read_only() { " (read-only)" } else { "" }
			);
			for spn in 0..section.length() {
				let vpn = section.first_vpn() + spn;
				// Layout::plan checked that every section page is mapped.
				if let Some(ppn) = space.ppn(vpn) {
					space.set_read_only(vpn, section.is_read_only());
					section.load_page(spn, ppn, processor);
				}
			}
		}

		let argv = ((layout.num_pages - 1) * page_size) as u32;
		if !write_arguments(&space, argv, args) {
			space.release(kernel.pages());
			executable.close();
			return Err(LoadError::ArgumentsTooLong {
				size: layout.args_size,
				limit: page_size,
			});
		}

		Ok(Self {
			space,
			executable,
			entry: coff.entry_point(),
			initial_sp: layout.initial_sp,
			argc: args.len() as u32,
			argv,
		})
	}
}

/// Page counts for a program about to be loaded.
struct Layout {
	num_pages: usize,
	initial_sp: u32,
	args_size: usize,
}

impl Layout {
	fn plan(
		kernel: &UserKernel,
		coff: &Coff,
		args: &[String],
		page_size: usize,
		phys_pages: usize,
	) -> Result<Self, LoadError> {
		let mut num_pages = 0u32;
		for section in coff.sections() {
			if section.first_vpn() != num_pages {
				return Err(LoadError::Fragmented {
					section: section.name().to_string(),
					first_vpn: section.first_vpn(),
					expected: num_pages,
				});
			}
			num_pages += section.length();
		}

		// A pointer plus the string and its terminator, per argument.
		let args_size: usize = args.iter().map(|a| 4 + a.len() + 1).sum();
		if args_size > page_size {
			return Err(LoadError::ArgumentsTooLong {
				size: args_size,
				limit: page_size,
			});
		}

		let stack_top = num_pages as usize + kernel.config().stack_pages;
		let num_pages = stack_top + 1;
		if num_pages > phys_pages {
			return Err(LoadError::TooLarge {
				pages: num_pages,
				available: phys_pages,
			});
		}

		Ok(Self {
			num_pages,
			initial_sp: (stack_top * page_size) as u32,
			args_size,
		})
	}
}

/// Write the argv block at `base`: the pointer array, then the strings.
fn write_arguments(space: &AddressSpace, base: u32, args: &[String]) -> bool {
	let mut entry = base;
	let mut string = base + 4 * args.len() as u32;
	for arg in args {
		if space.write(entry, &string.to_le_bytes()) != 4 {
			return false;
		}
		entry += 4;

		let mut bytes = arg.as_bytes().to_vec();
		bytes.push(0);
		if space.write(string, &bytes) != bytes.len() {
			return false;
		}
		string += bytes.len() as u32;
	}
	true
}

// ── Processes ───────────────────────────────────────────────────

pub struct Process {
	pid: Pid,
	name: String,
	space: AddressSpace,
	executable: spin::Mutex<Option<Box<dyn OpenFile>>>,
	entry: u32,
	initial_sp: u32,
	argc: u32,
	argv: u32,
	files: Mutex<FdTable>,
	exit_status: spin::Mutex<Option<i32>>,
	thread: spin::Mutex<Option<KThread>>,
}

impl Process {
	pub(crate) fn new(pid: Pid, name: &str, image: Image, max_files: usize) -> Self {
		let console = machine::current().console().clone();
		Self {
			pid,
			name: name.to_string(),
			space: image.space,
			executable: spin::Mutex::new(Some(image.executable)),
			entry: image.entry,
			initial_sp: image.initial_sp,
			argc: image.argc,
			argv: image.argv,
			files: Mutex::named("fd table", FdTable::new(max_files, &console)),
			exit_status: spin::Mutex::new(None),
			thread: spin::Mutex::new(None),
		}
	}

	pub fn pid(&self) -> Pid {
		self.pid
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn space(&self) -> &AddressSpace {
		&self.space
	}

	pub fn files(&self) -> &Mutex<FdTable> {
		&self.files
	}

	/// The status passed to `exit`, once the process has exited.
	pub fn exit_status(&self) -> Option<i32> {
		*self.exit_status.lock()
	}

	pub fn has_exited(&self) -> bool {
		self.exit_status().is_some()
	}

	/// The thread running this process, once started.
	pub fn thread(&self) -> Option<KThread> {
		self.thread.lock().clone()
	}

	/// Fork the thread that runs the program.
	pub(crate) fn start(self: &Arc<Self>) {
		let process = self.clone();
		let thread = KThread::new(&self.name, move || process.run());
		*self.thread.lock() = Some(thread.clone());
		thread.fork();
	}

	fn run(self: Arc<Self>) -> ! {
		klog::debug!("pid {}: running {}", self.pid, self.name);
		let trap = Arc::new(ProcessTrap::new(self.clone()));
		let mut cpu = Cpu::new(self.space.mmu(), trap);
		self.init_registers(&mut cpu);
		cpu.run()
	}

	/// All registers zero except PC and next-PC at the entry point, SP at
	/// the top of the stack, and a0/a1 holding argc/argv.
	pub fn init_registers(&self, cpu: &mut Cpu) {
		for r in 0..reg::COUNT {
			cpu.write_register(r, 0);
		}
		cpu.write_register(reg::PC, self.entry);
		cpu.write_register(reg::NEXT_PC, self.entry.wrapping_add(4));
		cpu.write_register(reg::SP, self.initial_sp);
		cpu.write_register(reg::A0, self.argc);
		cpu.write_register(reg::A1, self.argv);
	}

	/// Start `name` as a child of this process; returns the child's PID.
	pub fn exec(&self, name: &str, args: &[String]) -> Result<Pid, LoadError> {
		let child = UserKernel::current().spawn(name, args, Some(self.pid))?;
		Ok(child.pid())
	}

	/// Wait for child `pid` to exit and reap it. `None` if `pid` is not a
	/// child of this process, or was already joined.
	pub fn join(&self, pid: Pid) -> Option<i32> {
		let kernel = UserKernel::current();
		let child = kernel.processes().lock().child(self.pid, pid)?;

		if let Some(thread) = child.thread() {
			thread.join();
		}
		kernel.processes().lock().reap(self.pid, pid);

		let status = child.exit_status().unwrap_or(ABNORMAL_EXIT);
		klog::debug!("pid {}: joined {} with status {}", self.pid, pid, status);
		Some(status)
	}

	/// Tear the process down and end its thread. The last process to exit
	/// halts the machine.
	pub fn exit(&self, status: i32) -> ! {
		let machine = machine::current();
		machine.grader().finishing_current_process(status);
		klog::debug!("pid {}: exit({})", self.pid, status);

		let kernel = UserKernel::current();
		self.files.lock().close_files();
		self.space.release(kernel.pages());
		if let Some(mut executable) = self.executable.lock().take() {
			executable.close();
		}

		{
			let mut table = kernel.processes().lock();
			*self.exit_status.lock() = Some(status);
			table.retire(self.pid);
		}

		if kernel.process_exited() == 0 {
			klog::info!("last process exited");
			kernel.terminate()
		}
		KThread::finish()
	}
}

impl fmt::Debug for Process {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Process")
			.field("pid", &self.pid)
			.field("name", &self.name)
			.field("pages", &self.space.num_pages())
			.field("exit_status", &self.exit_status())
			.finish()
	}
}

// ── Process table ───────────────────────────────────────────────

struct Entry {
	process: Arc<Process>,
	parent: Option<Pid>,
	children: BTreeSet<Pid>,
}

/// Every process that is running or waiting to be joined, by PID.
pub struct ProcessTable {
	next_pid: Pid,
	entries: BTreeMap<Pid, Entry>,
}

impl ProcessTable {
	pub fn new() -> Self {
		Self {
			next_pid: 0,
			entries: BTreeMap::new(),
		}
	}

	/// Assign the next PID to a new process and record it as a child of
	/// `parent`.
	pub(crate) fn register(
		&mut self,
		parent: Option<Pid>,
		build: impl FnOnce(Pid) -> Process,
	) -> Arc<Process> {
		let pid = self.next_pid;
		self.next_pid += 1;

		let process = Arc::new(build(pid));
		let parent = parent.filter(|p| self.entries.contains_key(p));
		if let Some(entry) = parent.and_then(|p| self.entries.get_mut(&p)) {
			entry.children.insert(pid);
		}
		self.entries.insert(
			pid,
			Entry {
				process: process.clone(),
				parent,
				children: BTreeSet::new(),
			},
		);
		process
	}

	pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
		self.entries.get(&pid).map(|e| e.process.clone())
	}

	pub fn parent_of(&self, pid: Pid) -> Option<Pid> {
		self.entries.get(&pid).and_then(|e| e.parent)
	}

	pub fn children_of(&self, pid: Pid) -> Vec<Pid> {
		self.entries
			.get(&pid)
			.map(|e| e.children.iter().copied().collect())
			.unwrap_or_default()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// `child`, if it is a child `parent` has not joined yet.
	fn child(&self, parent: Pid, child: Pid) -> Option<Arc<Process>> {
		let entry = self.entries.get(&parent)?;
		if !entry.children.contains(&child) {
			return None;
		}
		self.get(child)
	}

	/// Forget a joined child.
	fn reap(&mut self, parent: Pid, child: Pid) {
		if let Some(entry) = self.entries.get_mut(&parent) {
			entry.children.remove(&child);
		}
		self.entries.remove(&child);
	}

	/// Bookkeeping for an exiting process: running children lose their
	/// parent, exited ones can never be joined now and are dropped, and the
	/// process itself goes too unless a parent may still join it.
	fn retire(&mut self, pid: Pid) {
		let Some(entry) = self.entries.get_mut(&pid) else {
			return;
		};
		let children = mem::take(&mut entry.children);
		let orphan = entry.parent.is_none();

		for child in children {
			let exited = match self.entries.get_mut(&child) {
				Some(entry) => {
					entry.parent = None;
					entry.process.has_exited()
				}
				None => false,
			};
			if exited {
				self.entries.remove(&child);
			}
		}
		if orphan {
			self.entries.remove(&pid);
		}
	}
}

impl Default for ProcessTable {
	fn default() -> Self {
		Self::new()
	}
}
