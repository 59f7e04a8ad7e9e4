// =============================================================================
// edukern: Kernel Lifecycle
// =============================================================================
//
// Two layers, each a superset of the one before:
//
//   ThreadedKernel  the alarm on the timer interrupt; enough for kernel
//                   threads that sleep, lock and wait
//   UserKernel      physical pages, the process table, and the first user
//                   program (the shell)
//
// The user kernel is installed on the machine as an extension, which is how
// syscall handlers running on any thread find it again.
//
// BOOT SEQUENCE:
//   1. Machine::boot starts the main thread
//   2. UserKernel::initialize: logger, alarm, page allocator
//   3. UserKernel::run: load and fork the shell, then the main thread ends
//   4. the machine halts when the last process exits, or on `halt`
// =============================================================================

use std::sync::Arc;

use khal::{machine, KThread};

use crate::config::{KernelConfig, ProcessKind};
use crate::memory::PageAllocator;
use crate::sync::{IrqSpinLock, Mutex};
use crate::task::process::{Image, LoadError, Pid, Process, ProcessTable};
use crate::task::Alarm;

// ── Threaded kernel ─────────────────────────────────────────────

/// Kernel threads plus timed sleeps.
pub struct ThreadedKernel {
	alarm: Arc<Alarm>,
}

impl ThreadedKernel {
	/// Hook the alarm up to the machine's timer.
	pub fn initialize() -> Self {
		let alarm = Alarm::install();
		klog::debug!("alarm installed on the timer interrupt");
		Self { alarm }
	}

	pub fn alarm(&self) -> &Arc<Alarm> {
		&self.alarm
	}

	/// Stop the machine.
	pub fn terminate(&self) -> ! {
		machine::current().halt()
	}
}

// ── User kernel ─────────────────────────────────────────────────

pub struct UserKernel {
	threaded: ThreadedKernel,
	config: KernelConfig,
	pages: PageAllocator,
	processes: Mutex<ProcessTable>,
	/// Processes started and not yet exited.
	live: IrqSpinLock<usize>,
}

impl UserKernel {
	/// Bring the kernel up on the current machine.
	pub fn initialize(config: KernelConfig) -> Arc<Self> {
		if let Some(level) = config.log_level {
			klog::init(level);
		}

		let machine = machine::current();
		let threaded = ThreadedKernel::initialize();
		let pages = PageAllocator::new(machine.processor().num_phys_pages());
		klog::info!(
			"user kernel: {} physical pages of {} bytes, {} processes",
			pages.total_pages(),
			machine.processor().page_size(),
			config.process_kind.name()
		);

		let kernel = Arc::new(Self {
			threaded,
			config,
			pages,
			processes: Mutex::named("process table", ProcessTable::new()),
			live: IrqSpinLock::new(0),
		});
		machine.install(kernel.clone());
		kernel
	}

	/// The kernel on the current machine.
	///
	/// Panics if no kernel has been initialized there.
	pub fn current() -> Arc<Self> {
		match Self::try_current() {
			Some(kernel) => kernel,
			None => panic!("no user kernel on this machine"),
		}
	}

	pub fn try_current() -> Option<Arc<Self>> {
		machine::try_current()?.extension::<UserKernel>()
	}

	pub fn config(&self) -> &KernelConfig {
		&self.config
	}

	pub fn alarm(&self) -> &Arc<Alarm> {
		self.threaded.alarm()
	}

	pub fn pages(&self) -> &PageAllocator {
		&self.pages
	}

	pub fn processes(&self) -> &Mutex<ProcessTable> {
		&self.processes
	}

	/// Processes started and not yet exited.
	pub fn live_processes(&self) -> usize {
		*self.live.lock()
	}

	/// Load `name` and start it as a child of `parent`. The PID is only
	/// taken once the program has loaded.
	pub fn spawn(&self, name: &str, args: &[String], parent: Option<Pid>) -> Result<Arc<Process>, LoadError> {
		let image = match self.config.process_kind {
			ProcessKind::User => Image::load(self, name, args)?,
		};
		let max_files = self.config.max_files;
		let process = self
			.processes
			.lock()
			.register(parent, |pid| Process::new(pid, name, image, max_files));

		*self.live.lock() += 1;
		if log::log_enabled!(log::Level::Debug) {
			klog::debug!("{} of {} pages free", self.pages.free_pages(), self.pages.total_pages());
		}
		klog::info!(
			"pid {}: {} {:?}, {} pages, parent {:?}",
			process.pid(),
			name,
			args,
			process.space().num_pages(),
			parent
		);
		process.start();
		Ok(process)
	}

	/// Count one process out; returns how many remain.
	pub(crate) fn process_exited(&self) -> usize {
		let mut live = self.live.lock();
		*live -= 1;
		*live
	}

	/// Start the shell and retire the boot thread. A shell name missing its
	/// `.coff` suffix is retried with one.
	pub fn run(&self) -> ! {
		let shell = &self.config.shell_program;
		let args = &self.config.shell_args;

		let started = match self.spawn(shell, args, None) {
			Err(LoadError::NotFound(_)) if !shell.ends_with(".coff") => {
				let retry = format!("{}.coff", shell);
				klog::info!("{} not found, trying {}", shell, retry);
				self.spawn(&retry, args, None)
			}
			other => other,
		};

		if let Err(e) = started {
			klog::error!("cannot start shell {}: {}", shell, e);
			self.terminate()
		}
		KThread::finish()
	}

	/// Stop the machine.
	pub fn terminate(&self) -> ! {
		klog::info!("user kernel halting, {} pages free", self.pages.free_pages());
		self.threaded.terminate()
	}
}
