//! The simulated machine and its boot sequence.
//!
//! A `Machine` owns every device. It is built once with `MachineBuilder`,
//! prepared from the host side (files, routines, console input), then booted:
//! `boot` runs the given closure as the first simulated thread and blocks
//! until the machine halts.

use std::any::Any;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use spin::Mutex;

use crate::console::Console;
use crate::fs::{FileSystem, MemFileSystem};
use crate::grader::{AutoGrader, NullGrader};
use crate::interrupt::Interrupt;
use crate::processor::Processor;
use crate::sched::{RoundRobinScheduler, Scheduler};
use crate::thread::{self, KThread, Outcome, Runtime};
use crate::timer::Timer;

/// Tunables of the simulated hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
	/// Number of physical pages in main memory.
	pub num_phys_pages: usize,
	/// Bytes per page.
	pub page_size: usize,
	/// Ticks between timer interrupts.
	pub timer_interval: u64,
	/// Ticks charged each time interrupts are re-enabled in kernel mode.
	pub kernel_tick: u64,
	/// Ticks charged per user-mode instruction.
	pub user_tick: u64,
	/// Consecutive idle ticks after which a machine with blocked threads is
	/// declared deadlocked.
	pub idle_limit: u64,
	/// Copy console output to the host's stdout as well.
	pub console_echo: bool,
}

impl Default for MachineConfig {
	fn default() -> Self {
		Self {
			num_phys_pages: 64,
			page_size: 0x400,
			timer_interval: 500,
			kernel_tick: 10,
			user_tick: 1,
			idle_limit: 10_000_000,
			console_echo: false,
		}
	}
}

/// Why the machine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
	/// `Machine::halt` was called.
	Terminated,
	/// Every thread finished.
	Idle,
	/// Threads remain but none became ready within the idle limit.
	Deadlock,
}

/// Final statistics of a machine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaltReport {
	pub reason: HaltReason,
	pub total_ticks: u64,
	pub kernel_ticks: u64,
	pub user_ticks: u64,
	pub idle_ticks: u64,
	pub context_switches: u64,
}

/// Tick and switch counters.
#[derive(Debug, Default)]
pub struct Stats {
	total: AtomicU64,
	kernel: AtomicU64,
	user: AtomicU64,
	idle: AtomicU64,
	switches: AtomicU64,
}

impl Stats {
	pub fn total_ticks(&self) -> u64 {
		self.total.load(Ordering::SeqCst)
	}

	pub fn kernel_ticks(&self) -> u64 {
		self.kernel.load(Ordering::SeqCst)
	}

	pub fn user_ticks(&self) -> u64 {
		self.user.load(Ordering::SeqCst)
	}

	pub fn idle_ticks(&self) -> u64 {
		self.idle.load(Ordering::SeqCst)
	}

	pub fn context_switches(&self) -> u64 {
		self.switches.load(Ordering::SeqCst)
	}

	pub(crate) fn advance(&self, ticks: u64, user: bool) {
		self.total.fetch_add(ticks, Ordering::SeqCst);
		if user {
			self.user.fetch_add(ticks, Ordering::SeqCst);
		} else {
			self.kernel.fetch_add(ticks, Ordering::SeqCst);
		}
	}

	pub(crate) fn advance_idle(&self, ticks: u64) {
		self.total.fetch_add(ticks, Ordering::SeqCst);
		self.idle.fetch_add(ticks, Ordering::SeqCst);
	}

	pub(crate) fn note_switch(&self) {
		self.switches.fetch_add(1, Ordering::SeqCst);
	}
}

/// A simulated single-core computer.
pub struct Machine {
	config: MachineConfig,
	stats: Stats,
	interrupt: Interrupt,
	timer: Timer,
	scheduler: Box<dyn Scheduler>,
	runtime: Runtime,
	processor: Processor,
	fs: Arc<dyn FileSystem>,
	console: Arc<Console>,
	grader: Arc<dyn AutoGrader>,
	extensions: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
	booted: AtomicBool,
}

impl Machine {
	pub fn config(&self) -> &MachineConfig {
		&self.config
	}

	pub fn stats(&self) -> &Stats {
		&self.stats
	}

	/// Current simulated time in ticks.
	pub fn now(&self) -> u64 {
		self.stats.total_ticks()
	}

	pub fn interrupt(&self) -> &Interrupt {
		&self.interrupt
	}

	pub fn timer(&self) -> &Timer {
		&self.timer
	}

	pub fn scheduler(&self) -> &dyn Scheduler {
		self.scheduler.as_ref()
	}

	pub fn processor(&self) -> &Processor {
		&self.processor
	}

	pub fn file_system(&self) -> &Arc<dyn FileSystem> {
		&self.fs
	}

	pub fn console(&self) -> &Arc<Console> {
		&self.console
	}

	pub fn grader(&self) -> &Arc<dyn AutoGrader> {
		&self.grader
	}

	pub(crate) fn runtime(&self) -> &Runtime {
		&self.runtime
	}

	pub fn is_halted(&self) -> bool {
		self.runtime.is_halted()
	}

	/// Attach a per-machine service, replacing any previous one of the same
	/// type.
	pub fn install<T: Any + Send + Sync>(&self, value: Arc<T>) {
		let mut extensions = self.extensions.lock();
		extensions.retain(|e| !(**e).is::<T>());
		extensions.push(value);
	}

	/// Look up a service attached with `install`.
	pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
		self.extensions
			.lock()
			.iter()
			.find_map(|e| e.clone().downcast::<T>().ok())
	}

	/// Run `main` as the first simulated thread and block until the machine
	/// halts. A panic in any simulated thread is re-raised here.
	pub fn boot<F>(self: &Arc<Self>, main: F) -> HaltReport
	where
		F: FnOnce() + Send + 'static,
	{
		assert!(!self.booted.swap(true, Ordering::SeqCst), "machine booted twice");

		let (tx, rx) = mpsc::channel();
		self.runtime.set_outcome_channel(tx);
		self.timer.start(self);
		thread::launch(self, KThread::new("main", main));

		let outcome = rx.recv();
		self.runtime.join_all();
		match outcome {
			Ok(Outcome::Halted(report)) => report,
			Ok(Outcome::Panicked(payload)) => panic::resume_unwind(payload),
			Err(_) => panic!("machine stopped without reporting"),
		}
	}

	/// Stop the machine. Must be called from a simulated thread; never
	/// returns to it.
	pub fn halt(&self) -> ! {
		self.stop(HaltReason::Terminated);
		thread::exit_host_thread()
	}

	pub(crate) fn stop(&self, reason: HaltReason) {
		let report = HaltReport {
			reason,
			total_ticks: self.stats.total_ticks(),
			kernel_ticks: self.stats.kernel_ticks(),
			user_ticks: self.stats.user_ticks(),
			idle_ticks: self.stats.idle_ticks(),
			context_switches: self.stats.context_switches(),
		};
		self.runtime.stop(Outcome::Halted(report));
	}
}

/// The machine the calling simulated thread runs on.
///
/// Panics outside a simulated thread.
pub fn current() -> Arc<Machine> {
	match thread::current_machine() {
		Some(machine) => machine,
		None => panic!("no simulated machine on this host thread"),
	}
}

/// Like `current`, but `None` outside a simulated thread.
pub fn try_current() -> Option<Arc<Machine>> {
	thread::current_machine()
}

/// Assembles a `Machine`.
pub struct MachineBuilder {
	config: MachineConfig,
	fs: Option<Arc<dyn FileSystem>>,
	grader: Option<Arc<dyn AutoGrader>>,
	scheduler: Option<Box<dyn Scheduler>>,
}

impl MachineBuilder {
	pub fn new() -> Self {
		Self {
			config: MachineConfig::default(),
			fs: None,
			grader: None,
			scheduler: None,
		}
	}

	pub fn config(mut self, config: MachineConfig) -> Self {
		self.config = config;
		self
	}

	pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
		self.fs = Some(fs);
		self
	}

	pub fn grader(mut self, grader: Arc<dyn AutoGrader>) -> Self {
		self.grader = Some(grader);
		self
	}

	pub fn scheduler(mut self, scheduler: Box<dyn Scheduler>) -> Self {
		self.scheduler = Some(scheduler);
		self
	}

	pub fn build(self) -> Arc<Machine> {
		let scheduler = self
			.scheduler
			.unwrap_or_else(|| Box::new(RoundRobinScheduler));
		let ready = scheduler.new_thread_queue(false);
		let console = Arc::new(Console::new(self.config.console_echo));
		Arc::new(Machine {
			stats: Stats::default(),
			interrupt: Interrupt::new(),
			timer: Timer::new(self.config.timer_interval),
			runtime: Runtime::new(ready),
			processor: Processor::new(self.config.num_phys_pages, self.config.page_size),
			fs: self.fs.unwrap_or_else(|| Arc::new(MemFileSystem::new())),
			grader: self.grader.unwrap_or_else(|| Arc::new(NullGrader)),
			console,
			scheduler,
			extensions: Mutex::new(Vec::new()),
			booted: AtomicBool::new(false),
			config: self.config,
		})
	}
}

impl Default for MachineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	#[test]
	fn boot_runs_main_and_goes_idle() {
		let machine = MachineBuilder::new().build();
		let ran = Arc::new(AtomicUsize::new(0));
		let r = ran.clone();
		let report = machine.boot(move || {
			r.fetch_add(1, Ordering::SeqCst);
		});
		assert_eq!(report.reason, HaltReason::Idle);
		assert_eq!(ran.load(Ordering::SeqCst), 1);
		assert!(machine.is_halted());
	}

	#[test]
	fn halt_stops_every_thread() {
		let machine = MachineBuilder::new().build();
		let report = machine.boot(|| {
			KThread::new("sleeper", || {
				crate::interrupt::disable();
				KThread::sleep();
			})
			.fork();
			KThread::yield_now();
			current().halt();
		});
		assert_eq!(report.reason, HaltReason::Terminated);
	}

	#[test]
	fn blocked_forever_is_a_deadlock() {
		let config = MachineConfig {
			idle_limit: 5_000,
			..MachineConfig::default()
		};
		let machine = MachineBuilder::new().config(config).build();
		let report = machine.boot(|| {
			crate::interrupt::disable();
			KThread::sleep();
		});
		assert_eq!(report.reason, HaltReason::Deadlock);
		assert!(report.idle_ticks >= 5_000);
	}

	#[test]
	#[should_panic(expected = "boom")]
	fn panics_surface_in_boot() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			KThread::new("child", || panic!("boom")).fork();
			KThread::yield_now();
		});
	}

	#[test]
	fn extensions_are_typed() {
		let machine = MachineBuilder::new().build();
		machine.install(Arc::new(7u32));
		machine.install(Arc::new(String::from("x")));
		machine.install(Arc::new(9u32));
		assert_eq!(machine.extension::<u32>().as_deref(), Some(&9));
		assert_eq!(machine.extension::<String>().as_deref().map(String::as_str), Some("x"));
		assert!(machine.extension::<u64>().is_none());
	}
}
