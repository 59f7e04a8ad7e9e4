// =============================================================================
// edukern: Kernel Library
// =============================================================================
//
// An educational kernel for the simulated machine in `khal`. The machine
// plays the hardware: one CPU, a timer, a console, a flat file system and
// physical memory. This crate is everything above it.
//
// LAYOUT:
//   sync/     spin lock with interrupts masked, Lock, Mutex, Condition,
//             Rendezvous
//   task/     Alarm (timed sleep) and user processes
//   memory/   physical page allocator, page tables, address spaces
//   fs/       per-process file descriptor tables
//   arch/     syscall numbers and dispatch
//   traps/    the exception handler user CPUs trap into
//   kernel    ThreadedKernel and UserKernel lifecycle
//   config    nachos.conf-style configuration
//
// A kernel is booted with `boot`, which runs until the machine halts.
// =============================================================================

pub mod arch;
pub mod config;
pub mod fs;
pub mod kernel;
pub mod memory;
pub mod sync;
pub mod task;
pub mod traps;

use std::sync::Arc;

use khal::{HaltReport, Machine};

pub use config::{Config, ConfigError, KernelConfig, ProcessKind};
pub use kernel::{ThreadedKernel, UserKernel};
pub use task::process::{LoadError, Pid, Process, ABNORMAL_EXIT};

/// Boot a user kernel on `machine` and run the configured shell until the
/// machine halts.
pub fn boot(machine: &Arc<Machine>, config: KernelConfig) -> HaltReport {
	machine.boot(move || {
		let kernel = UserKernel::initialize(config);
		kernel.run()
	})
}
