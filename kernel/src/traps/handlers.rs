//! Exception handler for user processes.

use std::sync::Arc;

use khal::processor::{reg, Cpu, Exception, ExceptionHandler};

use crate::arch::syscall;
use crate::task::process::{Process, ABNORMAL_EXIT};

/// Traps from the CPU running one process.
///
/// Syscalls are served and the program continues after the trapping
/// instruction. Any other exception kills the process.
pub struct ProcessTrap {
	process: Arc<Process>,
}

impl ProcessTrap {
	pub fn new(process: Arc<Process>) -> Self {
		Self { process }
	}
}

impl ExceptionHandler for ProcessTrap {
	fn handle_exception(&self, cpu: &mut Cpu, cause: Exception) {
		match cause {
			Exception::Syscall => {
				let number = cpu.read_register(reg::V0);
				let args = [
					cpu.read_register(reg::A0),
					cpu.read_register(reg::A1),
					cpu.read_register(reg::A2),
					cpu.read_register(reg::A3),
				];
				let result = syscall::dispatch(&self.process, number, args);
				cpu.write_register(reg::V0, result as u32);
				cpu.advance_pc();
			}
			_ => {
				klog::warn!(
					"pid {} ({}): unexpected {} exception, pc={:#x} badvaddr={:#x}",
					self.process.pid(),
					self.process.name(),
					cause,
					cpu.read_register(reg::PC),
					cpu.read_register(reg::BAD_VADDR)
				);
				self.process.exit(ABNORMAL_EXIT)
			}
		}
	}
}
