//! Shared setup for end-to-end kernel tests.

#![allow(dead_code)]

use std::sync::Arc;

use edukern::KernelConfig;
use khal::fs::MemFileSystem;
use khal::grader::ExitLog;
use khal::processor::Cpu;
use khal::{HaltReport, Machine, MachineBuilder, MachineConfig};

/// A machine with an in-memory file system and an exit-status log.
pub struct Rig {
	pub machine: Arc<Machine>,
	pub fs: Arc<MemFileSystem>,
	pub exits: Arc<ExitLog>,
}

impl Rig {
	pub fn new() -> Self {
		Self::with_pages(64)
	}

	pub fn with_pages(num_phys_pages: usize) -> Self {
		let fs = Arc::new(MemFileSystem::new());
		let exits = Arc::new(ExitLog::new());
		let machine = MachineBuilder::new()
			.config(MachineConfig {
				num_phys_pages,
				..MachineConfig::default()
			})
			.file_system(fs.clone())
			.grader(exits.clone())
			.build();
		Self { machine, fs, exits }
	}

	pub fn program<F>(&self, name: &str, main: F) -> &Self
	where
		F: Fn(&mut Cpu, &[String]) -> i32 + Send + Sync + 'static,
	{
		libek::install(&self.machine, &self.fs, name, main);
		self
	}

	/// Boot with `shell` as the first program.
	pub fn run(&self, shell: &str, args: &[&str]) -> HaltReport {
		let config = KernelConfig {
			shell_program: shell.to_string(),
			shell_args: args.iter().map(|a| a.to_string()).collect(),
			..KernelConfig::default()
		};
		edukern::boot(&self.machine, config)
	}

	pub fn console(&self) -> String {
		self.machine.console().output_string()
	}
}

/// Print one formatted line on the console. The line is built before `cpu`
/// is borrowed, so its arguments may themselves make syscalls.
macro_rules! say {
	($cpu:expr, $($fmt:tt)*) => {{
		let line = format!($($fmt)*);
		libek::print($cpu, &format!("{}\n", line));
	}};
}

pub(crate) use say;
