//! edukern runner.
//!
//! Boots the user kernel on a fresh simulated machine with the built-in
//! programs installed, then reports how the machine stopped.
//!
//! ```text
//! init -x sh.coff echo,hello cat,motd
//! init -c nachos.conf
//! ```

mod programs;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use edukern::Config;
use khal::fs::MemFileSystem;
use khal::{HaltReason, MachineBuilder};

/// Boot edukern on a simulated machine and run one user program
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// nachos.conf-style configuration file
	#[arg(short = 'c', long = "config")]
	config: Option<PathBuf>,

	/// First program to run, overriding the configured shell
	#[arg(short = 'x', long = "program")]
	program: Option<String>,

	/// Arguments for the first program
	#[arg(trailing_var_arg = true)]
	args: Vec<String>,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
	let Some(path) = path else {
		return Ok(Config::default());
	};
	let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
	Config::parse(&text).with_context(|| format!("parsing {}", path.display()))
}

fn main() -> ExitCode {
	let Args {
		config,
		program,
		args,
	} = Args::parse();
	let config = match load_config(config.as_deref()) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("Error: {:#}", e);
			return ExitCode::from(2);
		}
	};

	let mut kernel = config.kernel;
	if let Some(program) = program {
		kernel.shell_program = program;
	}
	if !args.is_empty() {
		kernel.shell_args = args;
	}
	if kernel.shell_program == "sh.coff" && kernel.shell_args.is_empty() {
		kernel.shell_args = vec!["echo,hello,world".to_string()];
	}

	let files = Arc::new(MemFileSystem::new());
	files.insert("motd", b"welcome to edukern\n".to_vec());
	let machine = MachineBuilder::new()
		.config(config.machine)
		.file_system(files.clone())
		.build();
	programs::install_all(&machine, &files);

	let report = edukern::boot(&machine, kernel);

	if !machine.config().console_echo {
		print!("{}", machine.console().output_string());
	}
	eprintln!(
		"machine halted ({:?}): {} ticks ({} kernel, {} user, {} idle), {} context switches",
		report.reason,
		report.total_ticks,
		report.kernel_ticks,
		report.user_ticks,
		report.idle_ticks,
		report.context_switches
	);

	match report.reason {
		HaltReason::Deadlock => ExitCode::FAILURE,
		HaltReason::Terminated | HaltReason::Idle => ExitCode::SUCCESS,
	}
}
