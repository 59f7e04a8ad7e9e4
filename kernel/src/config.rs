//! Kernel and machine configuration.
//!
//! Settings come from a `nachos.conf`-style file: one `Section.key = value`
//! per line, `#` starting a comment. Every key has a default, so an empty file
//! is a valid configuration.
//!
//! ```text
//! Processor.numPhysPages = 64
//! Kernel.shellProgram    = sh.coff
//! Kernel.processClassName = nachos.userprog.UserProcess
//! ```

use core::fmt;
use core::str::FromStr;

use khal::MachineConfig;

/// Which kind of process the kernel creates for user programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessKind {
	/// Every page loaded and pinned at exec time.
	#[default]
	User,
}

impl ProcessKind {
	/// Look a kind up by its configuration name.
	pub fn from_name(name: &str) -> Result<Self, ConfigError> {
		match name {
			"user" | "nachos.userprog.UserProcess" => Ok(ProcessKind::User),
			"vm" | "nachos.vm.VMProcess" => Err(ConfigError::UnsupportedProcessKind(name.to_string())),
			_ => Err(ConfigError::UnknownProcessKind(name.to_string())),
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			ProcessKind::User => "user",
		}
	}
}

/// Tunables of the kernel proper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
	/// Program the kernel runs at boot.
	pub shell_program: String,
	pub shell_args: Vec<String>,
	pub process_kind: ProcessKind,
	/// Stack pages given to every process.
	pub stack_pages: usize,
	/// Size of each process's file descriptor table.
	pub max_files: usize,
	/// Longest string a syscall reads from user memory.
	pub max_string: usize,
	/// Longest accepted file name.
	pub max_name: usize,
	/// Log level for the serial logger; `None` leaves logging off.
	pub log_level: Option<klog::Level>,
}

impl Default for KernelConfig {
	fn default() -> Self {
		Self {
			shell_program: "sh.coff".to_string(),
			shell_args: Vec::new(),
			process_kind: ProcessKind::User,
			stack_pages: 8,
			max_files: 16,
			max_string: 256,
			max_name: 255,
			log_level: None,
		}
	}
}

/// A whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
	pub machine: MachineConfig,
	pub kernel: KernelConfig,
}

/// Keys that older configuration files carry and this kernel has no use for.
const IGNORED_KEYS: &[&str] = &[
	"Machine.stubFileSystem",
	"Machine.processor",
	"Machine.console",
	"Machine.disk",
	"Machine.bank",
	"Machine.networkLink",
	"Kernel.kernel",
	"ThreadedKernel.scheduler",
	"ElevatorBank.allowElevatorGUI",
	"NachosSecurityManager.fullySecure",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
	/// A line that is not `key = value`.
	Syntax { line: usize, text: String },
	UnknownKey { line: usize, key: String },
	BadValue { line: usize, key: String, value: String },
	UnknownProcessKind(String),
	/// A process kind this kernel knows of but does not implement.
	UnsupportedProcessKind(String),
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::Syntax { line, text } => {
				write!(f, "line {}: expected `key = value`, found {:?}", line, text)
			}
			ConfigError::UnknownKey { line, key } => write!(f, "line {}: unknown key {}", line, key),
			ConfigError::BadValue { line, key, value } => {
				write!(f, "line {}: bad value {:?} for {}", line, value, key)
			}
			ConfigError::UnknownProcessKind(name) => write!(f, "unknown process kind {}", name),
			ConfigError::UnsupportedProcessKind(name) => {
				write!(f, "process kind {} is not supported", name)
			}
		}
	}
}

impl std::error::Error for ConfigError {}

impl Config {
	/// Parse configuration text, starting from the defaults.
	pub fn parse(text: &str) -> Result<Self, ConfigError> {
		let mut config = Config::default();
		for (index, raw) in text.lines().enumerate() {
			let line = index + 1;
			let content = raw.split('#').next().unwrap_or("").trim();
			if content.is_empty() {
				continue;
			}
			let Some((key, value)) = content.split_once('=') else {
				return Err(ConfigError::Syntax {
					line,
					text: content.to_string(),
				});
			};
			config.set(line, key.trim(), value.trim())?;
		}
		Ok(config)
	}

	fn set(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
		let bad = || ConfigError::BadValue {
			line,
			key: key.to_string(),
			value: value.to_string(),
		};
		let machine = &mut self.machine;
		let kernel = &mut self.kernel;

		match key {
			"Processor.numPhysPages" => machine.num_phys_pages = number(value).ok_or_else(bad)?,
			"Processor.pageSize" => {
				machine.page_size = number(value).filter(|&n: &usize| n >= 16).ok_or_else(bad)?
			}
			"Processor.usingTLB" => {
				// Translation always goes through the page table.
				if flag(value).ok_or_else(bad)? {
					return Err(bad());
				}
			}
			"Machine.timerInterval" => machine.timer_interval = number(value).ok_or_else(bad)?,
			"Machine.kernelTick" => machine.kernel_tick = number(value).ok_or_else(bad)?,
			"Machine.userTick" => machine.user_tick = number(value).ok_or_else(bad)?,
			"Machine.idleLimit" => machine.idle_limit = number(value).ok_or_else(bad)?,
			"Machine.consoleEcho" => machine.console_echo = flag(value).ok_or_else(bad)?,
			"Kernel.shellProgram" => kernel.shell_program = value.to_string(),
			"Kernel.shellArgs" => {
				kernel.shell_args = value.split_whitespace().map(str::to_string).collect()
			}
			"Kernel.processClassName" => kernel.process_kind = ProcessKind::from_name(value)?,
			"Kernel.stackPages" => kernel.stack_pages = number(value).ok_or_else(bad)?,
			"Kernel.maxFiles" => {
				// Two slots are taken by the console.
				kernel.max_files = number(value).filter(|&n: &usize| n >= 2).ok_or_else(bad)?
			}
			"Kernel.logLevel" => {
				kernel.log_level = match value {
					"off" | "none" => None,
					_ => Some(klog::Level::from_name(value).ok_or_else(bad)?),
				}
			}
			_ if IGNORED_KEYS.contains(&key) => {}
			_ => {
				return Err(ConfigError::UnknownKey {
					line,
					key: key.to_string(),
				});
			}
		}
		Ok(())
	}
}

impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Config::parse(s)
	}
}

fn number<T: FromStr>(value: &str) -> Option<T> {
	value.parse().ok()
}

fn flag(value: &str) -> Option<bool> {
	match value {
		"true" | "yes" | "1" => Some(true),
		"false" | "no" | "0" => Some(false),
		_ => None,
	}
}
