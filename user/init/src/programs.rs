//! Built-in user programs.
//!
//! | name          | does                                                   |
//! |---------------|--------------------------------------------------------|
//! | `sh.coff`     | runs each argument as a program, in order, and joins it |
//! | `echo.coff`   | prints its arguments                                   |
//! | `cat.coff`    | prints the files named by its arguments                |
//! | `cp.coff`     | copies its first argument to its second                |
//! | `rm.coff`     | unlinks its arguments                                  |
//! | `halt.coff`   | halts the machine                                      |
//! | `fault.coff`  | touches an unmapped address and is killed              |

use khal::fs::MemFileSystem;
use khal::processor::Cpu;
use khal::Machine;

/// Bytes moved per read/write syscall.
const CHUNK: usize = 256;

pub fn install_all(machine: &Machine, fs: &MemFileSystem) {
	libek::install(machine, fs, "sh.coff", sh);
	libek::install(machine, fs, "echo.coff", echo);
	libek::install(machine, fs, "cat.coff", cat);
	libek::install(machine, fs, "cp.coff", cp);
	libek::install(machine, fs, "rm.coff", rm);
	libek::install(machine, fs, "halt.coff", |cpu, _| libek::halt(cpu));
	libek::install(machine, fs, "fault.coff", |cpu, _| {
		libek::load(cpu, 0xffff_0000, 4);
		0
	});
}

/// `sh prog[,arg...] ...`: run each program to completion.
fn sh(cpu: &mut Cpu, args: &[String]) -> i32 {
	let mut failures = 0;
	for command in args {
		let mut words = command.split(',');
		let Some(program) = words.next() else {
			continue;
		};
		let program = if program.ends_with(".coff") {
			program.to_string()
		} else {
			format!("{}.coff", program)
		};
		let argv: Vec<&str> = words.collect();

		let pid = libek::exec(cpu, &program, &argv);
		if pid < 0 {
			libek::print(cpu, &format!("sh: cannot run {}\n", program));
			failures += 1;
			continue;
		}
		let (joined, status) = libek::join(cpu, pid);
		match joined {
			1 if status == 0 => {}
			1 => {
				libek::print(cpu, &format!("sh: {} exited with {}\n", program, status));
				failures += 1;
			}
			_ => {
				libek::print(cpu, &format!("sh: {} was killed\n", program));
				failures += 1;
			}
		}
	}
	failures
}

fn echo(cpu: &mut Cpu, args: &[String]) -> i32 {
	libek::print(cpu, &format!("{}\n", args.join(" ")));
	0
}

fn cat(cpu: &mut Cpu, args: &[String]) -> i32 {
	for name in args {
		let fd = libek::open(cpu, name);
		if fd < 0 {
			libek::print(cpu, &format!("cat: {}: cannot open\n", name));
			return 1;
		}
		loop {
			match libek::read_bytes(cpu, fd, CHUNK) {
				Some(bytes) if !bytes.is_empty() => {
					libek::write_bytes(cpu, libek::STDOUT, &bytes);
				}
				Some(_) => break,
				None => {
					libek::close(cpu, fd);
					return 1;
				}
			}
		}
		libek::close(cpu, fd);
	}
	0
}

fn cp(cpu: &mut Cpu, args: &[String]) -> i32 {
	let [from, to] = args else {
		libek::print(cpu, "usage: cp from to\n");
		return 2;
	};
	let src = libek::open(cpu, from);
	if src < 0 {
		return 1;
	}
	let dst = libek::creat(cpu, to);
	if dst < 0 {
		libek::close(cpu, src);
		return 1;
	}

	let mut status = 0;
	while let Some(bytes) = libek::read_bytes(cpu, src, CHUNK) {
		if bytes.is_empty() {
			break;
		}
		if libek::write_bytes(cpu, dst, &bytes) != bytes.len() as i32 {
			status = 1;
			break;
		}
	}
	libek::close(cpu, src);
	libek::close(cpu, dst);
	status
}

fn rm(cpu: &mut Cpu, args: &[String]) -> i32 {
	let mut status = 0;
	for name in args {
		if libek::unlink(cpu, name) != 0 {
			libek::print(cpu, &format!("rm: {}: no such file\n", name));
			status = 1;
		}
	}
	status
}
