//! edukern userspace library.
//!
//! Programs are native routines run by the simulated CPU. Everything they
//! hand the kernel (file names, argument vectors, I/O buffers) has to live in
//! user memory, so the wrappers here stage it in scratch space below the
//! stack pointer and put SP back when the call returns.
//!
//! ```ignore
//! libek::install(&machine, &fs, "echo.coff", |cpu, args| {
//!     libek::print(cpu, &args.join(" "));
//!     0
//! });
//! ```

use std::sync::Arc;

use khal::coff::CoffBuilder;
use khal::fs::MemFileSystem;
use khal::processor::{reg, Cpu, Exception, Routine};
use khal::Machine;

/// Syscall numbers, matching the kernel's table.
pub mod nr {
	pub const SYS_HALT: u32 = 0;
	pub const SYS_EXIT: u32 = 1;
	pub const SYS_EXEC: u32 = 2;
	pub const SYS_JOIN: u32 = 3;
	pub const SYS_CREATE: u32 = 4;
	pub const SYS_OPEN: u32 = 5;
	pub const SYS_READ: u32 = 6;
	pub const SYS_WRITE: u32 = 7;
	pub const SYS_CLOSE: u32 = 8;
	pub const SYS_UNLINK: u32 = 9;
}

pub const STDIN: i32 = 0;
pub const STDOUT: i32 = 1;

/// Status of a process the kernel killed.
pub const ABNORMAL_EXIT: i32 = i32::MIN;

/// Longest argument string `crt0` reads.
const MAX_ARG: usize = 256;

// ── Program entry ───────────────────────────────────────────────

/// Wrap `main` as a routine: read argc/argv from a0/a1, run `main`, and
/// exit with what it returns.
pub fn crt0<F>(main: F) -> Routine
where
	F: Fn(&mut Cpu, &[String]) -> i32 + Send + Sync + 'static,
{
	Arc::new(move |cpu: &mut Cpu| start(cpu, &main))
}

fn start<F: Fn(&mut Cpu, &[String]) -> i32>(cpu: &mut Cpu, main: &F) {
	let argc = cpu.read_register(reg::A0);
	let argv = cpu.read_register(reg::A1);

	let mut args = Vec::with_capacity(argc as usize);
	for i in 0..argc {
		let word = cpu.read_word(argv.wrapping_add(4 * i));
		let pointer = or_die(cpu, word);
		args.push(read_string(cpu, pointer, MAX_ARG));
	}

	let status = main(cpu, &args);
	exit(cpu, status);
}

/// Make `main` loadable as `name`: register its routine with the processor
/// and store a one-section executable for it in `fs`.
pub fn install<F>(machine: &Machine, fs: &MemFileSystem, name: &str, main: F)
where
	F: Fn(&mut Cpu, &[String]) -> i32 + Send + Sync + 'static,
{
	let processor = machine.processor();
	processor.register_routine(name, crt0(main));
	fs.insert(name, CoffBuilder::new(processor.page_size()).routine(name).build());
}

// ── User memory ─────────────────────────────────────────────────

/// The value of a memory access, or the end of the program if it faulted.
pub fn or_die<T>(cpu: &mut Cpu, result: Result<T, Exception>) -> T {
	match result {
		Ok(value) => value,
		Err(_) => exit(cpu, ABNORMAL_EXIT),
	}
}

/// Run `f`, then put SP back where it was.
pub fn with_stack<R>(cpu: &mut Cpu, f: impl FnOnce(&mut Cpu) -> R) -> R {
	let sp = cpu.read_register(reg::SP);
	let result = f(cpu);
	cpu.write_register(reg::SP, sp);
	result
}

/// Copy `bytes` below SP (word aligned) and return their address.
pub fn push_bytes(cpu: &mut Cpu, bytes: &[u8]) -> u32 {
	let sp = cpu.read_register(reg::SP);
	let addr = sp.wrapping_sub(bytes.len() as u32) & !3;
	cpu.write_register(reg::SP, addr);
	let stored = cpu.write_mem(addr, bytes);
	or_die(cpu, stored);
	addr
}

/// Push `s` with a NUL terminator.
pub fn push_str(cpu: &mut Cpu, s: &str) -> u32 {
	let mut bytes = s.as_bytes().to_vec();
	bytes.push(0);
	push_bytes(cpu, &bytes)
}

/// Push each string, then the array of pointers to them.
pub fn push_argv(cpu: &mut Cpu, args: &[&str]) -> u32 {
	let pointers: Vec<u32> = args.iter().map(|arg| push_str(cpu, arg)).collect();
	let bytes: Vec<u8> = pointers.iter().flat_map(|p| p.to_le_bytes()).collect();
	push_bytes(cpu, &bytes)
}

pub fn load(cpu: &mut Cpu, vaddr: u32, len: usize) -> Vec<u8> {
	let mut buf = vec![0; len];
	let loaded = cpu.read_mem(vaddr, &mut buf);
	or_die(cpu, loaded);
	buf
}

/// The NUL-terminated string at `vaddr`, cut at `max_len` bytes.
pub fn read_string(cpu: &mut Cpu, vaddr: u32, max_len: usize) -> String {
	let mut bytes = Vec::new();
	for i in 0..max_len as u32 {
		let mut byte = [0u8];
		let loaded = cpu.read_mem(vaddr.wrapping_add(i), &mut byte);
		or_die(cpu, loaded);
		if byte[0] == 0 {
			break;
		}
		bytes.push(byte[0]);
	}
	String::from_utf8_lossy(&bytes).into_owned()
}

// ── Syscalls ────────────────────────────────────────────────────

pub fn halt(cpu: &mut Cpu) -> ! {
	cpu.syscall(nr::SYS_HALT, [0; 4]);
	unreachable!("halt returned")
}

pub fn exit(cpu: &mut Cpu, status: i32) -> ! {
	cpu.syscall(nr::SYS_EXIT, [status as u32, 0, 0, 0]);
	unreachable!("exit returned")
}

/// Start `name` with `args`; the child's PID or -1.
pub fn exec(cpu: &mut Cpu, name: &str, args: &[&str]) -> i32 {
	with_stack(cpu, |cpu| {
		let argv = push_argv(cpu, args);
		let name = push_str(cpu, name);
		cpu.syscall(nr::SYS_EXEC, [name, args.len() as u32, argv, 0])
	})
}

/// `join` with a caller-chosen status address.
pub fn join_at(cpu: &mut Cpu, pid: i32, status: u32) -> i32 {
	cpu.syscall(nr::SYS_JOIN, [pid as u32, status, 0, 0])
}

/// Wait for child `pid`. Returns join's result with the status it wrote
/// (zero if it wrote none).
pub fn join(cpu: &mut Cpu, pid: i32) -> (i32, i32) {
	with_stack(cpu, |cpu| {
		let slot = push_bytes(cpu, &[0; 4]);
		let result = join_at(cpu, pid, slot);
		let word = cpu.read_word(slot);
		(result, or_die(cpu, word) as i32)
	})
}

pub fn creat(cpu: &mut Cpu, name: &str) -> i32 {
	with_stack(cpu, |cpu| {
		let name = push_str(cpu, name);
		cpu.syscall(nr::SYS_CREATE, [name, 0, 0, 0])
	})
}

pub fn open(cpu: &mut Cpu, name: &str) -> i32 {
	with_stack(cpu, |cpu| {
		let name = push_str(cpu, name);
		cpu.syscall(nr::SYS_OPEN, [name, 0, 0, 0])
	})
}

pub fn read(cpu: &mut Cpu, fd: i32, buf: u32, count: i32) -> i32 {
	cpu.syscall(nr::SYS_READ, [fd as u32, buf, count as u32, 0])
}

pub fn write(cpu: &mut Cpu, fd: i32, buf: u32, count: i32) -> i32 {
	cpu.syscall(nr::SYS_WRITE, [fd as u32, buf, count as u32, 0])
}

pub fn close(cpu: &mut Cpu, fd: i32) -> i32 {
	cpu.syscall(nr::SYS_CLOSE, [fd as u32, 0, 0, 0])
}

pub fn unlink(cpu: &mut Cpu, name: &str) -> i32 {
	with_stack(cpu, |cpu| {
		let name = push_str(cpu, name);
		cpu.syscall(nr::SYS_UNLINK, [name, 0, 0, 0])
	})
}

// ── Conveniences ────────────────────────────────────────────────

/// Write `bytes` to `fd` through a stack buffer.
pub fn write_bytes(cpu: &mut Cpu, fd: i32, bytes: &[u8]) -> i32 {
	with_stack(cpu, |cpu| {
		let buf = push_bytes(cpu, bytes);
		write(cpu, fd, buf, bytes.len() as i32)
	})
}

/// Read up to `max` bytes from `fd`; `None` if the read failed.
pub fn read_bytes(cpu: &mut Cpu, fd: i32, max: usize) -> Option<Vec<u8>> {
	with_stack(cpu, |cpu| {
		let buf = push_bytes(cpu, &vec![0; max]);
		let n = read(cpu, fd, buf, max as i32);
		if n < 0 {
			return None;
		}
		Some(load(cpu, buf, n as usize))
	})
}

pub fn print(cpu: &mut Cpu, text: &str) -> i32 {
	write_bytes(cpu, STDOUT, text.as_bytes())
}
