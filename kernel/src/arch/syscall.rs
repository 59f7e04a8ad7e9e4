//! System call dispatch.
//!
//! A user program traps with the call number in v0 and up to four arguments
//! in a0..a3; the result goes back in v0. Pointers are virtual addresses in
//! the caller's address space and are only ever touched through
//! `AddressSpace::read`/`write`, so a bad pointer shows up as a short
//! transfer and never faults the kernel.
//!
//! Every call except `halt` and `exit` returns -1 on failure.

use khal::machine;

use crate::kernel::UserKernel;
use crate::task::process::{Process, ABNORMAL_EXIT};

// ── Call numbers ────────────────────────────────────────────────

/// Syscall numbers.
pub mod nr {
	/// `void halt()`: stop the machine.
	pub const SYS_HALT: u32 = 0;
	/// `void exit(int status)`: end the calling process.
	pub const SYS_EXIT: u32 = 1;
	/// `int exec(char *name, int argc, char **argv)`: start a child process, returns its PID.
	pub const SYS_EXEC: u32 = 2;
	/// `int join(int pid, int *status)`: wait for a child; 1 on normal exit, 0 if it was killed.
	pub const SYS_JOIN: u32 = 3;
	/// `int creat(char *name)`: open a file, creating it empty if missing.
	pub const SYS_CREATE: u32 = 4;
	/// `int open(char *name)`: open an existing file.
	pub const SYS_OPEN: u32 = 5;
	/// `int read(int fd, char *buf, int count)`: returns the bytes read.
	pub const SYS_READ: u32 = 6;
	/// `int write(int fd, char *buf, int count)`: returns `count`.
	pub const SYS_WRITE: u32 = 7;
	/// `int close(int fd)`
	pub const SYS_CLOSE: u32 = 8;
	/// `int unlink(char *name)`: remove a file from the file system.
	pub const SYS_UNLINK: u32 = 9;
}

/// Run syscall `number` for `process`; the return value goes to v0.
///
/// `exit`, `halt` and unknown numbers do not return.
pub fn dispatch(process: &Process, number: u32, args: [u32; 4]) -> i32 {
	let [a0, a1, a2, _] = args;
	match number {
		nr::SYS_HALT => sys_halt(process),
		nr::SYS_EXIT => {
			klog::debug!("[syscall] pid {}: exit({})", process.pid(), a0 as i32);
			process.exit(a0 as i32)
		}
		nr::SYS_EXEC => sys_exec(process, a0, a1 as i32, a2),
		nr::SYS_JOIN => sys_join(process, a0 as i32, a1),
		nr::SYS_CREATE => sys_open(process, a0, true),
		nr::SYS_OPEN => sys_open(process, a0, false),
		nr::SYS_READ => sys_read(process, a0 as i32, a1, a2 as i32),
		nr::SYS_WRITE => sys_write(process, a0 as i32, a1, a2 as i32),
		nr::SYS_CLOSE => sys_close(process, a0 as i32),
		nr::SYS_UNLINK => sys_unlink(process, a0),
		_ => {
			klog::warn!("[syscall] pid {}: unknown syscall {}", process.pid(), number);
			process.exit(ABNORMAL_EXIT)
		}
	}
}

// ── Process control ─────────────────────────────────────────────

fn sys_halt(process: &Process) -> ! {
	klog::info!("[syscall] pid {} ({}) halts the machine", process.pid(), process.name());
	UserKernel::current().terminate()
}

fn sys_exec(process: &Process, name_addr: u32, argc: i32, argv: u32) -> i32 {
	if argc < 0 {
		return -1;
	}
	let max_string = UserKernel::current().config().max_string;
	let space = process.space();

	let Some(name) = space.read_string(name_addr, max_string) else {
		return -1;
	};
	if name.is_empty() || !name.ends_with(".coff") {
		klog::debug!("[syscall] pid {}: exec of {:?} refused", process.pid(), name);
		return -1;
	}

	let mut args = Vec::new();
	for i in 0..argc as u32 {
		let Some(slot) = i.checked_mul(4).and_then(|offset| argv.checked_add(offset)) else {
			return -1;
		};
		let mut pointer = [0u8; 4];
		if space.read(slot, &mut pointer) < pointer.len() {
			return -1;
		}
		let Some(arg) = space.read_string(u32::from_le_bytes(pointer), max_string) else {
			return -1;
		};
		args.push(arg);
	}

	match process.exec(&name, &args) {
		Ok(pid) => {
			klog::debug!("[syscall] pid {}: exec({:?}, {:?}) = {}", process.pid(), name, args, pid);
			pid
		}
		Err(e) => {
			klog::warn!("[syscall] pid {}: exec {}: {}", process.pid(), name, e);
			-1
		}
	}
}

fn sys_join(process: &Process, pid: i32, status_addr: u32) -> i32 {
	let Some(status) = process.join(pid) else {
		return -1;
	};
	let written = process.space().write(status_addr, &status.to_le_bytes());
	if status != ABNORMAL_EXIT && written == 4 { 1 } else { 0 }
}

// ── Files ───────────────────────────────────────────────────────

/// Read a file name argument; `None` if unreadable, empty or too long.
fn file_name(process: &Process, addr: u32) -> Option<String> {
	let kernel = UserKernel::current();
	let config = kernel.config();
	let name = process.space().read_string(addr, config.max_string)?;
	if name.is_empty() || name.len() > config.max_name {
		return None;
	}
	Some(name)
}

fn sys_open(process: &Process, name_addr: u32, create: bool) -> i32 {
	let Some(name) = file_name(process, name_addr) else {
		return -1;
	};
	let Some(file) = machine::current().file_system().open(&name, create) else {
		return -1;
	};
	match process.files().lock().insert(file) {
		Ok(fd) => {
			klog::trace!("[syscall] pid {}: {:?} on fd {}", process.pid(), name, fd);
			fd as i32
		}
		Err(mut file) => {
			file.close();
			-1
		}
	}
}

fn sys_read(process: &Process, fd: i32, buf: u32, count: i32) -> i32 {
	if count < 0 {
		return -1;
	}
	let space = process.space();
	let mut local = vec![0u8; (count as usize).min(space.size())];

	let received = {
		let mut files = process.files().lock();
		let Some(file) = files.get_mut(fd) else {
			return -1;
		};
		match file.read(&mut local) {
			Ok(n) => n,
			Err(e) => {
				klog::debug!("[syscall] pid {}: read fd {}: {}", process.pid(), fd, e);
				return -1;
			}
		}
	};

	if space.write(buf, &local[..received]) < received {
		return -1;
	}
	received as i32
}

fn sys_write(process: &Process, fd: i32, buf: u32, count: i32) -> i32 {
	if count < 0 {
		return -1;
	}
	let space = process.space();
	let count = count as usize;
	if count > space.size() {
		return -1;
	}
	let mut local = vec![0u8; count];
	if space.read(buf, &mut local) < count {
		return -1;
	}

	let mut files = process.files().lock();
	let Some(file) = files.get_mut(fd) else {
		return -1;
	};
	match file.write(&local) {
		Ok(n) if n == count => n as i32,
		Ok(n) => {
			klog::debug!("[syscall] pid {}: short write on fd {}: {} of {}", process.pid(), fd, n, count);
			-1
		}
		Err(e) => {
			klog::debug!("[syscall] pid {}: write fd {}: {}", process.pid(), fd, e);
			-1
		}
	}
}

fn sys_close(process: &Process, fd: i32) -> i32 {
	if process.files().lock().close(fd) { 0 } else { -1 }
}

fn sys_unlink(process: &Process, name_addr: u32) -> i32 {
	let Some(name) = file_name(process, name_addr) else {
		return -1;
	};
	if machine::current().file_system().remove(&name) { 0 } else { -1 }
}
