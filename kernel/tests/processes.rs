//! Process lifecycle through the syscall interface.

mod common;

use common::{say, Rig};
use edukern::UserKernel;
use khal::coff::CoffBuilder;
use khal::HaltReason;

const KILLED: i32 = i32::MIN;

#[test]
fn exec_and_join_report_exit_status() {
	let rig = Rig::new();
	rig.program("child.coff", |_, _| 42).program("parent.coff", |cpu, _| {
		let pid = libek::exec(cpu, "child.coff", &[]);
		let (joined, status) = libek::join(cpu, pid);
		say!(cpu, "{} {} {}", pid, joined, status);
		// A child can be joined once.
		let (again, _) = libek::join(cpu, pid);
		say!(cpu, "{}", again);
		0
	});

	let report = rig.run("parent.coff", &[]);
	assert_eq!(report.reason, HaltReason::Terminated);
	assert_eq!(rig.console(), "1 1 42\n-1\n");
	assert_eq!(rig.exits.statuses(), vec![42, 0]);
}

#[test]
fn arguments_reach_main() {
	let rig = Rig::new();
	rig.program("args.coff", |cpu, args| {
		say!(cpu, "{}: {}", args.len(), args.join("|"));
		0
	})
	.program("parent.coff", |cpu, args| {
		let pid = libek::exec(cpu, "args.coff", &["x", "", "a longer one"]);
		libek::join(cpu, pid);
		say!(cpu, "{}: {}", args.len(), args.join("|"));
		0
	});

	rig.run("parent.coff", &["first", "second"]);
	assert_eq!(rig.console(), "3: x||a longer one\n2: first|second\n");
}

#[test]
fn only_children_can_be_joined() {
	let rig = Rig::new();
	rig.program("grandchild.coff", |_, _| 3)
		.program("child.coff", |cpu, _| {
			let pid = libek::exec(cpu, "grandchild.coff", &[]);
			// Hand the PID up as the exit status.
			pid
		})
		.program("parent.coff", |cpu, _| {
			say!(cpu, "self {}", libek::join(cpu, 0).0);
			say!(cpu, "unknown {}", libek::join(cpu, 99).0);
			let child = libek::exec(cpu, "child.coff", &[]);
			let (_, grandchild) = libek::join(cpu, child);
			say!(cpu, "grandchild {}", libek::join(cpu, grandchild).0);
			0
		});

	rig.run("parent.coff", &[]);
	assert_eq!(rig.console(), "self -1\nunknown -1\ngrandchild -1\n");
}

#[test]
fn exec_rejects_bad_requests() {
	let rig = Rig::new();
	rig.program("ok.coff", |_, _| 0).program("parent.coff", |cpu, _| {
		say!(cpu, "suffix {}", libek::exec(cpu, "ok", &[]));
		say!(cpu, "missing {}", libek::exec(cpu, "missing.coff", &[]));
		let name = libek::push_str(cpu, "ok.coff");
		let negative = cpu.syscall(libek::nr::SYS_EXEC, [name, -1i32 as u32, 0, 0]);
		say!(cpu, "argc {}", negative);
		let wild = cpu.syscall(libek::nr::SYS_EXEC, [name, 1, 0xffff_fff0, 0]);
		say!(cpu, "argv {}", wild);
		0
	});

	rig.run("parent.coff", &[]);
	assert_eq!(rig.console(), "suffix -1\nmissing -1\nargc -1\nargv -1\n");
	assert_eq!(rig.exits.statuses(), vec![0]);
}

#[test]
fn faults_and_unknown_syscalls_kill_the_process() {
	let rig = Rig::new();
	rig.program("wild.coff", |cpu, _| {
		libek::load(cpu, 0xffff_0000, 4);
		0
	})
	.program("scribble.coff", |cpu, _| {
		// Page 0 holds the read-only text section.
		let stored = cpu.write_word(0, 0xdead_beef);
		libek::or_die(cpu, stored);
		0
	})
	.program("bogus.coff", |cpu, _| {
		cpu.syscall(77, [0; 4]);
		0
	})
	.program("parent.coff", |cpu, _| {
		for name in ["wild.coff", "scribble.coff", "bogus.coff"] {
			let pid = libek::exec(cpu, name, &[]);
			let (joined, status) = libek::join(cpu, pid);
			say!(cpu, "{} {} {}", name, joined, status == KILLED);
		}
		0
	});

	let report = rig.run("parent.coff", &[]);
	assert_eq!(report.reason, HaltReason::Terminated);
	assert_eq!(
		rig.console(),
		"wild.coff 0 true\nscribble.coff 0 true\nbogus.coff 0 true\n"
	);
	assert_eq!(rig.exits.statuses(), vec![KILLED, KILLED, KILLED, 0]);
}

#[test]
fn last_exit_halts_even_with_orphans() {
	let rig = Rig::new();
	rig.program("worker.coff", |cpu, _| {
		for _ in 0..2_000 {
			cpu.step();
		}
		7
	})
	.program("parent.coff", |cpu, _| {
		libek::exec(cpu, "worker.coff", &[]);
		libek::exec(cpu, "worker.coff", &[]);
		1
	});

	let report = rig.run("parent.coff", &[]);
	assert_eq!(report.reason, HaltReason::Terminated);
	let mut statuses = rig.exits.statuses();
	statuses.sort();
	assert_eq!(statuses, vec![1, 7, 7]);
}

#[test]
fn halt_stops_everything() {
	let rig = Rig::new();
	rig.program("halt.coff", |cpu, _| {
		say!(cpu, "bye");
		libek::halt(cpu)
	});

	let report = rig.run("halt.coff", &[]);
	assert_eq!(report.reason, HaltReason::Terminated);
	assert_eq!(rig.console(), "bye\n");
	assert!(rig.exits.statuses().is_empty());
}

#[test]
fn shell_name_gets_coff_suffix() {
	let rig = Rig::new();
	rig.program("sh.coff", |_, _| 5);

	let report = rig.run("sh", &[]);
	assert_eq!(report.reason, HaltReason::Terminated);
	assert_eq!(rig.exits.statuses(), vec![5]);
}

#[test]
fn missing_shell_halts_the_machine() {
	let rig = Rig::new();
	let report = rig.run("nothing.coff", &[]);
	assert_eq!(report.reason, HaltReason::Terminated);
	assert!(rig.exits.statuses().is_empty());
}

#[test]
fn pages_come_back_on_exit_and_failed_exec() {
	// One process takes 1 text + 8 stack + 1 argument page.
	let rig = Rig::with_pages(16);
	rig.program("child.coff", |_, _| 0).program("parent.coff", |cpu, _| {
		let kernel = UserKernel::current();
		say!(cpu, "free {}", kernel.pages().free_pages());
		say!(cpu, "exec {}", libek::exec(cpu, "child.coff", &[]));
		say!(cpu, "free {}", kernel.pages().free_pages());
		0
	});

	let report = rig.run("parent.coff", &[]);
	assert_eq!(report.reason, HaltReason::Terminated);
	assert_eq!(rig.console(), "free 6\nexec -1\nfree 6\n");
}

#[test]
fn bad_images_and_long_arguments_fail_cleanly() {
	let rig = Rig::new();
	let page_size = rig.machine.processor().page_size();
	rig.fs.insert("junk.coff", b"not an executable".to_vec());
	// Text at page 0, data at page 3: a hole the loader refuses.
	let gappy = CoffBuilder::new(page_size)
		.routine("ok.coff")
		.section_at(".data", 3, 1, false, vec![7; 16])
		.build();
	rig.fs.insert("gappy.coff", gappy);
	rig.program("ok.coff", |_, _| 0).program("parent.coff", |cpu, _| {
		let kernel = UserKernel::current();
		let before = kernel.pages().free_pages();
		say!(cpu, "junk {}", libek::exec(cpu, "junk.coff", &[]));
		say!(cpu, "gappy {}", libek::exec(cpu, "gappy.coff", &[]));

		// Five pointers and strings need 1275 bytes, one page holds 1024.
		let long = "x".repeat(250);
		let args = [long.as_str(); 5];
		say!(cpu, "long {}", libek::exec(cpu, "ok.coff", &args));
		let pid = libek::exec(cpu, "ok.coff", &args[..4]);
		say!(cpu, "four {}", libek::join(cpu, pid).0);

		say!(cpu, "leaked {}", before - kernel.pages().free_pages());
		0
	});

	let report = rig.run("parent.coff", &[]);
	assert_eq!(report.reason, HaltReason::Terminated);
	assert_eq!(rig.console(), "junk -1\ngappy -1\nlong -1\nfour 1\nleaked 0\n");
	assert_eq!(rig.exits.statuses(), vec![0, 0]);
}

#[test]
fn sequential_children_reuse_memory() {
	let rig = Rig::with_pages(20);
	rig.program("child.coff", |_, args| args.len() as i32)
		.program("parent.coff", |cpu, _| {
			let mut total = 0;
			for _ in 0..5 {
				let pid = libek::exec(cpu, "child.coff", &["a", "b"]);
				let (joined, status) = libek::join(cpu, pid);
				if joined == 1 {
					total += status;
				}
			}
			say!(cpu, "{} {}", total, UserKernel::current().pages().free_pages());
			0
		});

	rig.run("parent.coff", &[]);
	assert_eq!(rig.console(), "10 10\n");
}
