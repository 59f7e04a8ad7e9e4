//! Simulated kernel threads.
//!
//! Every `KThread` is backed by a host thread, but only the thread holding the
//! baton executes. Everybody else is parked in `wait_for_baton`. Handing the
//! baton to another thread is the context switch, so kernel code observes the
//! same single-core execution model as on real uniprocessor hardware.
//!
//! Host threads retire by unwinding with a private `ThreadExit` payload. That
//! covers `KThread::finish` and a halting machine alike; a genuine panic in
//! any simulated thread halts the machine and is re-raised by `Machine::boot`.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self as host, JoinHandle};

use spin::Mutex;

use crate::interrupt;
use crate::machine::{self, HaltReport, Machine};
use crate::sched::ThreadQueue;

/// Unwind payload that retires a host thread without a panic message.
pub(crate) struct ThreadExit;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
	static CONTEXT: RefCell<Option<(Arc<Machine>, KThread)>> = const { RefCell::new(None) };
	static EXITING: Cell<bool> = const { Cell::new(false) };
}

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	New,
	Ready,
	Running,
	Blocked,
	Finished,
}

struct Tcb {
	id: u64,
	name: String,
	status: Mutex<Status>,
	/// Set by the thread switching to us, consumed when we resume.
	baton: AtomicBool,
	host: Mutex<Option<host::Thread>>,
	body: Mutex<Option<Box<dyn FnOnce() + Send>>>,
	joiners: Mutex<Vec<KThread>>,
}

/// Handle to a simulated thread. Cloning yields another handle to the same
/// thread.
#[derive(Clone)]
pub struct KThread(Arc<Tcb>);

impl KThread {
	/// Create a thread that will run `body` once forked.
	pub fn new<F>(name: &str, body: F) -> Self
	where
		F: FnOnce() + Send + 'static,
	{
		Self(Arc::new(Tcb {
			id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
			name: name.to_string(),
			status: Mutex::new(Status::New),
			baton: AtomicBool::new(false),
			host: Mutex::new(None),
			body: Mutex::new(Some(Box::new(body))),
			joiners: Mutex::new(Vec::new()),
		}))
	}

	/// The thread executing the caller.
	///
	/// Panics when called from a host thread that is not a simulated thread.
	pub fn current() -> KThread {
		match CONTEXT.with(|c| c.borrow().as_ref().map(|(_, t)| t.clone())) {
			Some(thread) => thread,
			None => panic!("KThread::current called outside a simulated thread"),
		}
	}

	pub fn id(&self) -> u64 {
		self.0.id
	}

	pub fn name(&self) -> &str {
		&self.0.name
	}

	pub fn status(&self) -> Status {
		*self.0.status.lock()
	}

	pub fn is_blocked(&self) -> bool {
		self.status() == Status::Blocked
	}

	pub fn is_finished(&self) -> bool {
		self.status() == Status::Finished
	}

	/// Start the thread and put it on the ready queue.
	pub fn fork(&self) {
		let machine = machine::current();
		let prev = interrupt::disable();
		spawn_host(&machine, self);
		self.ready();
		interrupt::restore(prev);
	}

	/// Move the thread to the ready queue. Interrupts must be disabled.
	pub fn ready(&self) {
		assert!(interrupt::disabled(), "KThread::ready with interrupts enabled");
		let machine = machine::current();
		{
			let mut status = self.0.status.lock();
			assert_ne!(*status, Status::Ready, "{} made ready twice", self);
			assert_ne!(*status, Status::Finished, "{} made ready after finishing", self);
			*status = Status::Ready;
		}
		machine.runtime().ready.lock().wait_for_access(self.clone());
	}

	/// Block the current thread until some other thread readies it.
	/// Interrupts must be disabled.
	pub fn sleep() {
		assert!(interrupt::disabled(), "KThread::sleep with interrupts enabled");
		let machine = machine::current();
		let current = KThread::current();
		{
			let mut status = current.0.status.lock();
			if *status != Status::Finished {
				*status = Status::Blocked;
			}
		}
		run_next_thread(&machine, &current);
	}

	/// Give up the CPU if another thread is ready.
	pub fn yield_now() {
		let machine = machine::current();
		let prev = interrupt::disable();
		let current = KThread::current();
		current.ready();
		run_next_thread(&machine, &current);
		interrupt::restore(prev);
	}

	/// Finish the current thread. Threads blocked in `join` are readied.
	pub fn finish() -> ! {
		let machine = machine::current();
		interrupt::disable();
		let current = KThread::current();
		*current.0.status.lock() = Status::Finished;
		machine.runtime().live.fetch_sub(1, Ordering::SeqCst);
		let joiners = mem::take(&mut *current.0.joiners.lock());
		for joiner in joiners {
			joiner.ready();
		}
		exit_host_thread()
	}

	/// Wait for this thread to finish. Returns at once if it already has.
	pub fn join(&self) {
		let current = KThread::current();
		assert!(*self != current, "{} joined itself", self);
		let prev = interrupt::disable();
		if !self.is_finished() {
			self.0.joiners.lock().push(current);
			KThread::sleep();
		}
		interrupt::restore(prev);
	}

	fn unpark(&self) {
		if let Some(host) = self.0.host.lock().as_ref() {
			host.unpark();
		}
	}

	fn wait_for_baton(&self, machine: &Machine) {
		loop {
			if self.0.baton.swap(false, Ordering::SeqCst) {
				return;
			}
			if machine.runtime().is_halted() {
				exit_host_thread();
			}
			host::park();
		}
	}
}

impl PartialEq for KThread {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}
}

impl Eq for KThread {}

impl fmt::Display for KThread {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} (#{})", self.0.name, self.0.id)
	}
}

impl fmt::Debug for KThread {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KThread")
			.field("id", &self.0.id)
			.field("name", &self.0.name)
			.field("status", &self.status())
			.finish()
	}
}

/// True while the host thread is being torn down, either by `ThreadExit` or a
/// panic. Device and scheduler entry points become inert in that state so
/// destructors cannot switch threads.
pub fn is_exiting() -> bool {
	EXITING.with(|e| e.get()) || host::panicking()
}

pub(crate) fn current_machine() -> Option<Arc<Machine>> {
	CONTEXT.with(|c| c.borrow().as_ref().map(|(m, _)| m.clone()))
}

pub(crate) fn exit_host_thread() -> ! {
	EXITING.with(|e| e.set(true));
	panic::resume_unwind(Box::new(ThreadExit))
}

// ── Runtime ─────────────────────────────────────────────────────

pub(crate) enum Outcome {
	Halted(HaltReport),
	Panicked(Box<dyn Any + Send>),
}

/// Per-machine thread bookkeeping.
pub(crate) struct Runtime {
	ready: Mutex<Box<dyn ThreadQueue>>,
	/// Forked threads that have not finished.
	live: AtomicUsize,
	/// Ticks spent idling since a thread last got the CPU.
	idle_run: AtomicU64,
	halted: AtomicBool,
	threads: Mutex<Vec<KThread>>,
	handles: Mutex<Vec<JoinHandle<()>>>,
	outcome: Mutex<Option<mpsc::Sender<Outcome>>>,
}

impl Runtime {
	pub(crate) fn new(ready: Box<dyn ThreadQueue>) -> Self {
		Self {
			ready: Mutex::new(ready),
			live: AtomicUsize::new(0),
			idle_run: AtomicU64::new(0),
			halted: AtomicBool::new(false),
			threads: Mutex::new(Vec::new()),
			handles: Mutex::new(Vec::new()),
			outcome: Mutex::new(None),
		}
	}

	pub(crate) fn live(&self) -> usize {
		self.live.load(Ordering::SeqCst)
	}

	pub(crate) fn is_halted(&self) -> bool {
		self.halted.load(Ordering::SeqCst)
	}

	/// Account idle time; returns the length of the current idle run.
	pub(crate) fn note_idle(&self, ticks: u64) -> u64 {
		self.idle_run.fetch_add(ticks, Ordering::SeqCst) + ticks
	}

	pub(crate) fn set_outcome_channel(&self, tx: mpsc::Sender<Outcome>) {
		*self.outcome.lock() = Some(tx);
	}

	/// Stop the machine: publish the outcome and wake every host thread so it
	/// can retire.
	pub(crate) fn stop(&self, outcome: Outcome) {
		if self.halted.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Some(tx) = self.outcome.lock().take() {
			let _ = tx.send(outcome);
		}
		for thread in self.threads.lock().iter() {
			thread.unpark();
		}
	}

	pub(crate) fn join_all(&self) {
		loop {
			let handles = mem::take(&mut *self.handles.lock());
			if handles.is_empty() {
				break;
			}
			for handle in handles {
				let _ = handle.join();
			}
		}
	}
}

/// Start `thread` directly on the CPU. Used once, for the boot thread.
pub(crate) fn launch(machine: &Arc<Machine>, thread: KThread) {
	spawn_host(machine, &thread);
	*thread.0.status.lock() = Status::Running;
	thread.0.baton.store(true, Ordering::SeqCst);
	thread.unpark();
}

fn spawn_host(machine: &Arc<Machine>, thread: &KThread) {
	assert_eq!(thread.status(), Status::New, "{} forked twice", thread);
	machine.runtime().live.fetch_add(1, Ordering::SeqCst);

	let m = machine.clone();
	let t = thread.clone();
	let spawned = host::Builder::new()
		.name(thread.name().to_string())
		.spawn(move || thread_main(m, t));
	match spawned {
		Ok(handle) => {
			*thread.0.host.lock() = Some(handle.thread().clone());
			machine.runtime().threads.lock().push(thread.clone());
			machine.runtime().handles.lock().push(handle);
		}
		Err(e) => panic!("cannot spawn host thread for {}: {}", thread, e),
	}
}

fn thread_main(machine: Arc<Machine>, thread: KThread) {
	CONTEXT.with(|c| *c.borrow_mut() = Some((machine.clone(), thread.clone())));

	let mut result = panic::catch_unwind(AssertUnwindSafe(|| {
		thread.wait_for_baton(&machine);
		interrupt::enable();
		let body = thread.0.body.lock().take();
		if let Some(body) = body {
			body();
		}
		KThread::finish();
	}));

	// A finished thread still owns the CPU; hand it on from a clean stack.
	if is_thread_exit(&result) && thread.is_finished() && !machine.runtime().is_halted() {
		EXITING.with(|e| e.set(false));
		result = panic::catch_unwind(AssertUnwindSafe(|| {
			interrupt::disable();
			run_next_thread(&machine, &thread);
		}));
	}

	EXITING.with(|e| e.set(true));
	if let Err(payload) = result {
		if !payload.is::<ThreadExit>() {
			machine.runtime().stop(Outcome::Panicked(payload));
		}
	}
	CONTEXT.with(|c| c.borrow_mut().take());
}

fn is_thread_exit(result: &std::thread::Result<()>) -> bool {
	matches!(result, Err(payload) if payload.is::<ThreadExit>())
}

fn run_next_thread(machine: &Arc<Machine>, current: &KThread) {
	let next = loop {
		let next = machine.runtime().ready.lock().next_thread();
		match next {
			Some(thread) => break thread,
			None => machine.interrupt().idle(machine),
		}
	};
	switch_to(machine, current, next);
}

fn switch_to(machine: &Arc<Machine>, current: &KThread, next: KThread) {
	machine.runtime().idle_run.store(0, Ordering::SeqCst);
	*next.0.status.lock() = Status::Running;
	if next == *current {
		return;
	}
	machine.stats().note_switch();

	let finished = current.is_finished();
	next.0.baton.store(true, Ordering::SeqCst);
	next.unpark();
	if !finished {
		current.wait_for_baton(machine);
	}
}
