//! Interrupt controller and clock.
//!
//! Interrupt masking is the only synchronization primitive the simulated
//! hardware offers. Re-enabling interrupts advances the clock by one kernel
//! tick and delivers every device interrupt that has come due; a handler may
//! ask for the interrupted thread to yield once delivery finishes.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use spin::Mutex;

use crate::machine::{self, HaltReason, Machine};
use crate::thread::{self, KThread};

/// Device callback run with interrupts disabled.
pub type Handler = Arc<dyn Fn() + Send + Sync>;

struct State {
	enabled: bool,
	in_handler: bool,
	yield_on_return: bool,
	/// Keyed by (due tick, arrival order).
	pending: BTreeMap<(u64, u64), Handler>,
	seq: u64,
}

pub struct Interrupt {
	state: Mutex<State>,
}

impl Interrupt {
	pub(crate) fn new() -> Self {
		Self {
			state: Mutex::new(State {
				enabled: false,
				in_handler: false,
				yield_on_return: false,
				pending: BTreeMap::new(),
				seq: 0,
			}),
		}
	}

	pub fn enabled(&self) -> bool {
		self.state.lock().enabled
	}

	/// Schedule `handler` to run once the clock reaches `when`.
	pub fn schedule(&self, when: u64, handler: Handler) {
		let mut state = self.state.lock();
		let seq = state.seq;
		state.seq += 1;
		state.pending.insert((when, seq), handler);
	}

	/// Number of device interrupts waiting to fire.
	pub fn pending(&self) -> usize {
		self.state.lock().pending.len()
	}

	/// Advance the clock by one kernel or user tick and deliver due
	/// interrupts.
	pub(crate) fn tick(&self, machine: &Arc<Machine>, user: bool) {
		let config = machine.config();
		let stride = if user { config.user_tick } else { config.kernel_tick };
		machine.stats().advance(stride, user);

		let was_enabled = mem::replace(&mut self.state.lock().enabled, false);
		self.check_if_due(machine);
		self.state.lock().enabled = was_enabled;

		let yield_now = mem::take(&mut self.state.lock().yield_on_return);
		if yield_now && was_enabled {
			KThread::yield_now();
		}
	}

	/// Nothing is ready to run: skip ahead to the next device interrupt.
	/// Halts the machine when no thread can ever run again.
	pub(crate) fn idle(&self, machine: &Arc<Machine>) {
		if machine.runtime().live() == 0 {
			machine.stop(HaltReason::Idle);
			thread::exit_host_thread();
		}

		let next = self.state.lock().pending.keys().next().map(|&(when, _)| when);
		let Some(when) = next else {
			machine.stop(HaltReason::Deadlock);
			thread::exit_host_thread();
		};

		let now = machine.now();
		if when > now {
			let ticks = when - now;
			machine.stats().advance_idle(ticks);
			if machine.runtime().note_idle(ticks) > machine.config().idle_limit {
				machine.stop(HaltReason::Deadlock);
				thread::exit_host_thread();
			}
		}

		self.check_if_due(machine);
		// Nobody to yield to while idling.
		self.state.lock().yield_on_return = false;
	}

	fn check_if_due(&self, machine: &Machine) {
		let now = machine.now();
		loop {
			let due = {
				let mut state = self.state.lock();
				match state.pending.keys().next() {
					Some(&(when, _)) if when <= now => state.pending.pop_first().map(|(_, h)| h),
					_ => None,
				}
			};
			let Some(handler) = due else {
				break;
			};
			self.state.lock().in_handler = true;
			handler();
			self.state.lock().in_handler = false;
		}
	}
}

// ── Masking ─────────────────────────────────────────────────────
//
// Free functions acting on the calling thread's machine, mirroring the
// disable/restore discipline kernel code is written against.

/// Set the interrupt mask; returns the previous state. Turning interrupts
/// back on is a preemption point.
pub fn set_status(status: bool) -> bool {
	if thread::is_exiting() {
		return false;
	}
	let machine = machine::current();
	let old = mem::replace(&mut machine.interrupt().state.lock().enabled, status);
	if !old && status {
		machine.interrupt().tick(&machine, false);
	}
	old
}

/// Disable interrupts; returns whether they were enabled.
pub fn disable() -> bool {
	set_status(false)
}

/// Restore a state returned by `disable`.
pub fn restore(status: bool) {
	set_status(status);
}

pub fn enable() {
	set_status(true);
}

pub fn enabled() -> bool {
	match machine::try_current() {
		Some(machine) => machine.interrupt().enabled(),
		None => false,
	}
}

pub fn disabled() -> bool {
	!enabled()
}

/// True while a device handler runs.
pub fn in_handler() -> bool {
	match machine::try_current() {
		Some(machine) => machine.interrupt().state.lock().in_handler,
		None => false,
	}
}

/// From inside a handler: make the interrupted thread yield once the handler
/// returns.
pub fn yield_on_return() {
	let machine = machine::current();
	let mut state = machine.interrupt().state.lock();
	assert!(state.in_handler, "yield_on_return outside an interrupt handler");
	state.yield_on_return = true;
}

/// Charge one user-mode instruction.
pub fn tick_user() {
	if thread::is_exiting() {
		return;
	}
	let machine = machine::current();
	if machine.interrupt().enabled() {
		machine.interrupt().tick(&machine, true);
	} else {
		machine.stats().advance(machine.config().user_tick, true);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::machine::MachineBuilder;
	use std::sync::atomic::{AtomicU64, Ordering};

	#[test]
	fn disable_restore_round_trips() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			assert!(enabled());
			let prev = disable();
			assert!(prev);
			assert!(disabled());
			assert!(!disable());
			restore(false);
			assert!(disabled());
			restore(prev);
			assert!(enabled());
		});
	}

	#[test]
	fn enabling_advances_the_clock() {
		let machine = MachineBuilder::new().build();
		machine.boot(|| {
			let m = machine::current();
			let before = m.now();
			disable();
			enable();
			assert_eq!(m.now(), before + m.config().kernel_tick);
		});
	}

	#[test]
	fn scheduled_interrupts_fire_in_order() {
		let machine = MachineBuilder::new().build();
		let seen = Arc::new(AtomicU64::new(0));
		let s = seen.clone();
		machine.boot(move || {
			let m = machine::current();
			let now = m.now();
			let first = s.clone();
			m.interrupt().schedule(
				now + 20,
				Arc::new(move || {
					first.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).ok();
				}),
			);
			let second = s.clone();
			m.interrupt().schedule(
				now + 20,
				Arc::new(move || {
					second.compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst).ok();
				}),
			);
			for _ in 0..3 {
				disable();
				enable();
			}
		});
		assert_eq!(seen.load(Ordering::SeqCst), 2);
	}
}
