//! Periodic timer device.
//!
//! Fires every `timer_interval` ticks for as long as the machine runs and
//! calls whatever handler the kernel registered (the alarm clock, normally).

use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::interrupt::Handler;
use crate::machine::{self, Machine};

pub struct Timer {
	interval: u64,
	handler: Mutex<Option<Handler>>,
}

impl Timer {
	pub(crate) fn new(interval: u64) -> Self {
		Self {
			interval: interval.max(1),
			handler: Mutex::new(None),
		}
	}

	pub fn interval(&self) -> u64 {
		self.interval
	}

	/// Install the callback run on every timer interrupt.
	pub fn set_interrupt_handler(&self, handler: Handler) {
		*self.handler.lock() = Some(handler);
	}

	pub(crate) fn start(&self, machine: &Arc<Machine>) {
		schedule_next(Arc::downgrade(machine));
	}
}

fn schedule_next(machine: Weak<Machine>) {
	let Some(m) = machine.upgrade() else {
		return;
	};
	let when = m.now() + m.timer().interval;
	m.interrupt().schedule(
		when,
		Arc::new(move || {
			schedule_next(machine.clone());
			let Some(m) = machine.upgrade() else {
				return;
			};
			let handler = m.timer().handler.lock().clone();
			if let Some(handler) = handler {
				handler();
			}
		}),
	);
}

/// Current time of the calling thread's machine.
pub fn now() -> u64 {
	machine::current().now()
}
