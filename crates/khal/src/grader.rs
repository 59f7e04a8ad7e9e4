//! Grading hook.
//!
//! The kernel reports every process exit here before tearing the process
//! down, which lets a harness observe exit statuses in order.

use spin::Mutex;

pub trait AutoGrader: Send + Sync {
	/// The current process is about to exit with `status`.
	fn finishing_current_process(&self, status: i32);
}

/// Ignores everything.
#[derive(Debug, Default)]
pub struct NullGrader;

impl AutoGrader for NullGrader {
	fn finishing_current_process(&self, _status: i32) {}
}

/// Records exit statuses in the order processes finish.
#[derive(Debug, Default)]
pub struct ExitLog {
	statuses: Mutex<Vec<i32>>,
}

impl ExitLog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn statuses(&self) -> Vec<i32> {
		self.statuses.lock().clone()
	}
}

impl AutoGrader for ExitLog {
	fn finishing_current_process(&self, status: i32) {
		self.statuses.lock().push(status);
	}
}
