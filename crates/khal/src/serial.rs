//! Serial line of the simulated machine.
//!
//! The host's standard error stream plays the part of the UART, so kernel
//! diagnostics never mix with the captured console output.

use core::fmt;
use std::io::Write;

use spin::Mutex;

/// Serial port driver writing to the host's stderr.
pub struct Serial {
	enabled: bool,
}

impl Serial {
	const fn new() -> Self {
		Self { enabled: true }
	}

	/// Turn the line on or off. A disabled line swallows everything.
	pub fn set_enabled(&mut self, enabled: bool) {
		self.enabled = enabled;
	}

	/// Write a string to the serial port
	pub fn write_str(&self, s: &str) {
		if !self.enabled {
			return;
		}
		let stderr = std::io::stderr();
		let mut out = stderr.lock();
		let _ = out.write_all(s.as_bytes());
	}
}

impl fmt::Write for Serial {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		Serial::write_str(self, s);
		Ok(())
	}
}

/// Global serial port instance
pub static SERIAL: Mutex<Serial> = Mutex::new(Serial::new());

/// Enable or disable the serial line.
pub fn set_enabled(enabled: bool) {
	SERIAL.lock().set_enabled(enabled);
}

/// Write a string to the serial port
pub fn write_str(s: &str) {
	SERIAL.lock().write_str(s);
}

/// Write formatted arguments to the serial port
pub fn write_fmt(args: fmt::Arguments) {
	use fmt::Write;
	let _ = SERIAL.lock().write_fmt(args);
}
