//! Console device.
//!
//! Input is whatever the host fed in before or during the run; reads never
//! block and return 0 once the buffer is drained. Output is captured so tests
//! can inspect it, and optionally echoed to the host's stdout.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use spin::Mutex;

use crate::fs::{FsError, OpenFile};

pub struct Console {
	input: Mutex<VecDeque<u8>>,
	output: Mutex<Vec<u8>>,
	echo: bool,
}

impl Console {
	pub(crate) fn new(echo: bool) -> Self {
		Self {
			input: Mutex::new(VecDeque::new()),
			output: Mutex::new(Vec::new()),
			echo,
		}
	}

	/// Queue bytes for programs reading standard input.
	pub fn feed(&self, bytes: &[u8]) {
		self.input.lock().extend(bytes.iter().copied());
	}

	/// Everything written so far.
	pub fn output(&self) -> Vec<u8> {
		self.output.lock().clone()
	}

	pub fn output_string(&self) -> String {
		String::from_utf8_lossy(&self.output.lock()).into_owned()
	}

	pub fn open_for_reading(self: &Arc<Self>) -> Box<dyn OpenFile> {
		Box::new(ConsoleFile {
			console: self.clone(),
			name: "console:in",
			readable: true,
		})
	}

	pub fn open_for_writing(self: &Arc<Self>) -> Box<dyn OpenFile> {
		Box::new(ConsoleFile {
			console: self.clone(),
			name: "console:out",
			readable: false,
		})
	}
}

struct ConsoleFile {
	console: Arc<Console>,
	name: &'static str,
	readable: bool,
}

impl OpenFile for ConsoleFile {
	fn name(&self) -> &str {
		self.name
	}

	fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
		if !self.readable {
			return Err(FsError::Unsupported);
		}
		let mut input = self.console.input.lock();
		let n = buf.len().min(input.len());
		for (slot, byte) in buf.iter_mut().zip(input.drain(..n)) {
			*slot = byte;
		}
		Ok(n)
	}

	fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
		if self.readable {
			return Err(FsError::Unsupported);
		}
		self.console.output.lock().extend_from_slice(buf);
		if self.console.echo {
			let stdout = std::io::stdout();
			let mut out = stdout.lock();
			let _ = out.write_all(buf);
			let _ = out.flush();
		}
		Ok(buf.len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reads_drain_fed_input() {
		let console = Arc::new(Console::new(false));
		console.feed(b"abc");
		let mut stdin = console.open_for_reading();
		let mut buf = [0u8; 2];
		assert_eq!(stdin.read(&mut buf).unwrap(), 2);
		assert_eq!(&buf, b"ab");
		assert_eq!(stdin.read(&mut buf).unwrap(), 1);
		assert_eq!(stdin.read(&mut buf).unwrap(), 0);
		assert!(stdin.write(b"x").is_err());
	}

	#[test]
	fn writes_are_captured() {
		let console = Arc::new(Console::new(false));
		let mut stdout = console.open_for_writing();
		stdout.write(b"hi ").unwrap();
		stdout.write(b"there").unwrap();
		assert_eq!(console.output_string(), "hi there");
	}
}
