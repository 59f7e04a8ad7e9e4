//! File system of the simulated machine.
//!
//! Files are flat byte vectors addressed by name. An open file keeps its data
//! alive, so removing a name does not disturb handles that are already open.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
	/// The handle was closed.
	Closed,
	/// The operation makes no sense for this kind of file.
	Unsupported,
}

impl fmt::Display for FsError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FsError::Closed => write!(f, "file is closed"),
			FsError::Unsupported => write!(f, "operation not supported"),
		}
	}
}

/// A handle produced by `FileSystem::open` or the console.
pub trait OpenFile: Send {
	fn name(&self) -> &str;

	/// Read from the current position, advancing it.
	fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError>;

	/// Write at the current position, advancing it.
	fn write(&mut self, buf: &[u8]) -> Result<usize, FsError>;

	/// Read at an absolute position without moving the file pointer.
	fn read_at(&mut self, _pos: usize, _buf: &mut [u8]) -> Result<usize, FsError> {
		Err(FsError::Unsupported)
	}

	/// Size in bytes, for files that have one.
	fn length(&self) -> Option<usize> {
		None
	}

	fn close(&mut self) {}
}

pub trait FileSystem: Send + Sync {
	/// Open `name`. With `create`, a missing file is created and an existing
	/// one truncated; without it, a missing file yields `None`.
	fn open(&self, name: &str, create: bool) -> Option<Box<dyn OpenFile>>;

	/// Delete `name`. Returns false when no such file exists.
	fn remove(&self, name: &str) -> bool;
}

type Data = Arc<Mutex<Vec<u8>>>;

/// In-memory file system.
#[derive(Default)]
pub struct MemFileSystem {
	files: Mutex<BTreeMap<String, Data>>,
}

impl MemFileSystem {
	pub fn new() -> Self {
		Self::default()
	}

	/// Create or replace `name` with `contents`.
	pub fn insert(&self, name: &str, contents: Vec<u8>) {
		self.files
			.lock()
			.insert(name.to_string(), Arc::new(Mutex::new(contents)));
	}

	pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
		self.files.lock().get(name).map(|d| d.lock().clone())
	}

	pub fn exists(&self, name: &str) -> bool {
		self.files.lock().contains_key(name)
	}

	pub fn names(&self) -> Vec<String> {
		self.files.lock().keys().cloned().collect()
	}
}

impl FileSystem for MemFileSystem {
	fn open(&self, name: &str, create: bool) -> Option<Box<dyn OpenFile>> {
		let mut files = self.files.lock();
		let data = match files.get(name) {
			Some(data) => {
				if create {
					data.lock().clear();
				}
				data.clone()
			}
			None if create => {
				let data: Data = Arc::new(Mutex::new(Vec::new()));
				files.insert(name.to_string(), data.clone());
				data
			}
			None => return None,
		};
		Some(Box::new(MemFile {
			name: name.to_string(),
			data,
			pos: 0,
			open: true,
		}))
	}

	fn remove(&self, name: &str) -> bool {
		self.files.lock().remove(name).is_some()
	}
}

struct MemFile {
	name: String,
	data: Data,
	pos: usize,
	open: bool,
}

impl MemFile {
	fn check_open(&self) -> Result<(), FsError> {
		if self.open {
			Ok(())
		} else {
			Err(FsError::Closed)
		}
	}
}

impl OpenFile for MemFile {
	fn name(&self) -> &str {
		&self.name
	}

	fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
		let n = self.read_at(self.pos, buf)?;
		self.pos += n;
		Ok(n)
	}

	fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
		self.check_open()?;
		let mut data = self.data.lock();
		let end = self.pos + buf.len();
		if data.len() < end {
			data.resize(end, 0);
		}
		data[self.pos..end].copy_from_slice(buf);
		self.pos = end;
		Ok(buf.len())
	}

	fn read_at(&mut self, pos: usize, buf: &mut [u8]) -> Result<usize, FsError> {
		self.check_open()?;
		let data = self.data.lock();
		if pos >= data.len() {
			return Ok(0);
		}
		let n = buf.len().min(data.len() - pos);
		buf[..n].copy_from_slice(&data[pos..pos + n]);
		Ok(n)
	}

	fn length(&self) -> Option<usize> {
		Some(self.data.lock().len())
	}

	fn close(&mut self) {
		self.open = false;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn open_missing_without_create_fails() {
		let fs = MemFileSystem::new();
		assert!(fs.open("nope", false).is_none());
		assert!(!fs.remove("nope"));
	}

	#[test]
	fn write_then_read_back() {
		let fs = MemFileSystem::new();
		let mut f = fs.open("a.txt", true).unwrap();
		assert_eq!(f.write(b"hello").unwrap(), 5);
		f.close();
		assert_eq!(f.write(b"x"), Err(FsError::Closed));

		let mut g = fs.open("a.txt", false).unwrap();
		let mut buf = [0u8; 16];
		assert_eq!(g.read(&mut buf).unwrap(), 5);
		assert_eq!(&buf[..5], b"hello");
		assert_eq!(g.read(&mut buf).unwrap(), 0);
	}

	#[test]
	fn create_truncates() {
		let fs = MemFileSystem::new();
		fs.insert("f", b"old contents".to_vec());
		let _ = fs.open("f", true).unwrap();
		assert_eq!(fs.contents("f").unwrap(), b"");
	}

	#[test]
	fn removed_file_stays_readable_through_open_handle() {
		let fs = MemFileSystem::new();
		fs.insert("f", b"data".to_vec());
		let mut f = fs.open("f", false).unwrap();
		assert!(fs.remove("f"));
		assert!(!fs.exists("f"));
		let mut buf = [0u8; 4];
		assert_eq!(f.read(&mut buf).unwrap(), 4);
		assert_eq!(&buf, b"data");
	}
}
