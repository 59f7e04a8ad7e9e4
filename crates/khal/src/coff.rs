//! Executable image format.
//!
//! Little-endian layout:
//!
//! ```text
//! magic        4 bytes  "ECOF"
//! entry        u32      initial PC
//! nsections    u32
//! per section:
//!   name_len   u16, then name bytes
//!   first_vpn  u32
//!   num_pages  u32
//!   flags      u32      bit 0: read-only
//!   data_len   u32, then data bytes (at most num_pages * page_size)
//! ```
//!
//! Code sections hold the NUL-terminated name of the routine to execute.

use std::fmt;

use crate::fs::{FsError, OpenFile};
use crate::processor::Processor;

pub const MAGIC: [u8; 4] = *b"ECOF";

const FLAG_READ_ONLY: u32 = 1;
const MAX_SECTIONS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoffError {
	Io(FsError),
	/// The file has no size, so it cannot be an image.
	NotAFile,
	BadMagic,
	Truncated,
	TooManySections(u32),
	/// A section carries more bytes than its pages can hold.
	SectionOverflow { name: String },
}

impl fmt::Display for CoffError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CoffError::Io(e) => write!(f, "read failed: {}", e),
			CoffError::NotAFile => write!(f, "not a regular file"),
			CoffError::BadMagic => write!(f, "bad magic number"),
			CoffError::Truncated => write!(f, "truncated image"),
			CoffError::TooManySections(n) => write!(f, "{} sections is too many", n),
			CoffError::SectionOverflow { name } => {
				write!(f, "section {} does not fit its pages", name)
			}
		}
	}
}

impl From<FsError> for CoffError {
	fn from(e: FsError) -> Self {
		CoffError::Io(e)
	}
}

/// A parsed executable.
#[derive(Debug, Clone)]
pub struct Coff {
	entry: u32,
	sections: Vec<CoffSection>,
}

#[derive(Debug, Clone)]
pub struct CoffSection {
	name: String,
	first_vpn: u32,
	num_pages: u32,
	read_only: bool,
	data: Vec<u8>,
	page_size: usize,
}

impl Coff {
	/// Parse the whole of `file`.
	pub fn load(file: &mut dyn OpenFile, page_size: usize) -> Result<Self, CoffError> {
		let len = file.length().ok_or(CoffError::NotAFile)?;
		let mut bytes = vec![0u8; len];
		let mut done = 0;
		while done < len {
			let n = file.read_at(done, &mut bytes[done..])?;
			if n == 0 {
				return Err(CoffError::Truncated);
			}
			done += n;
		}
		Self::parse(&bytes, page_size)
	}

	pub fn parse(bytes: &[u8], page_size: usize) -> Result<Self, CoffError> {
		let mut r = Reader { bytes, pos: 0 };
		if r.take(4)? != MAGIC {
			return Err(CoffError::BadMagic);
		}
		let entry = r.u32()?;
		let count = r.u32()?;
		if count > MAX_SECTIONS {
			return Err(CoffError::TooManySections(count));
		}

		let mut sections = Vec::with_capacity(count as usize);
		for _ in 0..count {
			let name_len = r.u16()? as usize;
			let name = String::from_utf8_lossy(r.take(name_len)?).into_owned();
			let first_vpn = r.u32()?;
			let num_pages = r.u32()?;
			let flags = r.u32()?;
			let data_len = r.u32()? as usize;
			if data_len > num_pages as usize * page_size {
				return Err(CoffError::SectionOverflow { name });
			}
			let data = r.take(data_len)?.to_vec();
			sections.push(CoffSection {
				name,
				first_vpn,
				num_pages,
				read_only: flags & FLAG_READ_ONLY != 0,
				data,
				page_size,
			});
		}
		Ok(Self { entry, sections })
	}

	pub fn entry_point(&self) -> u32 {
		self.entry
	}

	pub fn number_of_sections(&self) -> usize {
		self.sections.len()
	}

	pub fn section(&self, i: usize) -> &CoffSection {
		&self.sections[i]
	}

	pub fn sections(&self) -> &[CoffSection] {
		&self.sections
	}
}

impl CoffSection {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn first_vpn(&self) -> u32 {
		self.first_vpn
	}

	/// Length in pages.
	pub fn length(&self) -> u32 {
		self.num_pages
	}

	pub fn is_read_only(&self) -> bool {
		self.read_only
	}

	/// Copy page `spn` of this section into physical page `ppn`, zero-filling
	/// whatever the section's data does not cover.
	pub fn load_page(&self, spn: u32, ppn: u32, processor: &Processor) {
		assert!(spn < self.num_pages, "section page {} out of range", spn);
		let page_size = self.page_size;
		let start = spn as usize * page_size;
		let end = (start + page_size).min(self.data.len()).max(start);
		let chunk = self.data.get(start..end).unwrap_or(&[]);

		processor.with_memory(|memory| {
			let base = ppn as usize * page_size;
			let page = &mut memory[base..base + page_size];
			page[..chunk.len()].copy_from_slice(chunk);
			page[chunk.len()..].fill(0);
		});
	}
}

struct Reader<'a> {
	bytes: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn take(&mut self, n: usize) -> Result<&'a [u8], CoffError> {
		let end = self.pos.checked_add(n).ok_or(CoffError::Truncated)?;
		let slice = self.bytes.get(self.pos..end).ok_or(CoffError::Truncated)?;
		self.pos = end;
		Ok(slice)
	}

	fn u16(&mut self) -> Result<u16, CoffError> {
		let b = self.take(2)?;
		Ok(u16::from_le_bytes([b[0], b[1]]))
	}

	fn u32(&mut self) -> Result<u32, CoffError> {
		let b = self.take(4)?;
		Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
	}
}

/// Writes images.
#[derive(Debug, Clone)]
pub struct CoffBuilder {
	page_size: usize,
	entry: Option<u32>,
	sections: Vec<(String, u32, u32, bool, Vec<u8>)>,
	next_vpn: u32,
}

impl CoffBuilder {
	pub fn new(page_size: usize) -> Self {
		Self {
			page_size,
			entry: None,
			sections: Vec::new(),
			next_vpn: 0,
		}
	}

	/// Append a read-only code section that runs `routine`. The first one
	/// becomes the entry point unless `entry` says otherwise.
	pub fn routine(mut self, routine: &str) -> Self {
		let mut data = routine.as_bytes().to_vec();
		data.push(0);
		if self.entry.is_none() {
			self.entry = Some(self.next_vpn * self.page_size as u32);
		}
		self.section(".text", true, data)
	}

	/// Append a section after the previous one, sized to fit `data`.
	pub fn section(self, name: &str, read_only: bool, data: Vec<u8>) -> Self {
		let pages = data.len().div_ceil(self.page_size).max(1) as u32;
		let vpn = self.next_vpn;
		self.section_at(name, vpn, pages, read_only, data)
	}

	/// Append a section at an explicit page range.
	pub fn section_at(
		mut self,
		name: &str,
		first_vpn: u32,
		num_pages: u32,
		read_only: bool,
		data: Vec<u8>,
	) -> Self {
		self.next_vpn = self.next_vpn.max(first_vpn + num_pages);
		self.sections
			.push((name.to_string(), first_vpn, num_pages, read_only, data));
		self
	}

	pub fn entry(mut self, entry: u32) -> Self {
		self.entry = Some(entry);
		self
	}

	pub fn build(&self) -> Vec<u8> {
		let mut out = Vec::new();
		out.extend_from_slice(&MAGIC);
		out.extend_from_slice(&self.entry.unwrap_or(0).to_le_bytes());
		out.extend_from_slice(&(self.sections.len() as u32).to_le_bytes());
		for (name, first_vpn, num_pages, read_only, data) in &self.sections {
			out.extend_from_slice(&(name.len() as u16).to_le_bytes());
			out.extend_from_slice(name.as_bytes());
			out.extend_from_slice(&first_vpn.to_le_bytes());
			out.extend_from_slice(&num_pages.to_le_bytes());
			let flags = if *read_only { FLAG_READ_ONLY } else { 0 };
			out.extend_from_slice(&flags.to_le_bytes());
			out.extend_from_slice(&(data.len() as u32).to_le_bytes());
			out.extend_from_slice(data);
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builder_output_parses() {
		let image = CoffBuilder::new(1024)
			.routine("hello")
			.section(".data", false, vec![7; 1500])
			.build();
		let coff = Coff::parse(&image, 1024).unwrap();
		assert_eq!(coff.entry_point(), 0);
		assert_eq!(coff.number_of_sections(), 2);

		let text = coff.section(0);
		assert_eq!(text.name(), ".text");
		assert!(text.is_read_only());
		assert_eq!((text.first_vpn(), text.length()), (0, 1));

		let data = coff.section(1);
		assert!(!data.is_read_only());
		assert_eq!((data.first_vpn(), data.length()), (1, 2));
	}

	#[test]
	fn rejects_garbage() {
		assert_eq!(Coff::parse(b"nope", 1024).unwrap_err(), CoffError::BadMagic);
		let image = CoffBuilder::new(1024).routine("x").build();
		assert_eq!(
			Coff::parse(&image[..image.len() - 1], 1024).unwrap_err(),
			CoffError::Truncated
		);
	}

	#[test]
	fn oversized_section_is_rejected() {
		let image = CoffBuilder::new(1024)
			.section_at(".data", 0, 1, false, vec![0; 1025])
			.build();
		assert!(matches!(
			Coff::parse(&image, 1024),
			Err(CoffError::SectionOverflow { .. })
		));
	}
}
