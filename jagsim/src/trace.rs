//! Trace files
//!
//! The self-describing binary format a capture is saved to: a fixed header
//! of section offsets (patched in after the body is written), the loaded
//! modules and their name strings, the raw stack-frame pool, the
//! statistics records and, once an external resolve pass has run, a
//! rip-sorted symbol table with UTF-16 strings.
//!
//! All integers are little-endian and all offsets are from the start of
//! the file. Sections are 8-byte aligned.

// Modules
pub mod reader;
pub mod writer;

// Exports
pub use self::{
	reader::{badness, FileProfile, FlatRecord, Trace, TreeNode},
	writer::{write_symbols, write_trace, write_trace_file},
};

// Imports
use {
	crate::cache::ACCESS_RESULT_COUNT,
	anyhow::Context,
	byteorder::{LittleEndian, ReadBytesExt},
	std::io,
};

/// File magic
pub const MAGIC: u32 = 0xcace_51af;

/// Version without per-module segment offsets
pub const VERSION_V1: u32 = 1;

/// Current version, with per-module segment offsets
pub const VERSION_V2: u32 = 2;

/// Trace header
#[derive(Clone, Copy, Debug)]
pub struct Header {
	/// Format version
	pub version: u32,

	/// Modules table
	pub module_offset: u32,
	pub module_count:  u32,

	/// Module name strings
	pub module_str_offset: u32,

	/// Stack-frame pool
	pub frame_offset: u32,
	pub frame_count:  u32,

	/// Statistics records
	pub stats_offset: u32,
	pub stats_count:  u32,

	/// Symbol table; zero in a just-captured file
	pub symbol_offset:      u32,
	pub symbol_count:       u32,
	pub symbol_text_offset: u32,
}

impl Header {
	/// Size of the serialized header, including the magic
	pub const BYTE_SIZE: usize = 48;
	/// File offset of the symbol header words, for the resolve rewrite
	pub const SYMBOL_WORDS_OFFSET: usize = 36;

	/// Parses a header, validating the magic and version
	pub fn from_reader<R: io::Read>(reader: &mut R) -> Result<Self, anyhow::Error> {
		let magic = reader.read_u32::<LittleEndian>().context("Unable to read magic")?;
		anyhow::ensure!(magic == MAGIC, "Found wrong magic {magic:#010x}, expected {MAGIC:#010x}");

		let version = reader.read_u32::<LittleEndian>().context("Unable to read version")?;
		anyhow::ensure!(
			version == VERSION_V1 || version == VERSION_V2,
			"Unsupported trace version {version}"
		);

		let mut word = || reader.read_u32::<LittleEndian>();
		Ok(Self {
			version,
			module_offset: word().context("Unable to read module offset")?,
			module_count: word().context("Unable to read module count")?,
			module_str_offset: word().context("Unable to read module string offset")?,
			frame_offset: word().context("Unable to read frame offset")?,
			frame_count: word().context("Unable to read frame count")?,
			stats_offset: word().context("Unable to read stats offset")?,
			stats_count: word().context("Unable to read stats count")?,
			symbol_offset: word().context("Unable to read symbol offset")?,
			symbol_count: word().context("Unable to read symbol count")?,
			symbol_text_offset: word().context("Unable to read symbol text offset")?,
		})
	}

	/// Returns the size of a module record for this version
	#[must_use]
	pub const fn module_record_size(&self) -> usize {
		match self.version {
			VERSION_V1 => 16,
			_ => 24,
		}
	}
}

/// Size of a serialized statistics record
pub const STATS_RECORD_SIZE: usize = 48;

/// Size of a serialized symbol record
pub const SYMBOL_RECORD_SIZE: usize = 28;

/// A loaded module of the traced process
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ModuleRecord {
	/// Image base address
	pub image_base: u64,

	/// In-memory offset of the mapped text segment; 0 in v1 traces
	pub segment_offset: u64,

	/// Image size in bytes
	pub size_bytes: u32,

	/// File name
	pub name: String,
}

/// One statistics record: key plus counter vector
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct StatsRow {
	/// Instruction pointer
	pub rip: u64,

	/// Offset into the frame pool
	pub stack_offset: u32,

	/// Counters, indexed by [`AccessResult`](crate::cache::AccessResult)
	pub counts: [u32; ACCESS_RESULT_COUNT],
}

/// One symbol record, as stored after a resolve pass
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct SymbolRecord {
	/// Instruction address this symbol was resolved for
	pub rip: u64,

	/// Symbol name, as an offset into the UTF-16 text section
	pub name_offset: u32,

	/// Source file name, as an offset into the UTF-16 text section
	pub file_offset: u32,

	/// Source line number
	pub line_number: u32,

	/// Byte displacement from the symbol start
	pub displacement: u32,

	/// Index into the modules table
	pub module_index: u32,
}

/// A resolved symbol, as produced by the external resolve pass
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ResolvedSymbol {
	/// Instruction address
	pub rip: u64,

	/// Symbol name
	pub symbol_name: String,

	/// Source file name
	pub file_name: String,

	/// Source line number
	pub line_number: u32,

	/// Byte displacement from the symbol start
	pub displacement: u32,

	/// Index into the modules table
	pub module_index: u32,
}
