//! Trace writing
//!
//! The writer reserves placeholder words for the header's section offsets,
//! streams the body sections out and then seeks back to patch the
//! placeholders, so nothing needs to be sized up front.

// Imports
use {
	super::{Header, ModuleRecord, ResolvedSymbol, StatsRow, MAGIC, VERSION_V2},
	anyhow::Context,
	byteorder::{LittleEndian, WriteBytesExt},
	std::{
		fs, io,
		path::{Path, PathBuf},
		time::SystemTime,
	},
};

/// A reserved 32-bit word, patched once its value is known
struct PatchWord {
	/// File offset of the placeholder
	offset: u64,
}

impl PatchWord {
	/// Placeholder bytes; conspicuous in a hex dump of a truncated file
	const PLACEHOLDER: [u8; 4] = [0xcc, 0xdd, 0xee, 0xff];

	/// Writes a placeholder at the current position
	fn reserve<W: io::Write + io::Seek>(writer: &mut W) -> Result<Self, anyhow::Error> {
		let offset = writer.stream_position().context("Unable to get stream position")?;
		writer
			.write_all(&Self::PLACEHOLDER)
			.context("Unable to write placeholder")?;
		Ok(Self { offset })
	}

	/// Overwrites the placeholder with `value`, restoring the position
	fn patch<W: io::Write + io::Seek>(&self, writer: &mut W, value: u32) -> Result<(), anyhow::Error> {
		let pos = writer.stream_position().context("Unable to get stream position")?;
		writer
			.seek(io::SeekFrom::Start(self.offset))
			.context("Unable to seek to placeholder")?;
		writer
			.write_u32::<LittleEndian>(value)
			.context("Unable to patch placeholder")?;
		writer
			.seek(io::SeekFrom::Start(pos))
			.context("Unable to seek back")?;
		Ok(())
	}
}

/// Pads the stream to the next 8-byte boundary
fn align<W: io::Write + io::Seek>(writer: &mut W) -> Result<(), anyhow::Error> {
	let pos = writer.stream_position().context("Unable to get stream position")?;
	let needed = (8 - (pos & 7)) & 7;
	if needed != 0 {
		let padding = [0u8; 8];
		writer
			.write_all(&padding[..needed as usize])
			.context("Unable to write padding")?;
	}
	Ok(())
}

/// Returns the current stream position as a section offset
fn position<W: io::Write + io::Seek>(writer: &mut W) -> Result<u32, anyhow::Error> {
	let pos = writer.stream_position().context("Unable to get stream position")?;
	Ok(pos as u32)
}

/// Writes a complete capture to `writer`.
///
/// `frames` is the raw frame pool including terminators; `stats` supplies
/// the records in their serialization order.
pub fn write_trace<W: io::Write + io::Seek>(
	writer: &mut W,
	modules: &[ModuleRecord],
	frames: &[u64],
	stats: impl IntoIterator<Item = StatsRow>,
) -> Result<(), anyhow::Error> {
	writer.write_u32::<LittleEndian>(MAGIC).context("Unable to write magic")?;
	writer
		.write_u32::<LittleEndian>(VERSION_V2)
		.context("Unable to write version")?;

	let module_offset = PatchWord::reserve(writer)?;
	let module_count = PatchWord::reserve(writer)?;
	let module_str_offset = PatchWord::reserve(writer)?;
	let frame_offset = PatchWord::reserve(writer)?;
	let frame_count = PatchWord::reserve(writer)?;
	let stats_offset = PatchWord::reserve(writer)?;
	let stats_count = PatchWord::reserve(writer)?;

	// Symbol section; populated by a later resolve pass
	for _ in 0..3 {
		writer.write_u32::<LittleEndian>(0).context("Unable to write symbol header")?;
	}

	// Modules, then their names as consecutive NUL-terminated strings
	align(writer)?;
	let pos = position(writer)?;
	module_offset.patch(writer, pos)?;
	module_count.patch(writer, modules.len() as u32)?;

	let mut name_offset = 0u32;
	for module in modules {
		writer
			.write_u64::<LittleEndian>(module.image_base)
			.context("Unable to write module base")?;
		writer
			.write_u64::<LittleEndian>(module.segment_offset)
			.context("Unable to write module segment offset")?;
		writer
			.write_u32::<LittleEndian>(module.size_bytes)
			.context("Unable to write module size")?;
		writer
			.write_u32::<LittleEndian>(name_offset)
			.context("Unable to write module name offset")?;
		name_offset += module.name.len() as u32 + 1;
	}

	let pos = position(writer)?;
	module_str_offset.patch(writer, pos)?;
	for module in modules {
		writer
			.write_all(module.name.as_bytes())
			.context("Unable to write module name")?;
		writer.write_all(&[0]).context("Unable to write module name terminator")?;
	}

	// Raw stack-frame pool
	align(writer)?;
	let pos = position(writer)?;
	frame_offset.patch(writer, pos)?;
	frame_count.patch(writer, frames.len() as u32)?;
	for &frame in frames {
		writer.write_u64::<LittleEndian>(frame).context("Unable to write frame")?;
	}

	// Statistics records
	align(writer)?;
	let pos = position(writer)?;
	stats_offset.patch(writer, pos)?;
	let mut count = 0u32;
	for row in stats {
		writer.write_u64::<LittleEndian>(row.rip).context("Unable to write rip")?;
		writer
			.write_u32::<LittleEndian>(row.stack_offset)
			.context("Unable to write stack offset")?;
		for counter in row.counts {
			writer
				.write_u32::<LittleEndian>(counter)
				.context("Unable to write counter")?;
		}
		writer.write_u32::<LittleEndian>(0).context("Unable to write reserved word")?;
		count += 1;
	}
	stats_count.patch(writer, count)?;

	Ok(())
}

/// Writes a complete capture to `path`
pub fn write_trace_file(
	path: &Path,
	modules: &[ModuleRecord],
	frames: &[u64],
	stats: impl IntoIterator<Item = StatsRow>,
) -> Result<(), anyhow::Error> {
	let file = fs::File::create(path).with_context(|| format!("Unable to create trace file {path:?}"))?;
	let mut writer = io::BufWriter::new(file);
	write_trace(&mut writer, modules, frames, stats)?;
	io::Write::flush(&mut writer).context("Unable to flush trace file")?;
	Ok(())
}

/// Returns the capture path for a host executable:
/// `<exe-stem>_<unix-time>.csim` next to the executable.
#[must_use]
pub fn capture_file_path(executable: &Path) -> PathBuf {
	let stem = executable
		.file_stem()
		.map_or_else(|| "unknown".to_owned(), |stem| stem.to_string_lossy().into_owned());
	let time = SystemTime::now()
		.duration_since(SystemTime::UNIX_EPOCH)
		.map_or(0, |duration| duration.as_secs());
	executable.with_file_name(format!("{stem}_{time}.csim"))
}

/// Rewrites a serialized trace with a resolved symbol table.
///
/// Symbol records are sorted by rip and appended after the capture
/// sections, followed by their interned UTF-16 strings; the header's
/// symbol words are patched in place. Offset 0 of the string section is a
/// NUL so that zero offsets read as empty strings.
pub fn resolve_symbols(data: &[u8], symbols: &[ResolvedSymbol]) -> Result<Vec<u8>, anyhow::Error> {
	let header = Header::from_reader(&mut &data[..]).context("Unable to read header")?;
	anyhow::ensure!(header.symbol_count == 0, "Trace already has a symbol table");

	let mut out = data.to_vec();
	while out.len() % 8 != 0 {
		out.push(0);
	}

	// Intern all strings as UTF-16 code units
	fn intern(text: &mut Vec<u16>, offsets: &mut std::collections::HashMap<String, u32>, s: &str) -> u32 {
		if let Some(&offset) = offsets.get(s) {
			return offset;
		}
		let offset = text.len() as u32;
		text.extend(s.encode_utf16());
		text.push(0);
		offsets.insert(s.to_owned(), offset);
		offset
	}

	let mut text = vec![0u16];
	let mut offsets = std::collections::HashMap::new();
	let mut records = symbols
		.iter()
		.map(|symbol| super::SymbolRecord {
			rip:          symbol.rip,
			name_offset:  intern(&mut text, &mut offsets, &symbol.symbol_name),
			file_offset:  intern(&mut text, &mut offsets, &symbol.file_name),
			line_number:  symbol.line_number,
			displacement: symbol.displacement,
			module_index: symbol.module_index,
		})
		.collect::<Vec<_>>();
	records.sort_by_key(|record| record.rip);

	let symbol_offset = out.len() as u32;
	for record in &records {
		out.extend_from_slice(&record.rip.to_le_bytes());
		out.extend_from_slice(&record.name_offset.to_le_bytes());
		out.extend_from_slice(&record.file_offset.to_le_bytes());
		out.extend_from_slice(&record.line_number.to_le_bytes());
		out.extend_from_slice(&record.displacement.to_le_bytes());
		out.extend_from_slice(&record.module_index.to_le_bytes());
	}

	let symbol_text_offset = out.len() as u32;
	for unit in text {
		out.extend_from_slice(&unit.to_le_bytes());
	}

	// Patch the header's symbol words
	let words = [symbol_offset, records.len() as u32, symbol_text_offset];
	for (idx, word) in words.into_iter().enumerate() {
		let at = Header::SYMBOL_WORDS_OFFSET + idx * 4;
		out[at..at + 4].copy_from_slice(&word.to_le_bytes());
	}

	Ok(out)
}

/// Rewrites the trace at `path` with a resolved symbol table
pub fn write_symbols(path: &Path, symbols: &[ResolvedSymbol]) -> Result<(), anyhow::Error> {
	let data = fs::read(path).with_context(|| format!("Unable to read trace file {path:?}"))?;
	let resolved = resolve_symbols(&data, symbols)?;
	fs::write(path, resolved).with_context(|| format!("Unable to rewrite trace file {path:?}"))
}
