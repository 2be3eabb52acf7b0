//! Trace reading
//!
//! Memory-maps a produced trace and exposes the raw sections plus the
//! three projections the tooling wants: a flat per-symbol profile, a
//! top-down call tree built from the frame pool, and a per-source-line
//! table for a single symbol. Addresses resolve against the embedded
//! symbol table when a resolve pass has populated it; otherwise locations
//! are labeled with their raw address.

// Imports
use {
	super::{Header, ModuleRecord, StatsRow, SymbolRecord, STATS_RECORD_SIZE, SYMBOL_RECORD_SIZE},
	crate::cache::{AccessResult, ACCESS_RESULT_COUNT},
	anyhow::Context,
	itertools::Itertools,
	jagsim_util::ReadByteArray,
	std::{collections::BTreeMap, fs, path::Path},
};

/// Badness weight of an access served by the L2
const BADNESS_L2_HIT: f64 = 25.0;

/// Badness weight of an access missing both levels
const BADNESS_L2_MISS: f64 = 200.0;

/// Weighted sum of miss counters, used to rank code locations.
///
/// The weights approximate Jaguar load-to-use latencies; the exact values
/// only matter for ranking.
#[must_use]
pub fn badness(counts: &[u32; ACCESS_RESULT_COUNT]) -> f64 {
	let l2_hits = counts[AccessResult::L2Hit.index()] as f64;
	let l2_misses =
		counts[AccessResult::L2DMiss.index()] as f64 + counts[AccessResult::L2IMiss.index()] as f64;
	BADNESS_L2_HIT * l2_hits + BADNESS_L2_MISS * l2_misses
}

/// Backing bytes of a loaded trace
enum Bytes {
	/// Memory-mapped file
	Mapped(memmap2::Mmap),

	/// Owned buffer
	Owned(Vec<u8>),
}

impl Bytes {
	/// Returns the bytes
	fn get(&self) -> &[u8] {
		match self {
			Self::Mapped(map) => map,
			Self::Owned(bytes) => bytes,
		}
	}
}

/// A loaded trace
pub struct Trace {
	/// Raw file contents
	data: Bytes,

	/// Parsed header
	header: Header,
}

impl Trace {
	/// Memory-maps and validates the trace at `path`
	pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
		let mut file = fs::File::open(path).with_context(|| format!("Unable to open trace file {path:?}"))?;

		// Check the magic before mapping anything
		let magic: [u8; 4] = file.read_byte_array().context("Unable to read magic")?;
		anyhow::ensure!(
			magic == super::MAGIC.to_le_bytes(),
			"Found wrong magic {magic:?}, expected {:?}",
			super::MAGIC.to_le_bytes()
		);

		// Note: The map stays valid for as long as we hold it; rewriting a
		//       trace in place while reading it is not supported.
		let map = unsafe { memmap2::Mmap::map(&file) }.context("Unable to memory-map trace file")?;
		tracing::trace!(?path, len = map.len(), "Mapped trace file");

		Self::from_data(Bytes::Mapped(map))
	}

	/// Loads a trace from an in-memory buffer
	pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, anyhow::Error> {
		Self::from_data(Bytes::Owned(bytes))
	}

	/// Parses and bounds-checks the header
	fn from_data(data: Bytes) -> Result<Self, anyhow::Error> {
		let bytes = data.get();
		let header = Header::from_reader(&mut &bytes[..]).context("Unable to read header")?;
		tracing::trace!(?header, "Parsed trace header");

		let len = bytes.len();
		let section = |offset: u32, count: u32, record_size: usize| -> Result<(), anyhow::Error> {
			let end = offset as usize + count as usize * record_size;
			anyhow::ensure!(end <= len, "Section at {offset:#x} ({count} records) exceeds file size {len:#x}");
			Ok(())
		};

		section(header.module_offset, header.module_count, header.module_record_size())
			.context("Invalid modules section")?;
		anyhow::ensure!((header.module_str_offset as usize) <= len, "Invalid module string section");
		section(header.frame_offset, header.frame_count, 8).context("Invalid frames section")?;
		section(header.stats_offset, header.stats_count, STATS_RECORD_SIZE).context("Invalid stats section")?;
		if header.symbol_count != 0 {
			section(header.symbol_offset, header.symbol_count, SYMBOL_RECORD_SIZE)
				.context("Invalid symbols section")?;
			anyhow::ensure!((header.symbol_text_offset as usize) <= len, "Invalid symbol text section");
		}

		Ok(Self { data, header })
	}

	/// Returns the parsed header
	#[must_use]
	pub fn header(&self) -> &Header {
		&self.header
	}

	/// Returns if a resolve pass has populated the symbol table
	#[must_use]
	pub fn is_resolved(&self) -> bool {
		self.header.symbol_count != 0
	}

	/// Parses the modules table
	#[must_use]
	pub fn modules(&self) -> Vec<ModuleRecord> {
		let record_size = self.header.module_record_size();
		(0..self.header.module_count as usize)
			.map(|idx| {
				let at = self.header.module_offset as usize + idx * record_size;
				let image_base = self.read_u64(at);
				let (segment_offset, rest) = match self.header.version {
					super::VERSION_V1 => (0, at + 8),
					_ => (self.read_u64(at + 8), at + 16),
				};
				let size_bytes = self.read_u32(rest);
				let name_offset = self.read_u32(rest + 4);

				ModuleRecord {
					image_base,
					segment_offset,
					size_bytes,
					name: self.read_cstr(self.header.module_str_offset as usize + name_offset as usize),
				}
			})
			.collect()
	}

	/// Maps a rip to its module and offset within it, if any
	#[must_use]
	pub fn module_for(&self, rip: u64) -> Option<(usize, u64)> {
		let modules = self.modules();
		let idx = modules
			.iter()
			.position(|module| rip >= module.image_base && rip < module.image_base + module.size_bytes as u64)?;
		Some((idx, rip - modules[idx].image_base))
	}

	/// Iterates the statistics records
	pub fn stats(&self) -> impl Iterator<Item = StatsRow> + '_ {
		(0..self.header.stats_count as usize).map(|idx| {
			let at = self.header.stats_offset as usize + idx * STATS_RECORD_SIZE;
			let mut counts = [0u32; ACCESS_RESULT_COUNT];
			for (slot, count) in counts.iter_mut().enumerate() {
				*count = self.read_u32(at + 12 + slot * 4);
			}
			StatsRow {
				rip: self.read_u64(at),
				stack_offset: self.read_u32(at + 8),
				counts,
			}
		})
	}

	/// Iterates the frame run starting at pool offset `offset`, up to its
	/// zero terminator
	pub fn stack_frames(&self, offset: u32) -> impl Iterator<Item = u64> + '_ {
		(offset..self.header.frame_count)
			.map(|idx| self.read_u64(self.header.frame_offset as usize + idx as usize * 8))
			.take_while(|&frame| frame != 0)
	}

	/// Returns symbol record `idx`
	#[must_use]
	fn symbol_at(&self, idx: usize) -> SymbolRecord {
		let at = self.header.symbol_offset as usize + idx * SYMBOL_RECORD_SIZE;
		SymbolRecord {
			rip:          self.read_u64(at),
			name_offset:  self.read_u32(at + 8),
			file_offset:  self.read_u32(at + 12),
			line_number:  self.read_u32(at + 16),
			displacement: self.read_u32(at + 20),
			module_index: self.read_u32(at + 24),
		}
	}

	/// Finds the symbol record for `rip`.
	///
	/// The resolve pass emits one record per unique instruction address,
	/// sorted by rip, so this is an exact binary search.
	#[must_use]
	pub fn find_symbol(&self, rip: u64) -> Option<SymbolRecord> {
		let count = self.header.symbol_count as usize;
		if count == 0 {
			return None;
		}

		let (mut lo, mut hi) = (0usize, count);
		while lo < hi {
			let mid = (lo + hi) / 2;
			let record = self.symbol_at(mid);
			match record.rip.cmp(&rip) {
				std::cmp::Ordering::Equal => return Some(record),
				std::cmp::Ordering::Less => lo = mid + 1,
				std::cmp::Ordering::Greater => hi = mid,
			}
		}
		None
	}

	/// Reads a UTF-16 string from the symbol text section
	#[must_use]
	pub fn symbol_text(&self, offset: u32) -> String {
		let base = self.header.symbol_text_offset as usize + offset as usize * 2;
		let data = self.data.get();

		let mut units = Vec::new();
		let mut at = base;
		while at + 2 <= data.len() {
			let unit = u16::from_le_bytes([data[at], data[at + 1]]);
			if unit == 0 {
				break;
			}
			units.push(unit);
			at += 2;
		}
		String::from_utf16_lossy(&units)
	}

	/// Returns the display label for `rip`: the resolved symbol name, or
	/// the raw address in brackets
	#[must_use]
	pub fn label_for(&self, rip: u64) -> String {
		match self.find_symbol(rip) {
			Some(symbol) => self.symbol_text(symbol.name_offset),
			None => format!("[{rip:016x}]"),
		}
	}

	/// Builds the flat profile: counters aggregated per symbol (or per
	/// address when unresolved), ranked by badness
	#[must_use]
	pub fn flat_profile(&self) -> Vec<FlatRecord> {
		let mut by_label = BTreeMap::<String, FlatRecord>::new();

		for row in self.stats() {
			let symbol = self.find_symbol(row.rip);
			let label = match symbol {
				Some(symbol) => self.symbol_text(symbol.name_offset),
				None => format!("[{:016x}]", row.rip),
			};

			let record = by_label.entry(label.clone()).or_insert_with(|| FlatRecord {
				label,
				file_name: symbol.map(|symbol| self.symbol_text(symbol.file_offset)),
				counts: [0; ACCESS_RESULT_COUNT],
				badness: 0.0,
			});
			for (slot, count) in row.counts.iter().enumerate() {
				record.counts[slot] += count;
			}
		}

		by_label
			.into_values()
			.update(|record| record.badness = badness(&record.counts))
			.sorted_by(|lhs, rhs| rhs.badness.total_cmp(&lhs.badness))
			.collect()
	}

	/// Builds the top-down call tree from the frame pool.
	///
	/// Every record's counters are added to each node along its path, so a
	/// branch shows the cost of everything beneath it.
	#[must_use]
	pub fn tree_profile(&self) -> TreeNode {
		let mut root = NodeBuilder::default();

		for row in self.stats() {
			// Innermost first: the record's own rip, then its callers
			let mut path = Vec::with_capacity(16);
			path.push(row.rip);
			path.extend(self.stack_frames(row.stack_offset));

			// Top-down: outermost caller at the root
			let mut node = &mut root;
			for rip in path.into_iter().rev() {
				let label = self.label_for(rip);
				node = node.children.entry(label).or_default();
				for (slot, count) in row.counts.iter().enumerate() {
					node.counts[slot] += count;
				}
			}
		}

		root.into_node("<root>")
	}

	/// Builds the per-source-line table for `symbol`
	#[must_use]
	pub fn file_profile(&self, symbol: &str) -> Option<FileProfile> {
		let mut file_name = None;
		let mut lines = BTreeMap::<u32, [u32; ACCESS_RESULT_COUNT]>::new();

		for row in self.stats() {
			let Some(record) = self.find_symbol(row.rip) else {
				continue;
			};
			if self.symbol_text(record.name_offset) != symbol {
				continue;
			}

			file_name.get_or_insert_with(|| self.symbol_text(record.file_offset));
			let counts = lines.entry(record.line_number).or_default();
			for (slot, count) in row.counts.iter().enumerate() {
				counts[slot] += count;
			}
		}

		let file_name = file_name?;
		let (&first_line, _) = lines.first_key_value()?;
		let (&last_line, _) = lines.last_key_value()?;
		Some(FileProfile {
			file_name,
			first_line,
			last_line,
			lines: lines
				.into_iter()
				.map(|(line_number, counts)| LineRecord {
					line_number,
					badness: badness(&counts),
					counts,
				})
				.collect(),
		})
	}

	/// Reads a `u64` at byte offset `at`
	fn read_u64(&self, at: usize) -> u64 {
		let bytes = self.data.get();
		u64::from_le_bytes(bytes[at..at + 8].try_into().expect("Slice is 8 bytes"))
	}

	/// Reads a `u32` at byte offset `at`
	fn read_u32(&self, at: usize) -> u32 {
		let bytes = self.data.get();
		u32::from_le_bytes(bytes[at..at + 4].try_into().expect("Slice is 4 bytes"))
	}

	/// Reads a NUL-terminated string at byte offset `at`
	fn read_cstr(&self, at: usize) -> String {
		let bytes = self.data.get();
		let end = bytes[at..]
			.iter()
			.position(|&byte| byte == 0)
			.map_or(bytes.len(), |pos| at + pos);
		String::from_utf8_lossy(&bytes[at..end]).into_owned()
	}
}

impl std::fmt::Debug for Trace {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Trace")
			.field("header", &self.header)
			.field("len", &self.data.get().len())
			.finish()
	}
}

/// One row of the flat profile
#[derive(Clone, Debug)]
#[derive(serde::Serialize)]
pub struct FlatRecord {
	/// Symbol name, or `[address]` when unresolved
	pub label: String,

	/// Source file, when resolved
	pub file_name: Option<String>,

	/// Aggregated counters
	pub counts: [u32; ACCESS_RESULT_COUNT],

	/// Badness rank
	pub badness: f64,
}

/// One node of the call tree
#[derive(Clone, Debug)]
#[derive(serde::Serialize)]
pub struct TreeNode {
	/// Symbol name, or `[address]` when unresolved
	pub label: String,

	/// Counters of everything at or below this node
	pub counts: [u32; ACCESS_RESULT_COUNT],

	/// Badness rank
	pub badness: f64,

	/// Callees, worst first
	pub children: Vec<TreeNode>,
}

/// Tree node under construction, keyed by label
#[derive(Default)]
struct NodeBuilder {
	/// Accumulated counters
	counts: [u32; ACCESS_RESULT_COUNT],

	/// Children by label
	children: BTreeMap<String, NodeBuilder>,
}

impl NodeBuilder {
	/// Converts the builder into a finished node
	fn into_node(self, label: &str) -> TreeNode {
		TreeNode {
			label: label.to_owned(),
			badness: badness(&self.counts),
			counts: self.counts,
			children: self
				.children
				.into_iter()
				.map(|(label, child)| child.into_node(&label))
				.sorted_by(|lhs, rhs| rhs.badness.total_cmp(&lhs.badness))
				.collect(),
		}
	}
}

/// Per-line counters of one symbol
#[derive(Clone, Debug)]
#[derive(serde::Serialize)]
pub struct FileProfile {
	/// Source file name
	pub file_name: String,

	/// First line with samples
	pub first_line: u32,

	/// Last line with samples
	pub last_line: u32,

	/// Sampled lines, in line order
	pub lines: Vec<LineRecord>,
}

/// One line of a [`FileProfile`]
#[derive(Clone, Debug)]
#[derive(serde::Serialize)]
pub struct LineRecord {
	/// Line number
	pub line_number: u32,

	/// Aggregated counters
	pub counts: [u32; ACCESS_RESULT_COUNT],

	/// Badness rank
	pub badness: f64,
}

#[cfg(test)]
mod tests {
	// Imports
	use {
		super::*,
		crate::trace::{writer, ResolvedSymbol},
		std::io::Cursor,
	};

	/// Writes a two-record trace and loads it back
	fn sample_trace() -> Trace {
		let modules = vec![ModuleRecord {
			image_base:     0x40_0000,
			segment_offset: 0,
			size_bytes:     0x10_0000,
			name:           "game".to_owned(),
		}];
		// Stack pool: [0xf1, 0xf2, 0] and [0xf2, 0]
		let frames = vec![0xf1, 0xf2, 0, 0xf2, 0];
		let stats = vec![
			StatsRow {
				rip:          0x40_1000,
				stack_offset: 0,
				counts:       [10, 0, 2, 1, 0, 12, 0, 0],
			},
			StatsRow {
				rip:          0x40_2000,
				stack_offset: 3,
				counts:       [5, 0, 0, 0, 0, 5, 0, 0],
			},
		];

		let mut cursor = Cursor::new(Vec::new());
		writer::write_trace(&mut cursor, &modules, &frames, stats).expect("Unable to write trace");
		Trace::from_bytes(cursor.into_inner()).expect("Unable to load trace")
	}

	#[test]
	fn round_trip_preserves_sections() {
		let trace = sample_trace();

		let modules = trace.modules();
		assert_eq!(modules.len(), 1);
		assert_eq!(modules[0].name, "game");
		assert_eq!(modules[0].image_base, 0x40_0000);

		let rows = trace.stats().collect::<Vec<_>>();
		assert_eq!(rows.len(), 2);
		assert_eq!(rows[0].rip, 0x40_1000);
		assert_eq!(rows[0].counts[0], 10);
		assert_eq!(rows[1].stack_offset, 3);

		assert_eq!(trace.stack_frames(0).collect::<Vec<_>>(), vec![0xf1, 0xf2]);
		assert_eq!(trace.stack_frames(3).collect::<Vec<_>>(), vec![0xf2]);
	}

	#[test]
	fn module_lookup_maps_rips() {
		let trace = sample_trace();

		assert_eq!(trace.module_for(0x40_1000), Some((0, 0x1000)));
		assert_eq!(trace.module_for(0x10), None);
	}

	#[test]
	fn unresolved_labels_use_addresses() {
		let trace = sample_trace();
		assert!(!trace.is_resolved());
		assert_eq!(trace.label_for(0x40_1000), "[0000000000401000]");
	}

	#[test]
	fn resolve_then_project() {
		let trace = sample_trace();

		// Resolve both rips and the common caller frame
		let data = match trace.data {
			Bytes::Owned(data) => data,
			Bytes::Mapped(_) => unreachable!(),
		};
		let resolved = writer::resolve_symbols(&data, &[
			ResolvedSymbol {
				rip:          0x40_1000,
				symbol_name:  "update".to_owned(),
				file_name:    "game.cpp".to_owned(),
				line_number:  10,
				displacement: 0,
				module_index: 0,
			},
			ResolvedSymbol {
				rip:          0x40_2000,
				symbol_name:  "render".to_owned(),
				file_name:    "game.cpp".to_owned(),
				line_number:  90,
				displacement: 0,
				module_index: 0,
			},
			ResolvedSymbol {
				rip:          0xf2,
				symbol_name:  "main".to_owned(),
				file_name:    "main.cpp".to_owned(),
				line_number:  1,
				displacement: 0,
				module_index: 0,
			},
		])
		.expect("Unable to resolve symbols");
		let trace = Trace::from_bytes(resolved).expect("Unable to load resolved trace");

		assert!(trace.is_resolved());
		assert_eq!(trace.label_for(0x40_1000), "update");
		assert_eq!(trace.label_for(0x40_2000), "render");

		// Flat: `update` carries the L2 traffic, so it ranks first
		let flat = trace.flat_profile();
		assert_eq!(flat[0].label, "update");
		assert_eq!(flat[0].counts[0], 10);
		assert!(flat[0].badness > 0.0);
		assert_eq!(flat[0].file_name.as_deref(), Some("game.cpp"));

		// Tree: both records sit under `main`; `update` is reached through
		// its unresolved caller frame
		let tree = trace.tree_profile();
		let main = tree
			.children
			.iter()
			.find(|node| node.label == "main")
			.expect("Tree has a main node");
		assert_eq!(main.counts[0], 15);
		assert!(main.children.iter().any(|node| node.label == "render"));

		let caller = main
			.children
			.iter()
			.find(|node| node.label == "[00000000000000f1]")
			.expect("Tree has the unresolved caller");
		assert!(caller.children.iter().any(|node| node.label == "update"));

		// File: `update`'s line table
		let file = trace.file_profile("update").expect("Symbol has a file profile");
		assert_eq!(file.file_name, "game.cpp");
		assert_eq!(file.first_line, 10);
		assert_eq!(file.lines.len(), 1);
		assert_eq!(file.lines[0].counts[0], 10);
	}
}
