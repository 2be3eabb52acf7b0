//! Cache hierarchy
//!
//! The access engine. Classifies one memory reference at a time against
//! the per-core L1 caches and the per-module shared L2, performing
//! replacement, line fills and the invalidation traffic between cores and
//! modules.

// Imports
use {
	super::{
		geometry::{
			l1_set, l1_tag, l2_line_addr, l2_set, l2_tag, line_of, module_of, sibling_of, CORE_COUNT, L1_SETS,
			L1_WAYS, L2_SETS, L2_WAYS, LINE_SIZE, MODULE_COUNT,
		},
		set::{CacheSet, LineState},
	},
	std::fmt,
};

/// Direction of a memory reference
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum AccessKind {
	/// Data read
	Read,

	/// Data write
	Write,

	/// Instruction fetch
	CodeRead,
}

/// Result of a classified access.
///
/// The first five variants are the mutually exclusive outcomes of a
/// classification. The remaining three are synthetic counters written only
/// by the accounting pipeline; they share the enum so a counter vector can
/// be indexed directly by any variant.
///
/// The variant order is the counter-slot order of the trace file, and also
/// orders outcomes from best to worst for [`AccessResult::worse`].
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum AccessResult {
	/// Hit in the core's L1 data cache
	D1Hit,

	/// Hit in the core's L1 instruction cache
	I1Hit,

	/// L1 miss served by an L2
	L2Hit,

	/// Data access missing both levels
	L2DMiss,

	/// Instruction fetch missing both levels
	L2IMiss,

	/// Synthetic: instructions executed
	InstructionsExecuted,

	/// Synthetic: prefetch hint that would have hit L1-D
	PrefetchHitD1,

	/// Synthetic: prefetch hint that would have hit L2
	PrefetchHitL2,
}

/// Number of counter slots indexed by [`AccessResult`]
pub const ACCESS_RESULT_COUNT: usize = 8;

impl AccessResult {
	/// All variants, in counter-slot order
	pub const ALL: [Self; ACCESS_RESULT_COUNT] = [
		Self::D1Hit,
		Self::I1Hit,
		Self::L2Hit,
		Self::L2DMiss,
		Self::L2IMiss,
		Self::InstructionsExecuted,
		Self::PrefetchHitD1,
		Self::PrefetchHitL2,
	];

	/// Returns this result's counter slot
	#[must_use]
	pub const fn index(self) -> usize {
		self as usize
	}

	/// Returns the worse of two outcomes.
	///
	/// Used when an access straddles a line boundary: the reported result
	/// is the worst per-line outcome, with misses dominating hits and L2
	/// misses dominating L2 hits.
	#[must_use]
	pub fn worse(self, other: Self) -> Self {
		Ord::max(self, other)
	}
}

/// Outcome of probing the other modules' L2s for a line
enum RemoteCopy {
	/// No other module holds the line
	None,

	/// The given module holds the line clean
	Clean(usize),

	/// The given module holds the line dirty
	Dirty(usize),
}

/// The full cache hierarchy of all eight cores
pub struct CacheHierarchy {
	/// Per-core L1 data caches, `L1_SETS` consecutive sets per core
	l1d: Vec<CacheSet<L1_WAYS>>,

	/// Per-core L1 instruction caches, `L1_SETS` consecutive sets per core
	l1i: Vec<CacheSet<L1_WAYS>>,

	/// Per-module L2 caches, `L2_SETS` consecutive sets per module
	l2: Vec<CacheSet<L2_WAYS>>,
}

impl CacheHierarchy {
	/// Creates a hierarchy with all lines invalid
	#[must_use]
	pub fn new() -> Self {
		Self {
			l1d: vec![CacheSet::new(); CORE_COUNT * L1_SETS],
			l1i: vec![CacheSet::new(); CORE_COUNT * L1_SETS],
			l2:  vec![CacheSet::new(); MODULE_COUNT * L2_SETS],
		}
	}

	/// Invalidates every line in every cache
	pub fn reset(&mut self) {
		for set in self.l1d.iter_mut().chain(self.l1i.iter_mut()) {
			set.reset();
		}
		for set in self.l2.iter_mut() {
			set.reset();
		}
	}

	/// Classifies one memory reference of `size` bytes at `addr` by `core`.
	///
	/// Accesses that straddle a line boundary are performed once per
	/// touched line and fold to the worst per-line outcome.
	///
	/// # Panics
	/// Panics if `core` is out of range.
	pub fn access(&mut self, core: usize, addr: u64, size: u64, kind: AccessKind) -> AccessResult {
		assert!(core < CORE_COUNT, "Core index out of range: {core}");
		debug_assert!(size > 0, "Zero-sized accesses must be rejected upstream");
		let size = size.max(1);

		let first = line_of(addr);
		let last = line_of(addr.saturating_add(size - 1));

		let mut result = self.access_line(core, first, kind);
		let mut line = first;
		while line < last {
			line += LINE_SIZE;
			result = result.worse(self.access_line(core, line, kind));
		}

		result
	}

	/// Classifies a single-line access
	fn access_line(&mut self, core: usize, line: u64, kind: AccessKind) -> AccessResult {
		if kind == AccessKind::CodeRead {
			return self.access_code_line(core, line);
		}

		let module = module_of(core);

		// L1-D lookup. A write hit on a non-dirty line promotes it.
		let set = self.l1d_set(core, line);
		if let Some(way) = set.find(l1_tag(line)) {
			let state = set.state(way);
			set.touch(way);
			if kind == AccessKind::Write && state != LineState::Modified {
				self.promote_write_hit(core, line);
			}
			return AccessResult::D1Hit;
		}

		// Local module L2 lookup
		if let Some(way) = self.l2_set_of(module, line).find(l2_tag(line)) {
			match kind {
				// The sibling core may still hold the line dirty; it hands
				// it over and keeps a shared copy.
				AccessKind::Read => self.downgrade_l1d_line(sibling_of(core), line),

				// A write leaves no other copy standing.
				AccessKind::Write => {
					self.invalidate_l1d_line(sibling_of(core), line);
					self.invalidate_other_modules(module, line);
				},

				AccessKind::CodeRead => unreachable!(),
			}

			let set = self.l2_set_of(module, line);
			set.set_state(way, LineState::Shared);
			set.touch(way);
			self.fill_l1(core, line, kind);
			return AccessResult::L2Hit;
		}

		// Local miss: probe the other modules.
		match kind {
			AccessKind::Read => match self.probe_remote(module, line) {
				// A clean remote copy serves the read; both L2s now share
				// the line.
				RemoteCopy::Clean(peer) => {
					let set = self.l2_set_of(peer, line);
					let way = set.find(l2_tag(line)).expect("Probe returned a module without the line");
					set.set_state(way, LineState::Shared);

					self.install_l2(module, line, LineState::Shared);
					self.fill_l1(core, line, kind);
					return AccessResult::L2Hit;
				},

				// A dirty remote copy is flushed and the access completes
				// as a miss.
				RemoteCopy::Dirty(peer) => self.invalidate_module_copies(peer, line),

				RemoteCopy::None => (),
			},

			// A write invalidates every remote copy unconditionally.
			AccessKind::Write => self.invalidate_other_modules(module, line),

			AccessKind::CodeRead => unreachable!(),
		}

		// Full miss: install in L2 and L1.
		let state = match kind {
			AccessKind::Write => LineState::Modified,
			_ => LineState::Exclusive,
		};
		self.install_l2(module, line, state);
		self.fill_l1(core, line, kind);
		AccessResult::L2DMiss
	}

	/// Classifies a single-line instruction fetch.
	///
	/// Code lines never appear in L1-D and generate no coherence traffic;
	/// self-modifying code is not modeled.
	fn access_code_line(&mut self, core: usize, line: u64) -> AccessResult {
		let module = module_of(core);

		let set = self.l1i_set(core, line);
		if let Some(way) = set.find(l1_tag(line)) {
			set.touch(way);
			return AccessResult::I1Hit;
		}

		if let Some(way) = self.l2_set_of(module, line).find(l2_tag(line)) {
			let set = self.l2_set_of(module, line);
			set.set_state(way, LineState::Shared);
			set.touch(way);
			self.fill_l1(core, line, AccessKind::CodeRead);
			return AccessResult::L2Hit;
		}

		// Code is never dirty in practice, but a stale data line at the
		// same address follows the data-read rules.
		match self.probe_remote(module, line) {
			RemoteCopy::Clean(peer) => {
				let set = self.l2_set_of(peer, line);
				let way = set.find(l2_tag(line)).expect("Probe returned a module without the line");
				set.set_state(way, LineState::Shared);

				self.install_l2(module, line, LineState::Shared);
				self.fill_l1(core, line, AccessKind::CodeRead);
				return AccessResult::L2Hit;
			},
			RemoteCopy::Dirty(peer) => self.invalidate_module_copies(peer, line),
			RemoteCopy::None => (),
		}

		self.install_l2(module, line, LineState::Exclusive);
		self.fill_l1(core, line, AccessKind::CodeRead);
		AccessResult::L2IMiss
	}

	/// Promotes a non-dirty L1-D hit to Modified on a write.
	///
	/// The sibling core's copy is invalidated; if the backing L2 entry was
	/// shared across modules, every other module's copy goes too.
	fn promote_write_hit(&mut self, core: usize, line: u64) {
		let module = module_of(core);

		let set = self.l1d_set(core, line);
		let way = set.find(l1_tag(line)).expect("Write promotion without an L1-D hit");
		set.set_state(way, LineState::Modified);

		self.invalidate_l1d_line(sibling_of(core), line);

		let set = self.l2_set_of(module, line);
		let was_shared = match set.find(l2_tag(line)) {
			Some(way) => {
				let state = set.state(way);
				set.set_state(way, LineState::Modified);
				state == LineState::Shared
			},
			None => false,
		};

		if was_shared {
			self.invalidate_other_modules(module, line);
		}
	}

	/// Probes every module except `module` for `line`.
	///
	/// A module counts as dirty when its L2 entry or any L1-D line above
	/// it is Modified.
	fn probe_remote(&mut self, module: usize, line: u64) -> RemoteCopy {
		for peer in (0..MODULE_COUNT).filter(|&peer| peer != module) {
			let set = self.l2_set_of(peer, line);
			let l2_state = set.find(l2_tag(line)).map(|way| set.state(way));

			let l1_dirty = [peer * 2, peer * 2 + 1].into_iter().any(|peer_core| {
				let set = self.l1d_set(peer_core, line);
				set.find(l1_tag(line))
					.is_some_and(|way| set.state(way) == LineState::Modified)
			});

			if l1_dirty || l2_state == Some(LineState::Modified) {
				return RemoteCopy::Dirty(peer);
			}
			if l2_state.is_some() {
				return RemoteCopy::Clean(peer);
			}
		}

		RemoteCopy::None
	}

	/// Invalidates `line` everywhere in every module except `module`
	fn invalidate_other_modules(&mut self, module: usize, line: u64) {
		for peer in (0..MODULE_COUNT).filter(|&peer| peer != module) {
			self.invalidate_module_copies(peer, line);
		}
	}

	/// Invalidates `line` in a module's L2 and in its cores' L1-Ds
	fn invalidate_module_copies(&mut self, module: usize, line: u64) {
		self.l2_set_of(module, line).invalidate(l2_tag(line));
		for core in [module * 2, module * 2 + 1] {
			self.invalidate_l1d_line(core, line);
		}
	}

	/// Invalidates `line` in `core`'s L1-D, if present
	fn invalidate_l1d_line(&mut self, core: usize, line: u64) {
		self.l1d_set(core, line).invalidate(l1_tag(line));
	}

	/// Downgrades `line` in `core`'s L1-D to Shared, if present
	fn downgrade_l1d_line(&mut self, core: usize, line: u64) {
		let set = self.l1d_set(core, line);
		if let Some(way) = set.find(l1_tag(line)) {
			set.set_state(way, LineState::Shared);
		}
	}

	/// Installs `line` into a module's L2, evicting the victim way.
	///
	/// A Modified victim first invalidates the matching L1-D entries of
	/// the module's cores.
	fn install_l2(&mut self, module: usize, line: u64, state: LineState) {
		let set_idx = l2_set(line);
		let victim = self.l2_set_of(module, line).victim_line();
		if let Some((tag, LineState::Modified)) = victim {
			let victim_line = l2_line_addr(tag, set_idx);
			for core in [module * 2, module * 2 + 1] {
				self.invalidate_l1d_line(core, victim_line);
			}
		}

		self.l2_set_of(module, line).fill(l2_tag(line), state);
	}

	/// Fills `line` into the requesting core's L1.
	///
	/// Reads and writes fill L1-D (Exclusive and Modified respectively),
	/// instruction fetches fill L1-I; a line never appears in both.
	fn fill_l1(&mut self, core: usize, line: u64, kind: AccessKind) {
		match kind {
			AccessKind::Read => {
				self.l1d_set(core, line).fill(l1_tag(line), LineState::Exclusive);
			},
			AccessKind::Write => {
				self.l1d_set(core, line).fill(l1_tag(line), LineState::Modified);
			},
			AccessKind::CodeRead => {
				self.l1i_set(core, line).fill(l1_tag(line), LineState::Exclusive);
			},
		}
	}

	/// Returns `core`'s L1-D set for `line`
	fn l1d_set(&mut self, core: usize, line: u64) -> &mut CacheSet<L1_WAYS> {
		&mut self.l1d[core * L1_SETS + l1_set(line)]
	}

	/// Returns `core`'s L1-I set for `line`
	fn l1i_set(&mut self, core: usize, line: u64) -> &mut CacheSet<L1_WAYS> {
		&mut self.l1i[core * L1_SETS + l1_set(line)]
	}

	/// Returns `module`'s L2 set for `line`
	fn l2_set_of(&mut self, module: usize, line: u64) -> &mut CacheSet<L2_WAYS> {
		&mut self.l2[module * L2_SETS + l2_set(line)]
	}
}

impl Default for CacheHierarchy {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for CacheHierarchy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CacheHierarchy")
			.field("l1_sets", &self.l1d.len())
			.field("l2_sets", &self.l2.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// Imports
	use super::*;

	#[test]
	fn straddle_reports_worst_outcome() {
		let mut cache = CacheHierarchy::new();

		// Warm the first line only
		assert_eq!(cache.access(0, 0x1000, 8, AccessKind::Read), AccessResult::L2DMiss);
		assert_eq!(cache.access(0, 0x1000, 8, AccessKind::Read), AccessResult::D1Hit);

		// 9 bytes at offset 60 touch the warm line and a cold one
		assert_eq!(cache.access(0, 0x1000 + 60, 9, AccessKind::Read), AccessResult::L2DMiss);

		// Both lines are now warm
		assert_eq!(cache.access(0, 0x1000 + 60, 9, AccessKind::Read), AccessResult::D1Hit);
	}

	#[test]
	fn wide_access_touches_every_line() {
		let mut cache = CacheHierarchy::new();

		// A 512-byte save touches 8 aligned lines
		assert_eq!(cache.access(0, 0x2000, 512, AccessKind::Write), AccessResult::L2DMiss);
		for line in 0..8 {
			assert_eq!(
				cache.access(0, 0x2000 + line * 64, 8, AccessKind::Read),
				AccessResult::D1Hit,
			);
		}
	}

	#[test]
	fn worse_prefers_misses() {
		assert_eq!(
			AccessResult::D1Hit.worse(AccessResult::L2Hit),
			AccessResult::L2Hit
		);
		assert_eq!(
			AccessResult::L2Hit.worse(AccessResult::L2DMiss),
			AccessResult::L2DMiss
		);
		assert_eq!(
			AccessResult::L2DMiss.worse(AccessResult::D1Hit),
			AccessResult::L2DMiss
		);
	}

	#[test]
	fn code_and_data_lines_stay_separate() {
		let mut cache = CacheHierarchy::new();

		assert_eq!(cache.access(0, 0x3000, 8, AccessKind::CodeRead), AccessResult::L2IMiss);

		// The line is in L1-I and L2, but not L1-D: a data read is served
		// by the L2.
		assert_eq!(cache.access(0, 0x3000, 8, AccessKind::Read), AccessResult::L2Hit);
		assert_eq!(cache.access(0, 0x3000, 8, AccessKind::CodeRead), AccessResult::I1Hit);
	}

	#[test]
	fn modified_l2_victim_back_invalidates_l1() {
		let mut cache = CacheHierarchy::new();
		let base = 0x40;

		// Dirty a line on core 0, then let the sibling core fill the
		// shared L2 set until the dirty line is the eviction victim. The
		// stride keeps the L2 set while changing the tag; the sibling's
		// fills land in its own L1-D, so core 0's copy can only disappear
		// through the back-invalidation.
		let stride = 64 * 2048;
		assert_eq!(cache.access(0, base, 8, AccessKind::Write), AccessResult::L2DMiss);
		for way in 1..=16 {
			assert_eq!(
				cache.access(1, base + way * stride, 8, AccessKind::Read),
				AccessResult::L2DMiss,
			);
		}

		// The dirty line was evicted from L2 and back-invalidated out of
		// core 0's L1-D, so re-accessing it is a full miss.
		assert_eq!(cache.access(0, base, 8, AccessKind::Read), AccessResult::L2DMiss);
	}
}
