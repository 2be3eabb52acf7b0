//! Cache sets
//!
//! A set is a fixed array of ways, each way holding a tag, a coherence
//! state and a single "recently used" bit. Replacement is pseudo-LRU over
//! the recently-used bits.

/// Coherence state of a cache line
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum LineState {
	/// Not present
	Invalid,

	/// Present, other caches may hold copies
	Shared,

	/// Present, no other cache holds a copy
	Exclusive,

	/// Present and dirty
	Modified,
}

impl LineState {
	/// Returns if this state holds a line
	#[must_use]
	pub const fn is_valid(self) -> bool {
		!matches!(self, Self::Invalid)
	}
}

/// One way of a cache set
#[derive(Clone, Copy, Debug)]
struct Way {
	/// Line tag
	tag: u64,

	/// Coherence state
	state: LineState,

	/// Recently-used bit
	recent: bool,
}

impl Way {
	/// An empty way
	const INVALID: Self = Self {
		tag:    0,
		state:  LineState::Invalid,
		recent: false,
	};
}

/// A fixed-associativity cache set
#[derive(Clone, Copy, Debug)]
pub struct CacheSet<const WAYS: usize> {
	/// All ways
	ways: [Way; WAYS],
}

impl<const WAYS: usize> CacheSet<WAYS> {
	/// Creates an empty set
	#[must_use]
	pub const fn new() -> Self {
		Self {
			ways: [Way::INVALID; WAYS],
		}
	}

	/// Invalidates all ways
	pub fn reset(&mut self) {
		self.ways = [Way::INVALID; WAYS];
	}

	/// Returns the way holding `tag`, if any
	#[must_use]
	pub fn find(&self, tag: u64) -> Option<usize> {
		self.ways
			.iter()
			.position(|way| way.state.is_valid() && way.tag == tag)
	}

	/// Returns the state of way `way`
	#[must_use]
	pub fn state(&self, way: usize) -> LineState {
		self.ways[way].state
	}

	/// Sets the state of way `way`
	pub fn set_state(&mut self, way: usize, state: LineState) {
		self.ways[way].state = state;
	}

	/// Invalidates the way holding `tag`, if any.
	///
	/// Returns the state the line was in.
	pub fn invalidate(&mut self, tag: u64) -> Option<LineState> {
		let way = self.find(tag)?;
		let state = self.ways[way].state;
		self.ways[way].state = LineState::Invalid;
		Some(state)
	}

	/// Marks way `way` as recently used.
	///
	/// If marking it would make every way recent, all other bits are first
	/// cleared.
	pub fn touch(&mut self, way: usize) {
		self.ways[way].recent = true;
		if self.ways.iter().all(|way| way.recent) {
			for (idx, other) in self.ways.iter_mut().enumerate() {
				other.recent = idx == way;
			}
		}
	}

	/// Returns the way a fill should claim.
	///
	/// Invalid ways are claimed first; otherwise the victim is the
	/// lowest-index way whose recently-used bit is clear.
	#[must_use]
	pub fn victim(&self) -> usize {
		if let Some(way) = self.ways.iter().position(|way| !way.state.is_valid()) {
			return way;
		}

		self.ways
			.iter()
			.position(|way| !way.recent)
			.expect("Touching a way always leaves at least one way non-recent")
	}

	/// Returns the tag and state of the current victim way, when valid.
	///
	/// Used to write back or invalidate the line about to be replaced.
	#[must_use]
	pub fn victim_line(&self) -> Option<(u64, LineState)> {
		let way = self.victim();
		let way = &self.ways[way];
		way.state.is_valid().then_some((way.tag, way.state))
	}

	/// Fills the victim way with `tag` in `state` and marks it recent.
	///
	/// Returns the way filled. The evicted line, if any, is simply
	/// replaced; evictions emit no events.
	pub fn fill(&mut self, tag: u64, state: LineState) -> usize {
		let way = self.victim();
		self.ways[way] = Way {
			tag,
			state,
			recent: false,
		};
		self.touch(way);
		way
	}
}

impl<const WAYS: usize> Default for CacheSet<WAYS> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	// Imports
	use super::*;

	#[test]
	fn fill_then_find() {
		let mut set = CacheSet::<4>::new();
		assert_eq!(set.find(0x10), None);

		let way = set.fill(0x10, LineState::Exclusive);
		assert_eq!(set.find(0x10), Some(way));
		assert_eq!(set.state(way), LineState::Exclusive);
	}

	#[test]
	fn invalid_ways_claimed_first() {
		let mut set = CacheSet::<4>::new();
		for tag in 0..4 {
			set.fill(tag, LineState::Exclusive);
		}
		assert_eq!(set.find(0), Some(0));
		assert_eq!(set.find(3), Some(3));
	}

	#[test]
	fn plru_victim_is_lowest_clear() {
		let mut set = CacheSet::<4>::new();
		for tag in 0..4 {
			set.fill(tag, LineState::Exclusive);
		}

		// Filling way 3 made every way recent, so all but way 3 were
		// cleared and way 0 is the next victim.
		assert_eq!(set.victim(), 0);

		set.fill(4, LineState::Exclusive);
		assert_eq!(set.find(0), None);
		assert_eq!(set.find(4), Some(0));

		// Ways 0 and 3 are now recent, so way 1 goes next.
		assert_eq!(set.victim(), 1);
	}

	#[test]
	fn touch_keeps_one_way_non_recent() {
		let mut set = CacheSet::<2>::new();
		set.fill(0, LineState::Exclusive);
		set.fill(1, LineState::Exclusive);
		set.touch(0);
		set.touch(1);
		// Some way must remain evictable
		let _ = set.victim();
	}

	#[test]
	fn invalidate_returns_prior_state() {
		let mut set = CacheSet::<4>::new();
		set.fill(7, LineState::Modified);
		assert_eq!(set.invalidate(7), Some(LineState::Modified));
		assert_eq!(set.invalidate(7), None);
		assert_eq!(set.find(7), None);
	}
}
