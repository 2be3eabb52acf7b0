//! Call-stack interning
//!
//! Stacks are content-addressed: the MD5 of the raw frame bytes maps to an
//! offset into a shared frame pool, so equal stacks always yield equal
//! offsets and the statistics key stays a compact integer. Interned runs
//! are terminated by a zero frame in the pool.

// Imports
use {
	super::table::{CaptureTable, TableKey},
	md5::{Digest, Md5},
};

/// Maximum frames in a single unwound stack
pub const MAX_FRAMES: usize = 128;

/// Marker for "no interned stack"
pub const INVALID_STACK_OFFSET: u32 = u32::MAX;

/// 128-bit content key of a frame sequence
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct StackKey([u8; 16]);

impl StackKey {
	/// Computes the key of a frame sequence
	#[must_use]
	pub fn new(frames: &[u64]) -> Self {
		let mut hasher = Md5::new();
		for frame in frames {
			hasher.update(frame.to_le_bytes());
		}
		Self(hasher.finalize().into())
	}
}

impl TableKey for StackKey {
	fn hash(&self) -> u32 {
		u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
	}
}

/// Location of an interned stack in the frame pool
#[derive(Clone, Copy, Debug)]
struct StackValue {
	/// Offset of the first frame
	offset: u32,

	/// Number of frames, excluding the zero terminator
	len: u32,
}

/// Interns frame sequences into a shared pool
#[derive(Clone, Debug)]
pub struct StackInterner {
	/// Content key to pool location
	keys: CaptureTable<StackKey, StackValue>,

	/// Frame pool; each interned run is followed by a zero frame
	pool: Vec<u64>,
}

impl StackInterner {
	/// Initial frame pool reserve
	const INITIAL_POOL_RESERVE: usize = 65536;

	/// Creates an empty interner
	#[must_use]
	pub fn new() -> Self {
		Self {
			keys: CaptureTable::with_capacity(1024),
			pool: Vec::with_capacity(Self::INITIAL_POOL_RESERVE),
		}
	}

	/// Interns a frame sequence and returns its pool offset.
	///
	/// Interning the same contents again returns the same offset; offsets
	/// stay valid until [`reset`](Self::reset).
	///
	/// # Panics
	/// Panics if `frames` is empty or longer than [`MAX_FRAMES`].
	pub fn intern(&mut self, frames: &[u64]) -> u32 {
		assert!(
			!frames.is_empty() && frames.len() <= MAX_FRAMES,
			"Stack must have 1..={MAX_FRAMES} frames, got {}",
			frames.len()
		);

		let key = StackKey::new(frames);
		if let Some(value) = self.keys.find(&key) {
			return value.offset;
		}

		let offset = self.pool.len() as u32;

		// Grow by doubling rather than whatever the push would do
		if self.pool.len() + frames.len() + 1 > self.pool.capacity() {
			self.pool.reserve(self.pool.capacity());
		}
		self.pool.extend_from_slice(frames);
		self.pool.push(0);

		self.keys.insert_with(key, || StackValue {
			offset,
			len: frames.len() as u32,
		});

		offset
	}

	/// Returns the number of distinct stacks interned
	#[must_use]
	pub fn len(&self) -> usize {
		self.keys.len()
	}

	/// Returns if no stacks are interned
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	/// Returns the whole frame pool, terminators included
	#[must_use]
	pub fn frames(&self) -> &[u64] {
		&self.pool
	}

	/// Removes all stacks and releases the pool storage
	pub fn reset(&mut self) {
		self.keys.reset();
		self.pool = Vec::with_capacity(Self::INITIAL_POOL_RESERVE);
	}
}

impl Default for StackInterner {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	// Imports
	use super::*;

	#[test]
	fn interning_is_idempotent() {
		let mut interner = StackInterner::new();

		let a = interner.intern(&[0x1, 0x2, 0x3]);
		assert_eq!(interner.intern(&[0x1, 0x2, 0x3]), a);

		let b = interner.intern(&[0x1, 0x2]);
		assert_ne!(a, b);
		assert_eq!(interner.len(), 2);
	}

	#[test]
	fn pool_runs_are_zero_terminated() {
		let mut interner = StackInterner::new();

		let a = interner.intern(&[0xaa, 0xbb]);
		let b = interner.intern(&[0xcc]);

		assert_eq!(a, 0);
		assert_eq!(b, 3);
		assert_eq!(interner.frames(), &[0xaa, 0xbb, 0, 0xcc, 0]);
	}

	#[test]
	fn prefix_stacks_get_distinct_offsets() {
		let mut interner = StackInterner::new();

		// A prefix of an interned stack is a different stack
		let a = interner.intern(&[0x10, 0x20, 0x30]);
		let b = interner.intern(&[0x10, 0x20]);
		let c = interner.intern(&[0x10]);
		assert!(a != b && b != c && a != c);
	}

	#[test]
	fn reset_clears_offsets() {
		let mut interner = StackInterner::new();

		interner.intern(&[0x1]);
		interner.reset();
		assert!(interner.is_empty());
		assert!(interner.frames().is_empty());
		assert_eq!(interner.intern(&[0x9]), 0);
	}

	#[test]
	#[should_panic(expected = "frames")]
	fn empty_stack_is_rejected() {
		let mut interner = StackInterner::new();
		interner.intern(&[]);
	}
}
