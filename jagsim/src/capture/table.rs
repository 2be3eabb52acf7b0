//! Capture hash table
//!
//! A small open-addressing table used by both the statistics aggregator
//! and the call-stack interner. Entries live in a flat, insertion-ordered
//! vector so iteration for serialization is deterministic; the slot array
//! only stores entry indices. All storage is pre-reserved and grows by
//! doubling, so the per-instruction path never reaches a general-purpose
//! allocator in the common case.

/// Key of a [`CaptureTable`]
pub trait TableKey: Copy + PartialEq {
	/// Hashes the key to a slot selector
	fn hash(&self) -> u32;
}

/// Slot marker for "no entry"
const EMPTY: u32 = u32::MAX;

/// Open-addressing table with insertion-ordered entries
#[derive(Clone, Debug)]
pub struct CaptureTable<K, V> {
	/// Slot array; each slot is an index into `entries` or `EMPTY`.
	/// Always a power of two in length.
	slots: Vec<u32>,

	/// Entries in insertion order
	entries: Vec<(K, V)>,
}

impl<K: TableKey, V> CaptureTable<K, V> {
	/// Creates a table with room for `capacity` entries before growing
	#[must_use]
	pub fn with_capacity(capacity: usize) -> Self {
		let slots = (capacity * 2).next_power_of_two().max(16);
		Self {
			slots:   vec![EMPTY; slots],
			entries: Vec::with_capacity(capacity),
		}
	}

	/// Returns the number of entries
	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Returns if the table is empty
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Finds the entry for `key`
	#[must_use]
	pub fn find(&self, key: &K) -> Option<&V> {
		self.find_index(key).map(|idx| &self.entries[idx].1)
	}

	/// Finds or inserts the entry for `key`, returning its index.
	///
	/// Inserting an existing key returns the existing index, so insertion
	/// is idempotent. Entries are never removed.
	pub fn insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> usize {
		if let Some(idx) = self.find_index(&key) {
			return idx;
		}

		// Keep the slot array at most half full
		if (self.entries.len() + 1) * 2 > self.slots.len() {
			self.grow();
		}

		let idx = self.entries.len();
		self.entries.push((key, make()));

		let slot = self.probe_empty(&key);
		self.slots[slot] = idx as u32;
		idx
	}

	/// Returns the value at entry index `idx`
	#[must_use]
	pub fn value_mut(&mut self, idx: usize) -> &mut V {
		&mut self.entries[idx].1
	}

	/// Iterates over all entries in insertion order
	pub fn iter(&self) -> impl Iterator<Item = &(K, V)> {
		self.entries.iter()
	}

	/// Removes all entries and releases the storage
	pub fn reset(&mut self) {
		self.slots = vec![EMPTY; 16];
		self.entries = Vec::new();
	}

	/// Finds the entry index for `key`
	fn find_index(&self, key: &K) -> Option<usize> {
		let mask = self.slots.len() - 1;
		let mut slot = key.hash() as usize & mask;

		loop {
			match self.slots[slot] {
				EMPTY => return None,
				idx => {
					let idx = idx as usize;
					if self.entries[idx].0 == *key {
						return Some(idx);
					}
				},
			}
			slot = (slot + 1) & mask;
		}
	}

	/// Finds the first empty slot for `key`
	fn probe_empty(&self, key: &K) -> usize {
		let mask = self.slots.len() - 1;
		let mut slot = key.hash() as usize & mask;
		while self.slots[slot] != EMPTY {
			slot = (slot + 1) & mask;
		}
		slot
	}

	/// Doubles the slot array and re-seats every entry
	fn grow(&mut self) {
		let new_len = self.slots.len() * 2;
		self.slots = vec![EMPTY; new_len];

		let mask = new_len - 1;
		for (idx, (key, _)) in self.entries.iter().enumerate() {
			let mut slot = key.hash() as usize & mask;
			while self.slots[slot] != EMPTY {
				slot = (slot + 1) & mask;
			}
			self.slots[slot] = idx as u32;
		}
	}
}

#[cfg(test)]
mod tests {
	// Imports
	use super::*;

	impl TableKey for u64 {
		fn hash(&self) -> u32 {
			// Deliberately poor hash to force probe collisions
			(*self % 7) as u32
		}
	}

	#[test]
	fn insert_is_idempotent() {
		let mut table = CaptureTable::<u64, u32>::with_capacity(4);

		let a = table.insert_with(10, || 1);
		let b = table.insert_with(10, || 2);
		assert_eq!(a, b);
		assert_eq!(table.find(&10), Some(&1));
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn colliding_keys_all_found() {
		let mut table = CaptureTable::<u64, u64>::with_capacity(4);

		// All of these collide modulo 7
		for key in [7, 14, 21, 28, 35] {
			table.insert_with(key, || key * 100);
		}

		for key in [7, 14, 21, 28, 35] {
			assert_eq!(table.find(&key), Some(&(key * 100)));
		}
		assert_eq!(table.find(&42), None);
	}

	#[test]
	fn growth_preserves_entries_and_order() {
		let mut table = CaptureTable::<u64, u64>::with_capacity(2);

		for key in 0..100 {
			table.insert_with(key, || key);
		}

		assert_eq!(table.len(), 100);
		for key in 0..100 {
			assert_eq!(table.find(&key), Some(&key));
		}

		// Iteration stays in insertion order across growth
		let keys = table.iter().map(|(key, _)| *key).collect::<Vec<_>>();
		assert_eq!(keys, (0..100).collect::<Vec<_>>());
	}
}
