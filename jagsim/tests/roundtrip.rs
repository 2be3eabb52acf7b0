//! Serialization round-trip
//!
//! Serializes an aggregator, interner and modules list and checks a
//! parallel reader reproduces the exact key-to-counters mapping and module
//! list.

// Imports
use {
	jagsim::{
		cache::AccessResult,
		capture::{RipKey, StackInterner, StatsTable},
		trace::{self, ModuleRecord, StatsRow, Trace},
	},
	std::io::Cursor,
};

#[test]
fn aggregate_reader_round_trip() {
	let mut stacks = StackInterner::new();
	let mut stats = StatsTable::new();

	// Three stacks, some shared between instruction pointers
	let stack_a = stacks.intern(&[0x10, 0x20, 0x30]);
	let stack_b = stacks.intern(&[0x10, 0x20]);
	let stack_c = stacks.intern(&[0x99]);
	assert_eq!(stacks.intern(&[0x10, 0x20, 0x30]), stack_a);

	let mut bump = |rip: u64, stack: u32, result: AccessResult, times: u32| {
		let node = stats.node(rip, stack);
		for _ in 0..times {
			stats.bump(node, result);
		}
	};
	bump(0x40_1000, stack_a, AccessResult::InstructionsExecuted, 100);
	bump(0x40_1000, stack_a, AccessResult::D1Hit, 70);
	bump(0x40_1000, stack_a, AccessResult::L2DMiss, 30);
	bump(0x40_1000, stack_b, AccessResult::InstructionsExecuted, 5);
	bump(0x40_2000, stack_b, AccessResult::I1Hit, 17);
	bump(0x40_3000, stack_c, AccessResult::PrefetchHitL2, 3);

	let modules = vec![
		ModuleRecord {
			image_base:     0x40_0000,
			segment_offset: 0x1000,
			size_bytes:     0x10_0000,
			name:           "game".to_owned(),
		},
		ModuleRecord {
			image_base:     0x7fff_0000_0000,
			segment_offset: 0,
			size_bytes:     0x2_0000,
			name:           "libc.so.6".to_owned(),
		},
	];

	// Serialize
	let rows = stats
		.iter()
		.map(|(key, record)| StatsRow {
			rip:          key.rip,
			stack_offset: key.stack_offset,
			counts:       record.counts,
		})
		.collect::<Vec<_>>();
	let mut cursor = Cursor::new(Vec::new());
	trace::write_trace(&mut cursor, &modules, stacks.frames(), rows.iter().copied()).expect("Unable to write trace");

	// Reload and compare
	let trace = Trace::from_bytes(cursor.into_inner()).expect("Unable to load trace");
	assert_eq!(trace.modules(), modules);

	let read_rows = trace.stats().collect::<Vec<_>>();
	assert_eq!(read_rows.len(), stats.len());
	for row in &read_rows {
		let record = stats
			.get(&RipKey {
				rip:          row.rip,
				stack_offset: row.stack_offset,
			})
			.expect("Reader produced an unknown key");
		assert_eq!(row.counts, record.counts);
	}

	// Interned stacks come back frame for frame
	assert_eq!(trace.stack_frames(stack_a).collect::<Vec<_>>(), vec![0x10, 0x20, 0x30]);
	assert_eq!(trace.stack_frames(stack_b).collect::<Vec<_>>(), vec![0x10, 0x20]);
	assert_eq!(trace.stack_frames(stack_c).collect::<Vec<_>>(), vec![0x99]);
}
