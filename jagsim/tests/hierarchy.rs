//! Cache hierarchy scenarios
//!
//! End-to-end access sequences against a cold hierarchy, covering the
//! classification rules and the invalidation traffic between cores and
//! modules.

// Imports
use jagsim::{AccessKind, AccessResult, CacheHierarchy};

#[test]
fn basic_hit() {
	let mut cache = CacheHierarchy::new();

	assert_eq!(
		cache.access(0, 0x12345678abcd, 8, AccessKind::Read),
		AccessResult::L2DMiss
	);
	assert_eq!(cache.access(0, 0x12345678abcd, 8, AccessKind::Read), AccessResult::D1Hit);
}

#[test]
fn basic_code_hit() {
	let mut cache = CacheHierarchy::new();

	assert_eq!(
		cache.access(0, 0x12345678abcd, 8, AccessKind::CodeRead),
		AccessResult::L2IMiss
	);
	assert_eq!(
		cache.access(0, 0x12345678abcd, 8, AccessKind::CodeRead),
		AccessResult::I1Hit
	);
}

#[test]
fn basic_assoc() {
	let mut cache = CacheHierarchy::new();

	let la = 0x40;
	let lb = la + 512 * 0x40;

	assert_eq!(cache.access(0, la, 8, AccessKind::Read), AccessResult::L2DMiss);
	assert_eq!(cache.access(0, la, 8, AccessKind::Read), AccessResult::D1Hit);
	assert_eq!(cache.access(0, lb, 8, AccessKind::Read), AccessResult::L2DMiss);
	assert_eq!(cache.access(0, la, 8, AccessKind::Read), AccessResult::D1Hit);
	assert_eq!(cache.access(0, lb, 8, AccessKind::Read), AccessResult::D1Hit);
}

#[test]
fn core_invalidating() {
	let mut cache = CacheHierarchy::new();
	let la = 0x40;

	// Cores 0/1 share module 0's L2; cores 2/3 get the line from module
	// 0's L2 into their own.
	assert_eq!(cache.access(0, la, 8, AccessKind::Read), AccessResult::L2DMiss);
	assert_eq!(cache.access(1, la, 8, AccessKind::Read), AccessResult::L2Hit);
	assert_eq!(cache.access(2, la, 8, AccessKind::Read), AccessResult::L2Hit);
	assert_eq!(cache.access(3, la, 8, AccessKind::Read), AccessResult::L2Hit);

	assert_eq!(cache.access(0, la, 8, AccessKind::Read), AccessResult::D1Hit);
	assert_eq!(cache.access(1, la, 8, AccessKind::Read), AccessResult::D1Hit);
	assert_eq!(cache.access(2, la, 8, AccessKind::Read), AccessResult::D1Hit);
	assert_eq!(cache.access(3, la, 8, AccessKind::Read), AccessResult::D1Hit);

	// A write on core 0 invalidates every other copy, so the other cores
	// fall back to their module's L2.
	assert_eq!(cache.access(0, la, 8, AccessKind::Write), AccessResult::D1Hit);
	assert_eq!(cache.access(1, la, 8, AccessKind::Read), AccessResult::L2Hit);
	assert_eq!(cache.access(2, la, 8, AccessKind::Read), AccessResult::L2Hit);
	assert_eq!(cache.access(3, la, 8, AccessKind::Read), AccessResult::L2Hit);
}

#[test]
fn core_invalidating_module() {
	let mut cache = CacheHierarchy::new();
	let la = 0x40;

	assert_eq!(cache.access(0, la, 8, AccessKind::Read), AccessResult::L2DMiss);
	assert_eq!(cache.access(0, la, 8, AccessKind::Read), AccessResult::D1Hit);

	// A write on core 5 (module 2) invalidates module 0's L2 line
	assert_eq!(cache.access(5, la, 8, AccessKind::Write), AccessResult::L2DMiss);
	assert_eq!(cache.access(5, la, 8, AccessKind::Read), AccessResult::D1Hit);
	assert_eq!(cache.access(0, la, 8, AccessKind::Read), AccessResult::L2DMiss);
	assert_eq!(cache.access(0, la, 8, AccessKind::Read), AccessResult::D1Hit);
}

#[test]
fn full_assoc() {
	let mut cache = CacheHierarchy::new();

	let base = 0x40;
	// Same L1 set every time
	let multiplier = 0x40 * 512;

	assert_eq!(cache.access(0, base, 8, AccessKind::Read), AccessResult::L2DMiss);

	for idx in 1..=8 {
		assert_eq!(
			cache.access(0, base + idx * multiplier, 8, AccessKind::Read),
			AccessResult::L2DMiss
		);
	}

	for idx in 1..=8 {
		assert_eq!(
			cache.access(0, base + idx * multiplier, 8, AccessKind::Read),
			AccessResult::D1Hit
		);
	}

	// The ninth fill evicted `base` from L1-D, but the L2 still holds it
	assert_eq!(cache.access(0, base, 8, AccessKind::Read), AccessResult::L2Hit);
}

#[test]
fn same_module_write_downgrades_sibling() {
	let mut cache = CacheHierarchy::new();
	let la = 0x40;

	assert_eq!(cache.access(0, la, 8, AccessKind::Read), AccessResult::L2DMiss);
	assert_eq!(cache.access(1, la, 8, AccessKind::Read), AccessResult::L2Hit);
	assert_eq!(cache.access(0, la, 8, AccessKind::Write), AccessResult::D1Hit);

	// The sibling lost its copy on the write, but the module's L2 serves
	// it straight back.
	assert_eq!(cache.access(1, la, 8, AccessKind::Read), AccessResult::L2Hit);
	assert_eq!(cache.access(1, la, 8, AccessKind::Read), AccessResult::D1Hit);
}

#[test]
fn straddling_access_reports_worst_outcome() {
	let mut cache = CacheHierarchy::new();

	// Warm only the first of the two lines a 9-byte access at offset 60
	// touches
	assert_eq!(cache.access(0, 0x7000, 8, AccessKind::Read), AccessResult::L2DMiss);
	assert_eq!(cache.access(0, 0x7000 + 60, 9, AccessKind::Read), AccessResult::L2DMiss);

	// Both lines warm now
	assert_eq!(cache.access(0, 0x7000 + 60, 9, AccessKind::Read), AccessResult::D1Hit);
}

#[test]
fn reset_cools_every_line() {
	let mut cache = CacheHierarchy::new();

	assert_eq!(cache.access(3, 0x40, 8, AccessKind::Read), AccessResult::L2DMiss);
	assert_eq!(cache.access(3, 0x40, 8, AccessKind::Read), AccessResult::D1Hit);

	cache.reset();
	assert_eq!(cache.access(3, 0x40, 8, AccessKind::Read), AccessResult::L2DMiss);
}
