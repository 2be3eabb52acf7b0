//! Capture session
//!
//! The process-global simulator session: one cache hierarchy, one
//! statistics table, one stack interner and the thread-to-core mapping
//! table, all guarded by a single spin lock. Traced threads carry a small
//! thread-local record (generation snapshot, core index, cached stack
//! offset) that they refresh lazily whenever the global generation has
//! moved past their copy.
//!
//! Everything the host platform must provide (suspending and resuming
//! threads, toggling single-stepping, unwinding a stack, enumerating
//! modules) sits behind the [`Host`] trait; the session never touches the
//! OS directly.

// Imports
use {
	crate::{
		cache::{AccessKind, AccessResult, CacheHierarchy},
		capture::{
			pipeline,
			stacks::{StackInterner, INVALID_STACK_OFFSET, MAX_FRAMES},
			stats::StatsTable,
		},
		insn::{Instruction, Registers},
		trace::{writer, ModuleRecord, StatsRow},
	},
	anyhow::Context,
	std::{
		cell::{Cell, UnsafeCell},
		ops::{Deref, DerefMut},
		path::PathBuf,
		sync::atomic::{AtomicBool, AtomicU32, Ordering},
		thread,
	},
};

/// Host collaborator.
///
/// Implemented by the tracing shell around the simulator. All methods may
/// be called with the session spin lock *not* held except where noted.
pub trait Host {
	/// Returns the calling thread's id, as used in core mappings
	fn current_thread_id(&self) -> u64;

	/// Returns if a debugger is attached to the process.
	///
	/// Single-stepping under a debugger traps into the debugger instead of
	/// the simulator, so captures refuse to start.
	fn is_debugger_attached(&self) -> bool {
		false
	}

	/// Suspends a thread
	fn suspend_thread(&self, thread_id: u64) -> Result<(), anyhow::Error>;

	/// Resumes a suspended thread
	fn resume_thread(&self, thread_id: u64) -> Result<(), anyhow::Error>;

	/// Enables or disables single-stepping on a thread
	fn set_single_step(&self, thread_id: u64, enabled: bool) -> Result<(), anyhow::Error>;

	/// Unwinds the calling thread's stack into `frames`, innermost first.
	///
	/// Returns the number of frames written. Called from the trap path;
	/// must not allocate or take locks.
	fn unwind_stack(&self, regs: &Registers, frames: &mut [u64]) -> usize;

	/// Enumerates the modules loaded in the traced process
	fn module_list(&self) -> Vec<ModuleRecord> {
		Vec::new()
	}

	/// Returns the path of the traced executable; the capture file is
	/// written next to it
	fn executable_path(&self) -> PathBuf;

	/// Yields the calling thread
	fn yield_now(&self) {
		thread::yield_now();
	}

	/// Sleeps the calling thread; `0` is a bare yield
	fn sleep_ms(&self, ms: u64) {
		match ms {
			0 => thread::yield_now(),
			ms => thread::sleep(std::time::Duration::from_millis(ms)),
		}
	}
}

/// Spin lock.
///
/// Spins up to ~1000 attempts, then yields and starts over. Traced threads
/// take this lock inside the trap path, so it must never park the thread
/// in a way that can be held across a syscall.
struct SpinLock<T> {
	/// Lock word
	locked: AtomicBool,

	/// Guarded value
	value: UnsafeCell<T>,
}

// SAFETY: Access to `value` is serialized by `locked`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
	/// Spins before yielding
	const SPIN_LIMIT: u32 = 1000;

	/// Creates an unlocked spin lock
	const fn new(value: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			value:  UnsafeCell::new(value),
		}
	}

	/// Acquires the lock
	fn lock(&self) -> SpinLockGuard<'_, T> {
		let mut count = 0u32;
		while self
			.locked
			.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			count += 1;
			if count == Self::SPIN_LIMIT {
				thread::yield_now();
				count = 0;
			}
			std::hint::spin_loop();
		}

		SpinLockGuard { lock: self }
	}
}

/// Guard of a held [`SpinLock`]
struct SpinLockGuard<'a, T> {
	/// The held lock
	lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		// SAFETY: The lock is held
		unsafe { &*self.lock.value.get() }
	}
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		// SAFETY: The lock is held exclusively
		unsafe { &mut *self.lock.value.get() }
	}
}

impl<T> Drop for SpinLockGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.locked.store(false, Ordering::Release);
	}
}

/// Capacity of the thread-to-core mapping table
const MAX_CORE_MAPPINGS: usize = 128;

/// One thread-to-core mapping
#[derive(Clone, Copy, Debug)]
struct CoreMapping {
	/// Host thread id
	thread_id: u64,

	/// Simulated core, `0..CORE_COUNT`
	core: i32,
}

/// The thread-to-core mapping table
struct CoreMappings {
	/// Mappings; only the first `len` are valid
	entries: [CoreMapping; MAX_CORE_MAPPINGS],

	/// Number of valid mappings
	len: usize,
}

impl CoreMappings {
	/// Creates an empty table
	const fn new() -> Self {
		Self {
			entries: [CoreMapping { thread_id: 0, core: -1 }; MAX_CORE_MAPPINGS],
			len:     0,
		}
	}

	/// Upserts a mapping; a core of `-1` removes it.
	///
	/// # Panics
	/// Panics when the table is full: running out of mapping slots is a
	/// fatal configuration error.
	fn set(&mut self, thread_id: u64, core: i32) {
		for idx in 0..self.len {
			if self.entries[idx].thread_id == thread_id {
				match core {
					-1 => {
						self.entries[idx] = self.entries[self.len - 1];
						self.len -= 1;
					},
					core => self.entries[idx].core = core,
				}
				return;
			}
		}

		if core == -1 {
			return;
		}

		assert!(self.len < MAX_CORE_MAPPINGS, "Core mapping table is full");
		self.entries[self.len] = CoreMapping { thread_id, core };
		self.len += 1;
	}

	/// Returns the core mapped to `thread_id`, or `-1`
	fn core_of(&self, thread_id: u64) -> i32 {
		self.entries[..self.len]
			.iter()
			.find(|mapping| mapping.thread_id == thread_id)
			.map_or(-1, |mapping| mapping.core)
	}

	/// Returns if no threads are mapped
	fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Returns all mapped thread ids
	fn thread_ids(&self) -> impl Iterator<Item = u64> + '_ {
		self.entries[..self.len].iter().map(|mapping| mapping.thread_id)
	}
}

/// The global simulator session
struct Session {
	/// Cache model
	cache: CacheHierarchy,

	/// Statistics aggregator
	stats: StatsTable,

	/// Call-stack interner
	stacks: StackInterner,

	/// Thread-to-core mappings; survive across captures
	mappings: CoreMappings,
}

impl Session {
	/// Creates a fresh session
	fn new() -> Self {
		Self {
			cache:    CacheHierarchy::new(),
			stats:    StatsTable::new(),
			stacks:   StackInterner::new(),
			mappings: CoreMappings::new(),
		}
	}

	/// Resets all capture state for a new capture
	fn reset(&mut self) {
		self.cache.reset();
		self.stats.reset();
		self.stacks.reset();
	}
}

/// Process-global session; `None` until [`init`]
static SESSION: SpinLock<Option<Session>> = SpinLock::new(None);

/// Capture generation; bumped by [`start_capture`] to force every thread
/// to refresh its thread-local state
static GENERATION: AtomicU32 = AtomicU32::new(1);

/// Recording gate, checked outside the lock for the fast path and again
/// inside it
static RECORDING: AtomicBool = AtomicBool::new(false);

/// Pause-instruction cadence counter
static PAUSE_TICKS: AtomicU32 = AtomicU32::new(0);

/// Per-thread capture state
#[derive(Clone, Copy, Debug)]
struct ThreadState {
	/// Generation this state was refreshed at
	generation: u32,

	/// Mapped core, or `-1`
	core: i32,

	/// Cached stack-pool offset of the current call stack
	stack_offset: u32,
}

impl ThreadState {
	/// State before any refresh
	const INITIAL: Self = Self {
		generation:   0,
		core:         -1,
		stack_offset: INVALID_STACK_OFFSET,
	};
}

thread_local! {
	/// This thread's capture state
	static THREAD_STATE: Cell<ThreadState> = const { Cell::new(ThreadState::INITIAL) };
}

/// Initializes the simulator session.
///
/// # Errors
/// Returns an error if already initialized; a second initialization would
/// discard live capture storage.
pub fn init() -> Result<(), anyhow::Error> {
	let mut session = SESSION.lock();
	anyhow::ensure!(session.is_none(), "Simulator session is already initialized");

	*session = Some(Session::new());
	Ok(())
}

/// Maps a host thread onto a simulated core, or unmaps it with a core of
/// `-1`. Threads without a mapping are not recorded.
///
/// # Errors
/// Returns an error if the session is not initialized or `core` is out of
/// range.
pub fn set_thread_core_mapping(thread_id: u64, core: i32) -> Result<(), anyhow::Error> {
	anyhow::ensure!(
		(-1..crate::cache::geometry::CORE_COUNT as i32).contains(&core),
		"Core must be -1 or 0..8, got {core}"
	);

	let mut session = SESSION.lock();
	let session = session.as_mut().context("Simulator session is not initialized")?;
	session.mappings.set(thread_id, core);
	Ok(())
}

/// Starts a capture.
///
/// Resets all cache, statistics and interner state, bumps the generation
/// and turns on single-stepping for every mapped thread, the caller last.
/// Returns `false` if a capture is already running, a debugger is
/// attached, the session is not initialized or no thread is mapped.
pub fn start_capture(host: &dyn Host) -> bool {
	if RECORDING.load(Ordering::Acquire) {
		tracing::warn!("Refusing to start a capture while one is running");
		return false;
	}
	if host.is_debugger_attached() {
		tracing::error!("Refusing to start a capture with a debugger attached");
		return false;
	}

	// Reset the capture state and snapshot the mapped threads
	let me = host.current_thread_id();
	let threads = {
		let mut session = SESSION.lock();
		let Some(session) = session.as_mut() else {
			tracing::error!("Cannot start a capture before initialization");
			return false;
		};
		if session.mappings.is_empty() {
			tracing::error!("Cannot start a capture with no thread mapped to a core");
			return false;
		}

		session.reset();
		session
			.mappings
			.thread_ids()
			.filter(|&thread_id| thread_id != me)
			.collect::<Vec<_>>()
	};

	// Suspend every mapped thread but the caller
	let mut suspended = Vec::with_capacity(threads.len());
	for &thread_id in &threads {
		match host.suspend_thread(thread_id) {
			Ok(()) => suspended.push(thread_id),
			Err(err) => {
				tracing::error!(thread_id, ?err, "Unable to suspend thread, aborting capture");
				for &thread_id in &suspended {
					let _ = host.resume_thread(thread_id);
				}
				return false;
			},
		}
	}

	// Make reasonably sure they've all stopped
	host.sleep_ms(1000);

	GENERATION.fetch_add(1, Ordering::Release);
	RECORDING.store(true, Ordering::Release);

	// Turn on stepping and let them go again
	for &thread_id in &suspended {
		if let Err(err) = host.set_single_step(thread_id, true) {
			tracing::warn!(thread_id, ?err, "Unable to enable single-stepping");
		}
		if let Err(err) = host.resume_thread(thread_id) {
			tracing::warn!(thread_id, ?err, "Unable to resume thread");
		}
	}

	// Finally step the calling thread
	if let Err(err) = host.set_single_step(me, true) {
		tracing::error!(?err, "Unable to single-step the calling thread");
	}

	tracing::info!(generation = GENERATION.load(Ordering::Relaxed), "Capture started");
	true
}

/// Ends the capture.
///
/// Stops stepping the caller and, if `save`, serializes the aggregated
/// statistics to a trace file next to the host executable. The capture
/// storage is released either way. The host trap handler stays installed:
/// a syscall paused in the kernel may still deliver one last trap later,
/// which the recording gate absorbs.
///
/// Returns the written path when saving succeeded.
///
/// # Errors
/// Returns an error if the session is not initialized. A serialization
/// failure is *not* an error: it is reported and the capture is dropped.
pub fn end_capture(host: &dyn Host, save: bool) -> Result<Option<PathBuf>, anyhow::Error> {
	RECORDING.store(false, Ordering::Release);
	if let Err(err) = host.set_single_step(host.current_thread_id(), false) {
		tracing::warn!(?err, "Unable to stop single-stepping the calling thread");
	}

	// Give in-flight traps a few chances to drain before touching storage
	host.yield_now();
	host.yield_now();
	host.yield_now();

	let mut session = SESSION.lock();
	let session = session.as_mut().context("Simulator session is not initialized")?;

	let mut path = None;
	if save {
		let modules = host.module_list();
		let file = writer::capture_file_path(&host.executable_path());
		let rows = session.stats.iter().map(|(key, stats)| StatsRow {
			rip:          key.rip,
			stack_offset: key.stack_offset,
			counts:       stats.counts,
		});

		match writer::write_trace_file(&file, &modules, session.stacks.frames(), rows) {
			Ok(()) => {
				tracing::info!(?file, records = session.stats.len(), "Capture saved");
				path = Some(file);
			},
			Err(err) => tracing::error!(?file, ?err, "Unable to save capture"),
		}
	}

	session.stats.reset();
	session.stacks.reset();
	Ok(path)
}

/// Records one executed instruction on the calling thread.
///
/// This is the per-trap entry point: it refreshes the thread-local state
/// if the generation moved, re-interns the call stack if a call or return
/// invalidated it, derives the instruction's memory traffic and commits it
/// to the cache model and statistics inside the critical section.
///
/// Undecodable instructions and unwind failures are absorbed silently;
/// they simply go untraced.
pub fn record_instruction(host: &dyn Host, insn: &Instruction, regs: &Registers) {
	if !RECORDING.load(Ordering::Acquire) {
		return;
	}

	// Refresh the thread state if the generation moved
	let generation = GENERATION.load(Ordering::Acquire);
	let mut state = THREAD_STATE.get();
	if state.generation != generation {
		let session = SESSION.lock();
		state.core = session
			.as_ref()
			.map_or(-1, |session| session.mappings.core_of(host.current_thread_id()));
		state.generation = generation;
		state.stack_offset = INVALID_STACK_OFFSET;
		THREAD_STATE.set(state);
	}

	// Only trace threads mapped to cores; ignore all others
	if state.core < 0 || insn.len == 0 {
		return;
	}
	let core = state.core as usize;

	// Recompute the call stack if a call or return invalidated it
	if state.stack_offset == INVALID_STACK_OFFSET {
		let mut frames = [0u64; MAX_FRAMES];
		let count = host.unwind_stack(regs, &mut frames);
		if count == 0 || count >= MAX_FRAMES {
			return;
		}

		// Drop the innermost frame; the instruction pointer keys the
		// statistics separately.
		let mut session = SESSION.lock();
		let Some(session) = session.as_mut() else {
			return;
		};
		state.stack_offset = match count {
			1 => session.stacks.intern(&frames[..1]),
			_ => session.stacks.intern(&frames[1..count]),
		};
		THREAD_STATE.set(state);
	}

	// The statistics key uses the stack as of instruction start; a call or
	// return only affects the next instruction.
	let stack_offset = state.stack_offset;

	let derived = pipeline::derive_accesses(insn, regs);
	if derived.invalidates_stack {
		state.stack_offset = INVALID_STACK_OFFSET;
		THREAD_STATE.set(state);
	}
	if derived.wants_pause {
		// An occasional real sleep keeps heavily-spinning programs from
		// starving the tracer.
		let ticks = PAUSE_TICKS.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
		host.sleep_ms(u64::from(ticks & 0x1fff == 0));
	}

	// Commit this instruction in the critical section
	let mut session = SESSION.lock();
	if !RECORDING.load(Ordering::Relaxed) {
		return;
	}
	let Some(session) = session.as_mut() else {
		return;
	};

	let node = session.stats.node(insn.rip, stack_offset);
	session.stats.bump(node, AccessResult::InstructionsExecuted);

	// Instruction fetch
	let result = session
		.cache
		.access(core, insn.rip, u64::from(insn.len), AccessKind::CodeRead);
	session.stats.bump(node, result);

	// Prefetches are modeled as immediate reads, recording only how
	// effective they would have been.
	if let Some(addr) = derived.prefetch {
		match session.cache.access(core, addr, 64, AccessKind::Read) {
			AccessResult::D1Hit => session.stats.bump(node, AccessResult::PrefetchHitD1),
			AccessResult::L2Hit => session.stats.bump(node, AccessResult::PrefetchHitL2),
			_ => (),
		}
	}

	// Data traffic
	for mem in derived.reads() {
		let result = session.cache.access(core, mem.addr, mem.size, AccessKind::Read);
		session.stats.bump(node, result);
	}
	for mem in derived.writes() {
		let result = session.cache.access(core, mem.addr, mem.size, AccessKind::Write);
		session.stats.bump(node, result);
	}
}
