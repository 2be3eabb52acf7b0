//! Instruction accounting pipeline
//!
//! Derives the memory traffic of one decoded instruction: implicit
//! operands by mnemonic family, explicit memory operands by effective
//! address, plus the handful of instructions with fixed-size or suppressed
//! accesses. The result is committed to the cache model and statistics by
//! the session, inside its critical section.

// Imports
use crate::insn::{Instruction, MemAccess, Mnemonic, Registers};

/// Most data references a single instruction can generate
pub const MAX_DATA_REFS: usize = 4;

/// One derived data reference
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct MemRef {
	/// Effective address
	pub addr: u64,

	/// Size in bytes
	pub size: u64,
}

impl MemRef {
	/// An empty slot
	const ZERO: Self = Self { addr: 0, size: 0 };
}

/// Memory traffic derived from one instruction
#[derive(Clone, Copy, Debug)]
pub struct DerivedAccesses {
	/// Data reads
	reads: [MemRef; MAX_DATA_REFS],

	/// Number of valid entries in `reads`
	read_count: usize,

	/// Data writes
	writes: [MemRef; MAX_DATA_REFS],

	/// Number of valid entries in `writes`
	write_count: usize,

	/// Prefetch hint target, as a full-line read
	pub prefetch: Option<u64>,

	/// The instruction changes the frame sequence (call/ret)
	pub invalidates_stack: bool,

	/// The instruction is a pause and wants an occasional host yield
	pub wants_pause: bool,
}

impl DerivedAccesses {
	/// No traffic
	fn new() -> Self {
		Self {
			reads:             [MemRef::ZERO; MAX_DATA_REFS],
			read_count:        0,
			writes:            [MemRef::ZERO; MAX_DATA_REFS],
			write_count:       0,
			prefetch:          None,
			invalidates_stack: false,
			wants_pause:       false,
		}
	}

	/// Returns the derived reads
	#[must_use]
	pub fn reads(&self) -> &[MemRef] {
		&self.reads[..self.read_count]
	}

	/// Returns the derived writes
	#[must_use]
	pub fn writes(&self) -> &[MemRef] {
		&self.writes[..self.write_count]
	}

	/// Queues a read.
	///
	/// Zero-sized, null and kernel-half addresses are transient decode or
	/// snapshot artifacts; they are rejected here so the cache engine
	/// never sees them.
	fn read(&mut self, addr: u64, size: u64) {
		if size == 0 || addr == 0 || (addr as i64) < 0 || self.read_count == MAX_DATA_REFS {
			return;
		}
		self.reads[self.read_count] = MemRef { addr, size };
		self.read_count += 1;
	}

	/// Queues a write, with the same rejections as [`read`](Self::read)
	fn write(&mut self, addr: u64, size: u64) {
		if size == 0 || addr == 0 || (addr as i64) < 0 || self.write_count == MAX_DATA_REFS {
			return;
		}
		self.writes[self.write_count] = MemRef { addr, size };
		self.write_count += 1;
	}
}

/// Derives the data traffic of `insn` against the register snapshot.
///
/// The instruction fetch itself is not included; the session issues it
/// separately from `(rip, len)`.
#[must_use]
pub fn derive_accesses(insn: &Instruction, regs: &Registers) -> DerivedAccesses {
	let mut out = DerivedAccesses::new();

	// Implicit operands, by mnemonic family
	match insn.mnemonic {
		// String instructions
		Mnemonic::Lodsb | Mnemonic::Scasb => out.read(regs.rsi, 1),
		Mnemonic::Lodsw | Mnemonic::Scasw => out.read(regs.rsi, 2),
		Mnemonic::Lodsd | Mnemonic::Scasd => out.read(regs.rsi, 4),
		Mnemonic::Lodsq | Mnemonic::Scasq => out.read(regs.rsi, 8),
		Mnemonic::Stosb => out.write(regs.rdi, 1),
		Mnemonic::Stosw => out.write(regs.rdi, 2),
		Mnemonic::Stosd => out.write(regs.rdi, 4),
		Mnemonic::Stosq => out.write(regs.rdi, 8),
		Mnemonic::Movsb => {
			out.read(regs.rsi, 1);
			out.write(regs.rdi, 1);
		},
		Mnemonic::Movsw => {
			out.read(regs.rsi, 2);
			out.write(regs.rdi, 2);
		},
		Mnemonic::Movsd => {
			out.read(regs.rsi, 4);
			out.write(regs.rdi, 4);
		},
		Mnemonic::Movsq => {
			out.read(regs.rsi, 8);
			out.write(regs.rdi, 8);
		},

		// Stack operations
		Mnemonic::Push | Mnemonic::Pop => out.write(regs.rsp, insn.operands[0].size_bytes()),
		Mnemonic::Call => {
			out.write(regs.rsp, 8);
			out.invalidates_stack = true;
		},
		Mnemonic::Ret => {
			out.read(regs.rsp, 8);
			out.invalidates_stack = true;
		},

		_ => (),
	}

	// Special memory operands
	match insn.mnemonic {
		Mnemonic::Pause => out.wants_pause = true,

		// LEA doesn't actually access memory even though it has memory
		// operands. There also seem to be NOPs that do crazy things with
		// memory operands.
		Mnemonic::Lea | Mnemonic::Nop => (),

		Mnemonic::Prefetch
		| Mnemonic::Prefetchnta
		| Mnemonic::Prefetcht0
		| Mnemonic::Prefetcht1
		| Mnemonic::Prefetcht2 => {
			if let Some(mem) = insn.mem_operand(0) {
				let addr = mem.effective_address(insn.segment, regs);
				if addr != 0 {
					out.prefetch = Some(addr);
				}
			}
		},

		// Non-temporal stores and FP context saves access a fixed size
		// regardless of what the operand claims.
		Mnemonic::Movntq => {
			if let Some(mem) = insn.mem_operand(0) {
				out.write(mem.effective_address(insn.segment, regs), 8);
			}
		},
		Mnemonic::Movntdq | Mnemonic::Movntdqa => {
			if let Some(mem) = insn.mem_operand(0) {
				out.write(mem.effective_address(insn.segment, regs), 16);
			}
		},
		Mnemonic::Fxsave => {
			if let Some(mem) = insn.mem_operand(0) {
				out.write(mem.effective_address(insn.segment, regs), 512);
			}
		},
		Mnemonic::Fxrstor => {
			if let Some(mem) = insn.mem_operand(0) {
				out.read(mem.effective_address(insn.segment, regs), 512);
			}
		},

		// Everything else goes through its explicit memory operands
		_ => {
			for operand in &insn.operands {
				let crate::insn::Operand::Mem(mem) = operand else {
					continue;
				};

				let size = mem.size_bits as u64 / 8;
				match mem.access {
					MemAccess::Read => out.read(mem.effective_address(insn.segment, regs), size),
					MemAccess::Write => out.write(mem.effective_address(insn.segment, regs), size),
					MemAccess::None => (),
				}
			}
		},
	}

	out
}
