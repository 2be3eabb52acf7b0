//! Decoded instruction contract
//!
//! The decode collaborator hands the simulator one record per executed
//! instruction: a mnemonic tag, the instruction length, an optional
//! segment-prefix tag and up to four operands. Memory operands carry the
//! ingredients of their effective address rather than the address itself,
//! so the address is computed here against a platform-neutral register
//! snapshot.

/// A general-purpose 64-bit register
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Gpr {
	Rax,
	Rbx,
	Rcx,
	Rdx,
	Rsi,
	Rdi,
	Rbp,
	Rsp,
	R8,
	R9,
	R10,
	R11,
	R12,
	R13,
	R14,
	R15,
	Rip,
}

/// Width of a register alias.
///
/// The 8-bit high alias (`AH` et al) only exists for the four legacy
/// registers, but nothing here needs to enforce that.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum RegWidth {
	/// Low byte (`AL`)
	Low8,

	/// High byte of the low word (`AH`)
	High8,

	/// Low word (`AX`)
	Low16,

	/// Low dword (`EAX`)
	Low32,

	/// Full register (`RAX`)
	Full,
}

/// A register alias: a register plus the width it is accessed at
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct RegRef {
	/// Register
	pub reg: Gpr,

	/// Access width
	pub width: RegWidth,
}

impl RegRef {
	/// A full-width alias of `reg`
	#[must_use]
	pub const fn full(reg: Gpr) -> Self {
		Self {
			reg,
			width: RegWidth::Full,
		}
	}
}

/// Segment-override prefix relevant to address computation
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Segment {
	Fs,
	Gs,
}

/// Platform-neutral register snapshot.
///
/// The tracing host converts whatever its debug facility provides into
/// this layout. The FS/GS bases are included so that segment-relative
/// addresses can be formed without a syscall from the accounting path.
#[derive(Clone, Copy, Debug, Default)]
pub struct Registers {
	pub rax: u64,
	pub rbx: u64,
	pub rcx: u64,
	pub rdx: u64,
	pub rsi: u64,
	pub rdi: u64,
	pub rbp: u64,
	pub rsp: u64,
	pub r8:  u64,
	pub r9:  u64,
	pub r10: u64,
	pub r11: u64,
	pub r12: u64,
	pub r13: u64,
	pub r14: u64,
	pub r15: u64,
	pub rip: u64,

	/// FS segment base
	pub fs_base: u64,

	/// GS segment base
	pub gs_base: u64,
}

impl Registers {
	/// Returns the full 64-bit value of `reg`
	#[must_use]
	pub const fn gpr(&self, reg: Gpr) -> u64 {
		match reg {
			Gpr::Rax => self.rax,
			Gpr::Rbx => self.rbx,
			Gpr::Rcx => self.rcx,
			Gpr::Rdx => self.rdx,
			Gpr::Rsi => self.rsi,
			Gpr::Rdi => self.rdi,
			Gpr::Rbp => self.rbp,
			Gpr::Rsp => self.rsp,
			Gpr::R8 => self.r8,
			Gpr::R9 => self.r9,
			Gpr::R10 => self.r10,
			Gpr::R11 => self.r11,
			Gpr::R12 => self.r12,
			Gpr::R13 => self.r13,
			Gpr::R14 => self.r14,
			Gpr::R15 => self.r15,
			Gpr::Rip => self.rip,
		}
	}

	/// Reads a register alias, sign-extended to 64 bits
	#[must_use]
	pub const fn read(&self, alias: RegRef) -> i64 {
		let value = self.gpr(alias.reg);
		match alias.width {
			RegWidth::Low8 => value as i8 as i64,
			RegWidth::High8 => (value >> 8) as i8 as i64,
			RegWidth::Low16 => value as i16 as i64,
			RegWidth::Low32 => value as i32 as i64,
			RegWidth::Full => value as i64,
		}
	}
}

/// Displacement of a memory operand, tagged by its encoded width
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Displacement {
	None,
	D8(i8),
	D16(i16),
	D32(i32),
	D64(i64),
}

impl Displacement {
	/// Returns the displacement sign-extended to 64 bits
	#[must_use]
	pub const fn value(self) -> i64 {
		match self {
			Self::None => 0,
			Self::D8(value) => value as i64,
			Self::D16(value) => value as i64,
			Self::D32(value) => value as i64,
			Self::D64(value) => value,
		}
	}
}

/// How a memory operand accesses its location
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum MemAccess {
	/// Address is formed but not accessed (e.g. LEA)
	None,

	Read,
	Write,
}

/// Ingredients of a memory operand
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct MemOperand {
	/// Base register
	pub base: Option<RegRef>,

	/// Index register
	pub index: Option<RegRef>,

	/// Index scale; 0 means unscaled
	pub scale: u8,

	/// Displacement
	pub disp: Displacement,

	/// Operand size in bits
	pub size_bits: u16,

	/// Access direction
	pub access: MemAccess,
}

impl MemOperand {
	/// Computes the effective address against `regs`.
	///
	/// `base + index × scale + displacement`, adjusted by the FS/GS base
	/// when the instruction carries a segment prefix.
	#[must_use]
	pub fn effective_address(&self, segment: Option<Segment>, regs: &Registers) -> u64 {
		let mut addr = self.disp.value() as u64;

		if let Some(base) = self.base {
			addr = addr.wrapping_add(regs.read(base) as u64);
		}

		if let Some(index) = self.index {
			let value = regs.read(index);
			let scaled = match self.scale {
				0 => value,
				scale => value.wrapping_mul(scale as i64),
			};
			addr = addr.wrapping_add(scaled as u64);
		}

		match segment {
			Some(Segment::Fs) => addr.wrapping_add(regs.fs_base),
			Some(Segment::Gs) => addr.wrapping_add(regs.gs_base),
			None => addr,
		}
	}
}

/// A decoded operand
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Operand {
	None,

	/// Register operand of `size_bits`
	Reg { size_bits: u16 },

	/// Immediate operand of `size_bits`
	Imm { size_bits: u16 },

	/// Memory operand
	Mem(MemOperand),
}

impl Operand {
	/// Returns the operand size in bytes; 0 for `None`
	#[must_use]
	pub const fn size_bytes(&self) -> u64 {
		let bits = match self {
			Self::None => 0,
			Self::Reg { size_bits } | Self::Imm { size_bits } => *size_bits,
			Self::Mem(mem) => mem.size_bits,
		};
		bits as u64 / 8
	}
}

/// Mnemonic tag.
///
/// Only the families the accounting pipeline dispatches on are named;
/// everything else decodes to `Other` and is handled through its explicit
/// memory operands.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Mnemonic {
	// String instructions
	Lodsb,
	Lodsw,
	Lodsd,
	Lodsq,
	Scasb,
	Scasw,
	Scasd,
	Scasq,
	Stosb,
	Stosw,
	Stosd,
	Stosq,
	Movsb,
	Movsw,
	Movsd,
	Movsq,

	// Stack operations
	Push,
	Pop,
	Call,
	Ret,

	// Hints and non-accesses
	Pause,
	Lea,
	Nop,

	// Prefetch family
	Prefetch,
	Prefetchnta,
	Prefetcht0,
	Prefetcht1,
	Prefetcht2,

	// Fixed-size accesses
	Movntq,
	Movntdq,
	Movntdqa,
	Fxsave,
	Fxrstor,

	/// Anything else
	Other,
}

/// One decoded instruction
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Instruction {
	/// Instruction address
	pub rip: u64,

	/// Instruction length in bytes
	pub len: u8,

	/// Mnemonic tag
	pub mnemonic: Mnemonic,

	/// Segment-override prefix, if any
	pub segment: Option<Segment>,

	/// Operands; unused slots are `Operand::None`
	pub operands: [Operand; 4],
}

impl Instruction {
	/// Creates an instruction with no operands
	#[must_use]
	pub const fn new(rip: u64, len: u8, mnemonic: Mnemonic) -> Self {
		Self {
			rip,
			len,
			mnemonic,
			segment: None,
			operands: [Operand::None; 4],
		}
	}

	/// Sets operand `idx`
	#[must_use]
	pub fn with_operand(mut self, idx: usize, operand: Operand) -> Self {
		self.operands[idx] = operand;
		self
	}

	/// Sets the segment-override prefix
	#[must_use]
	pub fn with_segment(mut self, segment: Segment) -> Self {
		self.segment = Some(segment);
		self
	}

	/// Returns the memory operand at `idx`, if it is one
	#[must_use]
	pub fn mem_operand(&self, idx: usize) -> Option<&MemOperand> {
		match &self.operands[idx] {
			Operand::Mem(mem) => Some(mem),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	// Imports
	use super::*;

	#[test]
	fn register_aliases_sign_extend() {
		let regs = Registers {
			rax: 0x1122_3344_5566_f788,
			..Registers::default()
		};

		let read = |width| {
			regs.read(RegRef {
				reg: Gpr::Rax,
				width,
			})
		};

		assert_eq!(read(RegWidth::Low8), -0x78i64);
		assert_eq!(read(RegWidth::High8), -9i64);
		assert_eq!(read(RegWidth::Low16), -0x878i64);
		assert_eq!(read(RegWidth::Low32), 0x5566_f788);
		assert_eq!(read(RegWidth::Full), 0x1122_3344_5566_f788);
	}

	#[test]
	fn effective_address_combines_ingredients() {
		let regs = Registers {
			rbx: 0x1000,
			rcx: 0x10,
			..Registers::default()
		};

		let mem = MemOperand {
			base:      Some(RegRef::full(Gpr::Rbx)),
			index:     Some(RegRef::full(Gpr::Rcx)),
			scale:     4,
			disp:      Displacement::D8(-8),
			size_bits: 64,
			access:    MemAccess::Read,
		};

		assert_eq!(mem.effective_address(None, &regs), 0x1000 + 0x40 - 8);
	}

	#[test]
	fn unscaled_index_is_added_directly() {
		let regs = Registers {
			rdx: 0x30,
			..Registers::default()
		};

		let mem = MemOperand {
			base:      None,
			index:     Some(RegRef::full(Gpr::Rdx)),
			scale:     0,
			disp:      Displacement::D32(0x100),
			size_bits: 32,
			access:    MemAccess::Read,
		};

		assert_eq!(mem.effective_address(None, &regs), 0x130);
	}

	#[test]
	fn segment_base_adjusts_address() {
		let regs = Registers {
			fs_base: 0x7000_0000,
			gs_base: 0x8000_0000,
			..Registers::default()
		};

		let mem = MemOperand {
			base:      None,
			index:     None,
			scale:     0,
			disp:      Displacement::D32(0x28),
			size_bits: 64,
			access:    MemAccess::Read,
		};

		assert_eq!(mem.effective_address(Some(Segment::Fs), &regs), 0x7000_0028);
		assert_eq!(mem.effective_address(Some(Segment::Gs), &regs), 0x8000_0028);
		assert_eq!(mem.effective_address(None, &regs), 0x28);
	}

	#[test]
	fn negative_displacement_wraps_below_base() {
		let regs = Registers {
			rbp: 0x5000,
			..Registers::default()
		};

		let mem = MemOperand {
			base:      Some(RegRef::full(Gpr::Rbp)),
			index:     None,
			scale:     0,
			disp:      Displacement::D32(-0x20),
			size_bits: 32,
			access:    MemAccess::Write,
		};

		assert_eq!(mem.effective_address(None, &regs), 0x4fe0);
	}
}
