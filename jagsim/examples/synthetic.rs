//! Synthetic capture
//!
//! Drives the simulator the way a tracing shell would, but with a
//! hand-built instruction stream instead of a single-stepped program:
//! captures a hot copy loop, saves the trace, resolves fake symbols and
//! prints the flat profile.

// Imports
use {
	anyhow::Context,
	jagsim::{
		capture::session,
		insn::{Displacement, Gpr, Instruction, MemAccess, MemOperand, Mnemonic, Operand, RegRef},
		trace::{writer, ModuleRecord, ResolvedSymbol, Trace},
		Host, Registers,
	},
	jagsim_util::logger,
	std::path::PathBuf,
};

/// Host stub: one synthetic thread, no real stepping
struct SyntheticHost;

impl Host for SyntheticHost {
	fn current_thread_id(&self) -> u64 {
		1
	}

	fn suspend_thread(&self, _thread_id: u64) -> Result<(), anyhow::Error> {
		Ok(())
	}

	fn resume_thread(&self, _thread_id: u64) -> Result<(), anyhow::Error> {
		Ok(())
	}

	fn set_single_step(&self, _thread_id: u64, _enabled: bool) -> Result<(), anyhow::Error> {
		Ok(())
	}

	fn unwind_stack(&self, regs: &Registers, frames: &mut [u64]) -> usize {
		frames[0] = regs.rip;
		frames[1] = 0x40_0100; // copy_buffers
		frames[2] = 0x40_0000; // main
		3
	}

	fn module_list(&self) -> Vec<ModuleRecord> {
		vec![ModuleRecord {
			image_base:     0x40_0000,
			segment_offset: 0,
			size_bytes:     0x10_0000,
			name:           "synthetic".to_owned(),
		}]
	}

	fn executable_path(&self) -> PathBuf {
		std::env::temp_dir().join("synthetic")
	}

	fn sleep_ms(&self, _ms: u64) {}
}

fn main() -> Result<(), anyhow::Error> {
	logger::init(None, false);

	let host = SyntheticHost;
	session::init().context("Unable to initialize session")?;
	session::set_thread_core_mapping(host.current_thread_id(), 0).context("Unable to map thread")?;
	anyhow::ensure!(session::start_capture(&host), "Unable to start capture");

	// A `movsq`-style copy loop: reads walk one buffer, writes the other.
	// The 8-byte stride means a miss every eighth iteration per stream.
	let copy = Instruction::new(0x40_1000, 3, Mnemonic::Movsq);
	let mut regs = Registers {
		rsi: 0x10_0000,
		rdi: 0x20_0000,
		rip: copy.rip,
		..Registers::default()
	};
	for _ in 0..4096 {
		session::record_instruction(&host, &copy, &regs);
		regs.rsi += 8;
		regs.rdi += 8;
	}

	// A pointer-chasing load with a 4 KiB stride: misses every time
	let chase = Instruction::new(0x40_1040, 4, Mnemonic::Other).with_operand(
		0,
		Operand::Mem(MemOperand {
			base:      Some(RegRef::full(Gpr::Rbx)),
			index:     None,
			scale:     0,
			disp:      Displacement::None,
			size_bits: 64,
			access:    MemAccess::Read,
		}),
	);
	regs.rip = chase.rip;
	regs.rbx = 0x30_0000;
	for _ in 0..1024 {
		session::record_instruction(&host, &chase, &regs);
		regs.rbx += 4096;
	}

	let path = session::end_capture(&host, true)
		.context("Unable to end capture")?
		.context("Capture produced no file")?;

	// Resolve the synthetic symbols so the profile reads like one
	writer::write_symbols(&path, &[
		ResolvedSymbol {
			rip:          0x40_1000,
			symbol_name:  "copy_loop".to_owned(),
			file_name:    "copy.rs".to_owned(),
			line_number:  10,
			displacement: 0,
			module_index: 0,
		},
		ResolvedSymbol {
			rip:          0x40_1040,
			symbol_name:  "chase_pointers".to_owned(),
			file_name:    "chase.rs".to_owned(),
			line_number:  31,
			displacement: 0,
			module_index: 0,
		},
		ResolvedSymbol {
			rip:          0x40_0100,
			symbol_name:  "copy_buffers".to_owned(),
			file_name:    "copy.rs".to_owned(),
			line_number:  3,
			displacement: 0,
			module_index: 0,
		},
		ResolvedSymbol {
			rip:          0x40_0000,
			symbol_name:  "main".to_owned(),
			file_name:    "main.rs".to_owned(),
			line_number:  1,
			displacement: 0,
			module_index: 0,
		},
	])
	.context("Unable to resolve symbols")?;

	let trace = Trace::open(&path).context("Unable to reload trace")?;
	println!("capture: {}", path.display());
	for record in trace.flat_profile() {
		println!(
			"{:<20} instrs={:<6} badness={:.0}",
			record.label,
			record.counts[jagsim::cache::AccessResult::InstructionsExecuted.index()],
			record.badness,
		);
	}

	std::fs::remove_file(&path).context("Unable to remove trace file")?;
	Ok(())
}
