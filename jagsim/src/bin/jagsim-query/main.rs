//! Jaguar cache simulator trace query tool (`jagsim-query`)

// Modules
mod args;

// Imports
use {
	self::args::{Args, Command},
	anyhow::Context,
	clap::Parser,
	jagsim::{
		cache::AccessResult,
		trace::{FileProfile, FlatRecord, Trace, TreeNode},
	},
	jagsim_util::{logger, DisplayWrapper},
	std::{fmt, io},
};

fn main() -> Result<(), anyhow::Error> {
	// Get arguments
	let args = Args::parse();
	logger::pre_init::debug(format!("Args: {args:?}"));

	// Initialize logging
	logger::init(args.log_file.as_deref(), args.log_file_append);

	// Load the trace
	let trace = Trace::open(&args.trace_file).context("Unable to load trace file")?;
	tracing::debug!(?trace, "Loaded trace");
	if !trace.is_resolved() {
		tracing::warn!("Trace has no symbol table; locations are shown as raw addresses");
	}

	match args.command.unwrap_or(Command::Flat { top: 20, json: false }) {
		Command::Flat { top, json } => {
			let records = trace.flat_profile();
			match json {
				true => write_json(&records.iter().take(top).collect::<Vec<_>>())?,
				false => print_flat(&records, top),
			}
		},

		Command::Tree { depth, json } => {
			let tree = trace.tree_profile();
			match json {
				true => write_json(&tree)?,
				false => print!("{}", DisplayWrapper::new(|f| fmt_tree_node(f, &tree, 0, depth))),
			}
		},

		Command::Files { symbol, json } => {
			let profile = trace
				.file_profile(&symbol)
				.with_context(|| format!("No samples resolve to symbol {symbol:?}"))?;
			match json {
				true => write_json(&profile)?,
				false => print_files(&profile),
			}
		},
	}

	Ok(())
}

/// Writes `value` to stdout as json
fn write_json<T: serde::Serialize>(value: &T) -> Result<(), anyhow::Error> {
	serde_json::to_writer_pretty(io::stdout(), value).context("Unable to write json output")?;
	println!();
	Ok(())
}

/// Prints the flat profile as a table
fn print_flat(records: &[FlatRecord], top: usize) {
	let badness = records
		.iter()
		.map(|record| record.badness)
		.collect::<average::Variance>();
	println!(
		"{} locations, badness {:.1} ± {:.1}",
		records.len(),
		badness.mean(),
		badness.error()
	);

	println!(
		"{:<40} {:>12} {:>9} {:>9} {:>9} {:>9} {:>10}",
		"location", "instrs", "d1-hit", "i1-hit", "l2-hit", "l2-miss", "badness"
	);
	for record in records.iter().take(top) {
		let counts = &record.counts;
		println!(
			"{:<40} {:>12} {:>9} {:>9} {:>9} {:>9} {:>10.1}",
			record.label,
			counts[AccessResult::InstructionsExecuted.index()],
			counts[AccessResult::D1Hit.index()],
			counts[AccessResult::I1Hit.index()],
			counts[AccessResult::L2Hit.index()],
			counts[AccessResult::L2DMiss.index()] + counts[AccessResult::L2IMiss.index()],
			record.badness,
		);
	}
}

/// Formats one call-tree node and its children, depth-limited
fn fmt_tree_node(f: &mut fmt::Formatter, node: &TreeNode, level: usize, max_depth: usize) -> fmt::Result {
	if level >= max_depth {
		return Ok(());
	}

	writeln!(
		f,
		"{:indent$}{} ({:.1})",
		"",
		node.label,
		node.badness,
		indent = level * 2
	)?;
	for child in &node.children {
		fmt_tree_node(f, child, level + 1, max_depth)?;
	}
	Ok(())
}

/// Prints the per-line profile of one symbol
fn print_files(profile: &FileProfile) {
	println!(
		"{} (lines {}..={})",
		profile.file_name, profile.first_line, profile.last_line
	);

	println!("{:>6} {:>9} {:>9} {:>9} {:>10}", "line", "d1-hit", "l2-hit", "l2-miss", "badness");
	for line in &profile.lines {
		let counts = &line.counts;
		println!(
			"{:>6} {:>9} {:>9} {:>9} {:>10.1}",
			line.line_number,
			counts[AccessResult::D1Hit.index()],
			counts[AccessResult::L2Hit.index()],
			counts[AccessResult::L2DMiss.index()] + counts[AccessResult::L2IMiss.index()],
			line.badness,
		);
	}
}
