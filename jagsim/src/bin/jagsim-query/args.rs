//! Arguments

// Imports
use std::path::PathBuf;

/// Arguments
#[derive(Debug)]
#[derive(clap::Parser)]
pub struct Args {
	/// Log file
	///
	/// Specifies a file to perform verbose logging to.
	/// You can use `RUST_LOG_FILE` to set filtering options
	#[clap(long = "log-file")]
	pub log_file: Option<PathBuf>,

	/// Whether to append to the log file
	#[clap(long = "log-file-append")]
	pub log_file_append: bool,

	/// Trace file
	pub trace_file: PathBuf,

	/// Projection to show; defaults to the flat profile
	#[clap(subcommand)]
	pub command: Option<Command>,
}

/// Command
#[derive(Debug)]
#[derive(clap::Subcommand)]
pub enum Command {
	/// Flat per-symbol profile, worst first
	Flat {
		/// Rows to show
		#[clap(long = "top", default_value_t = 20)]
		top: usize,

		/// Output as json
		#[clap(long = "json")]
		json: bool,
	},

	/// Top-down call tree
	Tree {
		/// Levels to show
		#[clap(long = "depth", default_value_t = 4)]
		depth: usize,

		/// Output as json
		#[clap(long = "json")]
		json: bool,
	},

	/// Per-line profile of one symbol
	Files {
		/// Symbol to annotate
		symbol: String,

		/// Output as json
		#[clap(long = "json")]
		json: bool,
	},
}
