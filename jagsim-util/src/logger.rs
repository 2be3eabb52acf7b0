//! Logger
//!
//! Logging is initialized once per process. The stderr layer is filtered
//! by `RUST_LOG` (defaulting to `info`), while the optional log file layer
//! is filtered separately by `RUST_LOG_FILE` so verbose traces can be
//! captured without flooding the terminal.

// Imports
use {
	std::{fs, io, path::Path, sync::Arc},
	tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer},
};

/// Initializes the logger.
///
/// If `log_file` is given, verbose logging is additionally written to it,
/// truncating unless `log_file_append` is set.
pub fn init(log_file: Option<&Path>, log_file_append: bool) {
	let stderr_layer = tracing_subscriber::fmt::layer()
		.with_writer(io::stderr)
		.with_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::INFO.into())
				.from_env_lossy(),
		);

	let file_layer = log_file.and_then(|path| {
		let file = fs::OpenOptions::new()
			.create(true)
			.write(true)
			.append(log_file_append)
			.truncate(!log_file_append)
			.open(path);
		let file = match file {
			Ok(file) => file,
			Err(err) => {
				eprintln!("Unable to open log file {path:?}: {err}");
				return None;
			},
		};

		let layer = tracing_subscriber::fmt::layer()
			.with_ansi(false)
			.with_writer(Arc::new(file))
			.with_filter(
				EnvFilter::builder()
					.with_env_var("RUST_LOG_FILE")
					.with_default_directive(LevelFilter::DEBUG.into())
					.from_env_lossy(),
			);
		Some(layer)
	});

	tracing_subscriber::registry()
		.with(stderr_layer)
		.with(file_layer)
		.init();

	// Flush anything logged before we were initialized
	for msg in pre_init::drain() {
		tracing::debug!("{msg}");
	}
}

/// Pre-initialization logging.
///
/// Messages logged before [`init`] are buffered and flushed into the
/// subscriber once it exists.
pub mod pre_init {
	// Imports
	use std::sync::Mutex;

	/// Buffered messages
	static MESSAGES: Mutex<Vec<String>> = Mutex::new(Vec::new());

	/// Buffers a debug message until the logger is initialized
	pub fn debug(msg: String) {
		let mut messages = MESSAGES.lock().expect("Pre-init message buffer was poisoned");
		messages.push(msg);
	}

	/// Drains all buffered messages
	pub(super) fn drain() -> Vec<String> {
		let mut messages = MESSAGES.lock().expect("Pre-init message buffer was poisoned");
		std::mem::take(&mut *messages)
	}
}
