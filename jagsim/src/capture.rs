//! Capture machinery
//!
//! Everything between the per-instruction trap and the trace file: the
//! accounting pipeline, the call-stack interner, the statistics aggregator
//! and the session controller that owns them.

// Modules
pub mod pipeline;
pub mod session;
pub mod stacks;
pub mod stats;
mod table;

// Exports
pub use self::{
	session::Host,
	stacks::StackInterner,
	stats::{RipKey, StatsTable},
};
