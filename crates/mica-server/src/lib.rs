//! # mica-server
//!
//! Ties the pieces together: per-socket reader/writer tasks feed the
//! protocol parser, the command executor routes cache actions to
//! partitions (through the combiner, the home runtime, or the lock,
//! depending on the configured engine), and replies stream back through
//! the segmented transmit buffer with values spliced straight out of the
//! cache.

mod conn;
mod exec;
mod server;

pub use exec::{ExecCtx, Hit, Reply};
pub use server::{Server, ServerConfig};
