//! Writing step output into the build event log.

mod writer;

pub use writer::{EventWriter, OutputFilter, DEFAULT_FLUSH_INTERVAL};
