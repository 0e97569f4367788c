//! # `LaminarDB` Connectors
//!
//! Split-based source connectors built on `laminar-source`.
//!
//! - [`file`]: newline-delimited files in a directory, one split per file
//! - [`testing`]: deterministic number sequences for tests and benchmarks

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod error;
pub mod file;
pub mod testing;

pub use error::ConnectorError;
pub use file::LineFileSource;
pub use testing::NumberSequenceSource;
