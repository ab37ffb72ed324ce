use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used by every fallible path in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by setup, encoding and lookup paths.
///
/// The key algebra itself never fails: inconsistencies found while merging or
/// classifying keys are reported through [`crate::diag::DiagnosticSink`].
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Encoded input that cannot be a valid key.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller-supplied value is out of range.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A device or bucket lookup missed.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Options file could not be read or parsed.
    #[error("failed to load options {path}: {reason}")]
    Config {
        /// File the options were read from.
        path: PathBuf,
        /// Parser or validation message.
        reason: String,
    },
}
