//! Crate-level error type for the boundaries that are allowed to surface a
//! failure instead of degrading silently (see spec §7: configuration
//! failures propagate to the caller; everything else, including listener
//! bind and history/push I/O, is logged and handled at its own call site).

use thiserror::Error;

/// Fatal/surfaced errors. Currently only configuration validation: an
/// invalid or unreadable config file prevents the process from starting.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),
}
