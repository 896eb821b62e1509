//! Error types shared across Cadence crates.

/// The result type used throughout cadence-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier failed to parse.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of the parse failure.
        message: String,
    },
}
