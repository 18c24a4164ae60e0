//! Error types for the saguaro crate.

use thiserror::Error;

/// Top-level error type for generation-controller operations.
///
/// Media and alignment errors are raised before any session state is merged,
/// so a failed call leaves the session retryable. A decode failure ends the
/// current episode only; the session remains usable after `rewind()`.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Programmer-error contract violation (missing required capability,
    /// driver channel gone).
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// The inference backend rejected a decode call. Fatal for the current
    /// episode; partial generated text is preserved.
    #[error("backend decode failed: {0}")]
    BackendDecodeFailed(String),

    /// Bad URL scheme, malformed base64, unreadable file, or a prompt whose
    /// media markers do not match the supplied media items.
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    /// The requested content cannot fit in the context window even after
    /// truncation, or a window shift has nothing left to discard.
    #[error("context window full")]
    ContextFull,

    /// No sampler is installed; an episode cannot start.
    #[error("sampler unavailable")]
    SamplerUnavailable,

    /// The sampler failed while picking a token.
    #[error("sampling failed: {0}")]
    Sampling(#[from] saguaro_sampling::SamplingError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
