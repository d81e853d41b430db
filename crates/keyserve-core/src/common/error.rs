//! Error types for the certificate issuance service.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable failure in the system. None of these errors is fatal to the
//! server process: each one is contained to the connection or subject name
//! involved.
//!
//! ## Error Cases
//! - `NameTooLong` / `InvalidName`: The client sent a malformed request.
//! - `FrameTooLarge` / `UnexpectedEof`: A response frame could not be encoded
//!   or was cut short on the wire.
//! - `Generation`: The credential generator failed for a subject.
//! - `ChannelError`: An internal handoff between threads failed.
//! - `ServiceShutdown`: Work arrived while the service was shutting down.
//! - `Io`: A transport-level failure.

use std::sync::Arc;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the issuance service.
///
/// The type is `Clone` so that a failed generation can be cached once and
/// handed to every connection that later asks for the same name.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The subject name exceeded the configured maximum length.
    #[error("Name too long: {len} bytes exceeds maximum of {max}")]
    NameTooLong { len: usize, max: usize },

    /// The subject name was empty or contained disallowed bytes.
    #[error("Invalid name: {reason}")]
    InvalidName { reason: String },

    /// A blob did not fit in a `u32` length prefix, or a received prefix
    /// exceeded the reader's limit.
    #[error("Frame too large: {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// The peer closed the stream in the middle of a frame.
    #[error("Unexpected EOF while reading {context}")]
    UnexpectedEof { context: String },

    /// The credential generator failed for `name`.
    #[error("Generation failed for '{name}': {reason}")]
    Generation { name: String, reason: String },

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Underlying transport failure.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
