//! The credential generation capability.
//!
//! The server core only ever sees [`CredentialGenerator`]: a slow, thread-safe
//! function from subject name to [`Credential`]. Workers call it; the reactor
//! never does.
//!
//! - [`issuer`] - The production implementation, signing with a configured
//!   issuer key via `rcgen`.

pub mod issuer;

pub use issuer::{IssuerGenerator, KeyAlgorithm, parse_distinguished_name};

use keyserve_core::{Credential, Result};

/// Produces a private key and a signed certificate for a subject.
///
/// Implementations must be safe to call from several worker threads at once.
/// A call may take seconds; it is only ever made from the worker pool.
pub trait CredentialGenerator: Send + Sync + 'static {
    /// Generates a fresh credential for `subject`.
    ///
    /// # Errors
    ///
    /// Any failure should be reported as [`keyserve_core::Error::Generation`];
    /// the name is then marked failed for the life of the process.
    fn generate(&self, subject: &str) -> Result<Credential>;
}

impl<F> CredentialGenerator for F
where
    F: Fn(&str) -> Result<Credential> + Send + Sync + 'static,
{
    fn generate(&self, subject: &str) -> Result<Credential> {
        self(subject)
    }
}
