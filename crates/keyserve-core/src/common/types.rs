//! # Issued Credentials and Protocol Constants
//!
//! The server hands out exactly one [`Credential`] per subject name. Both
//! halves are opaque PEM blobs: the core never parses them, it only frames
//! them on the wire.
//!
//! ## Constants
//!
//! - [`NAME_TERMINATOR`] - Byte that ends a request
//! - [`DEFAULT_MAX_NAME_LEN`] - Default bound on the subject name length
//! - [`LENGTH_PREFIX_SIZE`] - Size of each big-endian length prefix
//! - [`DEFAULT_MAX_BLOB_LEN`] - Default bound a client accepts per blob

use bytes::Bytes;

/// Byte that terminates the subject name in a request.
pub const NAME_TERMINATOR: u8 = 0;

/// Default upper bound on the number of name bytes a server buffers before
/// treating the request as a protocol violation.
pub const DEFAULT_MAX_NAME_LEN: usize = 4096;

/// Number of bytes in each length prefix of a response frame.
pub const LENGTH_PREFIX_SIZE: usize = core::mem::size_of::<u32>();

/// Default upper bound a reader accepts for a single blob (16 MiB).
pub const DEFAULT_MAX_BLOB_LEN: usize = 16 * 1024 * 1024;

/// A private key and the certificate issued for it.
///
/// Cloning is cheap: both fields are reference-counted [`Bytes`], so every
/// waiter on a subject shares the same immutable allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    /// PKCS#8 `PRIVATE KEY` PEM.
    pub key_pem: Bytes,
    /// X.509 `CERTIFICATE` PEM.
    pub cert_pem: Bytes,
}

impl Credential {
    pub fn new(key_pem: impl Into<Bytes>, cert_pem: impl Into<Bytes>) -> Self {
        Self {
            key_pem: key_pem.into(),
            cert_pem: cert_pem.into(),
        }
    }

    /// Size of this credential once framed for the wire.
    pub fn framed_len(&self) -> usize {
        2 * LENGTH_PREFIX_SIZE + self.key_pem.len() + self.cert_pem.len()
    }
}
