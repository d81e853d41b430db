//! Types shared by the keyserve server and client.
//!
//! - [`error`] - The unified [`Error`] type and [`Result`] alias.
//! - [`types`] - The issued [`Credential`] and protocol constants.
//! - [`frame`] - Request/response encoding and the incremental
//!   [`NameDecoder`] used by the server.

pub mod error;
pub mod frame;
pub mod types;

pub use error::{Error, Result};
pub use frame::{NameDecoder, encode_request, encode_response, read_response, validate_name};
pub use types::Credential;
