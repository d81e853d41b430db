//! Fixed-size pool of worker threads that run credential generation.
//!
//! - [`manager`] - Owns the work queue and coordinates shutdown.
//! - [`worker`] - The per-thread receive loop.
//! - [`processor`] - Runs one generation job and settles its subject.
//! - [`request`] - Messages accepted by the pool.

pub mod manager;
pub mod processor;
pub mod request;
pub mod worker;
