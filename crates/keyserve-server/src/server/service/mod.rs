//! Service assembly and lifecycle.
//!
//! This module wires the reactor, registry, handoff queue and worker pool
//! together behind a single bind/run/shutdown surface.
//!
//! ## Structure
//!
//! - [`handler`] - Service entry point ([`KeyService`]) and its
//!   [`ServerHandle`].
//!
//! [`KeyService`]: handler::KeyService
//! [`ServerHandle`]: handler::ServerHandle

pub mod handler;
