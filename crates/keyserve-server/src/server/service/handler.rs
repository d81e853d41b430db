//! The coalescing issuance service.
//!
//! This module defines [`KeyService`], which binds the listening socket and
//! owns the reactor, and [`ServerHandle`], a cloneable handle used to observe
//! and stop a running service from other threads.
//!
//! ## Responsibilities
//!
//! - Spawn the worker pool that runs credential generation.
//! - Build the registry and handoff queue shared between reactor and workers.
//! - Run the reactor on its own thread, or on the caller's.
//! - Coordinate graceful shutdown.

use crate::server::{
    config::ServerConfig,
    generator::CredentialGenerator,
    handoff::Handoff,
    pool::manager::WorkerPool,
    reactor::{Reactor, WAKER},
    registry::Registry,
};
use keyserve_core::Result;
use mio::{Poll, Waker, net::TcpListener};
use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;

/// A bound, ready-to-run issuance service.
///
/// Binding spawns the worker pool immediately; clients may connect as soon as
/// [`KeyService::bind`] returns, and are served once the reactor runs.
pub struct KeyService {
    reactor: Reactor,
    handle: ServerHandle,
}

/// Cloneable control handle for a [`KeyService`].
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    handoff: Arc<Handoff>,
    pool: Arc<WorkerPool>,
    registry: Arc<Registry>,
    local_addr: SocketAddr,
}

impl KeyService {
    /// Binds `config.server_addr` and spawns `config.num_workers` workers
    /// calling `generator`.
    ///
    /// # Errors
    ///
    /// Returns [`keyserve_core::Error::Io`] if the poller, listener or a
    /// worker thread cannot be created.
    pub fn bind(config: &ServerConfig, generator: Arc<dyn CredentialGenerator>) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let handoff = Arc::new(Handoff::new(waker));

        let listener = TcpListener::bind(config.server_addr)?;
        let local_addr = listener.local_addr()?;

        let pool = Arc::new(WorkerPool::spawn(
            config.num_workers,
            generator,
            Arc::clone(&handoff),
            config.shutdown_timeout,
        )?);
        let registry = Arc::new(Registry::new(Arc::clone(&pool), Arc::clone(&handoff)));
        let shutdown = CancellationToken::new();

        let reactor = Reactor::new(
            poll,
            listener,
            Arc::clone(&registry),
            Arc::clone(&handoff),
            shutdown.clone(),
            config.max_name_len,
            config.events_capacity,
        )?;

        tracing::info!(
            %local_addr,
            workers = config.num_workers,
            max_name_len = config.max_name_len,
            "Service bound"
        );

        Ok(Self {
            reactor,
            handle: ServerHandle {
                shutdown,
                handoff,
                pool,
                registry,
                local_addr,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Runs the reactor on the current thread until [`ServerHandle::stop`].
    ///
    /// # Errors
    ///
    /// Returns an error only if polling itself fails.
    pub fn run(self) -> Result<()> {
        self.reactor.run()
    }

    /// Runs the reactor on a dedicated `keyserve-reactor` thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self) -> io::Result<JoinHandle<Result<()>>> {
        thread::Builder::new()
            .name("keyserve-reactor".to_string())
            .spawn(move || self.run())
    }
}

impl ServerHandle {
    /// Stops the reactor at its next wakeup. Connections still open are
    /// closed without a response.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.handoff.wake();
    }

    /// Stops the reactor, then shuts down the worker pool.
    ///
    /// Returns once every worker acknowledged, or after the configured
    /// shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down service");
        self.stop();
        self.pool.shutdown().await
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
