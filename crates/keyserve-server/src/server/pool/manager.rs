//! Fixed pool of generation workers.
//!
//! This module defines the [`WorkerPool`] struct, which owns a set of OS
//! threads responsible for processing [`WorkRequest`]s. Generation is
//! CPU-bound and may take seconds, so each worker is a dedicated thread rather
//! than an async task.
//!
//! All workers pull from one shared unbounded queue: a job submitted while
//! every worker is busy waits until one frees up, and no job is ever lost.
//! Shutdown is coordinated through a shared [`CancellationToken`].

use crate::server::{
    generator::CredentialGenerator,
    handoff::Handoff,
    pool::{request::WorkRequest, worker::worker_loop},
};
use core::time::Duration;
use keyserve_core::{Error, Result};
use parking_lot::Mutex;
use std::{sync::Arc, thread};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, timeout_at},
};
use tokio_util::sync::CancellationToken;

/// A fixed set of worker threads that process [`WorkRequest`]s.
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<WorkRequest>,
    num_workers: usize,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns `num_workers` threads, each calling `generator` for the jobs it
    /// receives and settling results through `handoff`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a thread cannot be spawned. Workers that were
    /// already started exit once the returned error drops the queue.
    pub fn spawn(
        num_workers: usize,
        generator: Arc<dyn CredentialGenerator>,
        handoff: Arc<Handoff>,
        shutdown_timeout: Duration,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let shutdown_token = CancellationToken::new();

        for worker_id in 0..num_workers {
            let receiver = Arc::clone(&receiver);
            let generator = Arc::clone(&generator);
            let handoff = Arc::clone(&handoff);
            let token = shutdown_token.clone();

            thread::Builder::new()
                .name(format!("keyserve-worker-{worker_id}"))
                .spawn(move || {
                    worker_loop(worker_id, &receiver, generator.as_ref(), &handoff, &token);
                })?;
        }

        tracing::debug!("Spawned {num_workers} workers");

        Ok(Self {
            sender,
            num_workers,
            shutdown_token,
            shutdown_timeout,
        })
    }

    /// Queues a [`WorkRequest`] for the next free worker.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The pool is shutting down (`shutdown_token` was cancelled).
    /// - Every worker has exited and the queue is closed.
    pub fn submit(&self, request: WorkRequest) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        self.sender.send(request).map_err(|_| Error::ChannelError {
            context: "worker queue closed".to_string(),
        })
    }

    pub const fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Cancels the shared [`CancellationToken`] to refuse new work. Jobs
    ///   still queued are settled as [`Error::ServiceShutdown`] without
    ///   running.
    /// - Sends a [`WorkRequest::Shutdown`] to each worker.
    /// - Waits up to the configured shutdown timeout for every
    ///   acknowledgement. A worker stuck in a long generation is left behind.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new requests ===
        tracing::info!("Refusing new generation requests");
        self.shutdown_token.cancel();

        // === Phase 1: Notify workers to shut down ===
        tracing::debug!("Notifying all workers to shut down");
        let mut acks = Vec::with_capacity(self.num_workers);
        for i in 0..self.num_workers {
            let (tx, rx) = oneshot::channel();
            if let Err(e) = self.sender.send(WorkRequest::Shutdown { response: tx }) {
                tracing::error!("Failed to send shutdown to worker {i}: {e}");
            } else {
                acks.push((i, rx));
            }
        }

        // === Phase 2: Wait for acknowledgements against one deadline ===
        tracing::debug!(
            "Waiting up to {:?} for worker shutdown acknowledgements",
            self.shutdown_timeout
        );
        let deadline = Instant::now() + self.shutdown_timeout;
        let mut acknowledged = 0;
        for (i, rx) in acks {
            match timeout_at(deadline, rx).await {
                Ok(Ok(())) => {
                    acknowledged += 1;
                    tracing::trace!("Shutdown acknowledged");
                }
                Ok(Err(e)) => tracing::error!("Worker dropped its shutdown ack: {e}"),
                Err(_) => tracing::warn!("Shutdown acknowledgement {i} timed out"),
            }
        }

        tracing::info!(
            "Worker pool shutdown complete ({acknowledged}/{} acknowledged)",
            self.num_workers
        );

        Ok(())
    }
}
