use crate::server::{
    generator::CredentialGenerator,
    handoff::Handoff,
    pool::{processor::handle_generate_request, request::WorkRequest},
};
use keyserve_core::Error;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Worker thread body responsible for processing [`WorkRequest`] messages.
///
/// All workers share one receiver. A worker holds the receiver lock only while
/// waiting for the next message, so a long generation never blocks the
/// others from picking up work.
///
/// # Arguments
///
/// - `worker_id`: Unique numeric identifier for this worker (used for
///   logs/tracing).
/// - `rx`: Shared receiver through which [`WorkRequest`]s arrive.
/// - `generator`: The credential generator, shared by every worker.
/// - `handoff`: Where settled outcomes are delivered for the reactor.
/// - `shutdown`: Once cancelled, queued jobs are settled without running.
///
/// # Request Types
///
/// - [`WorkRequest::Generate`] - Runs [`handle_generate_request`].
/// - [`WorkRequest::Shutdown`] - Acknowledges and stops this worker.
pub fn worker_loop(
    worker_id: usize,
    rx: &Mutex<mpsc::UnboundedReceiver<WorkRequest>>,
    generator: &dyn CredentialGenerator,
    handoff: &Handoff,
    shutdown: &CancellationToken,
) {
    tracing::trace!("Worker {worker_id} started");

    loop {
        let Some(work) = rx.lock().blocking_recv() else {
            tracing::debug!("Worker {worker_id} queue closed");
            break;
        };

        match work {
            WorkRequest::Generate { entry } => {
                if shutdown.is_cancelled() {
                    tracing::debug!(
                        name = entry.name(),
                        "Worker {worker_id} dropping job during shutdown"
                    );
                    entry.settle(Err(Error::ServiceShutdown), handoff);
                    continue;
                }
                handle_generate_request(worker_id, &entry, generator, handoff);
            }
            WorkRequest::Shutdown { response } => {
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}
