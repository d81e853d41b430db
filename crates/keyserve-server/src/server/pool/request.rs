use crate::server::registry::PendingComputation;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A unit of work sent to the [`WorkerPool`].
///
/// [`WorkerPool`]: crate::server::pool::manager::WorkerPool
#[derive(Debug)]
pub enum WorkRequest {
    /// Generate the credential for `entry` and settle it.
    Generate { entry: Arc<PendingComputation> },
    /// Stop the receiving worker and acknowledge on `response`.
    Shutdown { response: oneshot::Sender<()> },
}
