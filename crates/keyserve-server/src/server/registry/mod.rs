//! Coalescing registry: one computation per subject name.
//!
//! The registry maps each subject name to exactly one [`PendingComputation`].
//! The entry is created by an atomic get-or-create under the map lock, and
//! only the caller that created it schedules the generation job, so no two
//! jobs for the same name can ever race.
//!
//! Entries are never evicted. A completed name is served from its cached
//! frame for the life of the process, and a failed name stays failed.

mod entry;

pub use entry::{Join, PendingComputation, Status};

use crate::server::{
    handoff::Handoff,
    pool::{manager::WorkerPool, request::WorkRequest},
    telemetry::{increment_cache_hits, increment_names_requested},
};
use mio::Token;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::{collections::HashMap, sync::Arc};

pub struct Registry {
    entries: Mutex<HashMap<String, Arc<PendingComputation>>>,
    pool: Arc<WorkerPool>,
    handoff: Arc<Handoff>,
    scheduled: AtomicU64,
}

impl Registry {
    pub fn new(pool: Arc<WorkerPool>, handoff: Arc<Handoff>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pool,
            handoff,
            scheduled: AtomicU64::new(0),
        }
    }

    /// Joins `waiter` to the computation for `name`, creating and scheduling
    /// it if this is the first request for the name.
    ///
    /// - [`Join::Waiting`]: the waiter will get a delivery through the handoff
    ///   queue.
    /// - [`Join::Ready`]: the name was already completed; the caller serves
    ///   the cached frame directly.
    /// - [`Join::Failed`]: the name already failed; the caller closes.
    #[tracing::instrument(level = "debug", skip(self), fields(waiter = waiter.0))]
    pub fn request_or_join(&self, name: &str, waiter: Token) -> Join {
        increment_names_requested();

        let (entry, created) = {
            let mut entries = self.entries.lock();
            match entries.get(name) {
                Some(entry) => (Arc::clone(entry), false),
                None => {
                    let entry = Arc::new(PendingComputation::new(name));
                    entries.insert(name.to_owned(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        // Join before scheduling so the creator is already a waiter when the
        // job can first settle.
        let join = entry.join(waiter);

        if created {
            self.schedule(entry);
        } else if matches!(join, Join::Ready(_)) {
            increment_cache_hits();
            tracing::debug!("Serving cached credential");
        }

        join
    }

    fn schedule(&self, entry: Arc<PendingComputation>) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        tracing::info!(name = entry.name(), "Scheduling generation");

        let request = WorkRequest::Generate {
            entry: Arc::clone(&entry),
        };
        if let Err(e) = self.pool.submit(request) {
            tracing::warn!(name = entry.name(), "Failed to schedule generation: {e}");
            entry.settle(Err(e), &self.handoff);
        }
    }

    /// Current status of `name`, if it was ever requested.
    pub fn status(&self, name: &str) -> Option<Status> {
        let entry = self.entries.lock().get(name).map(Arc::clone)?;
        Some(entry.status())
    }

    /// Number of distinct names ever requested.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of generation jobs ever scheduled.
    pub fn generations_scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn handoff(&self) -> &Handoff {
        &self.handoff
    }
}
