use crate::server::{
    generator::CredentialGenerator,
    handoff::Handoff,
    registry::PendingComputation,
    telemetry::{
        increment_generation_failures, increment_generations_started, record_generation_duration,
    },
};
use keyserve_core::{Error, encode_response};
use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    time::Instant,
};

/// Runs one generation job within a worker and settles its subject.
///
/// The credential is framed once here; every waiter, and every later cache
/// hit, shares that frame.
///
/// # Behavior
///
/// - On success, settles the subject as completed with the encoded frame.
/// - On error, or if the generator panics, settles it as failed. A panic is
///   contained so the worker thread keeps serving.
pub fn handle_generate_request(
    worker_id: usize,
    entry: &PendingComputation,
    generator: &dyn CredentialGenerator,
    handoff: &Handoff,
) {
    let name = entry.name();
    let _span = tracing::info_span!("generate", worker_id, name).entered();

    increment_generations_started();
    let start = Instant::now();

    let result = catch_unwind(AssertUnwindSafe(|| generator.generate(name)))
        .unwrap_or_else(|payload| {
            Err(Error::Generation {
                name: name.to_string(),
                reason: format!("generator panicked: {}", panic_message(payload.as_ref())),
            })
        })
        .and_then(|credential| encode_response(&credential));

    let elapsed = start.elapsed();
    record_generation_duration(elapsed.as_secs_f64() * 1000.0);

    match &result {
        Ok(frame) => tracing::info!(bytes = frame.len(), ?elapsed, "Generated credential"),
        Err(e) => {
            increment_generation_failures();
            tracing::warn!(?elapsed, "Generation failed: {e}");
        }
    }

    entry.settle(result, handoff);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
