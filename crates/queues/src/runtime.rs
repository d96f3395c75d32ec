//! Wiring the standard queues onto a job runtime.

use std::sync::Arc;

use tracing::debug;

use taskforge_infra::config::EngineConfig;
use taskforge_infra::jobs::{DeadLetterStore, JobHandler, JobRuntimeBuilder, JobStore, QueueError};
use taskforge_infra::notify::JobNotifier;

use crate::kind::QueueKind;
use crate::payload::QueuePayload;

/// A builder with every [`QueueKind`] registered using its default options.
/// Handlers are left to the host (see [`register_handler`]).
pub fn standard_runtime<S>(
    store: Arc<S>,
    notifier: Arc<dyn JobNotifier>,
    config: &EngineConfig,
) -> Result<JobRuntimeBuilder<S>, QueueError>
where
    S: JobStore + DeadLetterStore + 'static,
{
    let mut builder = JobRuntimeBuilder::new(store).notifier(notifier);
    for kind in QueueKind::ALL {
        builder = builder.queue(kind.default_options(config)?);
    }
    Ok(builder)
}

/// Register `handler` for its payload's job type on its payload's queue.
pub fn register_handler<S, H>(builder: &mut JobRuntimeBuilder<S>, handler: H) -> Result<(), QueueError>
where
    S: JobStore + DeadLetterStore + 'static,
    H: JobHandler,
    H::Payload: QueuePayload,
{
    let queue = <H::Payload as QueuePayload>::QUEUE;
    let job_type = <H::Payload as QueuePayload>::JOB_TYPE;
    builder.handlers(queue.as_str())?.register(job_type, handler);
    debug!(queue = %queue, job_type, "job handler registered");
    Ok(())
}
