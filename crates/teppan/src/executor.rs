//! Batch formation and execution.
//!
//! A pass over one (kind, device) queue greedily collects compatible jobs
//! in priority order, up to the model's `max_batch_size` or until the
//! configured latency window elapses, whichever comes first. The batch runs
//! as a single forward pass through the [`ModelExecutor`]; outputs are
//! demultiplexed back to each job's ticket by position. A forward-pass
//! failure fails every job in the batch but leaves the queue running.
//!
//! [`ModelExecutor`]: crate::model::ModelExecutor

use std::collections::BinaryHeap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::model::{BatchSlot, ModelHandle, ModelKind};
use crate::scheduler::{DeviceState, QueuedJob, SchedulerCore};

/// A group of same-model jobs executed in one forward pass. Ephemeral: it
/// exists only for the duration of the pass.
pub(crate) struct Batch {
    pub handle: Arc<ModelHandle>,
    pub jobs: Vec<QueuedJob>,
}

impl Batch {
    /// Aggregate memory requirement: the model's per-item footprint plus
    /// each item's own size.
    fn job_bytes(handle: &ModelHandle, job: &QueuedJob) -> u64 {
        handle.memory_footprint_bytes + job.input.approx_bytes()
    }
}

/// Runs one batch pass for `kind` on the given device. Returns after the
/// pass completes, fails, or nothing was dispatchable.
pub(crate) async fn run_pass(
    core: &SchedulerCore,
    device: &DeviceState,
    kind: ModelKind,
    notifier: &Notify,
) {
    let Some(queue) = core.queue(kind, &device.id) else {
        return;
    };
    let Some(batch) = collect_batch(core, queue, notifier).await else {
        return;
    };

    let oldest_wait = batch
        .jobs
        .iter()
        .map(|j| j.submitted_at.elapsed())
        .max()
        .unwrap_or_default();

    match admit(core, device, batch, queue).await {
        None => {}
        Some((batch, reserved)) => {
            info!(
                kind = ?kind,
                device = %device.id,
                size = batch.jobs.len(),
                wait_ms = oldest_wait.as_millis() as u64,
                "batch formed"
            );
            core.metrics.record_batch(batch.jobs.len());
            execute(core, batch).await;
            device.release(reserved);
        }
    }
}

/// Greedily pops dispatchable jobs, dropping cancelled, expired, and
/// over-length ones along the way. Waits out the remainder of the latency
/// window for stragglers unless the batch fills first.
async fn collect_batch(
    core: &SchedulerCore,
    queue: &Mutex<BinaryHeap<QueuedJob>>,
    notifier: &Notify,
) -> Option<Batch> {
    let started = Instant::now();
    let mut handle: Option<Arc<ModelHandle>> = None;
    let mut jobs: Vec<QueuedJob> = Vec::new();

    loop {
        {
            let mut q = queue.lock().await;
            let mut incompatible = Vec::new();
            while let Some(job) = q.pop() {
                if core.cancelled.remove(&job.id).is_some() {
                    core.metrics.record_job_failed();
                    debug!(job_id = %job.id, "dropping cancelled job before dispatch");
                    job.resolve(Err(PipelineError::Cancelled));
                    continue;
                }
                if job.past_deadline(Instant::now()) {
                    core.metrics.record_job_failed();
                    debug!(job_id = %job.id, "job missed deadline before dispatch");
                    job.resolve(Err(PipelineError::DeadlineExceeded));
                    continue;
                }
                let max_len = job.handle.max_sequence_length;
                if job.input.len() > max_len {
                    core.metrics.record_job_failed();
                    let len = job.input.len();
                    job.resolve(Err(PipelineError::InputTooLarge { len, max: max_len }));
                    continue;
                }
                match &handle {
                    None => handle = Some(job.handle.clone()),
                    Some(h) if Arc::ptr_eq(h, &job.handle) => {}
                    Some(_) => {
                        // Same kind, different model; it gets its own pass.
                        incompatible.push(job);
                        continue;
                    }
                }
                jobs.push(job);
                if jobs.len() >= handle.as_ref().map(|h| h.max_batch_size).unwrap_or(1) {
                    break;
                }
            }
            for job in incompatible {
                q.push(job);
            }
        }

        let Some(h) = handle.as_ref() else {
            return None;
        };
        if jobs.len() >= h.max_batch_size {
            break;
        }
        let elapsed = started.elapsed();
        if elapsed >= core.batch_window {
            break;
        }
        tokio::select! {
            _ = notifier.notified() => {}
            _ = tokio::time::sleep(core.batch_window - elapsed) => break,
        }
    }

    match handle {
        Some(handle) if !jobs.is_empty() => Some(Batch { handle, jobs }),
        _ => None,
    }
}

/// Admission control against the device's memory budget.
///
/// A dispatched batch never exceeds the budget: jobs that do not fit are
/// pushed back to the queue, and after a bounded number of consecutive
/// shrunken or rejected passes the device is flagged saturated so `submit`
/// sheds load upstream. A job that cannot fit even on an idle device fails
/// with `ResourceExhausted` instead of cycling forever.
///
/// Returns the admitted batch and the bytes reserved for it, or `None` if
/// nothing was admitted.
async fn admit(
    core: &SchedulerCore,
    device: &DeviceState,
    batch: Batch,
    queue: &Mutex<BinaryHeap<QueuedJob>>,
) -> Option<(Batch, u64)> {
    let in_use = device.in_use_bytes.load(Ordering::SeqCst);
    let mut admitted = Vec::with_capacity(batch.jobs.len());
    let mut spill = Vec::new();
    let mut reserved = 0u64;

    for job in batch.jobs {
        let bytes = Batch::job_bytes(&batch.handle, &job);
        if in_use + reserved + bytes <= device.budget_bytes {
            reserved += bytes;
            admitted.push(job);
        } else {
            spill.push(job);
        }
    }

    if admitted.is_empty() && in_use == 0 {
        // The most urgent job alone exceeds the whole device budget.
        let job = spill.remove(0);
        core.metrics.record_job_failed();
        warn!(job_id = %job.id, device = %device.id, "job larger than device budget");
        job.resolve(Err(PipelineError::ResourceExhausted {
            device: device.id.to_string(),
        }));
    }

    let rejected = !spill.is_empty();
    if rejected {
        let mut q = queue.lock().await;
        for job in spill {
            q.push(job);
        }
    }

    if rejected || admitted.is_empty() {
        let rejections = device.consecutive_rejections.fetch_add(1, Ordering::SeqCst) + 1;
        if rejections >= core.reject_limit && !device.saturated.swap(true, Ordering::SeqCst) {
            warn!(device = %device.id, rejections, "device saturated, shedding load");
        }
    } else {
        device.consecutive_rejections.store(0, Ordering::SeqCst);
        if device.saturated.swap(false, Ordering::SeqCst) {
            info!(device = %device.id, "device pressure cleared");
        }
    }

    if admitted.is_empty() {
        return None;
    }
    device.reserve(reserved);
    Some((
        Batch {
            handle: batch.handle,
            jobs: admitted,
        },
        reserved,
    ))
}

/// One forward pass plus positional demultiplexing of the outputs.
async fn execute(core: &SchedulerCore, batch: Batch) {
    let slots: Vec<BatchSlot> = batch
        .jobs
        .iter()
        .map(|job| BatchSlot {
            input: job.input.clone(),
            token_sink: job.token_sink.clone(),
        })
        .collect();

    match core.executor.execute(&batch.handle, &slots).await {
        Ok(outputs) if outputs.len() == batch.jobs.len() => {
            for (job, output) in batch.jobs.into_iter().zip(outputs) {
                if core.cancelled.remove(&job.id).is_some() {
                    // Computed but discarded: cancellation arrived mid-pass.
                    core.metrics.record_job_failed();
                    job.resolve(Err(PipelineError::Cancelled));
                } else {
                    core.metrics.record_job_completed();
                    job.resolve(Ok(output));
                }
            }
        }
        Ok(outputs) => {
            let message = format!(
                "model {} returned {} outputs for {} jobs",
                batch.handle.name,
                outputs.len(),
                batch.jobs.len()
            );
            error!(model = %batch.handle.name, %message, "batch output arity mismatch");
            fail_all(core, batch.jobs, message);
        }
        Err(fault) => {
            error!(model = %batch.handle.name, fault = %fault, "forward pass failed");
            fail_all(core, batch.jobs, fault.to_string());
        }
    }
}

fn fail_all(core: &SchedulerCore, jobs: Vec<QueuedJob>, message: String) {
    for job in jobs {
        core.cancelled.remove(&job.id);
        core.metrics.record_job_failed();
        job.resolve(Err(PipelineError::BatchExecution(message.clone())));
    }
}
