//! Sole arbiter of accelerator time and memory.
//!
//! The scheduler owns one priority queue per (model kind, device) pair and
//! one background dispatch task per device. `submit` only touches in-memory
//! queues under short-held locks and returns a ticket immediately; the
//! device task forms batches, runs admission control against the device's
//! declared memory budget, and hands batches to the executor. A device runs
//! exactly one forward pass at a time; different devices proceed in
//! parallel. Kinds sharing a device are served round-robin so none starves.

mod job;
mod worker;

pub use job::{InferenceJob, JobId, JobTicket};
pub(crate) use job::QueuedJob;

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::executor;
use crate::model::{DeviceId, ModelExecutor, ModelKind};
use crate::registry::ModelRegistry;
use crate::telemetry::MetricsCollector;
use worker::{timeout_await_notifier, DeviceWorkerHandle};

/// Per-device admission bookkeeping. `in_use_bytes` is the single source of
/// truth for admission and is updated on batch dispatch and completion.
pub(crate) struct DeviceState {
    pub id: DeviceId,
    pub budget_bytes: u64,
    pub in_use_bytes: AtomicU64,
    pub saturated: AtomicBool,
    pub consecutive_rejections: AtomicU32,
}

impl DeviceState {
    fn new(id: DeviceId, budget_bytes: u64) -> Self {
        Self {
            id,
            budget_bytes,
            in_use_bytes: AtomicU64::new(0),
            saturated: AtomicBool::new(false),
            consecutive_rejections: AtomicU32::new(0),
        }
    }

    pub fn reserve(&self, bytes: u64) {
        self.in_use_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn release(&self, bytes: u64) {
        self.in_use_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// State shared between the public scheduler handle and the device tasks.
pub(crate) struct SchedulerCore {
    pub registry: Arc<ModelRegistry>,
    pub executor: Arc<dyn ModelExecutor>,
    queues: HashMap<(ModelKind, DeviceId), Mutex<BinaryHeap<QueuedJob>>>,
    pub cancelled: DashSet<JobId>,
    pub devices: HashMap<DeviceId, DeviceState>,
    pub batch_window: Duration,
    pub reject_limit: u32,
    pub metrics: Arc<MetricsCollector>,
}

impl SchedulerCore {
    pub fn queue(
        &self,
        kind: ModelKind,
        device: &DeviceId,
    ) -> Option<&Mutex<BinaryHeap<QueuedJob>>> {
        self.queues.get(&(kind, device.clone()))
    }
}

pub struct Scheduler {
    core: Arc<SchedulerCore>,
    workers: HashMap<DeviceId, DeviceWorkerHandle>,
}

impl Scheduler {
    /// Builds the queues and spawns one dispatch task per declared device.
    pub fn new(
        registry: Arc<ModelRegistry>,
        executor: Arc<dyn ModelExecutor>,
        config: &PipelineConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let mut queues = HashMap::new();
        let mut devices = HashMap::new();
        for device in registry.devices() {
            let budget = registry.memory_budget(device).unwrap_or(u64::MAX);
            devices.insert(device.clone(), DeviceState::new(device.clone(), budget));
            for kind in registry.kinds_on_device(device) {
                queues.insert((kind, device.clone()), Mutex::new(BinaryHeap::new()));
            }
        }

        let core = Arc::new(SchedulerCore {
            registry: registry.clone(),
            executor,
            queues,
            cancelled: DashSet::new(),
            devices,
            batch_window: config.batch_window(),
            reject_limit: config.consecutive_reject_limit,
            metrics,
        });

        let mut workers = HashMap::new();
        for device in registry.devices() {
            let core = core.clone();
            let device_id = device.clone();
            let worker = DeviceWorkerHandle::new(move |running, notifier| {
                tokio::spawn(async move {
                    device_loop(core, device_id, running, notifier).await;
                })
            });
            workers.insert(device.clone(), worker);
        }

        Self { core, workers }
    }

    /// Enqueues a job and returns immediately with a ticket for its result.
    ///
    /// Fails fast with `ModelNotFound` if no handle matches, or with
    /// `ResourceExhausted` while the target device is flagged saturated.
    pub async fn submit(&self, job: InferenceJob) -> Result<JobTicket, PipelineError> {
        let handle = self.core.registry.resolve(job.kind, job.model.as_deref())?;

        let device = self
            .core
            .devices
            .get(&handle.device)
            .ok_or_else(|| PipelineError::Config(format!("unknown device {}", handle.device)))?;
        if device.saturated.load(Ordering::SeqCst) {
            return Err(PipelineError::ResourceExhausted {
                device: device.id.to_string(),
            });
        }

        let id = JobId::new();
        let (tx, rx) = oneshot::channel();
        let queued = QueuedJob::new(id, handle.clone(), job, tx);
        {
            let queue = self
                .core
                .queue(handle.kind, &handle.device)
                .ok_or_else(|| {
                    PipelineError::Config(format!(
                        "no queue for {:?} on {}",
                        handle.kind, handle.device
                    ))
                })?;
            queue.lock().await.push(queued);
        }
        self.core.metrics.record_job_submitted();
        debug!(job_id = %id, kind = ?handle.kind, device = %handle.device, "job submitted");

        if let Some(worker) = self.workers.get(&handle.device) {
            worker.notify();
        }
        Ok(JobTicket::new(id, rx))
    }

    /// Marks a job cancelled.
    ///
    /// A job still queued is guaranteed never to dispatch; a job already in
    /// an in-flight batch keeps running and its result is discarded.
    pub fn cancel(&self, id: JobId) {
        self.core.cancelled.insert(id);
        debug!(job_id = %id, "job cancelled");
        for worker in self.workers.values() {
            worker.notify();
        }
    }

    /// Whether a device is currently shedding load.
    pub fn is_saturated(&self, device: &DeviceId) -> bool {
        self.core
            .devices
            .get(device)
            .map(|d| d.saturated.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// One device's dispatch loop: find a non-empty queue round-robin over the
/// kinds placed on this device, run one batch pass, repeat.
async fn device_loop(
    core: Arc<SchedulerCore>,
    device: DeviceId,
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
) {
    let kinds = core.registry.kinds_on_device(&device);
    if kinds.is_empty() {
        return;
    }
    let state = match core.devices.get(&device) {
        Some(state) => state,
        None => return,
    };
    let mut cursor = 0usize;

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let mut selected = None;
        for offset in 0..kinds.len() {
            let kind = kinds[(cursor + offset) % kinds.len()];
            if let Some(queue) = core.queue(kind, &device) {
                if !queue.lock().await.is_empty() {
                    selected = Some((kind, offset));
                    break;
                }
            }
        }

        let Some((kind, offset)) = selected else {
            // Queues drained and nothing in flight: whatever pressure set
            // the saturation flag is gone, so stop shedding load.
            if state.in_use_bytes.load(Ordering::SeqCst) == 0
                && state.saturated.swap(false, Ordering::SeqCst)
            {
                state.consecutive_rejections.store(0, Ordering::SeqCst);
                info!(device = %device, "device pressure cleared");
            }
            // No work; wait for a notification or re-check shortly.
            let _ = timeout_await_notifier(&notifier).await;
            continue;
        };
        cursor = (cursor + offset + 1) % kinds.len();

        executor::run_pass(&core, state, kind, &notifier).await;
    }
}
