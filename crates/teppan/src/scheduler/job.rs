//! Job descriptions, queue entries, and the caller-facing ticket.

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::model::{JobInput, JobOutput, ModelHandle, ModelKind};

/// Unique identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of inference work handed to the scheduler.
pub struct InferenceJob {
    pub kind: ModelKind,
    /// Specific model name; `None` resolves the kind's default.
    pub model: Option<String>,
    pub input: JobInput,
    /// Higher runs earlier among jobs with equal deadlines.
    pub priority: u8,
    pub deadline: Option<Instant>,
    /// Sink for incremental generator output.
    pub token_sink: Option<UnboundedSender<String>>,
}

impl InferenceJob {
    pub fn new(kind: ModelKind, input: JobInput) -> Self {
        Self {
            kind,
            model: None,
            input,
            priority: 0,
            deadline: None,
            token_sink: None,
        }
    }

    pub fn with_model(mut self, name: impl Into<String>) -> Self {
        self.model = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_token_sink(mut self, sink: UnboundedSender<String>) -> Self {
        self.token_sink = Some(sink);
        self
    }
}

/// A job as it sits in a device queue: resolved handle plus the channel the
/// result travels back on.
pub(crate) struct QueuedJob {
    pub id: JobId,
    pub handle: Arc<ModelHandle>,
    pub input: JobInput,
    pub token_sink: Option<UnboundedSender<String>>,
    pub priority: u8,
    pub deadline: Option<Instant>,
    pub submitted_at: Instant,
    tx: oneshot::Sender<Result<JobOutput, PipelineError>>,
}

impl QueuedJob {
    pub fn new(
        id: JobId,
        handle: Arc<ModelHandle>,
        job: InferenceJob,
        tx: oneshot::Sender<Result<JobOutput, PipelineError>>,
    ) -> Self {
        Self {
            id,
            handle,
            input: job.input,
            token_sink: job.token_sink,
            priority: job.priority,
            deadline: job.deadline,
            submitted_at: Instant::now(),
            tx,
        }
    }

    /// Delivers the job's result. A dropped ticket is not an error.
    pub fn resolve(self, result: Result<JobOutput, PipelineError>) {
        let _ = self.tx.send(result);
    }

    pub fn past_deadline(&self, now: Instant) -> bool {
        self.deadline.map(|d| d <= now).unwrap_or(false)
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    /// `BinaryHeap` pops the greatest element, so "greater" means "runs
    /// first": earliest deadline, then highest priority, then earliest
    /// submission. Jobs with a deadline outrank jobs without one.
    fn cmp(&self, other: &Self) -> Ordering {
        let by_deadline = match (self.deadline, other.deadline) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        by_deadline
            .then(self.priority.cmp(&other.priority))
            .then(other.submitted_at.cmp(&self.submitted_at))
    }
}

/// Handle to a submitted job's eventual result.
///
/// Resolves when the job completes, fails, is cancelled, or misses its
/// deadline. Dropping the ticket does not cancel the job; use
/// [`Scheduler::cancel`] for that.
///
/// [`Scheduler::cancel`]: crate::scheduler::Scheduler::cancel
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    receiver: oneshot::Receiver<Result<JobOutput, PipelineError>>,
}

impl JobTicket {
    pub(crate) fn new(
        id: JobId,
        receiver: oneshot::Receiver<Result<JobOutput, PipelineError>>,
    ) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> JobId {
        self.id
    }
}

impl Future for JobTicket {
    type Output = Result<JobOutput, PipelineError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PipelineError::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
