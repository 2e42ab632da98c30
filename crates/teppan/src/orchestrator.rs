//! End-to-end pipeline coordination.
//!
//! A request moves through `Received → Transcribing (audio only) →
//! Embedding → Retrieving → Generating → Streaming → Completed`, with
//! `Failed` reachable from any non-terminal state and `Cancelled` as a
//! separate terminal state. Each stage submits work to the scheduler and
//! suspends until the ticket resolves; the orchestrator never holds GPU
//! resources itself. Transcription and embedding are intercepted by the
//! content-addressed cache before they reach the scheduler. Generated
//! tokens are forwarded to the caller as they arrive.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{content_hash, InferenceCache};
use crate::config::PromptOptions;
use crate::error::PipelineError;
use crate::index::VectorIndex;
use crate::model::{JobInput, JobOutput, Metadata, ModelKind};
use crate::scheduler::{InferenceJob, JobId, Scheduler};
use crate::telemetry::MetricsCollector;

/// Unique identifier of a pipeline request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Pipeline position of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Transcribing,
    Embedding,
    Retrieving,
    Generating,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// One retrieved context chunk attached to an answer.
#[derive(Debug, Clone)]
pub struct SourceChunk {
    pub doc_id: u64,
    pub text: Option<String>,
    pub score: f32,
}

/// Events delivered to the caller over a request's lifetime.
///
/// Non-terminal transitions arrive as `Stage`; tokens stream as `Token`
/// during generation; exactly one of `Completed`, `Failed`, or `Cancelled`
/// ends the stream.
#[derive(Debug)]
pub enum PipelineEvent {
    Stage(RequestStage),
    Token(String),
    Completed {
        answer: String,
        sources: Vec<SourceChunk>,
    },
    Failed(PipelineError),
    Cancelled,
}

/// Stream of [`PipelineEvent`]s backed by an unbounded channel receiver.
pub struct EventStream {
    receiver: UnboundedReceiver<PipelineEvent>,
}

impl EventStream {
    fn new(receiver: UnboundedReceiver<PipelineEvent>) -> Self {
        Self { receiver }
    }
}

impl Stream for EventStream {
    type Item = PipelineEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_recv(cx)
    }
}

/// Handle returned from [`Orchestrator::submit_request`].
pub struct RequestTicket {
    id: RequestId,
    pub events: EventStream,
}

impl RequestTicket {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

/// Caller input: raw audio to transcribe first, or text to embed directly.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    Audio(Vec<u8>),
    Text(String),
}

/// Per-request knobs, typically derived from caller identity and quota by
/// the layer above.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Override for the configured retrieval window.
    pub top_k: Option<usize>,
    pub priority: u8,
    pub deadline: Option<Instant>,
    /// Named generator; `None` uses the registry default.
    pub generator_model: Option<String>,
}

struct CancelHandle {
    trigger: watch::Sender<bool>,
}

pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    index: Arc<VectorIndex>,
    cache: Arc<InferenceCache>,
    prompt: PromptOptions,
    cancellations: Arc<DashMap<RequestId, CancelHandle>>,
    metrics: Arc<MetricsCollector>,
}

/// Why a request stopped before producing an answer.
enum Terminal {
    Cancelled,
    Failed(PipelineError),
}

struct Finished {
    answer: String,
    sources: Vec<SourceChunk>,
}

impl Orchestrator {
    pub fn new(
        scheduler: Arc<Scheduler>,
        index: Arc<VectorIndex>,
        cache: Arc<InferenceCache>,
        prompt: PromptOptions,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            scheduler,
            index,
            cache,
            prompt,
            cancellations: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Starts a request and returns a ticket streaming its events.
    ///
    /// The returned stream always ends with exactly one terminal event.
    pub fn submit_request(&self, payload: RequestPayload, options: RequestOptions) -> RequestTicket {
        let id = RequestId(Uuid::new_v4());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancellations
            .insert(id, CancelHandle { trigger: cancel_tx });

        let ctx = RequestCtx {
            id,
            scheduler: self.scheduler.clone(),
            index: self.index.clone(),
            cache: self.cache.clone(),
            prompt: self.prompt.clone(),
            options,
            events: events_tx,
            cancel_rx,
            current_job: Arc::new(Mutex::new(None)),
        };
        let cancellations = self.cancellations.clone();
        tokio::spawn(async move {
            ctx.run(payload).await;
            cancellations.remove(&id);
        });

        RequestTicket {
            id,
            events: EventStream::new(events_rx),
        }
    }

    /// Cancels a request: the stage currently in flight is cancelled at the
    /// scheduler and later stages never start.
    pub fn cancel(&self, id: RequestId) {
        if let Some(handle) = self.cancellations.get(&id) {
            let _ = handle.trigger.send(true);
            debug!(request_id = %id, "request cancellation requested");
        }
    }

    /// Embeds a document through the pipeline and inserts it into the
    /// index. The text is kept in the record metadata so retrieval can
    /// quote it as a source.
    pub async fn ingest(
        &self,
        doc_id: u64,
        text: &str,
        mut metadata: Metadata,
    ) -> Result<u64, PipelineError> {
        let scheduler = self.scheduler.clone();
        let input = text.to_string();
        let output = self
            .cache
            .get_or_compute(content_hash(text.as_bytes()), ModelKind::Embedder, || async move {
                scheduler
                    .submit(InferenceJob::new(ModelKind::Embedder, JobInput::Text(input)))
                    .await?
                    .await
            })
            .await?;
        let vector = expect_embedding(&output)?.to_vec();

        metadata
            .entry("text".to_string())
            .or_insert_with(|| text.to_string());
        self.index.insert(doc_id, vector, metadata).await
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}

/// Everything a spawned request task needs, detached from the orchestrator.
struct RequestCtx {
    id: RequestId,
    scheduler: Arc<Scheduler>,
    index: Arc<VectorIndex>,
    cache: Arc<InferenceCache>,
    prompt: PromptOptions,
    options: RequestOptions,
    events: UnboundedSender<PipelineEvent>,
    cancel_rx: watch::Receiver<bool>,
    /// Job currently in flight for this request, so cancellation can be
    /// forwarded to the scheduler.
    current_job: Arc<Mutex<Option<JobId>>>,
}

impl RequestCtx {
    async fn run(mut self, payload: RequestPayload) {
        self.transition(RequestStage::Received);
        match self.drive(payload).await {
            Ok(finished) => {
                info!(request_id = %self.id, "request completed");
                self.emit(PipelineEvent::Completed {
                    answer: finished.answer,
                    sources: finished.sources,
                });
            }
            Err(Terminal::Cancelled) => {
                info!(request_id = %self.id, "request cancelled");
                self.emit(PipelineEvent::Cancelled);
            }
            Err(Terminal::Failed(err)) => {
                info!(request_id = %self.id, error = %err, "request failed");
                self.emit(PipelineEvent::Failed(err));
            }
        }
    }

    async fn drive(&mut self, payload: RequestPayload) -> Result<Finished, Terminal> {
        let question = match payload {
            RequestPayload::Text(text) => text,
            RequestPayload::Audio(bytes) => {
                self.transition(RequestStage::Transcribing);
                let output = self.cached_stage(ModelKind::Transcriber, bytes).await?;
                output
                    .as_transcript()
                    .ok_or_else(|| Terminal::Failed(mismatched(ModelKind::Transcriber)))?
                    .to_string()
            }
        };

        self.transition(RequestStage::Embedding);
        let output = self
            .cached_stage(ModelKind::Embedder, question.clone().into_bytes())
            .await?;
        let embedding = expect_embedding(&output)
            .map_err(Terminal::Failed)?
            .to_vec();

        self.transition(RequestStage::Retrieving);
        let top_k = self.options.top_k.unwrap_or(self.prompt.top_k);
        let snapshot = self.index.snapshot().await;
        let hits = snapshot.search(&embedding, top_k).map_err(Terminal::Failed)?;
        if hits.is_empty() {
            // Nothing to ground the answer in; skip generation entirely.
            return Ok(Finished {
                answer: self.prompt.no_context_answer.clone(),
                sources: Vec::new(),
            });
        }
        let sources: Vec<SourceChunk> = hits
            .iter()
            .map(|hit| SourceChunk {
                doc_id: hit.doc_id,
                text: snapshot
                    .metadata(hit.doc_id)
                    .and_then(|m| m.get("text").cloned()),
                score: hit.score,
            })
            .collect();

        self.transition(RequestStage::Generating);
        let chunks: Vec<&str> = sources
            .iter()
            .filter_map(|s| s.text.as_deref())
            .collect();
        let prompt_text = self.prompt.render(&question, &chunks);

        let (token_tx, mut token_rx) = mpsc::unbounded_channel::<String>();
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(token) = token_rx.recv().await {
                let _ = events.send(PipelineEvent::Token(token));
            }
        });

        let mut job = InferenceJob::new(ModelKind::Generator, JobInput::Prompt(prompt_text))
            .with_priority(self.options.priority)
            .with_token_sink(token_tx);
        if let Some(deadline) = self.options.deadline {
            job = job.with_deadline(deadline);
        }
        if let Some(name) = &self.options.generator_model {
            job = job.with_model(name.clone());
        }
        // Entered before the ticket resolves so the stage is reached even
        // when the generator never pushes incremental tokens.
        self.transition(RequestStage::Streaming);
        let output = self.await_job(job).await;
        // All token sinks are dropped once the pass resolves; drain the
        // forwarder before emitting the terminal event.
        let _ = forwarder.await;
        let output = output?;
        let answer = output
            .as_generated()
            .ok_or_else(|| Terminal::Failed(mismatched(ModelKind::Generator)))?
            .to_string();

        Ok(Finished { answer, sources })
    }

    /// Runs a cacheable stage (transcription or embedding) through the
    /// single-flight cache; the scheduler is only reached on a miss.
    async fn cached_stage(
        &mut self,
        kind: ModelKind,
        payload: Vec<u8>,
    ) -> Result<Arc<JobOutput>, Terminal> {
        let hash = content_hash(&payload);
        let scheduler = self.scheduler.clone();
        let current_job = self.current_job.clone();
        let input = match kind {
            ModelKind::Transcriber => JobInput::Audio(payload),
            // Cached payloads are UTF-8 by construction for the embedder.
            _ => JobInput::Text(String::from_utf8_lossy(&payload).into_owned()),
        };

        let compute = || async move {
            let ticket = scheduler.submit(InferenceJob::new(kind, input)).await?;
            *current_job.lock().await = Some(ticket.id());
            let result = ticket.await;
            *current_job.lock().await = None;
            result
        };

        let cache = self.cache.clone();
        let fut = cache.get_or_compute(hash, kind, compute);
        tokio::pin!(fut);
        tokio::select! {
            result = &mut fut => result.map_err(Terminal::Failed),
            _ = self.cancel_rx.changed() => {
                if let Some(id) = self.current_job.lock().await.take() {
                    self.scheduler.cancel(id);
                }
                Err(Terminal::Cancelled)
            }
        }
    }

    /// Submits a non-cacheable job (generation) and waits for it, reacting
    /// to cancellation.
    async fn await_job(&mut self, job: InferenceJob) -> Result<JobOutput, Terminal> {
        let ticket = self
            .scheduler
            .submit(job)
            .await
            .map_err(Terminal::Failed)?;
        let id = ticket.id();
        *self.current_job.lock().await = Some(id);
        let result = tokio::select! {
            result = ticket => {
                result.map_err(Terminal::Failed)
            }
            _ = self.cancel_rx.changed() => {
                self.scheduler.cancel(id);
                Err(Terminal::Cancelled)
            }
        };
        *self.current_job.lock().await = None;
        result
    }

    fn transition(&self, stage: RequestStage) {
        debug!(request_id = %self.id, stage = ?stage, "stage transition");
        self.emit(PipelineEvent::Stage(stage));
    }

    fn emit(&self, event: PipelineEvent) {
        // A dropped ticket just means nobody is listening anymore.
        let _ = self.events.send(event);
    }
}

fn mismatched(kind: ModelKind) -> PipelineError {
    PipelineError::BatchExecution(format!("{kind:?} model produced mismatched output"))
}

fn expect_embedding(output: &JobOutput) -> Result<&[f32], PipelineError> {
    output
        .as_embedding()
        .ok_or_else(|| mismatched(ModelKind::Embedder))
}
