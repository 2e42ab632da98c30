//! # Teppan
//!
//! A GPU-shared multimodal inference and retrieval pipeline: audio or text
//! requests are transcribed, embedded, matched against a versioned vector
//! index, and answered by a generator model, with every stage's GPU work
//! flowing through one shared batching scheduler.
//!
//! ## Overview
//!
//! The pipeline multiplexes heterogeneous models (speech-to-text, embedding,
//! text generation) over a small pool of accelerator devices. Requests are
//! batched per model to amortize forward-pass overhead, admitted against
//! each device's declared memory budget, and cached by content hash so
//! identical payloads reach a GPU once.
//!
//! Key components include:
//!
//! - [`registry::ModelRegistry`]: declared models, their devices, and
//!   per-device memory budgets
//! - [`scheduler::Scheduler`]: priority queues per (model kind, device) and
//!   one dispatch task per device
//! - [`index::VectorIndex`]: brute-force similarity search with snapshot
//!   reads, tombstoned deletes, and background compaction
//! - [`cache::InferenceCache`]: single-flight, LRU-bounded memoization of
//!   transcription and embedding results
//! - [`orchestrator::Orchestrator`]: the request state machine tying the
//!   stages together and streaming events to the caller
//!
//! ## Architecture
//!
//! Callers never touch devices directly. The orchestrator decomposes a
//! request into per-stage jobs and submits them to the scheduler, which is
//! the sole arbiter of accelerator time and memory. Model execution itself
//! is behind the [`model::ModelExecutor`] trait, so the pipeline logic is
//! independent of any particular inference runtime.

pub mod cache;
pub mod config;
pub mod error;
mod executor;
pub mod index;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod mock;

pub use error::PipelineError;
pub use orchestrator::{Orchestrator, PipelineEvent, RequestOptions, RequestPayload};
