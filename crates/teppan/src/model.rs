//! Model kinds, handles, payloads, and the executor seam.
//!
//! Models are opaque inference units: the pipeline only knows a model's
//! declared contract (`ModelKind` decides input/output shape) and its
//! declared cost (`memory_footprint_bytes`, `approx_latency_per_item`),
//! which the scheduler uses for admission decisions. The actual forward
//! pass lives behind the [`ModelExecutor`] trait.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::ExecutionFault;

/// The three model families the pipeline multiplexes over shared devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Speech-to-text: audio bytes in, transcript out.
    Transcriber,
    /// Sentence embedding: text in, fixed-dimension vector out.
    Embedder,
    /// Generative language model: prompt in, streamed text out.
    Generator,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::Transcriber,
        ModelKind::Embedder,
        ModelKind::Generator,
    ];
}

/// Identifier of an accelerator the registry knows about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

/// Immutable description of a loaded model.
///
/// Built once by the registry and shared read-only (`Arc`) with the
/// scheduler and batch executor for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub name: String,
    pub kind: ModelKind,
    pub device: DeviceId,
    pub max_batch_size: usize,
    pub max_sequence_length: usize,
    pub approx_latency_per_item: Duration,
    pub memory_footprint_bytes: u64,
}

fn default_max_batch_size() -> usize {
    8
}

fn default_max_sequence_length() -> usize {
    4096
}

fn default_approx_latency_ms() -> u64 {
    50
}

/// One entry of the registry's startup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub kind: ModelKind,
    pub device: DeviceId,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
    #[serde(default = "default_approx_latency_ms")]
    pub approx_latency_ms: u64,
    pub memory_footprint_bytes: u64,
}

impl From<&ModelSpec> for ModelHandle {
    fn from(spec: &ModelSpec) -> Self {
        ModelHandle {
            name: spec.name.clone(),
            kind: spec.kind,
            device: spec.device.clone(),
            max_batch_size: spec.max_batch_size,
            max_sequence_length: spec.max_sequence_length,
            approx_latency_per_item: Duration::from_millis(spec.approx_latency_ms),
            memory_footprint_bytes: spec.memory_footprint_bytes,
        }
    }
}

/// Declared memory budget of one accelerator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: DeviceId,
    pub memory_budget_bytes: u64,
}

/// Payload of a single inference job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobInput {
    /// Raw audio bytes for a transcriber.
    Audio(Vec<u8>),
    /// Text for an embedder.
    Text(String),
    /// Fully constructed prompt for a generator.
    Prompt(String),
}

impl JobInput {
    /// Length in the unit the sequence limit is declared in: bytes for
    /// audio, characters for text and prompts.
    pub fn len(&self) -> usize {
        match self {
            JobInput::Audio(bytes) => bytes.len(),
            JobInput::Text(s) | JobInput::Prompt(s) => s.chars().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rough resident size used by admission control alongside the model's
    /// per-item footprint.
    pub fn approx_bytes(&self) -> u64 {
        match self {
            JobInput::Audio(bytes) => bytes.len() as u64,
            JobInput::Text(s) | JobInput::Prompt(s) => s.len() as u64,
        }
    }
}

/// Result of a single inference job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Transcript(String),
    Embedding(Vec<f32>),
    Generated(String),
}

impl JobOutput {
    pub fn as_transcript(&self) -> Option<&str> {
        match self {
            JobOutput::Transcript(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_embedding(&self) -> Option<&[f32]> {
        match self {
            JobOutput::Embedding(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_generated(&self) -> Option<&str> {
        match self {
            JobOutput::Generated(s) => Some(s),
            _ => None,
        }
    }

    /// Approximate size for cache byte accounting.
    pub fn approx_bytes(&self) -> u64 {
        match self {
            JobOutput::Transcript(s) | JobOutput::Generated(s) => s.len() as u64,
            JobOutput::Embedding(v) => (v.len() * std::mem::size_of::<f32>()) as u64,
        }
    }
}

/// One slot of a batch as seen by a [`ModelExecutor`].
///
/// Generator slots carry a token sink; the executor is expected to push
/// increments through it as they are produced, before returning the full
/// output for the slot.
pub struct BatchSlot {
    pub input: JobInput,
    pub token_sink: Option<UnboundedSender<String>>,
}

/// The forward-pass seam.
///
/// One call processes one batch of same-kind jobs on the handle's device and
/// returns exactly one output per slot, in slot order. An `Err` fails the
/// whole batch; per-slot problems must be encoded in the slot's output by
/// the implementation (the pipeline itself already rejects over-length
/// inputs before they reach the executor).
#[async_trait]
pub trait ModelExecutor: Send + Sync {
    async fn execute(
        &self,
        handle: &ModelHandle,
        batch: &[BatchSlot],
    ) -> Result<Vec<JobOutput>, ExecutionFault>;
}

/// Embedding payload attached to an indexed document.
pub type Metadata = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_len_counts_chars_not_bytes() {
        let input = JobInput::Text("héllo".to_string());
        assert_eq!(input.len(), 5);
        assert_eq!(input.approx_bytes(), 6);
    }

    #[test]
    fn spec_defaults_apply() {
        let spec: ModelSpec = serde_json::from_str(
            r#"{"name":"whisper-small","kind":"transcriber","device":"gpu0","memory_footprint_bytes":1000000}"#,
        )
        .unwrap();
        assert_eq!(spec.max_batch_size, 8);
        assert_eq!(spec.max_sequence_length, 4096);
        let handle = ModelHandle::from(&spec);
        assert_eq!(handle.approx_latency_per_item, Duration::from_millis(50));
        assert_eq!(handle.kind, ModelKind::Transcriber);
    }
}
