//! Mock model executor for tests.
//!
//! Transcription is lossy UTF-8 decoding, embeddings are deterministic
//! bag-of-words vectors so texts sharing words land close under cosine
//! similarity, and generation quotes the first context line while streaming
//! the answer token by token.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ExecutionFault;
use crate::model::{BatchSlot, JobInput, JobOutput, ModelExecutor, ModelHandle, ModelKind};

pub(crate) const EMBED_DIM: usize = 8;

/// Hashes each word into one of `EMBED_DIM` buckets.
pub(crate) fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBED_DIM];
    for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        vector[(hasher.finish() % EMBED_DIM as u64) as usize] += 1.0;
    }
    vector
}

fn answer_from_prompt(prompt: &str) -> String {
    let context_line = prompt
        .split_once("Context:\n")
        .map(|(_, rest)| rest.lines().next().unwrap_or(""))
        .unwrap_or("");
    format!("Based on the context: {context_line}")
}

#[derive(Default)]
pub(crate) struct MockExecutor {
    pub transcriptions: AtomicU32,
    pub execute_calls: AtomicU32,
    pub batch_sizes: Mutex<Vec<usize>>,
    /// When set, the next pass fails and the flag clears.
    pub fail_next: AtomicBool,
    /// When set, the generator returns answers without streaming tokens.
    pub mute_tokens: AtomicBool,
}

#[async_trait]
impl ModelExecutor for MockExecutor {
    async fn execute(
        &self,
        handle: &ModelHandle,
        batch: &[BatchSlot],
    ) -> Result<Vec<JobOutput>, ExecutionFault> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(batch.len());
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ExecutionFault("simulated device fault".into()));
        }

        let mut outputs = Vec::with_capacity(batch.len());
        for slot in batch {
            let output = match (handle.kind, &slot.input) {
                (ModelKind::Transcriber, JobInput::Audio(bytes)) => {
                    self.transcriptions.fetch_add(1, Ordering::SeqCst);
                    JobOutput::Transcript(String::from_utf8_lossy(bytes).into_owned())
                }
                (ModelKind::Embedder, JobInput::Text(text)) => JobOutput::Embedding(embed(text)),
                (ModelKind::Generator, JobInput::Prompt(prompt)) => {
                    let answer = answer_from_prompt(prompt);
                    if !self.mute_tokens.load(Ordering::SeqCst) {
                        if let Some(sink) = &slot.token_sink {
                            for token in answer.split_inclusive(' ') {
                                let _ = sink.send(token.to_string());
                            }
                        }
                    }
                    JobOutput::Generated(answer)
                }
                (kind, input) => {
                    return Err(ExecutionFault(format!(
                        "unexpected {input:?} for {kind:?} model"
                    )))
                }
            };
            outputs.push(output);
        }
        Ok(outputs)
    }
}
