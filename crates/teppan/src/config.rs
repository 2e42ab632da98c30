//! Pipeline configuration.
//!
//! Everything here deserializes from the host application's configuration;
//! each field has a standalone default so partial configs stay valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_batch_window_ms() -> u64 {
    50
}

fn default_reject_limit() -> u32 {
    3
}

fn default_cache_budget_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_top_k() -> usize {
    3
}

fn default_tombstone_compact_ratio() -> f32 {
    0.2
}

/// Tunables for the scheduler, batch executor, cache, and index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long a device worker waits for more jobs before dispatching a
    /// partially filled batch. Bounds tail latency in low-traffic periods.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Consecutive admission rejections before a device is flagged
    /// saturated and `submit` starts shedding load.
    #[serde(default = "default_reject_limit")]
    pub consecutive_reject_limit: u32,

    /// Total byte budget for memoized transcription/embedding results.
    #[serde(default = "default_cache_budget_bytes")]
    pub cache_budget_bytes: u64,

    /// Tombstone-to-record ratio above which the index compacts itself.
    #[serde(default = "default_tombstone_compact_ratio")]
    pub tombstone_compact_ratio: f32,

    #[serde(default)]
    pub prompt: PromptOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes")
    }
}

impl PipelineConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

fn default_instruction() -> String {
    "Using the following context, answer the question. If the answer is not \
     explicitly in the context, state that you cannot answer based on the \
     provided context."
        .to_string()
}

fn default_no_context_answer() -> String {
    "No relevant context found.".to_string()
}

/// How retrieved context is folded into the generation prompt.
///
/// Context weighting is a fixed top-k window; there is deliberately no
/// learned or token-budget strategy here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptOptions {
    /// Number of nearest neighbors included as context.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Instruction header placed above the context block.
    #[serde(default = "default_instruction")]
    pub instruction: String,

    /// Answer returned when retrieval finds nothing; generation is skipped.
    #[serde(default = "default_no_context_answer")]
    pub no_context_answer: String,
}

impl Default for PromptOptions {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty options deserialize")
    }
}

impl PromptOptions {
    /// Renders the full prompt from the question and retrieved chunks.
    pub fn render(&self, question: &str, context_chunks: &[&str]) -> String {
        let context = context_chunks.join("\n\n");
        format!(
            "{}\n\nContext:\n{}\n\nQuestion: {}\nAnswer:",
            self.instruction, context, question
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty_object() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_window(), Duration::from_millis(50));
        assert_eq!(config.consecutive_reject_limit, 3);
        assert_eq!(config.prompt.top_k, 3);
    }

    #[test]
    fn prompt_render_contains_context_and_question() {
        let options = PromptOptions::default();
        let prompt = options.render("capital of France?", &["Paris is the capital of France"]);
        assert!(prompt.contains("Context:\nParis is the capital of France"));
        assert!(prompt.contains("Question: capital of France?"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"batch_window_ms": 10}"#).unwrap();
        assert_eq!(config.batch_window(), Duration::from_millis(10));
        assert_eq!(config.cache_budget_bytes, 64 * 1024 * 1024);
    }
}
