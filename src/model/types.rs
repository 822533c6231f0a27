use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub max_new_tokens: usize,
    /// `0.0` selects greedy decoding.
    pub temperature: f64,
    pub top_k: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub tokens_generated: usize,
    /// True when generation stopped on the token budget rather than a stop token.
    pub truncated: bool,
    pub total_time_ms: u128,
    pub tokens_per_second: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub base_model: String,
    pub adapter: Option<String>,
    pub merged_modules: usize,
    pub lora_rank: Option<usize>,
    pub device: String,
    pub size_bytes: u64,
}
