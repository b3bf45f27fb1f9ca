//! Model Provider Client: generate text (streamed or not), produce
//! embeddings, and expose per-token log-probabilities when the backend
//! supports them. The trait is the real contract (spec §1 treats the LLM
//! runtime as an external collaborator); [`OpenAiProviderClient`] is one
//! concrete backend, [`MockProviderClient`] is the reference used by tests
//! and by callers that don't need a live model.

pub mod retry;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ProviderError;

/// Parameters recognized by every provider call (spec §4.A).
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub seed: Option<u64>,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            top_p: 1.0,
            max_output_tokens: 1024,
            stop_sequences: Vec::new(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub finish_reason: FinishReason,
}

/// One token's log-probability, present only when the backend reports it.
#[derive(Debug, Clone)]
pub struct TokenLogProb {
    pub token: String,
    pub logprob: f64,
}

#[derive(Debug, Clone)]
pub struct GenerateWithLogProbsResult {
    pub text: String,
    /// `None` when the backend doesn't support log-probs; the Confidence
    /// Engine must degrade to surface-feature estimation in that case.
    pub log_probs: Option<Vec<TokenLogProb>>,
}

/// One chunk of a streamed generation. The stream is finite, not
/// restartable, and stops delivering once the caller drops it or its
/// cancellation token fires.
#[derive(Debug, Clone)]
pub struct GenerateChunk {
    pub delta_text: String,
    pub token_info: Option<TokenLogProb>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<GenerateChunk, ProviderError>> + Send>>;

/// Contract for a language model backend: generate (blocking or streamed,
/// with or without log-probs) and embed. Every suspension point accepts a
/// deadline the caller enforces with hard cancellation (spec §4.A); this
/// trait's methods themselves take a `timeout` and race it internally so
/// callers never need their own `tokio::time::timeout` wrapper.
#[async_trait]
pub trait ModelProviderClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
        timeout: Duration,
    ) -> Result<GenerateResult, ProviderError>;

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<ChunkStream, ProviderError>;

    async fn generate_with_log_probs(
        &self,
        prompt: &str,
        params: &GenerateParams,
        timeout: Duration,
    ) -> Result<GenerateWithLogProbsResult, ProviderError>;

    async fn embed(&self, texts: &[String], timeout: Duration) -> Result<Vec<Vec<f32>>, ProviderError>;
}

mod mock;
mod openai;

pub use mock::MockProviderClient;
pub use openai::OpenAiProviderClient;
