//! Canned provider client for tests and offline development. Grounded on the
//! teacher's `MockLlm` (fixed response, no network): returns a configured
//! response string and, when asked for log-probs, a synthetic high-confidence
//! distribution so callers can exercise the Confidence Engine's log-prob path
//! without a live model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::StreamExt;

use crate::error::ProviderError;

use super::{
    ChunkStream, FinishReason, GenerateChunk, GenerateParams, GenerateResult,
    GenerateWithLogProbsResult, ModelProviderClient, TokenLogProb,
};

/// Fixed-response provider client. `responses` is consumed round-robin so a
/// test can script a short conversation; the last response repeats once
/// exhausted.
pub struct MockProviderClient {
    responses: Vec<String>,
    cursor: AtomicUsize,
    embedding_dim: usize,
}

impl MockProviderClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            cursor: AtomicUsize::new(0),
            embedding_dim: 8,
        }
    }

    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    fn next_response(&self) -> String {
        if self.responses.is_empty() {
            return String::new();
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.responses[idx.min(self.responses.len() - 1)].clone()
    }
}

#[async_trait]
impl ModelProviderClient for MockProviderClient {
    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerateParams,
        _timeout: Duration,
    ) -> Result<GenerateResult, ProviderError> {
        let text = self.next_response();
        Ok(GenerateResult {
            tokens_in: 16,
            tokens_out: (text.split_whitespace().count() as u32).max(1),
            text,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _params: &GenerateParams,
    ) -> Result<ChunkStream, ProviderError> {
        let text = self.next_response();
        let words: Vec<String> = text.split_whitespace().map(|w| format!("{w} ")).collect();
        let stream = tokio_stream::iter(words.into_iter().map(|w| {
            Ok(GenerateChunk {
                delta_text: w,
                token_info: None,
            })
        }));
        Ok(Box::pin(stream.throttle(Duration::from_millis(1))))
    }

    async fn generate_with_log_probs(
        &self,
        _prompt: &str,
        _params: &GenerateParams,
        _timeout: Duration,
    ) -> Result<GenerateWithLogProbsResult, ProviderError> {
        let text = self.next_response();
        let log_probs = text
            .split_whitespace()
            .map(|token| TokenLogProb {
                token: token.to_string(),
                logprob: -0.05,
            })
            .collect();
        Ok(GenerateWithLogProbsResult {
            text,
            log_probs: Some(log_probs),
        })
    }

    async fn embed(&self, texts: &[String], _timeout: Duration) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; self.embedding_dim];
                for (i, b) in t.bytes().enumerate() {
                    v[i % self.embedding_dim] += b as f32 / 255.0;
                }
                v
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_returns_configured_response() {
        let client = MockProviderClient::fixed("Paris is the capital of France.");
        let result = client
            .generate("summarize", &GenerateParams::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.text, "Paris is the capital of France.");
        assert_eq!(result.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn embed_is_deterministic_for_same_text() {
        let client = MockProviderClient::fixed("x");
        let a = client.embed(&["hello".to_string()], Duration::from_secs(1)).await.unwrap();
        let b = client.embed(&["hello".to_string()], Duration::from_secs(1)).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn log_probs_are_present_for_mock_backend() {
        let client = MockProviderClient::fixed("a b c");
        let result = client
            .generate_with_log_probs("q", &GenerateParams::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.log_probs.is_some());
        assert_eq!(result.log_probs.unwrap().len(), 3);
    }
}
