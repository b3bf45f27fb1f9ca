//! OpenAI-compatible backend for [`ModelProviderClient`]. Chat completions
//! drive `generate`/`generate_with_log_probs`/`generate_stream`; the
//! embeddings endpoint drives `embed`. Grounded on the corpus's own
//! `async-openai`-backed chat model (request building, `with_retry` wrapping
//! every call, extracting `choice.logprobs`/`response.usage` from the
//! response) generalized to this crate's narrower trait.

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use tokio_stream::StreamExt;

use crate::error::ProviderError;

use super::retry::{retry_with_backoff, RetryConfig};
use super::{
    ChunkStream, FinishReason, GenerateChunk, GenerateParams, GenerateResult,
    GenerateWithLogProbsResult, ModelProviderClient, TokenLogProb,
};

/// Thin wrapper around `async_openai::Client<OpenAIConfig>`. Reads
/// `OPENAI_API_KEY`/`OPENAI_API_BASE` the way the client's default config
/// does; callers needing a different base (e.g. a local gateway) pass one in
/// via `with_config`.
pub struct OpenAiProviderClient {
    client: Client<OpenAIConfig>,
    retry: RetryConfig,
}

impl OpenAiProviderClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_config(config: OpenAIConfig) -> Self {
        Self {
            client: Client::with_config(config),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn build_request(
        &self,
        prompt: &str,
        params: &GenerateParams,
        logprobs: bool,
    ) -> Result<async_openai::types::CreateChatCompletionRequest, ProviderError> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content("You are a helpful assistant.")
            .build()
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(params.model.clone())
            .temperature(params.temperature)
            .top_p(params.top_p)
            .max_tokens(params.max_output_tokens)
            .messages(vec![system.into(), user.into()]);
        if !params.stop_sequences.is_empty() {
            builder.stop(params.stop_sequences.clone());
        }
        if logprobs {
            builder.logprobs(true);
        }
        if let Some(seed) = params.seed {
            builder.seed(seed as i64);
        }
        builder
            .build()
            .map_err(|e| ProviderError::Rejected(e.to_string()))
    }
}

impl Default for OpenAiProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProviderClient for OpenAiProviderClient {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
        timeout: Duration,
    ) -> Result<GenerateResult, ProviderError> {
        let request = self.build_request(prompt, params, false)?;
        let client = &self.client;
        let call = || {
            let request = request.clone();
            async move {
                tokio::time::timeout(timeout, client.chat().create(request))
                    .await
                    .map_err(|_| ProviderError::Timeout)?
                    .map_err(|e| ProviderError::Transient(e.to_string()))
            }
        };
        let response = retry_with_backoff(self.retry.clone(), call).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Rejected("empty choices".to_string()))?;
        let finish_reason = match choice.finish_reason {
            Some(async_openai::types::FinishReason::Length) => FinishReason::Length,
            Some(async_openai::types::FinishReason::ContentFilter) => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        };
        let usage = response.usage;
        Ok(GenerateResult {
            text: choice.message.content.unwrap_or_default(),
            tokens_in: usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            tokens_out: usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            finish_reason,
        })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<ChunkStream, ProviderError> {
        let request = self.build_request(prompt, params, false)?;
        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let mapped = stream.map(|item| match item {
            Ok(chunk) => {
                let delta = chunk
                    .choices
                    .first()
                    .and_then(|c| c.delta.content.clone())
                    .unwrap_or_default();
                Ok(GenerateChunk {
                    delta_text: delta,
                    token_info: None,
                })
            }
            Err(e) => Err(ProviderError::Transient(e.to_string())),
        });
        Ok(Box::pin(mapped))
    }

    async fn generate_with_log_probs(
        &self,
        prompt: &str,
        params: &GenerateParams,
        timeout: Duration,
    ) -> Result<GenerateWithLogProbsResult, ProviderError> {
        let request = self.build_request(prompt, params, true)?;
        let client = &self.client;
        let call = || {
            let request = request.clone();
            async move {
                tokio::time::timeout(timeout, client.chat().create(request))
                    .await
                    .map_err(|_| ProviderError::Timeout)?
                    .map_err(|e| ProviderError::Transient(e.to_string()))
            }
        };
        let response = retry_with_backoff(self.retry.clone(), call).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Rejected("empty choices".to_string()))?;

        // Not every deployment returns per-token logprobs even when requested;
        // the caller (Confidence Engine) must degrade gracefully on `None`.
        let log_probs = choice.logprobs.and_then(|lp| lp.content).map(|entries| {
            entries
                .into_iter()
                .map(|e| TokenLogProb {
                    token: e.token,
                    logprob: e.logprob,
                })
                .collect()
        });

        Ok(GenerateWithLogProbsResult {
            text: choice.message.content.unwrap_or_default(),
            log_probs,
        })
    }

    async fn embed(&self, texts: &[String], timeout: Duration) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model("text-embedding-3-small")
            .input(texts.to_vec())
            .build()
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;

        let client = &self.client;
        let call = || {
            let request = request.clone();
            async move {
                tokio::time::timeout(timeout, client.embeddings().create(request))
                    .await
                    .map_err(|_| ProviderError::Timeout)?
                    .map_err(|e| ProviderError::Transient(e.to_string()))
            }
        };
        let response = retry_with_backoff(self.retry.clone(), call).await?;
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}
