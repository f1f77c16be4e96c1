//! OpenAI 兼容 HTTP 实现

use crate::error::{ProviderError, Result};
use crate::llm::client::post;
use crate::llm::config::{ModelConfig, ModelsConfig};
use crate::llm::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, EmbeddingRequest,
    EmbeddingResponse,
};
use crate::llm::{Embedder, SummarizeOptions, Summarizer, assemble_req_header};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use tracing::debug;

pub const SUMMARIZER_ID: &str = "summarizer";
pub const EMBEDDER_ID: &str = "embedder";

/// `/chat/completions` 摘要
pub struct OpenAiSummarizer {
    client: Arc<Client>,
    model: ModelConfig,
    headers: HeaderMap,
}

impl OpenAiSummarizer {
    pub fn new(client: Arc<Client>, model: ModelConfig) -> Result<Self> {
        let headers = assemble_req_header(&model)?;
        Ok(Self {
            client,
            model,
            headers,
        })
    }

    /// 读取 `KAIRIX_MODEL_SUMMARIZER_*`
    pub fn from_models(client: Arc<Client>, models: &ModelsConfig) -> Result<Self> {
        Self::new(client, models.get(SUMMARIZER_ID)?)
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    fn name(&self) -> &str {
        &self.model.model
    }

    async fn summarize(
        &self,
        text: &str,
        options: &SummarizeOptions,
    ) -> std::result::Result<String, ProviderError> {
        let request_body = ChatCompletionRequest {
            model: self.model.model.clone(),
            messages: vec![
                ChatMessage::system(options.system_instruction.clone()),
                ChatMessage::user(text.to_string()),
            ],
            temperature: Some(options.temperature),
            max_tokens: Some(options.requested_tokens),
            stream: Some(false),
        };

        let response: ChatCompletionResponse = post(
            self.client.clone(),
            self.name(),
            &request_body,
            self.headers.clone(),
            &self.model.baseurl,
        )
        .await?;

        let summary = response
            .first_content()
            .ok_or_else(|| ProviderError::fatal(self.name(), "Empty completion"))?;
        debug!(model = %self.model.model, chars = summary.chars().count(), "摘要完成");
        Ok(summary)
    }
}

/// `/embeddings` 向量
pub struct OpenAiEmbedder {
    client: Arc<Client>,
    model: ModelConfig,
    headers: HeaderMap,
}

impl OpenAiEmbedder {
    pub fn new(client: Arc<Client>, model: ModelConfig) -> Result<Self> {
        let headers = assemble_req_header(&model)?;
        Ok(Self {
            client,
            model,
            headers,
        })
    }

    /// 读取 `KAIRIX_MODEL_EMBEDDER_*`
    pub fn from_models(client: Arc<Client>, models: &ModelsConfig) -> Result<Self> {
        Self::new(client, models.get(EMBEDDER_ID)?)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model.model
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
        let request_body = EmbeddingRequest {
            model: self.model.model.clone(),
            input: text.to_string(),
        };

        let response: EmbeddingResponse = post(
            self.client.clone(),
            self.model(),
            &request_body,
            self.headers.clone(),
            &self.model.baseurl,
        )
        .await?;

        let vector = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProviderError::fatal(self.model(), "Empty embedding"))?;
        debug!(model = %self.model.model, dimensions = vector.len(), "向量生成完成");
        Ok(vector)
    }
}
