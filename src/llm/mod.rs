//! 摘要 / 向量服务契约
//!
//! 管道只依赖 [`Summarizer`] 与 [`Embedder`] 两个 trait，具体实现在构造时注入：
//!
//! - [`openai`]：OpenAI 兼容 HTTP 接口
//! - [`local`]：无需网络的本地实现（前缀摘要、特征哈希向量）
//! - [`crate::testing`]：可编排的测试替身

mod client;
pub mod config;
pub mod local;
pub mod openai;
pub mod types;

use crate::error::{ProviderError, Result, SynthError};
use crate::llm::config::ModelConfig;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

pub use local::{HashingEmbedder, PrefixSummarizer};
pub use openai::{OpenAiEmbedder, OpenAiSummarizer};

/// 摘要调用参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizeOptions {
    /// 期望的摘要长度上限（token）
    pub requested_tokens: u32,
    pub temperature: f32,
    pub system_instruction: String,
}

impl Default for SummarizeOptions {
    fn default() -> Self {
        Self {
            requested_tokens: 512,
            temperature: 0.3,
            system_instruction: "Summarize the following conversation excerpt into a concise, \
                                 self-contained memory. Keep facts, decisions and open questions."
                .to_string(),
        }
    }
}

/// 摘要服务
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// 用于日志与报告的名称
    fn name(&self) -> &str;

    async fn summarize(
        &self,
        text: &str,
        options: &SummarizeOptions,
    ) -> std::result::Result<String, ProviderError>;
}

/// 向量服务，输出固定维度的向量
#[async_trait]
pub trait Embedder: Send + Sync {
    /// 模型名，记录在 [`crate::memory::Embedding`] 上
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError>;
}

pub fn assemble_req_header(model: &ModelConfig) -> Result<HeaderMap> {
    let mut header_map = HeaderMap::new();

    header_map.insert(
        "Authorization",
        format!("Bearer {}", model.apikey)
            .parse()
            .map_err(|e| SynthError::Other(format!("Invalid Authorization header: {}", e)))?,
    );
    header_map.insert(
        "Content-Type",
        "application/json"
            .parse()
            .map_err(|e| SynthError::Other(format!("Invalid Content-Type header: {}", e)))?,
    );
    Ok(header_map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_req_header() {
        let model = ModelConfig {
            model: "m".into(),
            baseurl: "http://localhost".into(),
            apikey: "sk-test".into(),
        };
        let headers = assemble_req_header(&model).unwrap();
        assert_eq!(headers["Authorization"], "Bearer sk-test");
        assert_eq!(headers["Content-Type"], "application/json");
    }

    #[test]
    fn test_header_rejects_newline_in_key() {
        let model = ModelConfig {
            model: "m".into(),
            baseurl: "http://localhost".into(),
            apikey: "bad\nkey".into(),
        };
        assert!(assemble_req_header(&model).is_err());
    }

    #[test]
    fn test_summarize_options_defaults_fill_missing_fields() {
        let options: SummarizeOptions = serde_yaml::from_str("temperature: 0.7").unwrap();
        assert_eq!(options.requested_tokens, 512);
        assert!((options.temperature - 0.7).abs() < f32::EPSILON);
        assert!(!options.system_instruction.is_empty());
    }
}
