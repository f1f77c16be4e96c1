//! 离线实现：不依赖网络即可跑通整条管道

use crate::error::ProviderError;
use crate::llm::{Embedder, SummarizeOptions, Summarizer};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// 取文本前 N 个字符作为摘要
pub struct PrefixSummarizer {
    max_chars: usize,
}

impl PrefixSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }
}

impl Default for PrefixSummarizer {
    fn default() -> Self {
        Self::new(280)
    }
}

#[async_trait]
impl Summarizer for PrefixSummarizer {
    fn name(&self) -> &str {
        "prefix"
    }

    async fn summarize(
        &self,
        text: &str,
        _options: &SummarizeOptions,
    ) -> Result<String, ProviderError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ProviderError::fatal(self.name(), "Nothing to summarize"));
        }
        Ok(trimmed.chars().take(self.max_chars).collect())
    }
}

/// 特征哈希词袋向量，L2 归一化
pub struct HashingEmbedder {
    dimensions: usize,
    model: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model: format!("feature-hash-{dimensions}"),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let value = u64::from_le_bytes(raw);
        let index = (value % self.dimensions as u64) as usize;
        // 最高位决定符号，减少碰撞带来的偏置
        let sign = if value >> 63 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vector = vec![0f32; self.dimensions];
        let mut seen = false;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let (index, sign) = self.bucket(&token.to_lowercase());
            vector[index] += sign;
            seen = true;
        }
        if !seen {
            return Err(ProviderError::fatal(self.model(), "No tokens to embed"));
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}
