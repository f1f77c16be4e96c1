//! Mock 摘要 / 向量服务，用于在不发起真实 HTTP 请求的情况下测试合成与管道。
//!
//! # 示例
//!
//! ```rust
//! use kairix_synth::testing::MockSummarizer;
//! use kairix_synth::llm::{SummarizeOptions, Summarizer};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mock = MockSummarizer::new()
//!     .with_transient_error("rate limited")
//!     .with_response("摘要");
//!
//! let options = SummarizeOptions::default();
//! assert!(mock.summarize("text", &options).await.is_err());
//! assert_eq!(mock.summarize("text", &options).await.unwrap(), "摘要");
//! assert_eq!(mock.call_count(), 2);
//! # }
//! ```

use crate::error::ProviderError;
use crate::llm::{Embedder, SummarizeOptions, Summarizer};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SUMMARIZER_NAME: &str = "mock-summarizer";
const EMBEDDER_MODEL: &str = "mock-embedder";

/// 预设响应（文本或错误）
#[derive(Clone)]
enum Scripted<T> {
    Value(T),
    Err(ProviderError),
}

/// 队列耗尽后的行为
#[derive(Clone)]
enum Fallback<T> {
    /// 返回致命错误
    Exhausted,
    /// 按输入生成确定性的结果
    Derived,
    Fixed(Scripted<T>),
}

/// 可脚本化的 Mock 摘要服务。
///
/// 按顺序返回预设响应；队列耗尽后默认按输入生成 `summary: <前 48 个字符>`。
/// 命中 [`fail_when_contains`](MockSummarizer::fail_when_contains) 的输入总是失败，
/// 与调用顺序无关，适合并发场景。
pub struct MockSummarizer {
    responses: Arc<Mutex<VecDeque<Scripted<String>>>>,
    fallback: Fallback<String>,
    poisoned: Vec<(String, ProviderError)>,
    delay: Option<Duration>,
    /// 每次调用收到的文本，按顺序记录
    calls: Arc<Mutex<Vec<String>>>,
}

impl Default for MockSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSummarizer {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Fallback::Derived,
            poisoned: Vec::new(),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 追加一条成功响应
    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push(Scripted::Value(text.into()));
        self
    }

    /// 追加一条瞬时错误（用于测试重试）
    pub fn with_transient_error(self, msg: impl Into<String>) -> Self {
        self.push(Scripted::Err(ProviderError::transient(SUMMARIZER_NAME, msg)));
        self
    }

    /// 追加一条致命错误
    pub fn with_fatal_error(self, msg: impl Into<String>) -> Self {
        self.push(Scripted::Err(ProviderError::fatal(SUMMARIZER_NAME, msg)));
        self
    }

    /// 队列耗尽后总是返回同一文本
    pub fn with_default_response(mut self, text: impl Into<String>) -> Self {
        self.fallback = Fallback::Fixed(Scripted::Value(text.into()));
        self
    }

    /// 队列耗尽后总是返回该错误
    pub fn always_fail(mut self, err: ProviderError) -> Self {
        self.fallback = Fallback::Fixed(Scripted::Err(err));
        self
    }

    pub fn always_fail_transient(self, msg: impl Into<String>) -> Self {
        self.always_fail(ProviderError::transient(SUMMARIZER_NAME, msg))
    }

    /// 队列耗尽后返回致命错误
    pub fn strict(mut self) -> Self {
        self.fallback = Fallback::Exhausted;
        self
    }

    /// 输入包含 `needle` 时返回 `err`，优先于预设队列
    pub fn fail_when_contains(mut self, needle: impl Into<String>, err: ProviderError) -> Self {
        self.poisoned.push((needle.into(), err));
        self
    }

    /// 每次调用前等待，用于制造并发重叠
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 已发生的调用总次数
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// 所有历史调用的输入文本（按时序排列）
    pub fn all_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// 剩余未消费的预设响应数量
    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }

    fn push(&self, scripted: Scripted<String>) {
        self.responses.lock().unwrap().push_back(scripted);
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    fn name(&self) -> &str {
        SUMMARIZER_NAME
    }

    async fn summarize(
        &self,
        text: &str,
        _options: &SummarizeOptions,
    ) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(text.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some((_, err)) = self.poisoned.iter().find(|(n, _)| text.contains(n.as_str())) {
            return Err(err.clone());
        }

        let next = self.responses.lock().unwrap().pop_front();
        let scripted = match next {
            Some(s) => s,
            None => match &self.fallback {
                Fallback::Fixed(s) => s.clone(),
                Fallback::Derived => Scripted::Value(format!(
                    "summary: {}",
                    text.chars().take(48).collect::<String>()
                )),
                Fallback::Exhausted => Scripted::Err(ProviderError::fatal(
                    SUMMARIZER_NAME,
                    "no scripted response left",
                )),
            },
        };
        match scripted {
            Scripted::Value(text) => Ok(text),
            Scripted::Err(e) => Err(e),
        }
    }
}

/// 可脚本化的 Mock 向量服务。
///
/// 预设队列只存放错误；没有预设时按输入生成确定性的向量。
pub struct MockEmbedder {
    dimensions: usize,
    errors: Arc<Mutex<VecDeque<ProviderError>>>,
    always: Option<ProviderError>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            errors: Arc::new(Mutex::new(VecDeque::new())),
            always: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_transient_error(self, msg: impl Into<String>) -> Self {
        self.errors
            .lock()
            .unwrap()
            .push_back(ProviderError::transient(EMBEDDER_MODEL, msg));
        self
    }

    pub fn with_fatal_error(self, msg: impl Into<String>) -> Self {
        self.errors
            .lock()
            .unwrap()
            .push_back(ProviderError::fatal(EMBEDDER_MODEL, msg));
        self
    }

    pub fn always_fail(mut self, err: ProviderError) -> Self {
        self.always = Some(err);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn all_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn model(&self) -> &str {
        EMBEDDER_MODEL
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.lock().unwrap().push(text.to_string());
        if let Some(err) = &self.always {
            return Err(err.clone());
        }
        if let Some(err) = self.errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let bytes = text.as_bytes();
        Ok((0..self.dimensions)
            .map(|i| {
                let b = bytes.get(i % bytes.len().max(1)).copied().unwrap_or(0);
                (b as f32 + i as f32) / 255.0
            })
            .collect())
    }
}
