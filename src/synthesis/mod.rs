//! 摘要 / 向量合成
//!
//! [`SummaryClient`] 与 [`EmbeddingClient`] 是外部服务的薄封装，调用顺序固定：
//!
//! 1. 本次运行的哈希缓存（[`RunCache`]），同一哈希只会有一个调用者真正执行
//! 2. 已持久化的分片（`consult_store` 开启时）
//! 3. 外部服务，瞬时错误按 [`RetryPolicy`] 重试
//!
//! 结果以 [`SynthesisOutcome`] 返回，调用方按分支处理成功与失败。

pub mod cache;
pub mod retry;

use crate::chunking::ChatFragment;
use crate::error::ProviderError;
use crate::hashing::ContentHash;
use crate::llm::{Embedder, SummarizeOptions, Summarizer};
use crate::memory::{Embedding, GraphStore, MemoryShard, Summary};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use cache::RunCache;
pub use retry::{Attempted, RetryPolicy, Retryable};

/// 结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// 本次调用了外部服务
    Fresh,
    /// 同一运行中其他片段已生成
    RunCache,
    /// 图存储中已有
    Persisted,
}

/// 片段失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 对话结构不合法
    Validation,
    /// 超长消息无法切分
    Chunking,
    /// 外部服务永久拒绝
    ProviderFatal,
    /// 瞬时错误重试耗尽
    RetriesExhausted,
    /// 图存储写入失败
    Persistence,
}

impl FailureKind {
    pub fn from_provider(err: &ProviderError) -> Self {
        if err.is_transient() {
            FailureKind::RetriesExhausted
        } else {
            FailureKind::ProviderFatal
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutcome<T> {
    Success {
        value: T,
        source: ResultSource,
        /// 外部服务调用次数，命中缓存时为 0
        attempts: u32,
    },
    Failure {
        kind: FailureKind,
        detail: String,
        attempts: u32,
    },
}

impl<T> SynthesisOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            SynthesisOutcome::Success { attempts, .. }
            | SynthesisOutcome::Failure { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SynthesisOutcome::Success { .. })
    }
}

/// 初始化器返回给自己的信息，等待者拿不到
struct Produced {
    source: ResultSource,
    attempts: u32,
}

struct Failed {
    kind: FailureKind,
    detail: String,
    attempts: u32,
}

impl Failed {
    /// 同哈希此前已致命失败
    fn cached(detail: String) -> Self {
        Self {
            kind: FailureKind::ProviderFatal,
            detail,
            attempts: 0,
        }
    }
}

/// 通用流程：缓存 → 存储 → 外部服务
///
/// 致命错误按哈希记入运行缓存，同一次运行里的重复片段不再调用外部服务；
/// 重试耗尽的瞬时错误不记，后续片段仍会重新尝试。
async fn resolve<T, L, P, Fut>(
    cache: &RunCache<T>,
    hash: &ContentHash,
    label: &str,
    lookup: L,
    provider: P,
) -> SynthesisOutcome<T>
where
    T: Clone,
    L: Future<Output = Option<T>>,
    P: FnOnce() -> Fut,
    Fut: Future<Output = Attempted<T, ProviderError>>,
{
    let cell = cache.cell(hash);
    if let Some(value) = cell.get() {
        debug!(fragment = %label, hash = %hash.short(), "♻️ 命中运行缓存");
        return SynthesisOutcome::Success {
            value: value.clone(),
            source: ResultSource::RunCache,
            attempts: 0,
        };
    }

    if let Some(detail) = cache.rejection(hash) {
        debug!(fragment = %label, hash = %hash.short(), "复用本次运行的致命失败");
        return failure(label, Failed::cached(detail));
    }

    let mut produced: Option<Produced> = None;
    let result = cell
        .get_or_try_init(|| async {
            if let Some(detail) = cache.rejection(hash) {
                return Err(Failed::cached(detail));
            }
            if let Some(value) = lookup.await {
                produced = Some(Produced {
                    source: ResultSource::Persisted,
                    attempts: 0,
                });
                return Ok(value);
            }
            let attempted = provider().await;
            match attempted.result {
                Ok(value) => {
                    produced = Some(Produced {
                        source: ResultSource::Fresh,
                        attempts: attempted.attempts,
                    });
                    Ok(value)
                }
                Err(e) => {
                    let detail = e.to_string();
                    if !e.is_transient() {
                        cache.reject(hash, detail.clone());
                    }
                    Err(Failed {
                        kind: FailureKind::from_provider(&e),
                        detail,
                        attempts: attempted.attempts,
                    })
                }
            }
        })
        .await;

    match (result, produced) {
        (Ok(value), Some(produced)) => {
            if produced.source == ResultSource::Persisted {
                info!(fragment = %label, hash = %hash.short(), "📦 复用已持久化结果");
            }
            SynthesisOutcome::Success {
                value: value.clone(),
                source: produced.source,
                attempts: produced.attempts,
            }
        }
        (Ok(value), None) => {
            debug!(fragment = %label, hash = %hash.short(), "♻️ 等待并复用并发结果");
            SynthesisOutcome::Success {
                value: value.clone(),
                source: ResultSource::RunCache,
                attempts: 0,
            }
        }
        (Err(failed), _) => failure(label, failed),
    }
}

fn failure<T>(label: &str, failed: Failed) -> SynthesisOutcome<T> {
    warn!(fragment = %label, attempts = failed.attempts, error = %failed.detail, "合成失败");
    SynthesisOutcome::Failure {
        kind: failed.kind,
        detail: failed.detail,
        attempts: failed.attempts,
    }
}

/// 查询图存储；存储出错时只记录日志，继续走外部服务
async fn lookup_shard(
    store: Option<&Arc<dyn GraphStore>>,
    hash: &ContentHash,
) -> Option<MemoryShard> {
    let store = store?;
    match store.find_by_hash(hash).await {
        Ok(found) => found,
        Err(e) => {
            warn!(hash = %hash.short(), error = %e, "图存储查询失败，直接调用外部服务");
            None
        }
    }
}

// ── SummaryClient ─────────────────────────────────────────────────────────────

pub struct SummaryClient {
    summarizer: Arc<dyn Summarizer>,
    retry: RetryPolicy,
    options: SummarizeOptions,
    store: Option<Arc<dyn GraphStore>>,
    cache: RunCache<Summary>,
}

impl SummaryClient {
    pub fn new(summarizer: Arc<dyn Summarizer>, retry: RetryPolicy) -> Self {
        Self {
            summarizer,
            retry,
            options: SummarizeOptions::default(),
            store: None,
            cache: RunCache::new(),
        }
    }

    pub fn with_options(mut self, options: SummarizeOptions) -> Self {
        self.options = options;
        self
    }

    /// 调用服务前先查已持久化的分片
    pub fn with_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache(&self) -> &RunCache<Summary> {
        &self.cache
    }

    pub async fn summarize(&self, fragment: &ChatFragment) -> SynthesisOutcome<Summary> {
        let hash = &fragment.content_hash;
        let label = fragment.name();
        let store = self.store.as_ref();

        resolve(
            &self.cache,
            hash,
            &label,
            async { lookup_shard(store, hash).await.map(|shard| shard.summary) },
            || async {
                let transcript = fragment.transcript();
                let attempted = self
                    .retry
                    .run(self.summarizer.name(), || {
                        self.summarizer.summarize(&transcript, &self.options)
                    })
                    .await;
                Attempted {
                    result: attempted.result.map(|text| Summary {
                        content_hash: hash.clone(),
                        text,
                    }),
                    attempts: attempted.attempts,
                }
            },
        )
        .await
    }
}

// ── EmbeddingClient ───────────────────────────────────────────────────────────

pub struct EmbeddingClient {
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    store: Option<Arc<dyn GraphStore>>,
    cache: RunCache<Embedding>,
}

impl EmbeddingClient {
    pub fn new(embedder: Arc<dyn Embedder>, retry: RetryPolicy) -> Self {
        Self {
            embedder,
            retry,
            store: None,
            cache: RunCache::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache(&self) -> &RunCache<Embedding> {
        &self.cache
    }

    /// 以摘要的哈希为键
    pub async fn embed(&self, summary: &Summary, label: &str) -> SynthesisOutcome<Embedding> {
        let hash = &summary.content_hash;
        let store = self.store.as_ref();

        resolve(
            &self.cache,
            hash,
            label,
            async { lookup_shard(store, hash).await.map(|shard| shard.embedding) },
            || async {
                let attempted = self
                    .retry
                    .run(self.embedder.model(), || self.embedder.embed(&summary.text))
                    .await;
                Attempted {
                    result: attempted
                        .result
                        .map(|vector| Embedding::new(hash.clone(), self.embedder.model(), vector)),
                    attempts: attempted.attempts,
                }
            },
        )
        .await
    }
}
