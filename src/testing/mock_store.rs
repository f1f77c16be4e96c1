//! 可注入故障的图存储包装

use crate::error::PersistenceError;
use crate::hashing::ContentHash;
use crate::memory::{
    Embedding, FragmentLink, GraphStore, MemoryShard, StoreStats, Summary, Upserted,
};
use async_trait::async_trait;
use std::sync::Mutex;

/// 包装任意 [`GraphStore`]，让 `upsert` 按脚本失败；查询类方法直接转发。
///
/// ```rust
/// use kairix_synth::memory::InMemoryGraphStore;
/// use kairix_synth::testing::FlakyGraphStore;
///
/// // 前两次写入返回 Unavailable，之后正常
/// let store = FlakyGraphStore::new(InMemoryGraphStore::new()).failing_times(2);
/// assert_eq!(store.upsert_calls(), 0);
/// ```
pub struct FlakyGraphStore<S> {
    inner: S,
    remaining_failures: Mutex<Option<usize>>,
    error: PersistenceError,
    upsert_calls: Mutex<usize>,
}

impl<S: GraphStore> FlakyGraphStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            remaining_failures: Mutex::new(Some(0)),
            error: PersistenceError::Unavailable("injected failure".to_string()),
            upsert_calls: Mutex::new(0),
        }
    }

    /// 前 `n` 次写入失败
    pub fn failing_times(self, n: usize) -> Self {
        *self.remaining_failures.lock().unwrap() = Some(n);
        self
    }

    /// 每次写入都失败
    pub fn always_fail(self) -> Self {
        *self.remaining_failures.lock().unwrap() = None;
        self
    }

    /// 注入的错误类型，默认 `Unavailable`
    pub fn with_error(mut self, error: PersistenceError) -> Self {
        self.error = error;
        self
    }

    pub fn upsert_calls(&self) -> usize {
        *self.upsert_calls.lock().unwrap()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn should_fail(&self) -> bool {
        let mut remaining = self.remaining_failures.lock().unwrap();
        match remaining.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

#[async_trait]
impl<S: GraphStore> GraphStore for FlakyGraphStore<S> {
    async fn find_by_hash(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<MemoryShard>, PersistenceError> {
        self.inner.find_by_hash(hash).await
    }

    async fn upsert(
        &self,
        link: FragmentLink,
        summary: Summary,
        embedding: Embedding,
    ) -> Result<Upserted, PersistenceError> {
        *self.upsert_calls.lock().unwrap() += 1;
        if self.should_fail() {
            return Err(self.error.clone());
        }
        self.inner.upsert(link, summary, embedding).await
    }

    async fn stats(&self) -> Result<StoreStats, PersistenceError> {
        self.inner.stats().await
    }

    async fn list(&self) -> Result<Vec<MemoryShard>, PersistenceError> {
        self.inner.list().await
    }
}
