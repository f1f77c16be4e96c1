use crate::chunking::ChatFragment;
use crate::error::PersistenceError;
use crate::memory::{Embedding, FragmentLink, GraphStore, Summary, Upserted};
use crate::synthesis::retry::RetryPolicy;
use std::sync::Arc;
use tracing::{error, info};

/// 写入结果
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Stored { upserted: Upserted, attempts: u32 },
    /// 重试耗尽或被存储拒绝，只对该片段致命
    Failed {
        error: PersistenceError,
        attempts: u32,
    },
}

/// 带重试的合并写入
pub struct GraphPersister {
    store: Arc<dyn GraphStore>,
    retry: RetryPolicy,
}

impl GraphPersister {
    pub fn new(store: Arc<dyn GraphStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub async fn persist(
        &self,
        fragment: &ChatFragment,
        agent: &str,
        summary: Summary,
        embedding: Embedding,
    ) -> PersistOutcome {
        let link = FragmentLink::from_fragment(fragment, agent);
        let label = link.fragment_name.clone();

        let attempted = self
            .retry
            .run(&label, || {
                self.store
                    .upsert(link.clone(), summary.clone(), embedding.clone())
            })
            .await;

        match attempted.result {
            Ok(upserted) => {
                info!(
                    fragment = %label,
                    hash = %upserted.shard.content_hash.short(),
                    created = upserted.created(),
                    attempts = attempted.attempts,
                    "🧩 分片已写入"
                );
                PersistOutcome::Stored {
                    upserted,
                    attempts: attempted.attempts,
                }
            }
            Err(e) => {
                error!(fragment = %label, attempts = attempted.attempts, error = %e, "分片写入失败");
                PersistOutcome::Failed {
                    error: e,
                    attempts: attempted.attempts,
                }
            }
        }
    }
}
