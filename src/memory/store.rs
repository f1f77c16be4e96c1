//! 图存储
//!
//! ## 内置实现
//!
//! - [`InMemoryGraphStore`]：进程内存，适合测试
//! - [`FileGraphStore`]：JSON 文件持久化，每次写入后落盘
//!
//! 两者共用同一套合并规则：在写锁内完成"查找 → 创建或追加关联"，
//! 因此并发写入同一哈希时只会创建一个分片。

use crate::error::{PersistenceError, Result, SynthError};
use crate::hashing::ContentHash;
use crate::memory::{
    Embedding, FragmentLink, MemoryShard, Summary, UpsertDisposition, Upserted,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type StoreResult<T> = std::result::Result<T, PersistenceError>;

/// 存储统计，用于观察幂等性
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub shards: usize,
    /// 本进程内新建的摘要数
    pub summaries_created: usize,
    /// 本进程内新建的向量数
    pub embeddings_created: usize,
    pub merges: usize,
    pub links: usize,
}

// ── GraphStore trait ─────────────────────────────────────────────────────────

/// 记忆图的存储接口，所有方法都可被并发调用
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn find_by_hash(&self, hash: &ContentHash) -> StoreResult<Option<MemoryShard>>;

    /// 合并式写入：哈希已存在时只追加（或覆盖同位置的）关联
    async fn upsert(
        &self,
        link: FragmentLink,
        summary: Summary,
        embedding: Embedding,
    ) -> StoreResult<Upserted>;

    async fn stats(&self) -> StoreResult<StoreStats>;

    /// 全部分片，按哈希排序
    async fn list(&self) -> StoreResult<Vec<MemoryShard>>;
}

// ── 合并规则 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ShardGraph {
    shards: BTreeMap<ContentHash, MemoryShard>,
    summaries_created: usize,
    embeddings_created: usize,
    merges: usize,
}

/// 合并前的快照，落盘失败时用于回滚
struct MergeUndo {
    hash: ContentHash,
    previous: Option<MemoryShard>,
    summaries_created: usize,
    embeddings_created: usize,
    merges: usize,
}

impl ShardGraph {
    fn with_shards(shards: BTreeMap<ContentHash, MemoryShard>) -> Self {
        Self {
            shards,
            ..Default::default()
        }
    }

    fn merge(
        &mut self,
        link: FragmentLink,
        summary: Summary,
        embedding: Embedding,
    ) -> StoreResult<Upserted> {
        check_consistency(&summary, &embedding)?;
        let hash = summary.content_hash.clone();
        let now = Utc::now();

        if let Some(shard) = self.shards.get_mut(&hash) {
            self.merges += 1;
            let new_link = match shard.links.iter_mut().find(|l| l.same_slot(&link)) {
                // 同一位置的重复元数据，后写者覆盖
                Some(existing) => {
                    *existing = link;
                    false
                }
                None => {
                    shard.links.push(link);
                    true
                }
            };
            shard.updated_at = now;
            return Ok(Upserted {
                shard: shard.clone(),
                disposition: UpsertDisposition::Merged { new_link },
            });
        }

        let shard = MemoryShard {
            content_hash: hash.clone(),
            summary,
            embedding,
            links: vec![link],
            created_at: now,
            updated_at: now,
        };
        self.summaries_created += 1;
        self.embeddings_created += 1;
        self.shards.insert(hash, shard.clone());
        Ok(Upserted {
            shard,
            disposition: UpsertDisposition::Created,
        })
    }

    fn checkpoint(&self, hash: &ContentHash) -> MergeUndo {
        MergeUndo {
            hash: hash.clone(),
            previous: self.shards.get(hash).cloned(),
            summaries_created: self.summaries_created,
            embeddings_created: self.embeddings_created,
            merges: self.merges,
        }
    }

    fn rollback(&mut self, undo: MergeUndo) {
        match undo.previous {
            Some(shard) => {
                self.shards.insert(undo.hash, shard);
            }
            None => {
                self.shards.remove(&undo.hash);
            }
        }
        self.summaries_created = undo.summaries_created;
        self.embeddings_created = undo.embeddings_created;
        self.merges = undo.merges;
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            shards: self.shards.len(),
            summaries_created: self.summaries_created,
            embeddings_created: self.embeddings_created,
            merges: self.merges,
            links: self.shards.values().map(|s| s.links.len()).sum(),
        }
    }
}

fn check_consistency(summary: &Summary, embedding: &Embedding) -> StoreResult<()> {
    if summary.content_hash != embedding.content_hash {
        return Err(PersistenceError::Rejected(format!(
            "summary {} and embedding {} disagree on content hash",
            summary.content_hash.short(),
            embedding.content_hash.short()
        )));
    }
    if embedding.vector.is_empty() || embedding.vector.len() != embedding.dimensions {
        return Err(PersistenceError::Rejected(format!(
            "embedding for {} has {} values but declares {} dimensions",
            embedding.content_hash.short(),
            embedding.vector.len(),
            embedding.dimensions
        )));
    }
    if embedding.vector.iter().any(|v| !v.is_finite()) {
        return Err(PersistenceError::Rejected(format!(
            "embedding for {} contains non-finite values",
            embedding.content_hash.short()
        )));
    }
    Ok(())
}

// ── InMemoryGraphStore ───────────────────────────────────────────────────────

/// 进程内存图存储，不持久化
pub struct InMemoryGraphStore {
    graph: RwLock<ShardGraph>,
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(ShardGraph::default()),
        }
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn find_by_hash(&self, hash: &ContentHash) -> StoreResult<Option<MemoryShard>> {
        Ok(self.graph.read().await.shards.get(hash).cloned())
    }

    async fn upsert(
        &self,
        link: FragmentLink,
        summary: Summary,
        embedding: Embedding,
    ) -> StoreResult<Upserted> {
        let upserted = self.graph.write().await.merge(link, summary, embedding)?;
        debug!(
            hash = %upserted.shard.content_hash.short(),
            disposition = ?upserted.disposition,
            "分片写入"
        );
        Ok(upserted)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        Ok(self.graph.read().await.stats())
    }

    async fn list(&self) -> StoreResult<Vec<MemoryShard>> {
        Ok(self.graph.read().await.shards.values().cloned().collect())
    }
}

// ── FileGraphStore ───────────────────────────────────────────────────────────

/// 基于 JSON 文件的图存储
///
/// 写入在写锁内完成合并并落盘；落盘失败时回滚本次合并，内存与文件保持一致。
///
/// 存储格式：
/// ```json
/// {
///   "3f2a…": { "content_hash": "3f2a…", "summary": {...}, "embedding": {...}, "links": [...], ... }
/// }
/// ```
pub struct FileGraphStore {
    path: PathBuf,
    graph: RwLock<ShardGraph>,
}

impl FileGraphStore {
    /// 打开或创建存储文件，自动建父目录
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_tilde(path.as_ref());
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                SynthError::Persistence(PersistenceError::Io(format!("创建目录失败: {e}")))
            })?;
        }
        let shards: BTreeMap<ContentHash, MemoryShard> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                SynthError::Persistence(PersistenceError::Io(format!("读取存储文件失败: {e}")))
            })?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).map_err(|e| {
                    SynthError::Persistence(PersistenceError::Serialization(format!(
                        "{}: {e}",
                        path.display()
                    )))
                })?
            }
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), shards = shards.len(), "🗄️ FileGraphStore 初始化");
        Ok(Self {
            path,
            graph: RwLock::new(ShardGraph::with_shards(shards)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, shards: &BTreeMap<ContentHash, MemoryShard>) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(shards)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        // 先写临时文件再改名，避免中途崩溃留下半个文件
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| PersistenceError::Io(format!("写入存储文件失败: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PersistenceError::Io(format!("替换存储文件失败: {e}")))?;
        debug!(path = %self.path.display(), "💾 图存储已持久化");
        Ok(())
    }
}

#[async_trait]
impl GraphStore for FileGraphStore {
    async fn find_by_hash(&self, hash: &ContentHash) -> StoreResult<Option<MemoryShard>> {
        Ok(self.graph.read().await.shards.get(hash).cloned())
    }

    async fn upsert(
        &self,
        link: FragmentLink,
        summary: Summary,
        embedding: Embedding,
    ) -> StoreResult<Upserted> {
        let mut graph = self.graph.write().await;
        let undo = graph.checkpoint(&summary.content_hash);
        let upserted = graph.merge(link, summary, embedding)?;
        if let Err(e) = self.flush(&graph.shards).await {
            warn!(
                hash = %upserted.shard.content_hash.short(),
                error = %e,
                "落盘失败，回滚本次合并"
            );
            graph.rollback(undo);
            return Err(e);
        }
        Ok(upserted)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        Ok(self.graph.read().await.stats())
    }

    async fn list(&self) -> StoreResult<Vec<MemoryShard>> {
        Ok(self.graph.read().await.shards.values().cloned().collect())
    }
}

// ── 私有工具函数 ──────────────────────────────────────────────────────────────

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/")
        && let Some(home) = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())
    {
        return PathBuf::from(home).join(&s[2..]);
    }
    path.to_path_buf()
}
