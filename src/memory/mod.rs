//! 记忆图
//!
//! 持久化单元是 [`MemoryShard`]：一条摘要 + 一个向量，以内容哈希为身份，
//! 通过 [`FragmentLink`] 指回产生它的每一个对话片段。
//!
//! | 组件 | 作用 |
//! |------|------|
//! | [`GraphStore`] | 存储契约：按哈希查找、合并式写入 |
//! | [`InMemoryGraphStore`] | 进程内存实现，适合测试 |
//! | [`FileGraphStore`] | JSON 文件持久化，跨进程幂等 |
//! | [`GraphPersister`] | 带重试的写入，失败只影响单个片段 |
//!
//! 同一哈希只会有一个分片；再次写入只追加新的关联，不会重复创建摘要或向量。

pub mod persister;
pub mod store;

use crate::chunking::{ChatFragment, MessagePart};
use crate::hashing::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use persister::{GraphPersister, PersistOutcome};
pub use store::{FileGraphStore, GraphStore, InMemoryGraphStore, StoreStats};

/// 片段摘要，以片段内容哈希为键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub content_hash: ContentHash,
    pub text: String,
}

/// 摘要向量，与摘要共用同一个键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub content_hash: ContentHash,
    /// 生成向量的模型
    pub model: String,
    pub dimensions: usize,
    pub vector: Vec<f32>,
}

impl Embedding {
    pub fn new(content_hash: ContentHash, model: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            content_hash,
            model: model.into(),
            dimensions: vector.len(),
            vector,
        }
    }
}

/// 分片与来源片段的关联
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentLink {
    pub conversation_id: String,
    pub conversation_title: String,
    pub fragment_index: usize,
    pub fragment_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<MessagePart>,
    /// 写入该关联的 agent
    pub agent: String,
}

impl FragmentLink {
    pub fn from_fragment(fragment: &ChatFragment, agent: impl Into<String>) -> Self {
        Self {
            conversation_id: fragment.source_conversation_id.clone(),
            conversation_title: fragment.conversation_title.clone(),
            fragment_index: fragment.fragment_index,
            fragment_name: fragment.name(),
            part: fragment.part,
            agent: agent.into(),
        }
    }

    /// 同一对话的同一片段视为同一关联
    pub fn same_slot(&self, other: &FragmentLink) -> bool {
        self.conversation_id == other.conversation_id
            && self.fragment_index == other.fragment_index
    }
}

/// 持久化的记忆单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryShard {
    pub content_hash: ContentHash,
    pub summary: Summary,
    pub embedding: Embedding,
    pub links: Vec<FragmentLink>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryShard {
    /// 关联按 (conversation_id, fragment_index) 排序后的视图，用于还原片段顺序
    pub fn ordered_links(&self) -> Vec<&FragmentLink> {
        let mut links: Vec<&FragmentLink> = self.links.iter().collect();
        links.sort_by(|a, b| {
            a.conversation_id
                .cmp(&b.conversation_id)
                .then(a.fragment_index.cmp(&b.fragment_index))
        });
        links
    }
}

/// `upsert` 的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertDisposition {
    /// 新建了摘要、向量与分片
    Created,
    /// 分片已存在；`new_link` 表示本次是否追加了新的关联
    Merged { new_link: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub shard: MemoryShard,
    pub disposition: UpsertDisposition,
}

impl Upserted {
    pub fn created(&self) -> bool {
        self.disposition == UpsertDisposition::Created
    }
}
