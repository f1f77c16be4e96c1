//! 运行报告：失败的唯一出口

use crate::synthesis::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 运行状态机
///
/// `Pending → Chunking → Synthesizing → Persisting → {Completed | CompletedWithErrors | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Chunking,
    Synthesizing,
    /// 所有片段已派发，等待在途片段落盘
    Persisting,
    Completed,
    CompletedWithErrors,
    /// 所有输入对话都没通过校验
    Failed,
    /// 取消信号在派发完成前到达
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed
                | RunState::CompletedWithErrors
                | RunState::Failed
                | RunState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Chunking => "chunking",
            RunState::Synthesizing => "synthesizing",
            RunState::Persisting => "persisting",
            RunState::Completed => "completed",
            RunState::CompletedWithErrors => "completed_with_errors",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失败的片段；对话级校验失败时 `fragment_index` 为 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFragment {
    pub conversation_id: String,
    pub fragment_index: usize,
    pub fragment_name: String,
    pub kind: FailureKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounts {
    pub conversations: usize,
    pub conversations_rejected: usize,
    pub fragments: usize,
    /// 进入工作池的片段数
    pub fragments_dispatched: usize,
    pub fragments_succeeded: usize,
    pub fragments_failed: usize,
    /// 因取消而未派发的片段数
    pub fragments_skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCalls {
    pub summarizer: u32,
    pub embedder: u32,
    pub store_writes: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardCounts {
    pub created: usize,
    pub merged: usize,
    /// 合并时追加了新关联的次数
    pub links_added: usize,
    /// 命中运行缓存或已持久化结果而省下的摘要调用
    pub summary_reuses: usize,
    pub embedding_reuses: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTimings {
    pub chunking_ms: u64,
    pub synthesis_ms: u64,
    pub total_ms: u64,
}

/// 取消时的位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationPoint {
    pub state: RunState,
    pub dispatched: usize,
    pub remaining: usize,
    /// 最后一个派发的片段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dispatched: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub agent: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: RunCounts,
    pub provider_calls: ProviderCalls,
    pub shards: ShardCounts,
    pub timings: RunTimings,
    /// 按 (conversation_id, fragment_index) 排序
    pub failed_fragments: Vec<FailedFragment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<CancellationPoint>,
}

impl RunReport {
    /// 整体失败：状态为 `Failed`，或尝试过片段却一个都没成功
    pub fn failed_overall(&self) -> bool {
        self.state == RunState::Failed
            || (self.counts.fragments_dispatched + self.counts.fragments_failed > 0
                && self.counts.fragments_succeeded == 0)
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.failed_fragments
            .iter()
            .map(|f| f.fragment_name.as_str())
            .collect()
    }
}
