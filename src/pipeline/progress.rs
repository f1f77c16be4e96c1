//! 进度通知，粒度为片段

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentStatus {
    Completed,
    Failed,
}

/// 每个片段完成或失败时发出一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub conversation_id: String,
    pub fragment_index: usize,
    pub fragment_name: String,
    pub status: FragmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn completed(
        conversation_id: impl Into<String>,
        fragment_index: usize,
        fragment_name: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            fragment_index,
            fragment_name: fragment_name.into(),
            status: FragmentStatus::Completed,
            error: None,
        }
    }

    pub fn failed(
        conversation_id: impl Into<String>,
        fragment_index: usize,
        fragment_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            fragment_index,
            fragment_name: fragment_name.into(),
            status: FragmentStatus::Failed,
            error: Some(error.into()),
        }
    }
}

/// 进度接收方
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn notify(&self, event: ProgressEvent);
}

/// 写入 tracing 日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

#[async_trait]
impl ProgressSink for TracingProgress {
    async fn notify(&self, event: ProgressEvent) {
        match event.status {
            FragmentStatus::Completed => info!(
                conversation = %event.conversation_id,
                fragment = %event.fragment_name,
                "✅ 片段完成"
            ),
            FragmentStatus::Failed => warn!(
                conversation = %event.conversation_id,
                fragment = %event.fragment_name,
                error = event.error.as_deref().unwrap_or(""),
                "❌ 片段失败"
            ),
        }
    }
}

/// 转发到 channel，接收端关闭后静默丢弃
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelProgress {
    async fn notify(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}
