//! ChatGPT 导出文件加载
//!
//! 导出格式为对话数组，每条对话的消息以 `mapping`（节点 ID → 节点）形式保存：
//!
//! ```json
//! [{
//!   "id": "abc", "title": "Rust 学习", "create_time": 1714550400.0,
//!   "mapping": {
//!     "n1": { "message": { "author": { "role": "user" }, "create_time": 1714550401.2,
//!                          "content": { "parts": ["所有权怎么理解？"] } } }
//!   }
//! }]
//! ```
//!
//! 节点按 `create_time` 排序，`parts` 以换行拼接，没有文本的节点被跳过。

use super::{Conversation, Message, Role, clean_title};
use crate::error::{ConfigError, Result, ValidationError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct RawConversation {
    #[serde(default, alias = "conversation_id")]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    create_time: Option<f64>,
    #[serde(default)]
    mapping: Option<HashMap<String, RawNode>>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(default)]
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    author: Option<RawAuthor>,
    #[serde(default)]
    create_time: Option<f64>,
    #[serde(default)]
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
struct RawAuthor {
    #[serde(default)]
    role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawContent {
    #[serde(default)]
    parts: Option<Vec<Value>>,
}

/// 被拒绝的导出对话，交给编排器记入运行报告
#[derive(Debug, Clone)]
pub struct RejectedExport {
    pub conversation_id: String,
    pub title: String,
    pub error: ValidationError,
}

/// 一次导出加载的结果
#[derive(Debug, Default)]
pub struct ExportLoad {
    pub conversations: Vec<Conversation>,
    pub rejected: Vec<RejectedExport>,
}

/// 从文件加载 ChatGPT 导出
pub fn load_chatgpt_export(path: impl AsRef<Path>) -> Result<ExportLoad> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
    let label = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    parse_chatgpt_export(&raw, &label)
}

/// 解析导出 JSON。`source_label` 用于为缺少 ID 的对话生成 `{label}::{clean_title}`
pub fn parse_chatgpt_export(json: &str, source_label: &str) -> Result<ExportLoad> {
    let raw: Vec<RawConversation> = serde_json::from_str(json)?;
    info!(count = raw.len(), source = %source_label, "📥 读取导出对话");

    let mut load = ExportLoad::default();
    for convo in raw {
        let title = convo.title.unwrap_or_default();
        if title.trim().is_empty() {
            info!("跳过无标题对话");
            continue;
        }
        let Some(mapping) = convo.mapping else {
            info!(title = %title, "跳过无消息对话");
            continue;
        };

        let id = convo
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}::{}", source_label, clean_title(&title)));

        match build_messages(mapping) {
            Ok(messages) => {
                debug!(title = %title, messages = messages.len(), "解析对话");
                load.conversations.push(Conversation {
                    id,
                    title,
                    created_at: convo.create_time.and_then(timestamp),
                    messages,
                });
            }
            Err(error) => {
                warn!(title = %title, %error, "对话校验失败，跳过");
                load.rejected.push(RejectedExport {
                    conversation_id: id,
                    title,
                    error,
                });
            }
        }
    }
    Ok(load)
}

fn build_messages(
    mapping: HashMap<String, RawNode>,
) -> std::result::Result<Vec<Message>, ValidationError> {
    let mut nodes: Vec<(String, RawMessage)> = mapping
        .into_iter()
        .filter_map(|(node_id, node)| node.message.map(|m| (node_id, m)))
        .collect();
    // 没有时间戳的节点排在最前，同时间戳按节点 ID 保持稳定
    nodes.sort_by(|(id_a, a), (id_b, b)| {
        let ta = a.create_time.unwrap_or(f64::MIN);
        let tb = b.create_time.unwrap_or(f64::MIN);
        ta.total_cmp(&tb).then_with(|| id_a.cmp(id_b))
    });

    let mut messages = Vec::new();
    for (_, raw) in nodes {
        let Some(text) = raw.content.and_then(|c| c.parts).map(join_parts) else {
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        let sequence = messages.len();
        let role = raw
            .author
            .and_then(|a| a.role)
            .ok_or(ValidationError::MissingRole { sequence })?
            .parse::<Role>()
            .map_err(|_| ValidationError::MissingRole { sequence })?;

        messages.push(Message {
            role,
            text,
            created_at: raw.create_time.and_then(timestamp),
            sequence,
        });
    }
    Ok(messages)
}

fn join_parts(parts: Vec<Value>) -> String {
    parts
        .iter()
        .filter_map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn timestamp(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
    DateTime::from_timestamp(whole, nanos.min(999_999_999))
}
