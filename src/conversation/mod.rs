//! 对话数据模型
//!
//! 管道只读取调用方交来的 [`Conversation`]，不修改它。
//! 原始导出文件的解析见 [`export`]。

pub mod export;

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 消息角色：`user` / `assistant` / `system` / `tool`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// 对话中的单条消息，解析后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// 在对话中的序号，必须严格递增
    pub sequence: usize,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>, sequence: usize) -> Self {
        Self {
            role,
            text: text.into(),
            created_at: None,
            sequence,
        }
    }

    pub fn user(text: impl Into<String>, sequence: usize) -> Self {
        Self::new(Role::User, text, sequence)
    }

    pub fn assistant(text: impl Into<String>, sequence: usize) -> Self {
        Self::new(Role::Assistant, text, sequence)
    }

    pub fn system(text: impl Into<String>, sequence: usize) -> Self {
        Self::new(Role::System, text, sequence)
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// 一条完整对话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            created_at: None,
            messages: Vec::new(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    /// 按序追加一条消息，序号自动取下一个
    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        let sequence = self.messages.last().map(|m| m.sequence + 1).unwrap_or(0);
        self.messages.push(Message::new(role, text, sequence));
    }

    /// 结构校验：ID 与标题非空、序号严格递增、时间戳不倒退
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyConversationId);
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingTitle);
        }

        for pair in self.messages.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.sequence <= prev.sequence {
                return Err(ValidationError::OutOfOrder {
                    previous: prev.sequence,
                    found: next.sequence,
                });
            }
            if let (Some(a), Some(b)) = (prev.created_at, next.created_at)
                && b < a
            {
                return Err(ValidationError::TimestampRegression {
                    sequence: next.sequence,
                });
            }
        }
        Ok(())
    }
}

/// 对外展示用的标题：空格替换为下划线
pub fn clean_title(title: &str) -> String {
    title.trim().replace(' ', "_")
}
