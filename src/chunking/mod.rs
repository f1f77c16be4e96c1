//! 对话分片
//!
//! [`ConversationChunker`] 把一条对话按 token 预算贪心切成连续的 [`ChatFragment`]：
//!
//! - 片段边界只落在消息之间，不切开消息
//! - 单条消息超出预算时交给 [`splitter`] 按段落 / 句子 / 字符再切，
//!   每段成为独立片段，并以 [`MessagePart`] 标记
//! - 片段序号从 1 开始连续编号，对外名称为 `{标题}_{NN}`
//!
//! 分片是纯函数，不产生任何副作用。

pub mod splitter;
pub mod token;

use crate::conversation::{Conversation, Message, clean_title};
use crate::error::{ChunkingError, ValidationError};
use crate::hashing::{ContentHash, ContentHasher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use token::{CharEstimateCounter, TokenCounter};
use tracing::debug;

/// 超长消息切分后的第几段（从 1 开始）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePart {
    pub index: usize,
    pub total: usize,
}

/// 一条对话的连续消息切片，只在单次运行中存在
#[derive(Debug, Clone, PartialEq)]
pub struct ChatFragment {
    pub fragment_index: usize,
    pub source_conversation_id: String,
    pub conversation_title: String,
    pub messages: Vec<Message>,
    pub token_count: usize,
    pub content_hash: ContentHash,
    /// 仅当片段承载的是超长消息的一段时存在
    pub part: Option<MessagePart>,
}

impl ChatFragment {
    pub fn name(&self) -> String {
        fragment_name(&self.conversation_title, self.fragment_index)
    }

    /// 交给摘要服务的文本：每条消息 `[role]: text`
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("[{}]: {}", m.role, m.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 无法切分的片段，占用一个序号以便按名称报告
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub fragment_index: usize,
    pub conversation_id: String,
    pub fragment_name: String,
    pub error: ChunkingError,
}

/// 一条对话的分片结果
#[derive(Debug, Clone, Default)]
pub struct Chunking {
    pub fragments: Vec<ChatFragment>,
    pub failures: Vec<ChunkFailure>,
}

impl Chunking {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty() && self.failures.is_empty()
    }
}

/// `{clean_title}_{NN}`，序号至少两位补零
pub fn fragment_name(title: &str, index: usize) -> String {
    format!("{}_{:02}", clean_title(title), index)
}

/// 把分片里的消息还原为原始消息序列（超长消息的各段重新拼接）
pub fn reassemble(fragments: &[ChatFragment]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    for fragment in fragments {
        for message in &fragment.messages {
            match fragment.part {
                Some(part) if part.index > 1 => {
                    if let Some(last) = out.last_mut() {
                        last.text.push_str(&message.text);
                    }
                }
                _ => out.push(message.clone()),
            }
        }
    }
    out
}

pub struct ConversationChunker {
    counter: Arc<dyn TokenCounter>,
    hasher: ContentHasher,
}

impl Default for ConversationChunker {
    fn default() -> Self {
        Self::new(Arc::new(CharEstimateCounter::default()))
    }
}

impl ConversationChunker {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            counter,
            hasher: ContentHasher::new(),
        }
    }

    pub fn counter(&self) -> &dyn TokenCounter {
        self.counter.as_ref()
    }

    /// 贪心分片：`running + count(next) <= max_tokens` 时并入当前片段，否则另起一段
    pub fn chunk(
        &self,
        conversation: &Conversation,
        max_tokens: usize,
    ) -> Result<Chunking, ValidationError> {
        conversation.validate()?;
        let max_tokens = max_tokens.max(1);

        let mut builder = FragmentBuilder::new(conversation, &self.hasher);
        let mut current: Vec<Message> = Vec::new();
        let mut running = 0usize;

        for message in &conversation.messages {
            let tokens = self.counter.count(&message.text);

            if tokens > max_tokens {
                builder.close(&mut current, running, None);
                running = 0;
                self.split_message(message, max_tokens, &mut builder);
                continue;
            }

            if !current.is_empty() && running + tokens > max_tokens {
                builder.close(&mut current, running, None);
                running = 0;
            }
            current.push(message.clone());
            running += tokens;
        }
        builder.close(&mut current, running, None);

        let chunking = builder.finish();
        debug!(
            conversation = %conversation.id,
            fragments = chunking.fragments.len(),
            failures = chunking.failures.len(),
            "✂️ 对话分片完成"
        );
        Ok(chunking)
    }

    fn split_message(&self, message: &Message, max_tokens: usize, builder: &mut FragmentBuilder) {
        match splitter::split_oversized(
            &message.text,
            message.sequence,
            max_tokens,
            self.counter.as_ref(),
        ) {
            Ok(pieces) => {
                let total = pieces.len();
                for (i, text) in pieces.into_iter().enumerate() {
                    let tokens = self.counter.count(&text);
                    let mut piece = vec![Message {
                        text,
                        ..message.clone()
                    }];
                    builder.close(
                        &mut piece,
                        tokens,
                        Some(MessagePart {
                            index: i + 1,
                            total,
                        }),
                    );
                }
            }
            Err(error) => builder.fail(error),
        }
    }
}

/// 负责连续编号与哈希
struct FragmentBuilder<'a> {
    conversation: &'a Conversation,
    hasher: &'a ContentHasher,
    next_index: usize,
    out: Chunking,
}

impl<'a> FragmentBuilder<'a> {
    fn new(conversation: &'a Conversation, hasher: &'a ContentHasher) -> Self {
        Self {
            conversation,
            hasher,
            next_index: 1,
            out: Chunking::default(),
        }
    }

    fn close(
        &mut self,
        messages: &mut Vec<Message>,
        token_count: usize,
        part: Option<MessagePart>,
    ) {
        if messages.is_empty() {
            return;
        }
        let messages = std::mem::take(messages);
        let content_hash = self.hasher.hash_messages(&messages);
        self.out.fragments.push(ChatFragment {
            fragment_index: self.next_index,
            source_conversation_id: self.conversation.id.clone(),
            conversation_title: self.conversation.title.clone(),
            messages,
            token_count,
            content_hash,
            part,
        });
        self.next_index += 1;
    }

    fn fail(&mut self, error: ChunkingError) {
        self.out.failures.push(ChunkFailure {
            fragment_index: self.next_index,
            conversation_id: self.conversation.id.clone(),
            fragment_name: fragment_name(&self.conversation.title, self.next_index),
            error,
        });
        self.next_index += 1;
    }

    fn finish(self) -> Chunking {
        self.out
    }
}
