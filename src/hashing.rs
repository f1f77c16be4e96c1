//! 内容寻址键
//!
//! 键只取决于消息的角色与文本（空白归一、保持顺序），与分片序号、时间戳、
//! 所属对话无关。两个键相同即视为同一内容，不会重复合成。

use crate::chunking::ChatFragment;
use crate::conversation::Message;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write};

/// 64 位十六进制 SHA-256
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 日志用短格式
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl ContentHasher {
    pub fn new() -> Self {
        Self
    }

    pub fn hash(&self, fragment: &ChatFragment) -> ContentHash {
        self.hash_messages(&fragment.messages)
    }

    pub fn hash_messages(&self, messages: &[Message]) -> ContentHash {
        let mut hasher = Sha256::new();
        hasher.update(Self::normalized(messages).as_bytes());
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(64);
        for b in digest {
            let _ = write!(hex, "{:02x}", b);
        }
        ContentHash(hex)
    }

    /// 每条消息一行：`{role}: {空白归一后的文本}`
    fn normalized(messages: &[Message]) -> String {
        let mut out = String::new();
        for message in messages {
            out.push_str(message.role.as_str());
            out.push_str(": ");
            out.push_str(&collapse_whitespace(&message.text));
            out.push('\n');
        }
        out
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Message, Role};

    #[test]
    fn test_hash_is_fixed_length_hex() {
        let hash = ContentHasher::new().hash_messages(&[Message::user("hello", 0)]);
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash.short().len(), 12);
    }

    #[test]
    fn test_hash_ignores_sequence_timestamp_and_whitespace() {
        let hasher = ContentHasher::new();
        let a = hasher.hash_messages(&[
            Message::user("What is  ownership?", 0),
            Message::assistant("One owner.\n", 1),
        ]);
        let b = hasher.hash_messages(&[
            Message::user(" What is ownership? ", 7).at(chrono::Utc::now()),
            Message::assistant("One\towner.", 9),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_depends_on_role_and_order() {
        let hasher = ContentHasher::new();
        let base = hasher.hash_messages(&[Message::user("a", 0), Message::assistant("b", 1)]);
        let swapped_roles =
            hasher.hash_messages(&[Message::assistant("a", 0), Message::user("b", 1)]);
        let swapped_order =
            hasher.hash_messages(&[Message::assistant("b", 0), Message::user("a", 1)]);
        assert_ne!(base, swapped_roles);
        assert_ne!(base, swapped_order);
        assert_ne!(
            base,
            hasher.hash_messages(&[Message::new(Role::Tool, "a", 0), Message::assistant("b", 1)])
        );
    }

    #[test]
    fn test_message_boundaries_matter() {
        let hasher = ContentHasher::new();
        let joined = hasher.hash_messages(&[Message::user("a b", 0)]);
        let split = hasher.hash_messages(&[Message::user("a", 0), Message::user("b", 1)]);
        assert_ne!(joined, split);
    }
}
