//! Token 估算
//!
//! 只用于分片预算，不用于计费。所有实现必须对相同输入给出相同结果。

/// Token 计数策略
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// 按字符数估算：`ceil(字符数 / chars_per_token)`
///
/// 与文本内容无关，任何输入都能给出保守估计，是其他策略的兜底。
#[derive(Debug, Clone, Copy)]
pub struct CharEstimateCounter {
    chars_per_token: usize,
}

impl CharEstimateCounter {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharEstimateCounter {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenCounter for CharEstimateCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// 按空白分词计数；对中日文等没有空格的长文本退回字符估算，取两者较大值。
/// 纯空白文本计为 0。
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenCounter {
    fallback: CharEstimateCounter,
}

impl TokenCounter for WordTokenCounter {
    fn count(&self, text: &str) -> usize {
        if text.trim().is_empty() {
            return 0;
        }
        let words = text.split_whitespace().count();
        words.max(self.fallback.count(text))
    }
}
