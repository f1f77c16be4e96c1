//! 超长消息的二级切分
//!
//! 依次按段落、句子、字符切分，再把小块贪心合并回不超过预算的片段。
//! 切分是无损的：所有片段按序拼接等于原文。

use super::token::TokenCounter;
use crate::error::ChunkingError;

/// 切分单条超出 `max_tokens` 的消息文本
pub fn split_oversized(
    text: &str,
    sequence: usize,
    max_tokens: usize,
    counter: &dyn TokenCounter,
) -> Result<Vec<String>, ChunkingError> {
    let mut units: Vec<&str> = Vec::new();

    for paragraph in text.split_inclusive("\n\n") {
        if counter.count(paragraph) <= max_tokens {
            units.push(paragraph);
            continue;
        }
        for sentence in split_sentences(paragraph) {
            if counter.count(sentence) <= max_tokens {
                units.push(sentence);
            } else {
                units.extend(hard_split(sentence, sequence, max_tokens, counter)?);
            }
        }
    }

    Ok(pack(units, max_tokens, counter))
}

/// 句子边界：`.` `!` `?` 后跟空白、中文句末标点、换行。边界后的空白归前一句。
fn split_sentences(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i].1;
        let next_is_space = chars.get(i + 1).is_none_or(|(_, n)| n.is_whitespace());
        let is_end = matches!(c, '。' | '！' | '？' | '\n')
            || (matches!(c, '.' | '!' | '?') && next_is_space);
        if !is_end {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        while j < chars.len() && chars[j].1.is_whitespace() {
            j += 1;
        }
        let end = chars.get(j).map_or(text.len(), |(b, _)| *b);
        pieces.push(&text[start..end]);
        start = end;
        i = j;
    }

    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// 按字符边界硬切，每段取满足预算的最长前缀
fn hard_split<'a>(
    text: &'a str,
    sequence: usize,
    max_tokens: usize,
    counter: &dyn TokenCounter,
) -> Result<Vec<&'a str>, ChunkingError> {
    let mut pieces = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        // 字符边界（字节偏移），boundaries[k] 为前 k 个字符的结尾
        let boundaries: Vec<usize> = rest
            .char_indices()
            .map(|(b, _)| b)
            .skip(1)
            .chain(std::iter::once(rest.len()))
            .collect();

        let smallest = counter.count(&rest[..boundaries[0]]);
        if smallest > max_tokens {
            return Err(ChunkingError::Unsplittable {
                sequence,
                tokens: smallest,
                max_tokens,
            });
        }

        let (mut lo, mut hi) = (0, boundaries.len() - 1);
        let mut best = 0;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if counter.count(&rest[..boundaries[mid]]) <= max_tokens {
                best = mid;
                lo = mid + 1;
            } else if mid == 0 {
                break;
            } else {
                hi = mid - 1;
            }
        }

        let (head, tail) = rest.split_at(boundaries[best]);
        pieces.push(head);
        rest = tail;
    }
    Ok(pieces)
}

/// 贪心合并：相邻小块在不超预算时拼成一段
fn pack(units: Vec<&str>, max_tokens: usize, counter: &dyn TokenCounter) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();

    for unit in units {
        if current.is_empty() {
            current.push_str(unit);
            continue;
        }
        let candidate = format!("{current}{unit}");
        if counter.count(&candidate) <= max_tokens {
            current = candidate;
        } else {
            out.push(std::mem::take(&mut current));
            current.push_str(unit);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::token::{CharEstimateCounter, WordTokenCounter};

    struct HeavyCounter;

    impl TokenCounter for HeavyCounter {
        fn count(&self, text: &str) -> usize {
            if text.is_empty() { 0 } else { 1_000 }
        }
    }

    #[test]
    fn test_split_prefers_paragraphs() {
        let counter = WordTokenCounter::default();
        let para = |n: usize| vec!["w"; n].join(" ");
        let text = format!("{}\n\n{}\n\n{}", para(8), para(8), para(8));

        let pieces = split_oversized(&text, 0, 10, &counter).unwrap();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces.concat(), text);
        assert!(pieces[0].ends_with("\n\n"));
    }

    #[test]
    fn test_split_falls_back_to_sentences() {
        let counter = WordTokenCounter::default();
        let text = "One two three four. Five six seven eight! Nine ten eleven twelve?";

        let pieces = split_oversized(text, 0, 6, &counter).unwrap();
        assert_eq!(pieces.concat(), text);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], "One two three four. ");
        for piece in &pieces {
            assert!(counter.count(piece) <= 6);
        }
    }

    #[test]
    fn test_split_does_not_break_decimals() {
        let sentences = split_sentences("Pi is 3.14 today. Done.");
        assert_eq!(sentences, vec!["Pi is 3.14 today. ", "Done."]);
    }

    #[test]
    fn test_split_chinese_sentences() {
        let sentences = split_sentences("所有权很重要。借用也是！");
        assert_eq!(sentences, vec!["所有权很重要。", "借用也是！"]);
    }

    #[test]
    fn test_hard_split_last_resort() {
        let counter = CharEstimateCounter::default();
        let text = "x".repeat(1_000);

        let pieces = split_oversized(&text, 3, 100, &counter).unwrap();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].len(), 400);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_hard_split_respects_char_boundaries() {
        let counter = CharEstimateCounter::new(1);
        let text = "借用检查器".repeat(10);

        let pieces = split_oversized(&text, 0, 7, &counter).unwrap();
        assert_eq!(pieces.concat(), text);
        assert!(pieces.iter().all(|p| p.chars().count() <= 7));
    }

    #[test]
    fn test_unsplittable() {
        let err = split_oversized("abc", 4, 10, &HeavyCounter).unwrap_err();
        assert_eq!(
            err,
            ChunkingError::Unsplittable {
                sequence: 4,
                tokens: 1_000,
                max_tokens: 10
            }
        );
    }
}
