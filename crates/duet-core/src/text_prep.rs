//! Text preparation for synthesis: markdown cleaning, sentence segmentation,
//! and rough size estimates.
//!
//! Pure functions, no I/O. Segmentation is char-based so CJK replies split
//! on `。！？` as readily as English splits on `. `.

use regex::Regex;
use std::sync::LazyLock;

/// Markdown rewrites, applied in order. Tables go before fences since a
/// table can sit inside one; images go before links so `![alt](src)` does
/// not leave a stray `!`.
const MARKDOWN_RULES: &[(&str, &str)] = &[
    (r"(?m)(?:^|\n)(\|[^\n]+\|(?:\n\|[^\n]+\|)*)", "\nSee the table in our conversation.\n"),
    (r"(?s)```.*?```", " See the code in our conversation. "),
    (r"`[^`]+`", ""),
    (r"(?m)^[\s]*[-*_]{3,}[\s]*$", ""),
    (r"\*\*([^*]+)\*\*", "$1"),
    (r"\*([^*]+)\*", "$1"),
    (r"#{1,6}\s*", ""),
    (r"!\[[^\]]*\]\([^)]+\)", ""),
    (r"\[([^\]]+)\]\([^)]+\)", "$1"),
    // List items become a spoken pause.
    (r"(?m)^[\s]*[-*]\s+", ". "),
    (r"(?m)^[\s]*\d+\.\s+", ". "),
    (r"[\x{1F300}-\x{1FAFF}\x{2600}-\x{27BF}\x{FE0F}\x{200D}]", ""),
];

/// Punctuation left behind by the rewrites above.
const TIDY_RULES: &[(&str, &str)] = &[(r"\.\s*\.", "."), (r"[ \t]{2,}", " ")];

static MARKDOWN: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| compile(MARKDOWN_RULES));
static TIDY: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| compile(TIDY_RULES));

/// Rules are constants, so a pattern that fails to compile is a bug.
fn compile(rules: &'static [(&'static str, &'static str)]) -> Vec<(Regex, &'static str)> {
    rules
        .iter()
        .map(|(pattern, with)| match Regex::new(pattern) {
            Ok(re) => (re, *with),
            Err(e) => panic!("text_prep rule {pattern:?}: {e}"),
        })
        .collect()
}

/// Full-width sentence terminators.
const CJK_TERMINATORS: &[char] = &['。', '！', '？', '；', '…'];

/// Closing marks that belong to the sentence they follow.
const CLOSERS: &[char] = &['”', '’', '」', '』', '）', ')', '"'];

/// Default segment length for incremental synthesis, in chars.
pub const DEFAULT_SEGMENT_CHARS: usize = 200;

/// Strip markdown and emoji so a reply reads naturally when spoken.
pub fn clean_text_for_tts(text: &str) -> String {
    let spoken = rewrite(text.to_string(), &MARKDOWN);
    // A list at the very top leaves a pause with nothing before it.
    let spoken = spoken.trim_start().trim_start_matches(". ").to_string();
    rewrite(spoken, &TIDY).trim().to_string()
}

fn rewrite(text: String, rules: &[(Regex, &'static str)]) -> String {
    rules
        .iter()
        .fold(text, |acc, (re, with)| re.replace_all(&acc, *with).into_owned())
}

/// Whether cleaned text has anything a synthesizer could say.
pub fn is_speakable(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.len() >= 2 && trimmed.chars().any(|c| c.is_alphanumeric())
}

/// Split text into sentences at `.`/`!`/`?` followed by whitespace, at
/// full-width terminators, or at paragraph breaks.
///
/// Returns non-empty, trimmed strings.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' && chars.peek() == Some(&'\n') {
            push_trimmed(&mut sentences, &mut current);
            while chars.peek() == Some(&'\n') {
                chars.next();
            }
            continue;
        }

        current.push(c);

        if CJK_TERMINATORS.contains(&c) {
            while let Some(&next) = chars.peek() {
                if CJK_TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            push_trimmed(&mut sentences, &mut current);
        } else if matches!(c, '.' | '!' | '?') && chars.peek().is_some_and(|n| n.is_whitespace()) {
            push_trimmed(&mut sentences, &mut current);
        }
    }

    push_trimmed(&mut sentences, &mut current);
    sentences
}

fn push_trimmed(out: &mut Vec<String>, current: &mut String) {
    let chunk = current.trim();
    if !chunk.is_empty() {
        out.push(chunk.to_string());
    }
    current.clear();
}

/// Split text into chunks of at most `max_len` chars.
///
/// Prefers sentence boundaries, then word boundaries, then hard-splits.
/// A trailing fragment shorter than 2 bytes is discarded.
pub fn split_text(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut result = Vec::new();
    let mut remaining = text;

    while remaining.chars().count() > max_len {
        let window_end = remaining
            .char_indices()
            .nth(max_len)
            .map_or(remaining.len(), |(i, _)| i);
        let window = &remaining[..window_end];

        let split_at = sentence_boundary(window, max_len)
            .or_else(|| word_boundary(window, max_len))
            .unwrap_or(window_end);

        let chunk = remaining[..split_at].trim_end();
        if !chunk.is_empty() {
            result.push(chunk.to_string());
        }
        remaining = remaining[split_at..].trim_start();
    }

    if remaining.len() >= 2 {
        result.push(remaining.to_string());
    }

    result
}

/// Byte offset just past the last sentence terminator in the back half of `window`.
fn sentence_boundary(window: &str, max_len: usize) -> Option<usize> {
    let ascii = window.rfind(". ").map(|pos| pos + 1);
    let wide = window
        .char_indices()
        .filter(|(_, c)| CJK_TERMINATORS.contains(c))
        .last()
        .map(|(pos, c)| pos + c.len_utf8());

    let at = ascii.max(wide)?;
    (window[..at].chars().count() >= max_len / 2).then_some(at)
}

fn word_boundary(window: &str, max_len: usize) -> Option<usize> {
    let pos = window.rfind(' ')?;
    (pos > 0 && window[..pos].chars().count() >= max_len / 3).then_some(pos)
}

/// Sentence segments for incremental synthesis: each sentence on its own,
/// with over-long sentences sub-split at `max_len`.
pub fn segment_for_synthesis(text: &str, max_len: usize) -> Vec<String> {
    let mut segments = Vec::new();
    for sentence in split_sentences(text) {
        if sentence.chars().count() <= max_len {
            segments.push(sentence);
        } else {
            segments.extend(split_text(&sentence, max_len));
        }
    }
    segments
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{4E00}'..='\u{9FFF}'
        | '\u{AC00}'..='\u{D7AF}'
        | '\u{F900}'..='\u{FAFF}')
}

/// Rough token count: about four chars per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Rough spoken duration: 3.5 CJK chars or 12 other chars per second.
pub fn estimate_speech_ms(text: &str) -> u64 {
    let (cjk, other) = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .fold((0usize, 0usize), |(cjk, other), c| {
            if is_cjk(c) {
                (cjk + 1, other)
            } else {
                (cjk, other + 1)
            }
        });
    let seconds = cjk as f64 / 3.5 + other as f64 / 12.0;
    (seconds * 1000.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── clean_text_for_tts ──────────────────────────────────────────

    #[test]
    fn every_rule_compiles() {
        assert_eq!(MARKDOWN.len(), MARKDOWN_RULES.len());
        assert_eq!(TIDY.len(), TIDY_RULES.len());
    }

    #[test]
    fn code_and_tables_become_placeholders() {
        let reply = "Try this:\n```python\nprint('hi')\n```\nor see\n| k | v |\n| a | 1 |\ndone";
        let spoken = clean_text_for_tts(reply);
        assert!(spoken.contains("See the code in our conversation."));
        assert!(spoken.contains("See the table in our conversation."));
        assert!(!spoken.contains("print"));
        assert!(spoken.ends_with("done"));
    }

    #[test]
    fn emphasis_and_inline_code_are_flattened() {
        assert_eq!(
            clean_text_for_tts("Run `cargo run` and **then** wait a *moment*."),
            "Run and then wait a moment."
        );
    }

    #[test]
    fn images_vanish_and_links_keep_their_text() {
        assert_eq!(
            clean_text_for_tts("look ![cat](http://x/cat.png) and [here](https://example.com)"),
            "look and here"
        );
    }

    #[test]
    fn emoji_are_dropped() {
        assert_eq!(clean_text_for_tts("好的😊 明白了👍"), "好的 明白了");
    }

    #[test]
    fn list_items_become_pauses() {
        let spoken = clean_text_for_tts("Two options:\n1. tea\n- coffee");
        assert!(spoken.contains(". tea"));
        assert!(spoken.contains(". coffee"));
        assert_eq!(clean_text_for_tts("- first\n- second"), "first\n. second");
    }

    #[test]
    fn headings_lose_their_marks() {
        assert_eq!(clean_text_for_tts("# 今天\n## 明天"), "今天\n明天");
    }

    #[test]
    fn plain_replies_pass_through() {
        assert_eq!(clean_text_for_tts("Sure, I can help with that."), "Sure, I can help with that.");
        assert_eq!(clean_text_for_tts("你好，有什么可以帮你？"), "你好，有什么可以帮你？");
        assert_eq!(clean_text_for_tts(""), "");
    }

    #[test]
    fn speakable_needs_letters() {
        assert!(is_speakable("ok"));
        assert!(is_speakable("好的"));
        assert!(!is_speakable("..."));
        assert!(!is_speakable(" "));
    }

    // ── split_sentences ─────────────────────────────────────────────

    #[test]
    fn split_sentences_latin() {
        let s = split_sentences("Hello there. How can I help? Just ask!");
        assert_eq!(s, vec!["Hello there.", "How can I help?", "Just ask!"]);
    }

    #[test]
    fn split_sentences_cjk() {
        let s = split_sentences("你好。今天天气怎么样？我很好！");
        assert_eq!(s, vec!["你好。", "今天天气怎么样？", "我很好！"]);
    }

    #[test]
    fn split_sentences_keeps_closing_quote() {
        let s = split_sentences("他说：“走吧。”然后离开了。");
        assert_eq!(s, vec!["他说：“走吧。”", "然后离开了。"]);
    }

    #[test]
    fn split_sentences_paragraph_break() {
        let s = split_sentences("First thought\n\nSecond thought.");
        assert_eq!(s, vec!["First thought", "Second thought."]);
    }

    #[test]
    fn split_sentences_edges() {
        assert!(split_sentences("").is_empty());
        assert_eq!(split_sentences("  Yes.   No.  "), vec!["Yes.", "No."]);
        assert_eq!(split_sentences("version 2.5 shipped"), vec!["version 2.5 shipped"]);
    }

    // ── split_text / segment_for_synthesis ──────────────────────────

    #[test]
    fn fitting_text_is_one_chunk() {
        assert_eq!(split_text("Short reply.", DEFAULT_SEGMENT_CHARS), vec!["Short reply."]);
    }

    #[test]
    fn prefers_sentence_then_word_boundaries() {
        let text = "One short line. Another line that runs on well past the chosen limit.";
        let chunks = split_text(text, 24);
        assert_eq!(chunks[0], "One short line.");

        let words = "again ".repeat(30);
        for chunk in split_text(words.trim(), 25) {
            assert!(chunk.chars().count() <= 25, "chunk too long: {chunk}");
            assert!(!chunk.starts_with(' ') && !chunk.ends_with(' '));
        }
    }

    #[test]
    fn unbroken_runs_are_hard_split() {
        let chunks = split_text(&"z".repeat(250), 100);
        let sizes: Vec<usize> = chunks.iter().map(String::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn cjk_splits_on_char_boundaries() {
        let text = "这是一个很长的句子。".repeat(10);
        let chunks = split_text(&text, 25);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 25));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn segments_respect_max_len() {
        let text = format!("Short one. {}", "long ".repeat(40));
        let segments = segment_for_synthesis(&text, 50);
        assert_eq!(segments[0], "Short one.");
        assert!(segments.iter().all(|s| s.chars().count() <= 50));
    }

    // ── estimates ───────────────────────────────────────────────────

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn speech_estimate_weights_cjk() {
        assert_eq!(estimate_speech_ms("你好你好你好你"), 2000);
        assert_eq!(estimate_speech_ms("abcdefghijkl"), 1000);
        assert_eq!(estimate_speech_ms("   "), 0);
    }
}
