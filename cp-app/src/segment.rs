//! Reply segmentation.
//!
//! Strategies are tried in priority order: markdown (code fences or headings),
//! backslash-separated parts, long-text sentence packing, then a single message.
//! Lengths are counted in chars.

use regex::Regex;
use std::sync::LazyLock;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid code fence regex"));

const SENTENCE_TERMINATORS: &[char] = &['。', '！', '？', '.', '!', '?'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Markdown,
    Backslash,
    LongText,
    Single,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Backslash => "backslash",
            Self::LongText => "long_text",
            Self::Single => "single",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub strategy: Strategy,
    pub parts: Vec<String>,
}

pub fn plan(reply: &str, long_threshold: usize) -> SegmentPlan {
    let (strategy, parts) = if is_markdown(reply) {
        (Strategy::Markdown, split_markdown(reply))
    } else if reply.contains('\\') {
        (Strategy::Backslash, split_backslash(reply))
    } else if reply.chars().count() > long_threshold {
        (Strategy::LongText, split_long_text(reply, long_threshold))
    } else {
        (Strategy::Single, vec![reply.trim().to_string()])
    };
    let parts = parts.into_iter().filter(|p| !p.trim().is_empty()).collect();
    SegmentPlan { strategy, parts }
}

fn is_markdown(reply: &str) -> bool {
    reply.contains("```") || reply.lines().any(is_heading)
}

fn is_heading(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Fenced blocks are kept verbatim; everything between them is split into paragraphs.
pub fn split_markdown(reply: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = 0;
    for fence in CODE_FENCE.find_iter(reply) {
        out.extend(split_paragraphs(&reply[cursor..fence.start()]));
        out.push(fence.as_str().to_string());
        cursor = fence.end();
    }
    out.extend(split_paragraphs(&reply[cursor..]));
    out
}

/// Splits on blank lines and before every heading line.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut flush = |current: &mut Vec<&str>| {
        let joined = current.join("\n");
        let trimmed = joined.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
        current.clear();
    };
    for line in text.lines() {
        if line.trim().is_empty() {
            flush(&mut current);
            continue;
        }
        if is_heading(line) {
            flush(&mut current);
        }
        current.push(line);
    }
    flush(&mut current);
    out
}

pub fn split_backslash(reply: &str) -> Vec<String> {
    reply
        .split('\\')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Greedily packs paragraphs, then sentences, into chunks of at most `max_chars`.
/// A single sentence longer than `max_chars` is hard-split.
pub fn split_long_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut packer = Packer::new(max_chars);
    for paragraph in split_blank_lines(text) {
        if char_len(paragraph) <= max_chars {
            packer.push_paragraph(paragraph);
            continue;
        }
        for sentence in split_sentences(paragraph) {
            if char_len(sentence) <= max_chars {
                packer.push_sentence(sentence);
            } else {
                for piece in hard_split(sentence.trim(), max_chars) {
                    packer.push_sentence(&piece);
                }
            }
        }
    }
    packer.finish()
}

struct Packer {
    max_chars: usize,
    current: String,
    current_len: usize,
    out: Vec<String>,
}

impl Packer {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            current: String::new(),
            current_len: 0,
            out: Vec::new(),
        }
    }

    fn push_paragraph(&mut self, paragraph: &str) {
        let paragraph = paragraph.trim();
        let len = char_len(paragraph);
        let sep = if self.current.is_empty() { 0 } else { 2 };
        if self.current_len + sep + len > self.max_chars {
            self.flush();
        } else if sep > 0 {
            self.current.push_str("\n\n");
            self.current_len += sep;
        }
        self.current.push_str(paragraph);
        self.current_len += len;
    }

    fn push_sentence(&mut self, sentence: &str) {
        let len = char_len(sentence);
        if self.current_len + len > self.max_chars {
            self.flush();
        }
        self.current.push_str(sentence);
        self.current_len += len;
    }

    fn flush(&mut self) {
        let trimmed = self.current.trim();
        if !trimmed.is_empty() {
            self.out.push(trimmed.to_string());
        }
        self.current.clear();
        self.current_len = 0;
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.out
    }
}

fn split_blank_lines(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut blank_run_start: Option<usize> = None;
    let mut newlines = 0;
    for (idx, ch) in text.char_indices() {
        match ch {
            '\n' => {
                if blank_run_start.is_none() {
                    blank_run_start = Some(idx);
                }
                newlines += 1;
            }
            c if c.is_whitespace() && blank_run_start.is_some() => {}
            _ => {
                if let Some(run_start) = blank_run_start.take() {
                    if newlines >= 2 {
                        out.push(&text[start..run_start]);
                        start = idx;
                    }
                }
                newlines = 0;
            }
        }
    }
    out.push(&text[start..]);
    out.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

/// Sentences keep their terminator and any trailing whitespace.
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut after_terminator = false;
    for (idx, ch) in paragraph.char_indices() {
        if SENTENCE_TERMINATORS.contains(&ch) {
            after_terminator = true;
            continue;
        }
        if after_terminator {
            if ch.is_whitespace() {
                continue;
            }
            out.push(&paragraph[start..idx]);
            start = idx;
            after_terminator = false;
        }
    }
    if start < paragraph.len() {
        out.push(&paragraph[start..]);
    }
    out
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_fence_is_kept_verbatim_between_paragraphs() {
        let segments = plan("a```code```b", 500);
        assert_eq!(segments.strategy, Strategy::Markdown);
        assert_eq!(segments.parts, vec!["a", "```code```", "b"]);
    }

    #[test]
    fn multiline_fence_survives_blank_lines_inside() {
        let reply = "Try this:\n\n```rust\nfn main() {\n\n    println!(\"hi\");\n}\n```\n\nDone.";
        let segments = plan(reply, 500);
        assert_eq!(segments.parts.len(), 3);
        assert_eq!(segments.parts[0], "Try this:");
        assert!(segments.parts[1].starts_with("```rust") && segments.parts[1].ends_with("```"));
        assert!(segments.parts[1].contains("\n\n    println!"));
        assert_eq!(segments.parts[2], "Done.");
    }

    #[test]
    fn headings_start_new_segments() {
        let reply = "intro line\n# Title\nbody one\nbody two\n\n## Next\nmore";
        let segments = plan(reply, 500);
        assert_eq!(segments.strategy, Strategy::Markdown);
        assert_eq!(
            segments.parts,
            vec!["intro line", "# Title\nbody one\nbody two", "## Next\nmore"]
        );
    }

    #[test]
    fn markdown_takes_priority_over_backslash() {
        let segments = plan("# a\\b", 500);
        assert_eq!(segments.strategy, Strategy::Markdown);
        assert_eq!(segments.parts, vec!["# a\\b"]);
    }

    #[test]
    fn hash_inside_a_line_is_not_a_heading() {
        let segments = plan("issue #42 fixed\\thanks", 500);
        assert_eq!(segments.strategy, Strategy::Backslash);
        assert_eq!(segments.parts, vec!["issue #42 fixed", "thanks"]);
    }

    #[test]
    fn backslash_parts_are_trimmed_and_empty_parts_dropped() {
        assert_eq!(plan("x\\y\\z", 500).parts, vec!["x", "y", "z"]);
        assert_eq!(
            plan(" hello \\\\ world\\ ", 500).parts,
            vec!["hello", "world"]
        );
    }

    #[test]
    fn long_plain_reply_is_packed_on_sentence_boundaries() {
        let sentence = "This sentence is exactly forty chars!!! ";
        assert_eq!(char_len(sentence), 40);
        let reply: String = sentence.repeat(25);
        assert_eq!(char_len(&reply), 1000);

        let segments = plan(&reply, 500);
        assert_eq!(segments.strategy, Strategy::LongText);
        assert!(segments.parts.len() >= 2);
        for part in &segments.parts {
            assert!(char_len(part) <= 500, "chunk too long: {}", char_len(part));
            assert!(part.ends_with('!'), "chunk split mid-sentence: {part:?}");
        }
        let rejoined: String = segments.parts.join(" ");
        assert_eq!(rejoined, reply.trim_end());
    }

    #[test]
    fn long_reply_prefers_paragraph_boundaries() {
        let para_a = "a".repeat(300);
        let para_b = "b".repeat(150);
        let para_c = "c".repeat(300);
        let reply = format!("{para_a}\n\n{para_b}\n\n\n{para_c}");
        let parts = split_long_text(&reply, 500);
        assert_eq!(parts, vec![format!("{para_a}\n\n{para_b}"), para_c]);
    }

    #[test]
    fn oversized_sentence_is_hard_split() {
        let reply = "字".repeat(1200);
        let segments = plan(&reply, 500);
        assert_eq!(segments.strategy, Strategy::LongText);
        let lens: Vec<usize> = segments.parts.iter().map(|p| char_len(p)).collect();
        assert_eq!(lens, vec![500, 500, 200]);
    }

    #[test]
    fn cjk_sentences_split_after_full_width_terminators() {
        assert_eq!(split_sentences("你好。在吗？好的"), vec!["你好。", "在吗？", "好的"]);
    }

    #[test]
    fn short_reply_is_sent_whole() {
        let segments = plan("  just one line  ", 500);
        assert_eq!(segments.strategy, Strategy::Single);
        assert_eq!(segments.parts, vec!["just one line"]);
    }

    #[test]
    fn empty_reply_yields_no_parts() {
        assert!(plan("   ", 500).parts.is_empty());
    }
}
