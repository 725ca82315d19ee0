//! Layered recovery of `{answer, submit_url}` from free-form output.
//!
//! Generated programs are allowed to print logging noise next to their final
//! JSON, and models wrap JSON in markdown or prose. Candidates are tried in a
//! fixed order and the first one that parses wins:
//!
//! 1. the whole trimmed text, then the text with markdown fences stripped;
//! 2. every top-level brace-balanced `{...}` block, last block first;
//! 3. when the text mentions `"answer":`, the span from the first `{` to the
//!    last `}`;
//! 4. the last brace block rewritten from Python dict syntax.
//!
//! Nothing here panics or errors: failure is `None`, which callers turn into
//! retry feedback.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::types::Answer;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+.\-]*[ \t]*\r?\n(.*?)```").expect("fence regex is valid")
});
static ANSWER_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""answer"\s*:"#).expect("answer marker regex is valid"));
static PY_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(True|False|None)\b").expect("literal regex is valid"));

/// Unclosed `{` tolerated by one scan direction before it stops.
const MAX_BLOCK_RESTARTS: usize = 64;

/// Recover the first parseable JSON value from `output`.
pub fn extract_json(output: &str) -> Option<Value> {
    candidates(output)
        .iter()
        .find_map(|candidate| serde_json::from_str(candidate).ok())
}

/// Recover a structured answer from `output`.
///
/// A candidate only counts when it is an object with a non-null `answer`.
pub fn extract_answer(output: &str) -> Option<Answer> {
    candidates(output).iter().find_map(|candidate| {
        serde_json::from_str::<Value>(candidate)
            .ok()
            .and_then(|value| Answer::from_value(&value))
    })
}

/// Remove markdown code fences around model output.
///
/// With several fenced blocks the longest one is kept. An opening fence
/// without a closing one (truncated output) is dropped along with its tag.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let longest = FENCE_RE
        .captures_iter(trimmed)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .max_by_key(|block| block.len());
    if let Some(block) = longest {
        return block.trim().to_string();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
        return body.trim_end().trim_end_matches("```").trim().to_string();
    }
    trimmed.to_string()
}

fn candidates(output: &str) -> Vec<Cow<'_, str>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut out: Vec<Cow<'_, str>> = vec![Cow::Borrowed(trimmed)];

    let unfenced = strip_code_fences(trimmed);
    if unfenced != trimmed {
        out.push(Cow::Owned(unfenced));
    }

    let blocks = brace_blocks(trimmed);
    out.extend(blocks.iter().rev().map(|block| Cow::Borrowed(*block)));

    if let Some(span) = answer_marker_span(trimmed) {
        out.push(Cow::Borrowed(span));
    }

    if let Some(repaired) = blocks.last().and_then(|block| repair_python_literal(block)) {
        out.push(Cow::Owned(repaired));
    }

    out
}

/// Top-level brace-balanced blocks, in order of appearance.
///
/// Braces inside double-quoted strings are ignored. Quotes outside any block
/// (log prose) are not tracked. When too many unclosed `{` stop the forward
/// scan, the rest of the text is searched from the end for its last block.
fn brace_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut pos = 0;
    let mut restarts = 0;
    while let Some(rel) = text[pos..].find('{') {
        let open = pos + rel;
        match matching_close(text, open) {
            Some(close) => {
                blocks.push(&text[open..=close]);
                pos = close + 1;
            }
            None => {
                restarts += 1;
                pos = open + 1;
                if restarts > MAX_BLOCK_RESTARTS {
                    blocks.extend(last_block(text, pos));
                    break;
                }
            }
        }
    }
    blocks
}

/// The last top-level block in `text[from..]`, found by walking `{` backwards.
fn last_block(text: &str, from: usize) -> Option<&str> {
    let mut found: Option<(usize, usize)> = None;
    let mut misses = 0;
    for (rel, _) in text[from..].rmatch_indices('{') {
        let open = from + rel;
        match matching_close(text, open) {
            Some(close) if found.is_none_or(|(_, end)| close > end) => found = Some((open, close)),
            Some(_) => break,
            None => {
                misses += 1;
                if misses > MAX_BLOCK_RESTARTS {
                    break;
                }
            }
        }
    }
    found.map(|(open, close)| &text[open..=close])
}

/// Byte index of the `}` closing the `{` at `open`.
fn matching_close(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[open..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// First `{` through last `}`, only when the text carries an answer marker.
fn answer_marker_span(text: &str) -> Option<&str> {
    if !ANSWER_MARKER_RE.is_match(text) {
        return None;
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Rewrite a Python dict literal (`{'answer': True}`) as JSON.
///
/// Only applied when the block has no double quotes, so apostrophes inside
/// JSON strings are never touched.
fn repair_python_literal(block: &str) -> Option<String> {
    if block.contains('"') || !block.contains('\'') {
        return None;
    }
    let quoted = block.replace('\'', "\"");
    let repaired = PY_LITERAL_RE.replace_all(&quoted, |caps: &regex::Captures<'_>| match &caps[1] {
        "True" => "true",
        "False" => "false",
        _ => "null",
    });
    Some(repaired.into_owned())
}
