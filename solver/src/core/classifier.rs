//! Deterministic classification of fetched task pages.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::links::resolve_link;
use crate::core::types::TaskKind;

static AUDIO_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)[^\s'"<>()\[\]]+\.(?:mp3|wav|ogg|m4a|flac|opus)\b"#)
        .expect("audio regex is valid")
});
static DATA_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:csv|json|pdf|xlsx?|excel|spreadsheet|dataset|parquet|table)\b")
        .expect("data hint regex is valid")
});

/// Classify page text into `AUDIO` vs `DATA` vs `TEXT`.
///
/// - `AUDIO` if the text references an audio file that resolves to an
///   http(s) URL against `page_url`.
/// - `DATA` if it mentions a data file or structured format.
/// - `TEXT` otherwise.
pub fn classify_task(page_url: &str, text: &str) -> TaskKind {
    if let Some(audio_url) = find_audio_url(page_url, text) {
        return TaskKind::Audio { audio_url };
    }
    if DATA_HINT_RE.is_match(text) {
        return TaskKind::Data;
    }
    TaskKind::Text
}

fn find_audio_url(page_url: &str, text: &str) -> Option<String> {
    AUDIO_REF_RE
        .find_iter(text)
        .find_map(|m| resolve_link(page_url, trim_attr_prefix(m.as_str())))
}

/// Drop a leading `src=` / `href=` left over when markup was not rendered.
fn trim_attr_prefix(token: &str) -> &str {
    token
        .split_once('=')
        .filter(|(name, _)| matches!(name.to_ascii_lowercase().as_str(), "src" | "href"))
        .map_or(token, |(_, value)| value)
}
