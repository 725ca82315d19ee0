//! Fetching task pages and reducing them to visible text.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::types::TaskContent;
use crate::io::config::RendererConfig;

/// Produces the content of a task page.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<TaskContent>;
}

/// Plain HTTP renderer: no script execution, no screenshot.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    client: reqwest::Client,
    min_text_chars: usize,
}

impl HttpRenderer {
    pub fn new(config: &RendererConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("build renderer http client")?;
        Ok(Self {
            client,
            min_text_chars: config.min_text_chars,
        })
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<TaskContent> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("fetch {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("fetch {url}: http {status}");
        }
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("html"));
        let body = response
            .text()
            .await
            .with_context(|| format!("read body of {url}"))?;

        let text = if is_html || body.trim_start().starts_with('<') {
            visible_text_or_raw(&body, self.min_text_chars)
        } else {
            body.trim().to_string()
        };
        debug!(bytes = body.len(), text_chars = text.chars().count(), "page fetched");
        Ok(TaskContent {
            url: url.to_string(),
            text,
            screenshot: None,
        })
    }
}

/// Visible text of `html`, or the raw markup when too little text is visible
/// (pages that build their content from inline scripts).
pub fn visible_text_or_raw(html: &str, min_text_chars: usize) -> String {
    let text = html_to_text(html);
    if text.chars().count() < min_text_chars {
        debug!(
            visible_chars = text.chars().count(),
            "visible text too short, using raw body"
        );
        return html.trim().to_string();
    }
    text
}

static HIDDEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<!--.*?-->|<(script|style|noscript|template)\b[^>]*>.*?</(?:script|style|noscript|template)\s*>")
        .expect("hidden block regex is valid")
});
static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']?([^"'\s>]+)["']?[^>]*>(.*?)</a\s*>"#)
        .expect("anchor regex is valid")
});
static MEDIA_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<(?:audio|source)\b[^>]*?\bsrc\s*=\s*["']?([^"'\s>]+)["']?[^>]*>"#)
        .expect("media regex is valid")
});
static BLOCK_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(?:br|/?p|/?div|/?li|/?tr|/?h[1-6]|/?pre|/?table|/?section|/?article)\b[^>]*>")
        .expect("block tag regex is valid")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex is valid"));
static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]+);").expect("entity regex is valid")
});

/// Reduce HTML to readable text.
///
/// Scripts, styles and comments are dropped. Link targets stay inline as
/// `label (href)` and audio sources as `[audio: src]` so later stages can
/// still find them.
pub fn html_to_text(html: &str) -> String {
    let without_hidden = HIDDEN_RE.replace_all(html, " ");
    let with_links = ANCHOR_RE.replace_all(&without_hidden, |caps: &regex::Captures<'_>| {
        let href = &caps[1];
        let label = TAG_RE.replace_all(&caps[2], "");
        let label = label.trim();
        if label.is_empty() || label == href {
            format!(" {href} ")
        } else {
            format!(" {label} ({href}) ")
        }
    });
    let with_media = MEDIA_SRC_RE.replace_all(&with_links, " [audio: $1] ");
    let with_breaks = BLOCK_TAG_RE.replace_all(&with_media, "\n");
    let stripped = TAG_RE.replace_all(&with_breaks, " ");
    let decoded = decode_entities(&stripped);

    decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    ENTITY_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let entity = &caps[1];
            let decoded = if let Some(hex) = entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match entity {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    _ => None,
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}
