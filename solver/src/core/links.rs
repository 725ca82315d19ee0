//! URL resolution for links found on task pages and in judge responses.

use url::Url;

/// Resolve `target` against `base`.
///
/// Absolute targets are returned unchanged; relative ones are joined onto
/// `base`. Returns `None` when neither yields an http(s) URL.
pub fn resolve_link(base: &str, target: &str) -> Option<String> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }
    let resolved = match Url::parse(target) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base).ok()?.join(target).ok()?,
        Err(_) => return None,
    };
    is_web_url(&resolved).then(|| resolved.to_string())
}

/// True if `raw` parses as an absolute http(s) URL.
pub fn is_http_url(raw: &str) -> bool {
    Url::parse(raw.trim()).is_ok_and(|url| is_web_url(&url))
}

fn is_web_url(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host().is_some()
}
