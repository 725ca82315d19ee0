//! Reasoning-service ports and the OpenAI-compatible client behind them.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::types::ModelTier;
use crate::io::config::{Credentials, ReasonerConfig};

/// One completion request.
#[derive(Clone, PartialEq, Eq)]
pub struct ReasonerRequest {
    pub system: String,
    pub prompt: String,
    pub tier: ModelTier,
    /// Image attached to the user message (PNG or JPEG bytes).
    pub image: Option<Vec<u8>>,
    /// Ask the service for a JSON object response.
    pub json_mode: bool,
}

impl std::fmt::Debug for ReasonerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasonerRequest")
            .field("tier", &self.tier)
            .field("system_len", &self.system.len())
            .field("prompt_len", &self.prompt.len())
            .field("image_len", &self.image.as_ref().map(Vec::len))
            .field("json_mode", &self.json_mode)
            .finish()
    }
}

/// Text-in, text-out reasoning service.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn complete(&self, request: ReasonerRequest) -> Result<String>;
}

/// Speech-to-text for audio tasks.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_url: &str) -> Result<String>;
}

/// Client for an OpenAI-compatible API (chat completions and transcriptions).
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    fast_model: String,
    strong_model: String,
    transcription_model: String,
    max_audio_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl OpenAiClient {
    pub fn new(config: &ReasonerConfig, credentials: &Credentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("build reasoner http client")?;
        Ok(Self {
            http,
            base_url: config.effective_base_url(credentials),
            api_key: credentials.api_key.clone(),
            fast_model: config.fast_model.clone(),
            strong_model: config.strong_model.clone(),
            transcription_model: config.transcription_model.clone(),
            max_audio_bytes: config.max_audio_bytes,
        })
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Strong => &self.strong_model,
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn chat(&self, request: &ReasonerRequest, tier: ModelTier) -> Result<String> {
        let model = self.model_for(tier);
        let body = chat_body(model, request);
        let response = self
            .authorize(self.http.post(format!("{}/chat/completions", self.base_url)))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("send chat completion ({model})"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("chat completion ({model}) failed: http {status}: {}", excerpt(&text, 300));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .with_context(|| format!("decode chat completion ({model})"))?;
        if let Some(usage) = &parsed.usage {
            info!(
                model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "completion usage"
            );
        }
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| anyhow!("chat completion ({model}) returned no content"))
    }

    /// Download audio into memory, refusing anything over the size cap.
    async fn download_audio(&self, audio_url: &str) -> Result<Vec<u8>> {
        let mut response = self
            .http
            .get(audio_url)
            .send()
            .await
            .with_context(|| format!("download audio {audio_url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("download audio {audio_url}: http {status}");
        }
        if let Some(len) = response.content_length()
            && len > self.max_audio_bytes as u64
        {
            bail!(
                "audio {audio_url} is {len} bytes, over the {} byte limit",
                self.max_audio_bytes
            );
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("read audio {audio_url}"))?
        {
            if bytes.len() + chunk.len() > self.max_audio_bytes {
                bail!(
                    "audio {audio_url} exceeds the {} byte limit",
                    self.max_audio_bytes
                );
            }
            bytes.extend_from_slice(&chunk);
        }
        debug!(bytes = bytes.len(), "audio downloaded");
        Ok(bytes)
    }
}

#[async_trait]
impl Reasoner for OpenAiClient {
    #[instrument(skip_all, fields(tier = %request.tier, json_mode = request.json_mode))]
    async fn complete(&self, request: ReasonerRequest) -> Result<String> {
        match self.chat(&request, request.tier).await {
            Ok(content) => Ok(content),
            Err(err) if request.tier == ModelTier::Strong => {
                warn!(err = %err, "strong tier failed, falling back to fast tier");
                self.chat(&request, ModelTier::Fast)
                    .await
                    .with_context(|| format!("fallback after strong tier error: {err}"))
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Transcriber for OpenAiClient {
    #[instrument(skip(self))]
    async fn transcribe(&self, audio_url: &str) -> Result<String> {
        let audio = self.download_audio(audio_url).await?;
        let part = reqwest::multipart::Part::bytes(audio).file_name(audio_file_name(audio_url));
        let form = reqwest::multipart::Form::new()
            .text("model", self.transcription_model.clone())
            .part("file", part);
        let response = self
            .authorize(
                self.http
                    .post(format!("{}/audio/transcriptions", self.base_url)),
            )
            .multipart(form)
            .send()
            .await
            .context("send transcription request")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("transcription failed: http {status}: {}", excerpt(&text, 300));
        }
        let parsed: TranscriptionResponse =
            response.json().await.context("decode transcription")?;
        info!(chars = parsed.text.len(), "audio transcribed");
        Ok(parsed.text)
    }
}

fn chat_body(model: &str, request: &ReasonerRequest) -> Value {
    let user_content = match &request.image {
        Some(image) => json!([
            { "type": "text", "text": request.prompt },
            { "type": "image_url", "image_url": { "url": image_data_url(image) } },
        ]),
        None => Value::String(request.prompt.clone()),
    };
    let mut body = json!({
        "model": model,
        "temperature": 0,
        "messages": [
            { "role": "system", "content": request.system },
            { "role": "user", "content": user_content },
        ],
    });
    if request.json_mode {
        body["response_format"] = json!({ "type": "json_object" });
    }
    body
}

fn image_data_url(image: &[u8]) -> String {
    let mime = if image.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else {
        "image/png"
    };
    format!("data:{mime};base64,{}", BASE64.encode(image))
}

/// File name for the multipart upload; the extension tells the service the format.
fn audio_file_name(audio_url: &str) -> String {
    url::Url::parse(audio_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "audio.mp3".to_string())
}

/// First `max_chars` characters of `text`, marked when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Last `max_chars` characters of `text`, marked when cut.
pub fn tail_excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - max_chars).collect();
    format!("...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(image: Option<Vec<u8>>, json_mode: bool) -> ReasonerRequest {
        ReasonerRequest {
            system: "sys".to_string(),
            prompt: "question".to_string(),
            tier: ModelTier::Fast,
            image,
            json_mode,
        }
    }

    #[test]
    fn text_only_body() {
        let body = chat_body("gpt-4o-mini", &request(None, false));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(body["messages"][1]["content"], "question");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn image_and_json_mode_body() {
        let png = vec![0x89, b'P', b'N', b'G'];
        let body = chat_body("gpt-4o", &request(Some(png), true));
        assert_eq!(body["response_format"]["type"], "json_object");
        let parts = body["messages"][1]["content"]
            .as_array()
            .expect("content parts");
        assert_eq!(parts[0]["text"], "question");
        let url = parts[1]["image_url"]["url"].as_str().expect("url");
        assert!(url.starts_with("data:image/png;base64,"), "{url}");
    }

    #[test]
    fn jpeg_images_get_jpeg_mime() {
        assert!(image_data_url(&[0xFF, 0xD8, 0xFF, 0xE0]).starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn audio_file_name_from_url() {
        assert_eq!(audio_file_name("https://cdn.example/a/clip.wav?x=1"), "clip.wav");
        assert_eq!(audio_file_name("https://cdn.example/"), "audio.mp3");
    }

    #[test]
    fn excerpt_marks_cuts() {
        assert_eq!(excerpt("  short  ", 10), "short");
        assert_eq!(excerpt("abcdefghij", 4), "abcd...");
        assert_eq!(tail_excerpt("  short  ", 10), "short");
        assert_eq!(tail_excerpt("abcdefghij", 4), "...ghij");
    }

    #[test]
    fn request_debug_hides_prompt_text() {
        let debug = format!("{:?}", request(None, true));
        assert!(!debug.contains("question"));
        assert!(debug.contains("prompt_len"));
    }
}
