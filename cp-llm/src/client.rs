use crate::error::{LlmError, Result};
use crate::openai::{OpenAiClient, SamplingParams};
use crate::types::{ChatMessage, ChatResponse, InlineImage};
use base64::Engine as _;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct LlmClient {
    inner: OpenAiClient,
    model: String,
    params: SamplingParams,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self::with_timeout(base_url, api_key, model, Duration::from_secs(60))
    }

    pub fn with_timeout(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            inner: OpenAiClient::new(http, base_url, api_key),
            model: model.to_string(),
            params: SamplingParams::default(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = Some(max_tokens);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, messages = messages.len()))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("messages must not be empty".to_string()));
        }
        let started = std::time::Instant::now();
        let resp = self.inner.chat(&self.model, messages, self.params).await?;
        tracing::debug!(
            latency_ms = started.elapsed().as_millis() as u64,
            prompt_tokens = resp.usage.prompt_tokens,
            completion_tokens = resp.usage.completion_tokens,
            finish_reason = %resp.finish_reason,
            "chat completion finished"
        );
        Ok(resp)
    }

    /// Asks a vision-capable model to describe the image at `path`.
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, path = %path.display()))]
    pub async fn describe_image(&self, path: &Path, prompt: &str) -> Result<String> {
        let image = load_inline_image(path).await?;
        let messages = [ChatMessage::user(prompt).with_image(image)];
        let resp = self.chat(&messages).await?;
        Ok(resp.message.content.trim().to_string())
    }
}

async fn load_inline_image(path: &Path) -> Result<InlineImage> {
    let media_type = media_type_for(path).ok_or_else(|| {
        LlmError::InvalidInput(format!("unsupported image type: {}", path.display()))
    })?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| LlmError::Image(format!("{}: {e}", path.display())))?;
    if bytes.is_empty() {
        return Err(LlmError::Image(format!("{}: file is empty", path.display())));
    }
    Ok(InlineImage {
        media_type: media_type.to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(bytes),
    })
}

fn media_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}
