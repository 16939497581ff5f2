//! Image and sticker descriptions through a vision model.

use crate::config::VisionConfig;
use anyhow::Result;
use async_trait::async_trait;
use cp_llm::LlmClient;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Sticker,
    Picture,
}

impl ImageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sticker => "sticker",
            Self::Picture => "picture",
        }
    }
}

#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe(&self, path: &Path, kind: ImageKind) -> Result<String>;
}

pub struct LlmImageDescriber {
    client: LlmClient,
    cfg: VisionConfig,
}

impl LlmImageDescriber {
    pub fn new(client: LlmClient, cfg: VisionConfig) -> Self {
        Self { client, cfg }
    }
}

#[async_trait]
impl ImageDescriber for LlmImageDescriber {
    #[tracing::instrument(level = "debug", skip_all, fields(kind = kind.as_str(), model = %self.client.model()))]
    async fn describe(&self, path: &Path, kind: ImageKind) -> Result<String> {
        let prompt = match kind {
            ImageKind::Sticker => &self.cfg.sticker_prompt,
            ImageKind::Picture => &self.cfg.image_prompt,
        };
        let raw = self.client.describe_image(path, prompt).await?;
        let description = match kind {
            ImageKind::Sticker => strip_lead_in(&raw, self.cfg.sticker_marker.as_deref()),
            ImageKind::Picture => raw.trim(),
        };
        if description.is_empty() {
            return Err(anyhow::anyhow!("vision model returned an empty description"));
        }
        Ok(description.to_string())
    }
}

/// Drops everything up to and including `marker`, when present.
fn strip_lead_in<'a>(text: &'a str, marker: Option<&str>) -> &'a str {
    let marker = marker.map(str::trim).filter(|m| !m.is_empty());
    match marker.and_then(|m| text.find(m).map(|idx| idx + m.len())) {
        Some(end) => text[end..].trim(),
        None => text.trim(),
    }
}

/// Renders a description as a queue fragment, e.g. `[sent a sticker: a cat waving]`.
pub fn fragment_text(cfg: &VisionConfig, kind: ImageKind, description: &str) -> String {
    let prefix = match kind {
        ImageKind::Sticker => &cfg.sticker_prefix,
        ImageKind::Picture => &cfg.image_prefix,
    };
    let suffix = if prefix.trim_start().starts_with('[') { "]" } else { "" };
    format!("{prefix}{}{suffix}", description.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticker_lead_in_is_removed() {
        let raw = "The screenshot shows a chat. The last sticker: a cat waving hello";
        assert_eq!(strip_lead_in(raw, Some("The last sticker:")), "a cat waving hello");
        assert_eq!(strip_lead_in("  a dog  ", Some("missing")), "a dog");
        assert_eq!(strip_lead_in("  a dog  ", Some("  ")), "a dog");
        assert_eq!(strip_lead_in("a dog", None), "a dog");
    }

    #[test]
    fn fragments_use_configured_prefixes() {
        let cfg = VisionConfig::default();
        assert_eq!(
            fragment_text(&cfg, ImageKind::Sticker, " a cat waving "),
            "[sent a sticker: a cat waving]"
        );
        assert_eq!(
            fragment_text(&cfg, ImageKind::Picture, "a beach"),
            "[sent an image: a beach]"
        );

        let plain = VisionConfig {
            image_prefix: "image: ".to_string(),
            ..VisionConfig::default()
        };
        assert_eq!(fragment_text(&plain, ImageKind::Picture, "a beach"), "image: a beach");
    }
}
