//! Sticker lexicon and random attachment picker.

use crate::config::StickerConfig;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};

const STICKER_EXTENSIONS: &[&str] = &["gif", "jpg", "jpeg", "png"];

#[derive(Debug, Clone)]
pub struct StickerLexicon {
    request_keywords: Vec<String>,
    emotion_keywords: Vec<String>,
}

impl StickerLexicon {
    pub fn new(cfg: &StickerConfig) -> Self {
        Self {
            request_keywords: normalize(&cfg.request_keywords, true),
            emotion_keywords: normalize(&cfg.emotion_keywords, false),
        }
    }

    /// Substring match: request keywords case-insensitively, emotion words verbatim.
    pub fn matches(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.request_keywords.iter().any(|k| lowered.contains(k.as_str()))
            || self.emotion_keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

fn normalize(keywords: &[String], lowercase: bool) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(|k| if lowercase { k.to_lowercase() } else { k.to_string() })
        .collect()
}

/// Picks one image file uniformly at random, or `None` when the directory is
/// missing or holds no images.
pub async fn pick_random(dir: &Path) -> Option<PathBuf> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), %e, "sticker directory unavailable");
            return None;
        }
    };
    let mut candidates = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                if is_sticker_file(&path) {
                    candidates.push(path);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), %e, "sticker directory read failed");
                break;
            }
        }
    }
    if candidates.is_empty() {
        tracing::warn!(dir = %dir.display(), "no sticker images found");
        return None;
    }
    candidates.choose(&mut rand::thread_rng()).cloned()
}

fn is_sticker_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            STICKER_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
