//! Reply delivery: optional sticker, paced segments, one log record.
//!
//! Callers must hold the send slot for the whole call; `deliver` takes the
//! [`SendSlot`] by reference as proof.

use crate::config::DeliveryConfig;
use crate::gate::SendSlot;
use crate::segment::{self, Strategy, char_len};
use crate::stickers::{self, StickerLexicon};
use crate::store::ConversationLog;
use cp_channels::{ChannelAdapter, SendTarget};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct DeliveryRequest<'a> {
    pub target: &'a SendTarget,
    /// Sender identity recorded with the turn.
    pub sender_name: &'a str,
    pub original_text: &'a str,
    pub reply: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub strategy: &'static str,
    pub segments_sent: usize,
    pub segments_failed: usize,
    pub sticker_sent: bool,
    pub persisted: bool,
}

struct StickerSource {
    lexicon: StickerLexicon,
    dir: PathBuf,
}

pub struct DeliveryPipeline {
    channel: Arc<dyn ChannelAdapter>,
    log: Arc<dyn ConversationLog>,
    stickers: Option<StickerSource>,
    cfg: DeliveryConfig,
}

impl DeliveryPipeline {
    pub fn new(
        channel: Arc<dyn ChannelAdapter>,
        log: Arc<dyn ConversationLog>,
        cfg: DeliveryConfig,
    ) -> Self {
        Self {
            channel,
            log,
            stickers: None,
            cfg,
        }
    }

    pub fn with_stickers(mut self, lexicon: StickerLexicon, dir: PathBuf) -> Self {
        self.stickers = Some(StickerSource { lexicon, dir });
        self
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(conversation_id = %request.target.conversation_id(), group = request.target.is_group())
    )]
    pub async fn deliver(&self, _slot: &SendSlot, request: DeliveryRequest<'_>) -> DeliveryReport {
        let recipient = request.target.recipient();
        let sticker_sent = self.maybe_send_sticker(recipient, &request).await;

        let mut plan = segment::plan(request.reply, self.cfg.long_reply_threshold);
        // The mention rides on the first part only; segmentation sees the bare reply.
        if let (Some(sender), Some(first)) = (request.target.mentioned_sender(), plan.parts.first_mut()) {
            if !sender.trim().is_empty() {
                *first = format!("@{sender} {first}");
            }
        }

        let mut segments_sent = 0;
        let mut segments_failed = 0;
        for (idx, part) in plan.parts.iter().enumerate() {
            if idx > 0 {
                let delay = self.delay_before(plan.strategy, &plan.parts[idx - 1], part);
                tokio::time::sleep(delay).await;
            }
            match self.channel.send_text(recipient, part).await {
                Ok(()) => segments_sent += 1,
                Err(e) => {
                    segments_failed += 1;
                    tracing::warn!(segment = idx, error = %e, "segment send failed");
                }
            }
        }

        let persisted = match self
            .log
            .append_record(
                &request.target.conversation_id(),
                request.sender_name,
                request.original_text,
                request.reply,
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist turn");
                false
            }
        };

        let report = DeliveryReport {
            strategy: plan.strategy.as_str(),
            segments_sent,
            segments_failed,
            sticker_sent,
            persisted,
        };
        tracing::info!(
            strategy = report.strategy,
            segments_sent,
            segments_failed,
            sticker_sent,
            "reply delivered"
        );
        report
    }

    async fn maybe_send_sticker(&self, recipient: &str, request: &DeliveryRequest<'_>) -> bool {
        let Some(source) = &self.stickers else {
            return false;
        };
        if !source.lexicon.matches(request.original_text) && !source.lexicon.matches(request.reply) {
            return false;
        }
        let Some(path) = stickers::pick_random(&source.dir).await else {
            return false;
        };
        match self.channel.send_attachment(recipient, &path).await {
            Ok(()) => {
                tracing::debug!(sticker = %path.display(), "sticker sent");
                true
            }
            Err(e) => {
                tracing::warn!(sticker = %path.display(), error = %e, "sticker send failed");
                false
            }
        }
    }

    fn delay_before(&self, strategy: Strategy, previous: &str, next: &str) -> Duration {
        match strategy {
            Strategy::Backslash => typing_delay(&self.cfg, next),
            Strategy::Markdown | Strategy::LongText | Strategy::Single => {
                segment_delay(&self.cfg, previous)
            }
        }
    }
}

/// Simulated typing time for `next`: every char costs the base rate plus jitter.
pub fn typing_delay(cfg: &DeliveryConfig, next: &str) -> Duration {
    let per_char = cfg.typing_ms_per_char + uniform(cfg.typing_jitter_ms_per_char);
    Duration::from_millis(char_len(next) as u64 * per_char)
}

/// Pause after a markdown or long-text segment, capped before jitter is added.
pub fn segment_delay(cfg: &DeliveryConfig, segment: &str) -> Duration {
    let base = (char_len(segment) as u64 * cfg.segment_ms_per_char).min(cfg.segment_delay_cap_ms);
    Duration::from_millis(base + uniform(cfg.segment_jitter_ms))
}

fn uniform([lo, hi]: [u64; 2]) -> u64 {
    if lo >= hi {
        return lo;
    }
    rand::thread_rng().gen_range(lo..=hi)
}
