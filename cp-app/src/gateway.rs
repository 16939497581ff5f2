//! Inbound side: every channel event funnels through here into the queue.
//!
//! Text is enqueued immediately. Sticker notifications are coalesced per
//! conversation and resolved once the attachment had time to arrive. Images
//! are described right away. Both keep dispatch closed while pending.

use crate::commands::LocalCommands;
use crate::config::{ChatpaceConfig, DEFAULT_INTENT, VisionConfig};
use crate::debounce::Debouncer;
use crate::engagement::EngagementScheduler;
use crate::gate::SendGate;
use crate::intent::IntentClassifier;
use crate::queue::ConversationQueue;
use crate::vision::{self, ImageDescriber, ImageKind};
use cp_channels::{ConversationId, InboundEvent, InboundKind, SendTarget};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Four-per-em space the chat client inserts after a mention.
const MENTION_SPACE: char = '\u{2005}';

pub struct Gateway {
    bot_name: String,
    queue: Arc<ConversationQueue>,
    gate: Arc<SendGate>,
    classifier: Arc<dyn IntentClassifier>,
    commands: Option<LocalCommands>,
    describer: Option<Arc<dyn ImageDescriber>>,
    engagement: Option<Arc<EngagementScheduler>>,
    vision: VisionConfig,
    sticker_timers: Debouncer<ConversationId>,
    coalesce_delay: Duration,
    sticker_placeholder: String,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>>,
}

impl Gateway {
    pub fn new(
        cfg: &ChatpaceConfig,
        queue: Arc<ConversationQueue>,
        gate: Arc<SendGate>,
        classifier: Arc<dyn IntentClassifier>,
        inbound_rx: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        Self {
            bot_name: cfg.general.bot_name.trim().to_string(),
            queue,
            gate,
            classifier,
            commands: None,
            describer: None,
            engagement: None,
            vision: cfg.vision.clone(),
            sticker_timers: Debouncer::new(),
            coalesce_delay: cfg.debounce.coalesce_delay(),
            sticker_placeholder: cfg.debounce.sticker_placeholder.clone(),
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
        }
    }

    pub fn with_commands(mut self, commands: LocalCommands) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn with_describer(mut self, describer: Arc<dyn ImageDescriber>) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn with_engagement(mut self, engagement: Arc<EngagementScheduler>) -> Self {
        self.engagement = Some(engagement);
        self
    }

    pub fn pending_sticker_timers(&self) -> usize {
        self.sticker_timers.pending_count()
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway loop received shutdown signal");
                    break;
                }
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                tracing::info!("inbound channel closed");
                break;
            };
            self.handle_inbound(event);
        }
        self.sticker_timers.cancel_all();
    }

    /// Applies the group mention policy. Returns the text to enqueue, or
    /// `None` when the event is not addressed to the bot.
    fn accept(&self, event: &InboundEvent) -> Option<String> {
        let content = event.content.trim();
        if !event.is_group {
            return Some(content.to_string());
        }
        if let Some(stripped) = strip_mention(content, &self.bot_name) {
            return Some(stripped);
        }
        let is_command = self.commands.as_ref().is_some_and(|c| c.matches(content));
        if is_command || (!content.is_empty() && self.classifier.classify(content) != DEFAULT_INTENT) {
            return Some(content.to_string());
        }
        None
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(conversation_id = %event.conversation_id, kind = ?event.kind, group = event.is_group)
    )]
    pub fn handle_inbound(&self, event: InboundEvent) {
        let Some(text) = self.accept(&event) else {
            tracing::debug!("group message not addressed to the bot; ignored");
            return;
        };
        let target = event.reply_target();
        if let Some(engagement) = &self.engagement {
            engagement.touch(&target);
        }

        match event.kind {
            InboundKind::Text => {
                if text.is_empty() {
                    return;
                }
                self.queue.enqueue(target, &event.sender_name, text);
            }
            InboundKind::Sticker => self.arm_sticker(target, event.sender_name, event.attachment),
            InboundKind::Image => self.describe_image(target, event.sender_name, event.attachment),
        }
    }

    /// (Re)arms the coalescing timer for the conversation. Only the latest
    /// sticker event is resolved.
    fn arm_sticker(&self, target: SendTarget, sender: String, attachment: Option<PathBuf>) {
        let hold = self.gate.hold_dispatch();
        let queue = Arc::clone(&self.queue);
        let describer = self.describer.clone();
        let vision = self.vision.clone();
        let placeholder = self.sticker_placeholder.clone();
        let key = target.conversation_id();

        self.sticker_timers.arm(key, self.coalesce_delay, move || async move {
            let _hold = hold;
            let text = describe(describer.as_deref(), &vision, ImageKind::Sticker, attachment.as_deref())
                .await
                .unwrap_or(placeholder);
            tracing::debug!(conversation_id = %target.conversation_id(), "sticker resolved");
            queue.enqueue(target, &sender, text);
        });
    }

    fn describe_image(&self, target: SendTarget, sender: String, attachment: Option<PathBuf>) {
        let hold = self.gate.hold_dispatch();
        let queue = Arc::clone(&self.queue);
        let describer = self.describer.clone();
        let vision = self.vision.clone();
        tokio::spawn(async move {
            let _hold = hold;
            let text = describe(describer.as_deref(), &vision, ImageKind::Picture, attachment.as_deref())
                .await
                .unwrap_or_else(|| vision::fragment_text(&vision, ImageKind::Picture, "unrecognized"));
            queue.enqueue(target, &sender, text);
        });
    }
}

async fn describe(
    describer: Option<&dyn ImageDescriber>,
    vision: &VisionConfig,
    kind: ImageKind,
    attachment: Option<&Path>,
) -> Option<String> {
    let describer = describer?;
    let path = attachment?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), kind = kind.as_str(), "attachment missing");
        return None;
    }
    match describer.describe(path, kind).await {
        Ok(description) => Some(vision::fragment_text(vision, kind, &description)),
        Err(e) => {
            tracing::warn!(path = %path.display(), kind = kind.as_str(), error = %e, "image description failed");
            None
        }
    }
}

fn strip_mention(text: &str, bot_name: &str) -> Option<String> {
    if bot_name.is_empty() {
        return None;
    }
    let mention = format!("@{bot_name}");
    if !text.contains(&mention) {
        return None;
    }
    Some(
        text.replace(&mention, "")
            .replace(MENTION_SPACE, " ")
            .trim()
            .to_string(),
    )
}
