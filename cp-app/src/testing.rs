//! In-memory doubles for the channel, responder, log and describer.

use crate::responder::{ResponseRequest, Responder};
use crate::store::{ChatRecord, ConversationLog};
use crate::vision::{ImageDescriber, ImageKind};
use anyhow::Result;
use async_trait::async_trait;
use cp_channels::{ChannelAdapter, ConversationId, InboundEvent};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { recipient: String, text: String },
    Attachment { recipient: String, path: PathBuf },
}

#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<Sent>>,
    fail_sends: bool,
}

impl RecordingChannel {
    pub fn failing() -> Self {
        Self {
            fail_sends: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { text, .. } => Some(text),
                Sent::Attachment { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn channel_id(&self) -> &str {
        "recording"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, recipient: &str, text: &str) -> Result<()> {
        self.sent.lock().expect("sent lock").push(Sent::Text {
            recipient: recipient.to_string(),
            text: text.to_string(),
        });
        if self.fail_sends {
            return Err(anyhow::anyhow!("bridge unavailable"));
        }
        Ok(())
    }

    async fn send_attachment(&self, recipient: &str, path: &Path) -> Result<()> {
        self.sent.lock().expect("sent lock").push(Sent::Attachment {
            recipient: recipient.to_string(),
            path: path.to_path_buf(),
        });
        if self.fail_sends {
            return Err(anyhow::anyhow!("bridge unavailable"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub conversation_id: String,
    pub sender: String,
    pub text: String,
    pub intent: String,
}

pub struct ScriptedResponder {
    reply: Option<String>,
    delay: Duration,
    panics_for: Option<String>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedResponder {
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            delay: Duration::ZERO,
            panics_for: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            delay: Duration::ZERO,
            panics_for: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Panics instead of answering this one conversation.
    pub fn panicking_for(mut self, conversation_id: impl Into<String>) -> Self {
        self.panics_for = Some(conversation_id.into());
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn respond(&self, request: ResponseRequest<'_>) -> Result<String> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(RecordedRequest {
                conversation_id: request.conversation_id.to_string(),
                sender: request.sender.to_string(),
                text: request.text.to_string(),
                intent: request.intent.to_string(),
            });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics_for.as_deref() == Some(request.conversation_id.as_str()) {
            panic!("responder exploded for {}", request.conversation_id);
        }
        self.reply
            .clone()
            .ok_or_else(|| anyhow::anyhow!("model unavailable"))
    }
}

#[derive(Default)]
pub struct MemoryLog {
    records: Mutex<Vec<ChatRecord>>,
}

impl MemoryLog {
    pub fn records(&self) -> Vec<ChatRecord> {
        self.records.lock().expect("records lock").clone()
    }
}

#[async_trait]
impl ConversationLog for MemoryLog {
    async fn append_record(
        &self,
        conversation_id: &ConversationId,
        sender_name: &str,
        original_text: &str,
        reply_text: &str,
    ) -> Result<()> {
        self.records.lock().expect("records lock").push(ChatRecord {
            conversation_id: conversation_id.to_string(),
            sender_name: sender_name.to_string(),
            message: original_text.to_string(),
            reply: reply_text.to_string(),
            created_at: String::new(),
        });
        Ok(())
    }

    async fn recent(&self, conversation_id: &ConversationId, limit: usize) -> Result<Vec<ChatRecord>> {
        let records = self.records();
        let matching: Vec<ChatRecord> = records
            .into_iter()
            .filter(|r| r.conversation_id == conversation_id.as_str())
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).collect())
    }
}

pub struct StaticDescriber {
    description: Option<String>,
    delay: Duration,
    calls: Mutex<Vec<(PathBuf, ImageKind)>>,
}

impl StaticDescriber {
    pub fn describing(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            description: None,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<(PathBuf, ImageKind)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ImageDescriber for StaticDescriber {
    async fn describe(&self, path: &Path, kind: ImageKind) -> Result<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((path.to_path_buf(), kind));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.description
            .clone()
            .ok_or_else(|| anyhow::anyhow!("vision model unavailable"))
    }
}
