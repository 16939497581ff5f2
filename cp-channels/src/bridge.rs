use crate::traits::ChannelAdapter;
use crate::types::{ConversationId, EventId, InboundEvent, InboundKind};
use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};
use reqwest::Url;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

const RECENT_EVENT_ID_CAPACITY: usize = 4096;

/// Talks JSON over HTTP to the desktop-automation bridge that owns the chat client.
///
/// Inbound events are polled from `poll_url` (or pushed to the app's ingest route);
/// text goes to `send_url` and files to `attachment_url`.
#[derive(Clone)]
pub struct HttpBridgeAdapter {
    http: reqwest::Client,
    channel_id: String,
    send_url: String,
    attachment_url: Option<String>,
    poll_url: Option<String>,
    auth_token: Option<String>,
    poll_interval: Duration,
    start_from_latest: bool,
}

impl HttpBridgeAdapter {
    pub fn new(channel_id: &str, send_url: &str) -> Result<Self> {
        let channel_id = normalize_channel_id(channel_id)?;
        let send_url = normalize_http_url(send_url, "send_url")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            channel_id,
            send_url,
            attachment_url: None,
            poll_url: None,
            auth_token: None,
            poll_interval: Duration::from_millis(1000),
            start_from_latest: true,
        })
    }

    pub fn with_poll_url(mut self, poll_url: Option<String>) -> Result<Self> {
        self.poll_url = optional_url(poll_url, "poll_url")?;
        Ok(self)
    }

    pub fn with_attachment_url(mut self, attachment_url: Option<String>) -> Result<Self> {
        self.attachment_url = optional_url(attachment_url, "attachment_url")?;
        Ok(self)
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_start_from_latest(mut self, start_from_latest: bool) -> Self {
        self.start_from_latest = start_from_latest;
        self
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_json(&self, url: &str, payload: &serde_json::Value) -> Result<()> {
        let url = Url::parse(url)
            .map_err(|e| anyhow!("invalid bridge url for channel {}: {e}", self.channel_id))?;
        let response = self
            .authorized_request(self.http.post(url))
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "bridge send failed for channel {}: status={} body={}",
                self.channel_id,
                status,
                body
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for HttpBridgeAdapter {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        if self.poll_url.is_none() {
            tracing::info!(channel_id = %self.channel_id, "bridge polling disabled; expecting pushed events");
            return Ok(());
        }

        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(error) = adapter.run_poll_loop(tx).await {
                tracing::error!(channel_id = %adapter.channel_id, %error, "bridge poll loop exited");
            }
        });
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(channel_id = %self.channel_id, recipient = %recipient))]
    async fn send_text(&self, recipient: &str, text: &str) -> Result<()> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(anyhow!("recipient is required"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("message text is empty"));
        }

        let payload = serde_json::json!({
            "channel_id": self.channel_id,
            "recipient": recipient,
            "text": text,
        });
        self.post_json(&self.send_url, &payload).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(channel_id = %self.channel_id, recipient = %recipient))]
    async fn send_attachment(&self, recipient: &str, path: &Path) -> Result<()> {
        let Some(url) = self.attachment_url.as_deref() else {
            return Err(anyhow!(
                "channel {} has no attachment_url configured",
                self.channel_id
            ));
        };
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(anyhow!("recipient is required"));
        }

        let payload = serde_json::json!({
            "channel_id": self.channel_id,
            "recipient": recipient,
            "path": path.display().to_string(),
        });
        self.post_json(url, &payload).await
    }
}

impl HttpBridgeAdapter {
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let mut recent = RecentEventIds::new(RECENT_EVENT_ID_CAPACITY);
        let mut failed_attempts: usize = 0;

        if self.start_from_latest {
            match self.poll_once().await {
                Ok(events) => {
                    for (index, event) in events.iter().enumerate() {
                        if let Some(inbound) = event.to_inbound(&self.channel_id, index) {
                            recent.remember(inbound.event_id.into_inner());
                        }
                    }
                    tracing::info!(
                        channel_id = %self.channel_id,
                        seeded_ids = recent.len(),
                        "bridge seeded poll cursor"
                    );
                }
                Err(e) => {
                    tracing::warn!(channel_id = %self.channel_id, %e, "bridge seed poll failed");
                }
            }
        }

        loop {
            if tx.is_closed() {
                return Err(anyhow!("bridge inbound queue closed"));
            }

            match self.poll_once().await {
                Ok(events) => {
                    failed_attempts = 0;
                    let mut emitted = 0usize;
                    for (index, event) in events.into_iter().enumerate() {
                        let Some(inbound) = event.to_inbound(&self.channel_id, index) else {
                            continue;
                        };
                        if !recent.remember(inbound.event_id.as_str().to_string()) {
                            continue;
                        }
                        tx.send(inbound)
                            .await
                            .map_err(|e| anyhow!("bridge inbound queue closed: {e}"))?;
                        emitted += 1;
                    }
                    if emitted > 0 {
                        tracing::debug!(channel_id = %self.channel_id, emitted, "bridge poll cycle complete");
                    }
                }
                Err(e) => {
                    failed_attempts += 1;
                    let backoff = Duration::from_millis((failed_attempts.min(20) as u64) * 250);
                    tracing::warn!(
                        channel_id = %self.channel_id,
                        %e,
                        failed_attempts,
                        "bridge poll failed"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn poll_once(&self) -> Result<Vec<BridgeEnvelope>> {
        let Some(poll_url) = self.poll_url.as_deref() else {
            return Ok(Vec::new());
        };
        let response = self
            .authorized_request(self.http.get(poll_url))
            .send()
            .await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "bridge poll failed for channel {}: status={} body={}",
                self.channel_id,
                status,
                body
            ));
        }
        Ok(extract_poll_events(body))
    }
}

/// Bounded set of recently seen event ids, evicted in arrival order.
struct RecentEventIds {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl RecentEventIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    /// Returns false when the id was already known.
    fn remember(&mut self, event_id: String) -> bool {
        if !self.set.insert(event_id.clone()) {
            return false;
        }
        self.order.push_back(event_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

fn optional_url(raw: Option<String>, field: &str) -> Result<Option<String>> {
    match raw {
        Some(url) if !url.trim().is_empty() => Ok(Some(normalize_http_url(&url, field)?)),
        _ => Ok(None),
    }
}

fn normalize_channel_id(raw: &str) -> Result<String> {
    let channel_id = raw.trim().to_ascii_lowercase();
    if channel_id.is_empty() {
        return Err(anyhow!("channel id is required"));
    }
    if !channel_id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        return Err(anyhow!("invalid channel id {:?}: use [a-z0-9_-]+", raw));
    }
    Ok(channel_id)
}

fn normalize_http_url(raw: &str, field: &str) -> Result<String> {
    let normalized = raw.trim().to_string();
    if normalized.is_empty() {
        return Err(anyhow!("{field} is required"));
    }
    let parsed = Url::parse(&normalized).map_err(|e| anyhow!("invalid {field}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!("invalid {field} scheme: {other}")),
    }
}

fn extract_poll_events(body: serde_json::Value) -> Vec<BridgeEnvelope> {
    match body {
        serde_json::Value::Array(events) => events
            .into_iter()
            .filter_map(|event| serde_json::from_value(event).ok())
            .collect(),
        serde_json::Value::Object(mut obj) => {
            if let Some(serde_json::Value::Array(events)) = obj.remove("events") {
                return events
                    .into_iter()
                    .filter_map(|event| serde_json::from_value(event).ok())
                    .collect();
            }
            serde_json::from_value(serde_json::Value::Object(obj))
                .ok()
                .into_iter()
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Wire shape of one bridge event. Every field is optional; `to_inbound` decides
/// what is usable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeEnvelope {
    pub event_id: Option<String>,
    pub kind: Option<String>,
    /// Chat name. Defaults to the sender for one-to-one chats.
    pub conversation: Option<String>,
    pub sender: Option<String>,
    pub is_group: Option<bool>,
    pub content: Option<String>,
    pub attachment_path: Option<String>,
    pub timestamp_ms: Option<i64>,
}

impl BridgeEnvelope {
    pub fn to_inbound(&self, channel_id: &str, fallback_index: usize) -> Option<InboundEvent> {
        let sender = trimmed(self.sender.as_deref())?;
        let is_group = self.is_group.unwrap_or(false);
        let conversation = match trimmed(self.conversation.as_deref()) {
            Some(name) => name,
            None if is_group => return None,
            None => sender,
        };
        let kind = match self
            .kind
            .as_deref()
            .unwrap_or("text")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "sticker" | "emoji" => InboundKind::Sticker,
            "image" | "picture" => InboundKind::Image,
            _ => InboundKind::Text,
        };
        let content = self.content.as_deref().map(str::trim).unwrap_or_default();
        let attachment = trimmed(self.attachment_path.as_deref()).map(PathBuf::from);
        match kind {
            InboundKind::Text if content.is_empty() => return None,
            InboundKind::Image if attachment.is_none() => return None,
            _ => {}
        }

        let received_at = self
            .timestamp_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        let event_id = trimmed(self.event_id.as_deref())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| {
                format!(
                    "{}:{}:{}:{}",
                    channel_id,
                    conversation,
                    received_at.timestamp_millis(),
                    fallback_index
                )
            });

        Some(InboundEvent {
            kind,
            event_id: EventId::new(event_id),
            channel_id: channel_id.to_string(),
            conversation_id: ConversationId::new(conversation),
            sender_name: sender.to_string(),
            is_group,
            content: content.to_string(),
            attachment,
            received_at,
        })
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
