use crate::types::InboundEvent;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "wechat-bridge".
    fn channel_id(&self) -> &str;

    /// Start receiving events. Push to tx for each inbound event.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Send one text message to a person or group, addressed by display name.
    async fn send_text(&self, recipient: &str, text: &str) -> Result<()>;

    /// Send a local file (sticker, image) to a person or group.
    async fn send_attachment(&self, recipient: &str, path: &Path) -> Result<()>;
}
