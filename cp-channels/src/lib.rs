//! Channel adapters for chatpace.
//!
//! Adapters are pure I/O: they turn whatever the chat client emits into
//! `InboundEvent`s and carry text or attachments back out to a `SendTarget`.

mod bridge;
mod traits;
mod types;

pub use bridge::{BridgeEnvelope, HttpBridgeAdapter};
pub use traits::ChannelAdapter;
pub use types::{ConversationId, EventId, InboundEvent, InboundKind, SendTarget};
