//! OpenAI-compatible chat client for chatpace.
//!
//! Plain HTTP client. Works against any endpoint that speaks the
//! `/chat/completions` protocol (OpenAI, DeepSeek, Ark, Moonshot, local proxies).

mod client;
mod error;
mod openai;
mod types;

pub use client::{DEFAULT_BASE_URL, LlmClient};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, InlineImage, Role, Usage};
