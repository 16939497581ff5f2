//! Reply generation: local commands first, then the LLM with a resolved persona prompt.

use crate::commands::LocalCommands;
use crate::config::{ChatpaceConfig, DEFAULT_INTENT, expand_home};
use crate::store::ConversationLog;
use anyhow::Result;
use async_trait::async_trait;
use cp_channels::ConversationId;
use cp_llm::{ChatMessage, LlmClient};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct ResponseRequest<'a> {
    pub conversation_id: &'a ConversationId,
    pub sender: &'a str,
    pub text: &'a str,
    pub intent: &'a str,
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: ResponseRequest<'_>) -> Result<String>;
}

/// Calls `responder`, substituting `fallback` for any failure or empty reply.
pub async fn reply_or_fallback(
    responder: &dyn Responder,
    request: ResponseRequest<'_>,
    fallback: &str,
) -> String {
    let started = std::time::Instant::now();
    match responder.respond(request).await {
        Ok(reply) if !reply.trim().is_empty() => {
            tracing::debug!(
                conversation_id = %request.conversation_id,
                latency_ms = started.elapsed().as_millis() as u64,
                "responder replied"
            );
            reply
        }
        Ok(_) => {
            tracing::warn!(conversation_id = %request.conversation_id, "responder returned an empty reply");
            fallback.to_string()
        }
        Err(e) => {
            tracing::warn!(
                conversation_id = %request.conversation_id,
                error = %e,
                "responder failed; sending fallback reply"
            );
            fallback.to_string()
        }
    }
}

/// Fallback text and reasoning marker applied to every generated reply.
#[derive(Debug, Clone)]
pub struct ReplyPolicy {
    pub fallback_reply: String,
    pub reasoning_marker: String,
}

impl ReplyPolicy {
    pub fn from_config(cfg: &crate::config::ResponderConfig) -> Self {
        Self {
            fallback_reply: cfg.fallback_reply.clone(),
            reasoning_marker: cfg.reasoning_marker.clone(),
        }
    }

    /// Asks `responder` for a reply and strips any reasoning prefix. Never fails.
    pub async fn generate(&self, responder: &dyn Responder, request: ResponseRequest<'_>) -> String {
        let raw = reply_or_fallback(responder, request, &self.fallback_reply).await;
        let visible = strip_reasoning(&raw, &self.reasoning_marker);
        if visible.is_empty() {
            tracing::warn!(
                conversation_id = %request.conversation_id,
                "reply was empty after stripping reasoning"
            );
            return self.fallback_reply.clone();
        }
        visible.to_string()
    }
}

/// Keeps the text after the first `marker`, when the reply contains it.
pub fn strip_reasoning<'a>(reply: &'a str, marker: &str) -> &'a str {
    if marker.is_empty() {
        return reply.trim();
    }
    match reply.find(marker) {
        Some(idx) => reply[idx + marker.len()..].trim(),
        None => reply.trim(),
    }
}

/// Resolves the system prompt: intent file, then conversation file, then the
/// default file, then the built-in prompt.
#[derive(Debug, Clone)]
pub struct PromptResolver {
    dir: Option<PathBuf>,
    default_file: String,
    builtin: String,
}

impl PromptResolver {
    pub fn new(dir: Option<PathBuf>, default_file: impl Into<String>, builtin: impl Into<String>) -> Self {
        Self {
            dir,
            default_file: default_file.into(),
            builtin: builtin.into(),
        }
    }

    pub async fn resolve(&self, conversation_id: &ConversationId, intent: &str) -> String {
        let Some(dir) = &self.dir else {
            return self.builtin.clone();
        };
        let mut candidates = Vec::with_capacity(3);
        if intent != DEFAULT_INTENT {
            candidates.push(format!("{intent}.md"));
        }
        candidates.push(format!("{conversation_id}.md"));
        candidates.push(self.default_file.clone());

        for name in candidates {
            if !is_plain_file_name(&name) {
                continue;
            }
            let path = dir.join(&name);
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) if !contents.trim().is_empty() => {
                    tracing::debug!(prompt = %path.display(), "using prompt file");
                    return contents.trim().to_string();
                }
                Ok(_) => tracing::debug!(prompt = %path.display(), "prompt file is empty"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(prompt = %path.display(), %e, "prompt file unreadable"),
            }
        }
        self.builtin.clone()
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.contains(['/', '\\']) && !name.starts_with('.')
}

pub struct LlmResponder {
    prompts: PromptResolver,
    history_limit: usize,
    default_client: LlmClient,
    intent_clients: HashMap<String, LlmClient>,
    log: Arc<dyn ConversationLog>,
    commands: Option<LocalCommands>,
}

impl LlmResponder {
    pub fn new(
        cfg: &ChatpaceConfig,
        log: Arc<dyn ConversationLog>,
        commands: Option<LocalCommands>,
    ) -> Result<Self> {
        let dir = cfg
            .responder
            .prompt_dir
            .as_deref()
            .map(expand_home)
            .transpose()?;
        let intent_clients = cfg
            .llm
            .intents
            .iter()
            .map(|(key, profile)| {
                let mut profile = profile.clone();
                if profile.api_key.trim().is_empty() {
                    profile.api_key = cfg.llm.default.api_key.clone();
                }
                (key.clone(), profile.client())
            })
            .collect();
        Ok(Self {
            prompts: PromptResolver::new(
                dir,
                cfg.responder.default_prompt_file.clone(),
                cfg.responder.default_prompt.clone(),
            ),
            history_limit: cfg.responder.history_limit,
            default_client: cfg.llm.default.client(),
            intent_clients,
            log,
            commands,
        })
    }

    async fn history(&self, conversation_id: &ConversationId) -> Vec<ChatMessage> {
        match self.log.recent(conversation_id, self.history_limit).await {
            Ok(records) => records
                .into_iter()
                .flat_map(|r| [ChatMessage::user(r.message), ChatMessage::assistant(r.reply)])
                .collect(),
            Err(e) => {
                tracing::warn!(%conversation_id, %e, "history unavailable; replying without it");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Responder for LlmResponder {
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %request.conversation_id, intent = %request.intent))]
    async fn respond(&self, request: ResponseRequest<'_>) -> Result<String> {
        if let Some(commands) = &self.commands {
            if let Some(reply) = commands.handle(request.sender, request.text).await {
                return Ok(reply);
            }
        }

        let system = self
            .prompts
            .resolve(request.conversation_id, request.intent)
            .await;
        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(self.history(request.conversation_id).await);
        messages.push(ChatMessage::user(request.text));

        let client = self
            .intent_clients
            .get(request.intent)
            .unwrap_or(&self.default_client);
        let resp = client.chat(&messages).await?;
        Ok(resp.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedResponder;

    #[test]
    fn reasoning_prefix_is_dropped() {
        assert_eq!(strip_reasoning("<think>hmm</think>\nhello", "</think>"), "hello");
        assert_eq!(strip_reasoning("a</think>b</think> c", "</think>"), "b</think> c");
        assert_eq!(strip_reasoning("  plain  ", "</think>"), "plain");
        assert_eq!(strip_reasoning("x</think>", ""), "x</think>");
    }

    #[test]
    fn marker_inside_the_answer_is_kept() {
        assert_eq!(
            strip_reasoning("<think>a</think>answer</think>tail", "</think>"),
            "answer</think>tail"
        );
    }

    #[tokio::test]
    async fn failures_and_empty_replies_become_fallback() {
        let id = ConversationId::new("alice");
        let request = ResponseRequest {
            conversation_id: &id,
            sender: "alice",
            text: "hi",
            intent: DEFAULT_INTENT,
        };
        let failing = ScriptedResponder::failing();
        assert_eq!(reply_or_fallback(&failing, request, "sorry").await, "sorry");

        let empty = ScriptedResponder::replying("   ");
        assert_eq!(reply_or_fallback(&empty, request, "sorry").await, "sorry");

        let ok = ScriptedResponder::replying("hello");
        assert_eq!(reply_or_fallback(&ok, request, "sorry").await, "hello");
    }

    #[tokio::test]
    async fn policy_strips_reasoning_and_falls_back_on_empty_remainder() {
        let id = ConversationId::new("alice");
        let request = ResponseRequest {
            conversation_id: &id,
            sender: "alice",
            text: "hi",
            intent: DEFAULT_INTENT,
        };
        let policy = ReplyPolicy {
            fallback_reply: "sorry".to_string(),
            reasoning_marker: "</think>".to_string(),
        };
        let thinking = ScriptedResponder::replying("<think>plan</think>\n hey!");
        assert_eq!(policy.generate(&thinking, request).await, "hey!");

        let only_thoughts = ScriptedResponder::replying("<think>plan</think>");
        assert_eq!(policy.generate(&only_thoughts, request).await, "sorry");
    }

    #[tokio::test]
    async fn prompt_resolution_prefers_intent_then_conversation_then_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = PromptResolver::new(Some(dir.path().to_path_buf()), "prompt.md", "builtin");
        let alice = ConversationId::new("alice");

        assert_eq!(resolver.resolve(&alice, "astro").await, "builtin");

        std::fs::write(dir.path().join("prompt.md"), "default persona\n").expect("write");
        assert_eq!(resolver.resolve(&alice, "astro").await, "default persona");

        std::fs::write(dir.path().join("alice.md"), "alice persona").expect("write");
        assert_eq!(resolver.resolve(&alice, "astro").await, "alice persona");

        std::fs::write(dir.path().join("astro.md"), "astrologer").expect("write");
        assert_eq!(resolver.resolve(&alice, "astro").await, "astrologer");
        assert_eq!(resolver.resolve(&alice, DEFAULT_INTENT).await, "alice persona");
    }

    #[tokio::test]
    async fn prompt_resolution_ignores_path_like_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = PromptResolver::new(Some(dir.path().to_path_buf()), "prompt.md", "builtin");
        let sneaky = ConversationId::new("../etc/passwd");
        assert_eq!(resolver.resolve(&sneaky, DEFAULT_INTENT).await, "builtin");

        let no_dir = PromptResolver::new(None, "prompt.md", "builtin");
        assert_eq!(no_dir.resolve(&sneaky, DEFAULT_INTENT).await, "builtin");
    }
}
