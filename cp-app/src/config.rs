//! chatpace configuration loader.
//!
//! Every section except `[general]` is optional and falls back to the
//! defaults below. Environment overrides are applied after parsing.

use crate::engagement::QuietHours;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Intent key used when no configured intent matches.
pub const DEFAULT_INTENT: &str = "none";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatpaceConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub intents: Vec<IntentConfig>,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub engagement: EngagementConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub stickers: StickerConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Display name of the bot account. Group messages must `@` it.
    pub bot_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub default: LlmProfile,
    /// Vision model for image and sticker descriptions. Falls back to `default`.
    #[serde(default)]
    pub vision: Option<LlmProfile>,
    /// Per-intent overrides, keyed by intent key.
    #[serde(default)]
    pub intents: HashMap<String, LlmProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProfile {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_llm_base_url() -> String {
    cp_llm::DEFAULT_BASE_URL.to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout_seconds() -> u64 {
    60
}

impl Default for LlmProfile {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            temperature: None,
            max_tokens: None,
            timeout_seconds: default_llm_timeout_seconds(),
        }
    }
}

impl LlmProfile {
    pub fn client(&self) -> cp_llm::LlmClient {
        let mut client = cp_llm::LlmClient::with_timeout(
            &self.base_url,
            &self.api_key,
            &self.model,
            Duration::from_secs(self.timeout_seconds.max(1)),
        );
        if let Some(temperature) = self.temperature {
            client = client.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            client = client.with_max_tokens(max_tokens);
        }
        client
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentConfig {
    pub key: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponderConfig {
    /// Directory holding `<conversation>.md` and `<intent>.md` prompt files.
    #[serde(default)]
    pub prompt_dir: Option<String>,
    #[serde(default = "default_prompt_file")]
    pub default_prompt_file: String,
    #[serde(default = "default_system_prompt")]
    pub default_prompt: String,
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    #[serde(default = "default_reasoning_marker")]
    pub reasoning_marker: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_prompt_file() -> String {
    "prompt.md".to_string()
}

fn default_system_prompt() -> String {
    "You are a friendly chat companion. Reply casually and briefly, like a person texting. \
     Use a backslash to separate messages you would send one after another."
        .to_string()
}

fn default_fallback_reply() -> String {
    "抱歉，我现在有点忙，稍后再聊吧。".to_string()
}

fn default_reasoning_marker() -> String {
    "</think>".to_string()
}

fn default_history_limit() -> usize {
    30
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            prompt_dir: None,
            default_prompt_file: default_prompt_file(),
            default_prompt: default_system_prompt(),
            fallback_reply: default_fallback_reply(),
            reasoning_marker: default_reasoning_marker(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
    #[serde(default = "default_queue_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Prefix each fragment with `[YYYY-mm-dd HH:MM:SS]` when merging.
    #[serde(default = "default_true")]
    pub timestamp_fragments: bool,
}

fn default_idle_threshold_ms() -> u64 {
    7_000
}

fn default_queue_scan_interval_ms() -> u64 {
    1_000
}

fn default_max_fragments() -> usize {
    5
}

fn default_separator() -> String {
    " ".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: default_idle_threshold_ms(),
            scan_interval_ms: default_queue_scan_interval_ms(),
            max_fragments: default_max_fragments(),
            separator: default_separator(),
            timestamp_fragments: true,
        }
    }
}

impl QueueConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_coalesce_delay_ms")]
    pub coalesce_delay_ms: u64,
    /// Fragment enqueued when a sticker never resolves to a describable image.
    #[serde(default = "default_sticker_placeholder")]
    pub sticker_placeholder: String,
}

fn default_coalesce_delay_ms() -> u64 {
    3_000
}

fn default_sticker_placeholder() -> String {
    "[sent a sticker that could not be recognized]".to_string()
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            coalesce_delay_ms: default_coalesce_delay_ms(),
            sticker_placeholder: default_sticker_placeholder(),
        }
    }
}

impl DebounceConfig {
    pub fn coalesce_delay(&self) -> Duration {
        Duration::from_millis(self.coalesce_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_image_prompt")]
    pub image_prompt: String,
    #[serde(default = "default_sticker_prompt")]
    pub sticker_prompt: String,
    /// Lead-in the vision model puts before the sticker description; text before it is dropped.
    #[serde(default)]
    pub sticker_marker: Option<String>,
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    #[serde(default = "default_sticker_prefix")]
    pub sticker_prefix: String,
}

fn default_image_prompt() -> String {
    "Describe this picture in one or two short sentences.".to_string()
}

fn default_sticker_prompt() -> String {
    "This is a chat screenshot. Describe the mood and content of the last sticker in one sentence."
        .to_string()
}

fn default_image_prefix() -> String {
    "[sent an image: ".to_string()
}

fn default_sticker_prefix() -> String {
    "[sent a sticker: ".to_string()
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image_prompt: default_image_prompt(),
            sticker_prompt: default_sticker_prompt(),
            sticker_marker: None,
            image_prefix: default_image_prefix(),
            sticker_prefix: default_sticker_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngagementConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_engagement_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_min_wait_seconds")]
    pub min_wait_seconds: u64,
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,
    #[serde(default = "default_engagement_prompt")]
    pub prompt: String,
    #[serde(default = "default_quiet_start")]
    pub quiet_start: String,
    #[serde(default = "default_quiet_end")]
    pub quiet_end: String,
    /// One-to-one chats armed at startup.
    #[serde(default)]
    pub individuals: Vec<String>,
    /// Group chats armed at startup.
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_engagement_scan_interval_ms() -> u64 {
    10_000
}

fn default_min_wait_seconds() -> u64 {
    720
}

fn default_max_wait_seconds() -> u64 {
    1_800
}

fn default_engagement_prompt() -> String {
    "Stay in character and send the other person a casual message asking what they are up to."
        .to_string()
}

fn default_quiet_start() -> String {
    "22:00".to_string()
}

fn default_quiet_end() -> String {
    "08:00".to_string()
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_ms: default_engagement_scan_interval_ms(),
            min_wait_seconds: default_min_wait_seconds(),
            max_wait_seconds: default_max_wait_seconds(),
            prompt: default_engagement_prompt(),
            quiet_start: default_quiet_start(),
            quiet_end: default_quiet_end(),
            individuals: Vec::new(),
            groups: Vec::new(),
        }
    }
}

impl EngagementConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn wait_range(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.min_wait_seconds),
            Duration::from_secs(self.max_wait_seconds),
        )
    }

    pub fn quiet_hours(&self) -> anyhow::Result<QuietHours> {
        QuietHours::parse(&self.quiet_start, &self.quiet_end)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_long_reply_threshold")]
    pub long_reply_threshold: usize,
    #[serde(default = "default_typing_ms_per_char")]
    pub typing_ms_per_char: u64,
    #[serde(default = "default_typing_jitter_ms_per_char")]
    pub typing_jitter_ms_per_char: [u64; 2],
    #[serde(default = "default_segment_ms_per_char")]
    pub segment_ms_per_char: u64,
    #[serde(default = "default_segment_delay_cap_ms")]
    pub segment_delay_cap_ms: u64,
    #[serde(default = "default_segment_jitter_ms")]
    pub segment_jitter_ms: [u64; 2],
}

fn default_long_reply_threshold() -> usize {
    500
}

fn default_typing_ms_per_char() -> u64 {
    100
}

fn default_typing_jitter_ms_per_char() -> [u64; 2] {
    [50, 150]
}

fn default_segment_ms_per_char() -> u64 {
    10
}

fn default_segment_delay_cap_ms() -> u64 {
    2_000
}

fn default_segment_jitter_ms() -> [u64; 2] {
    [500, 1_500]
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            long_reply_threshold: default_long_reply_threshold(),
            typing_ms_per_char: default_typing_ms_per_char(),
            typing_jitter_ms_per_char: default_typing_jitter_ms_per_char(),
            segment_ms_per_char: default_segment_ms_per_char(),
            segment_delay_cap_ms: default_segment_delay_cap_ms(),
            segment_jitter_ms: default_segment_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StickerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sticker_dir")]
    pub dir: String,
    /// Explicit sticker requests; matched against lowercased text.
    #[serde(default = "default_request_keywords")]
    pub request_keywords: Vec<String>,
    #[serde(default = "default_emotion_keywords")]
    pub emotion_keywords: Vec<String>,
}

fn default_sticker_dir() -> String {
    "~/.chatpace/stickers".to_string()
}

fn default_request_keywords() -> Vec<String> {
    ["表情包", "表情", "斗图", "gif", "动图", "sticker", "meme"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_emotion_keywords() -> Vec<String> {
    [
        "开心", "难过", "生气", "委屈", "高兴", "伤心", "哭", "笑", "怒", "喜", "悲", "乐", "泪",
        "哈哈", "呜呜", "嘿嘿", "嘻嘻", "哼", "啊啊", "呵呵", "可爱", "惊讶", "惊喜", "恐惧",
        "害怕", "紧张", "放松", "激动", "满足", "失望", "愤怒", "羞愧", "兴奋", "愉快", "心酸",
        "愧疚", "懊悔", "孤独", "寂寞", "安慰", "安宁", "放心", "烦恼", "忧虑", "疑惑", "困惑",
        "怀疑", "鄙视", "厌恶", "厌倦", "失落", "愉悦", "惊恐", "惊魂未定", "震惊",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for StickerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_sticker_dir(),
            request_keywords: default_request_keywords(),
            emotion_keywords: default_emotion_keywords(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel_id")]
    pub id: String,
    #[serde(default = "default_send_url")]
    pub send_url: String,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub poll_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_true")]
    pub start_from_latest: bool,
}

fn default_channel_id() -> String {
    "wechat-bridge".to_string()
}

fn default_send_url() -> String {
    "http://127.0.0.1:8765/send".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: default_channel_id(),
            send_url: default_send_url(),
            attachment_url: None,
            poll_url: None,
            auth_token: None,
            poll_interval_ms: default_poll_interval_ms(),
            start_from_latest: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.chatpace/data/chatpace.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3030".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sign_in_keywords")]
    pub sign_in_keywords: Vec<String>,
    #[serde(default = "default_balance_keywords")]
    pub balance_keywords: Vec<String>,
    #[serde(default = "default_sign_in_reward")]
    pub sign_in_reward: i64,
    /// Offset used to decide which calendar day a sign-in belongs to.
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

fn default_sign_in_keywords() -> Vec<String> {
    vec!["签到".to_string(), "sign in".to_string()]
}

fn default_balance_keywords() -> Vec<String> {
    vec!["金币余额".to_string(), "balance".to_string()]
}

fn default_sign_in_reward() -> i64 {
    10
}

fn default_utc_offset_hours() -> i32 {
    8
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sign_in_keywords: default_sign_in_keywords(),
            balance_keywords: default_balance_keywords(),
            sign_in_reward: default_sign_in_reward(),
            utc_offset_hours: default_utc_offset_hours(),
        }
    }
}

impl ChatpaceConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: ChatpaceConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        Ok((cfg, path))
    }

    /// Parses and validates without reading the environment.
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: ChatpaceConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse config: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        let api_key = non_empty_env("CHATPACE_LLM_API_KEY").or_else(|| non_empty_env("OPENAI_API_KEY"));
        if let Some(v) = api_key {
            self.llm.default.api_key = v;
        }
        if let Some(v) = non_empty_env("CHATPACE_LLM_BASE_URL") {
            self.llm.default.base_url = v;
        }
        if let Some(v) = non_empty_env("CHATPACE_LLM_MODEL") {
            self.llm.default.model = v;
        }
        if let Some(v) = non_empty_env("CHATPACE_BRIDGE_TOKEN") {
            self.channel.auth_token = Some(v);
        }
        if let Some(v) = non_empty_env("CHATPACE_DB_PATH") {
            self.storage.db_path = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.bot_name.trim().is_empty() {
            return Err(anyhow::anyhow!("general.bot_name is required"));
        }
        if self.llm.default.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.default.model is required"));
        }
        if self.queue.max_fragments == 0 {
            return Err(anyhow::anyhow!("queue.max_fragments must be > 0"));
        }
        if self.queue.idle_threshold_ms == 0 || self.queue.scan_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "queue.idle_threshold_ms and queue.scan_interval_ms must be > 0"
            ));
        }
        if self.debounce.coalesce_delay_ms == 0 {
            return Err(anyhow::anyhow!("debounce.coalesce_delay_ms must be > 0"));
        }
        if self.engagement.scan_interval_ms == 0 {
            return Err(anyhow::anyhow!("engagement.scan_interval_ms must be > 0"));
        }
        if self.engagement.min_wait_seconds >= self.engagement.max_wait_seconds {
            return Err(anyhow::anyhow!(
                "engagement.min_wait_seconds must be < engagement.max_wait_seconds"
            ));
        }
        self.engagement.quiet_hours()?;
        if self.delivery.long_reply_threshold == 0 {
            return Err(anyhow::anyhow!("delivery.long_reply_threshold must be > 0"));
        }
        for (field, [lo, hi]) in [
            (
                "delivery.typing_jitter_ms_per_char",
                self.delivery.typing_jitter_ms_per_char,
            ),
            ("delivery.segment_jitter_ms", self.delivery.segment_jitter_ms),
        ] {
            if lo > hi {
                return Err(anyhow::anyhow!("{field} must be [min, max] with min <= max"));
            }
        }
        if self.channel.send_url.trim().is_empty() {
            return Err(anyhow::anyhow!("channel.send_url is required"));
        }
        if self.channel.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("channel.poll_interval_ms must be > 0"));
        }
        if !(-23..=23).contains(&self.commands.utc_offset_hours) {
            return Err(anyhow::anyhow!("commands.utc_offset_hours must be within -23..=23"));
        }
        if self.server.enabled && self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }

        let mut seen = HashSet::new();
        for intent in &self.intents {
            let key = intent.key.trim();
            if key.is_empty() {
                return Err(anyhow::anyhow!("intents[].key is required"));
            }
            if key == DEFAULT_INTENT {
                return Err(anyhow::anyhow!(
                    "intent key {DEFAULT_INTENT:?} is reserved for unmatched messages"
                ));
            }
            if !seen.insert(key.to_string()) {
                return Err(anyhow::anyhow!("duplicate intent key {key:?}"));
            }
            if intent.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(anyhow::anyhow!("intent {key:?} needs at least one keyword"));
            }
        }
        for key in self.llm.intents.keys() {
            if !seen.contains(key.as_str()) {
                return Err(anyhow::anyhow!(
                    "llm.intents.{key} has no matching [[intents]] entry"
                ));
            }
        }
        Ok(())
    }

    pub fn vision_profile(&self) -> LlmProfile {
        let mut profile = self.llm.vision.clone().unwrap_or_else(|| self.llm.default.clone());
        if profile.api_key.trim().is_empty() {
            profile.api_key = self.llm.default.api_key.clone();
        }
        profile
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".chatpace").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[general]
bot_name = "pace"
"#;

    #[test]
    fn minimal_config_uses_documented_defaults() {
        let cfg = ChatpaceConfig::from_toml_str(MINIMAL).expect("minimal config is valid");
        assert_eq!(cfg.queue.idle_threshold(), Duration::from_secs(7));
        assert_eq!(cfg.queue.scan_interval(), Duration::from_secs(1));
        assert_eq!(cfg.queue.max_fragments, 5);
        assert_eq!(cfg.debounce.coalesce_delay(), Duration::from_secs(3));
        assert_eq!(cfg.engagement.scan_interval(), Duration::from_secs(10));
        assert_eq!(cfg.delivery.long_reply_threshold, 500);
        assert_eq!(cfg.responder.reasoning_marker, "</think>");
        assert_eq!(cfg.responder.history_limit, 30);
        assert!(cfg.intents.is_empty());
    }

    #[test]
    fn missing_bot_name_is_rejected() {
        let err = ChatpaceConfig::from_toml_str("[general]\nbot_name = \"  \"\n")
            .expect_err("blank bot name");
        assert!(err.to_string().contains("bot_name"));
    }

    #[test]
    fn inverted_engagement_wait_is_rejected() {
        let toml = format!("{MINIMAL}\n[engagement]\nmin_wait_seconds = 60\nmax_wait_seconds = 60\n");
        assert!(ChatpaceConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn unparsable_quiet_time_is_rejected() {
        let toml = format!("{MINIMAL}\n[engagement]\nquiet_start = \"25:00\"\n");
        assert!(ChatpaceConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn intent_keys_must_be_unique_and_not_reserved() {
        let dup = format!(
            "{MINIMAL}\n[[intents]]\nkey = \"astro\"\nkeywords = [\"星座\"]\n[[intents]]\nkey = \"astro\"\nkeywords = [\"zodiac\"]\n"
        );
        assert!(ChatpaceConfig::from_toml_str(&dup).is_err());

        let reserved = format!("{MINIMAL}\n[[intents]]\nkey = \"none\"\nkeywords = [\"x\"]\n");
        assert!(ChatpaceConfig::from_toml_str(&reserved).is_err());

        let orphan = format!("{MINIMAL}\n[llm.intents.astro]\nmodel = \"m\"\n");
        assert!(ChatpaceConfig::from_toml_str(&orphan).is_err());
    }

    #[test]
    fn inverted_jitter_range_is_rejected() {
        let toml = format!("{MINIMAL}\n[delivery]\nsegment_jitter_ms = [900, 100]\n");
        assert!(ChatpaceConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn vision_profile_inherits_default_api_key() {
        let toml = format!(
            "{MINIMAL}\n[llm.default]\napi_key = \"sk-main\"\n[llm.vision]\nmodel = \"vision-preview\"\n"
        );
        let cfg = ChatpaceConfig::from_toml_str(&toml).expect("valid");
        let vision = cfg.vision_profile();
        assert_eq!(vision.model, "vision-preview");
        assert_eq!(vision.api_key, "sk-main");
    }

    #[test]
    fn bundled_template_parses() {
        let template = include_str!("../../config-templates/config.toml");
        ChatpaceConfig::from_toml_str(template).expect("template config is valid");
    }

    #[test]
    fn expand_home_leaves_absolute_paths_alone() {
        assert_eq!(
            expand_home("/var/lib/chatpace.db").expect("absolute"),
            PathBuf::from("/var/lib/chatpace.db")
        );
    }
}
