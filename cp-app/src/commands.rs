//! Local chat commands answered without the LLM: daily sign-in and coin balance.

use crate::config::CommandsConfig;
use crate::store::SqliteStore;
use chrono::{FixedOffset, NaiveDate, Offset, Utc};

const STORAGE_UNAVAILABLE: &str = "金币系统暂时不可用，请稍后再试。";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    SignIn,
    Balance,
}

#[derive(Debug, Clone)]
pub struct LocalCommands {
    cfg: CommandsConfig,
    store: SqliteStore,
}

impl LocalCommands {
    pub fn new(cfg: CommandsConfig, store: SqliteStore) -> Self {
        Self { cfg, store }
    }

    /// True when `text` would trigger a command.
    pub fn matches(&self, text: &str) -> bool {
        self.parse(text).is_some()
    }

    fn parse(&self, text: &str) -> Option<Command> {
        if !self.cfg.enabled {
            return None;
        }
        let lowered = text.to_lowercase();
        let hit = |keywords: &[String]| {
            keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .any(|k| !k.is_empty() && lowered.contains(&k))
        };
        if hit(&self.cfg.sign_in_keywords) {
            Some(Command::SignIn)
        } else if hit(&self.cfg.balance_keywords) {
            Some(Command::Balance)
        } else {
            None
        }
    }

    fn today(&self) -> NaiveDate {
        let offset = FixedOffset::east_opt(self.cfg.utc_offset_hours * 3600).unwrap_or_else(|| {
            tracing::warn!(
                utc_offset_hours = self.cfg.utc_offset_hours,
                "invalid commands.utc_offset_hours; using UTC"
            );
            Utc.fix()
        });
        Utc::now().with_timezone(&offset).date_naive()
    }

    /// Returns a reply when `text` is a command, `None` otherwise.
    #[tracing::instrument(level = "debug", skip_all, fields(sender = %sender))]
    pub async fn handle(&self, sender: &str, text: &str) -> Option<String> {
        let command = self.parse(text)?;
        let today = self.today();
        let reply = match command {
            Command::SignIn => self.sign_in(sender, today).await,
            Command::Balance => self.balance(sender, today).await,
        };
        tracing::info!(?command, "local command answered");
        Some(reply)
    }

    async fn sign_in(&self, sender: &str, today: NaiveDate) -> String {
        match self
            .store
            .sign_in(sender, today, self.cfg.sign_in_reward)
            .await
        {
            Ok(outcome) if outcome.credited => format!(
                "{sender} 签到成功！获得 {} 金币，当前余额 {} 金币。",
                self.cfg.sign_in_reward, outcome.balance
            ),
            Ok(outcome) => format!(
                "{sender} 今天已经签到过了，当前余额 {} 金币。",
                outcome.balance
            ),
            Err(e) => {
                tracing::warn!(%e, "sign-in failed");
                STORAGE_UNAVAILABLE.to_string()
            }
        }
    }

    async fn balance(&self, sender: &str, today: NaiveDate) -> String {
        match self.store.game_user(sender).await {
            Ok(Some(user)) => {
                let status = if user.last_sign_in_date == Some(today) {
                    "今天已签到"
                } else {
                    "今天还没有签到"
                };
                format!("{sender} 当前余额 {} 金币，{status}。", user.coin_balance)
            }
            Ok(None) => format!("{sender} 还没有账户，发送“签到”即可开户并领取金币。"),
            Err(e) => {
                tracing::warn!(%e, "balance lookup failed");
                STORAGE_UNAVAILABLE.to_string()
            }
        }
    }
}
