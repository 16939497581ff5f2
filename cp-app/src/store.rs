//! SQLite persistence: the conversation log and the sign-in ledger.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use cp_channels::ConversationId;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chat_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    sender_name TEXT NOT NULL,
    message TEXT NOT NULL,
    reply TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_conversation
    ON chat_messages(conversation_id, id);

CREATE TABLE IF NOT EXISTS game_users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    coin_balance INTEGER NOT NULL DEFAULT 0,
    last_sign_in_date TEXT
);
"#;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRecord {
    pub conversation_id: String,
    pub sender_name: String,
    pub message: String,
    pub reply: String,
    pub created_at: String,
}

/// Append-only log of answered turns.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn append_record(
        &self,
        conversation_id: &ConversationId,
        sender_name: &str,
        original_text: &str,
        reply_text: &str,
    ) -> Result<()>;

    /// Most recent `limit` records, oldest first.
    async fn recent(&self, conversation_id: &ConversationId, limit: usize)
    -> Result<Vec<ChatRecord>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameUser {
    pub name: String,
    pub coin_balance: i64,
    pub last_sign_in_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignInOutcome {
    pub credited: bool,
    pub new_account: bool,
    pub balance: i64,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("apply database schema")?;
        tracing::debug!(path = %path.display(), "sqlite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .context("sqlite task failed")?
    }

    pub async fn game_user(&self, name: &str) -> Result<Option<GameUser>> {
        let name = name.to_string();
        self.with_conn(move |conn| load_game_user(conn, &name)).await
    }

    /// Credits `reward` once per `today`. Creates the account on first use.
    pub async fn sign_in(&self, name: &str, today: NaiveDate, reward: i64) -> Result<SignInOutcome> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existing = load_game_user(&tx, &name)?;
            let outcome = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO game_users (name, coin_balance, last_sign_in_date) VALUES (?1, ?2, ?3)",
                        params![name, reward, today.format(DATE_FORMAT).to_string()],
                    )?;
                    SignInOutcome {
                        credited: true,
                        new_account: true,
                        balance: reward,
                    }
                }
                Some(user) if user.last_sign_in_date == Some(today) => SignInOutcome {
                    credited: false,
                    new_account: false,
                    balance: user.coin_balance,
                },
                Some(user) => {
                    let balance = user.coin_balance + reward;
                    tx.execute(
                        "UPDATE game_users SET coin_balance = ?1, last_sign_in_date = ?2 WHERE name = ?3",
                        params![balance, today.format(DATE_FORMAT).to_string(), name],
                    )?;
                    SignInOutcome {
                        credited: true,
                        new_account: false,
                        balance,
                    }
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }
}

fn load_game_user(conn: &Connection, name: &str) -> Result<Option<GameUser>> {
    let row = conn
        .query_row(
            "SELECT name, coin_balance, last_sign_in_date FROM game_users WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((name, coin_balance, date)) = row else {
        return Ok(None);
    };
    let last_sign_in_date = match date {
        Some(raw) => Some(
            NaiveDate::parse_from_str(&raw, DATE_FORMAT)
                .with_context(|| format!("invalid last_sign_in_date {raw:?} for {name}"))?,
        ),
        None => None,
    };
    Ok(Some(GameUser {
        name,
        coin_balance,
        last_sign_in_date,
    }))
}

#[async_trait]
impl ConversationLog for SqliteStore {
    async fn append_record(
        &self,
        conversation_id: &ConversationId,
        sender_name: &str,
        original_text: &str,
        reply_text: &str,
    ) -> Result<()> {
        let values = (
            conversation_id.to_string(),
            sender_name.to_string(),
            original_text.to_string(),
            reply_text.to_string(),
            Utc::now().to_rfc3339(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chat_messages (conversation_id, sender_name, message, reply, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![values.0, values.1, values.2, values.3, values.4],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<ChatRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT conversation_id, sender_name, message, reply, created_at \
                 FROM chat_messages WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![conversation_id, limit as i64], |row| {
                Ok(ChatRecord {
                    conversation_id: row.get(0)?,
                    sender_name: row.get(1)?,
                    message: row.get(2)?,
                    reply: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            let mut out = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            out.reverse();
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("data").join("chatpace.db")).expect("open");
        (dir, store)
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).expect("date")
    }

    #[tokio::test]
    async fn recent_returns_latest_records_oldest_first() {
        let (_dir, store) = open_temp();
        let alice = ConversationId::new("alice");
        let bob = ConversationId::new("bob");
        for i in 1..=4 {
            store
                .append_record(&alice, "alice", &format!("q{i}"), &format!("a{i}"))
                .await
                .expect("append");
        }
        store.append_record(&bob, "bob", "hey", "yo").await.expect("append");

        let records = store.recent(&alice, 2).await.expect("recent");
        let messages: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["q3", "q4"]);
        assert!(records.iter().all(|r| r.conversation_id == "alice"));
        assert!(store.recent(&alice, 0).await.expect("recent").is_empty());
    }

    #[tokio::test]
    async fn sign_in_credits_once_per_day() {
        let (_dir, store) = open_temp();
        let first = store.sign_in("alice", day("2026-03-01"), 10).await.expect("sign in");
        assert_eq!(
            first,
            SignInOutcome {
                credited: true,
                new_account: true,
                balance: 10
            }
        );

        let again = store.sign_in("alice", day("2026-03-01"), 10).await.expect("sign in");
        assert!(!again.credited);
        assert_eq!(again.balance, 10);

        let next_day = store.sign_in("alice", day("2026-03-02"), 10).await.expect("sign in");
        assert!(next_day.credited && !next_day.new_account);
        assert_eq!(next_day.balance, 20);

        let user = store.game_user("alice").await.expect("load").expect("exists");
        assert_eq!(user.last_sign_in_date, Some(day("2026-03-02")));
        assert!(store.game_user("bob").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn reopening_keeps_existing_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chatpace.db");
        let id = ConversationId::new("alice");
        SqliteStore::open(&path)
            .expect("open")
            .append_record(&id, "alice", "hi", "hello")
            .await
            .expect("append");

        let reopened = SqliteStore::open(&path).expect("reopen");
        assert_eq!(reopened.recent(&id, 10).await.expect("recent").len(), 1);
    }
}
