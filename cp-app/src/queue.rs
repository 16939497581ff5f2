//! Conversation queue store.
//!
//! Pending fragments per conversation behind a single lock. Turns are removed
//! atomically when they go idle, so no turn is handed out twice.

use chrono::{DateTime, Local};
use cp_channels::{ConversationId, SendTarget};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub sender: String,
    pub text: String,
    pub received_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub conversation_id: ConversationId,
    pub target: SendTarget,
    /// Most recent sender in this turn.
    pub display_sender: String,
    pub fragments: VecDeque<Fragment>,
    pub last_activity: Instant,
}

impl ConversationTurn {
    pub fn texts(&self) -> Vec<&str> {
        self.fragments.iter().map(|f| f.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedConversation {
    pub conversation_id: ConversationId,
    pub pending_fragments: usize,
    pub idle_ms: u64,
}

#[derive(Debug)]
pub struct ConversationQueue {
    max_fragments: usize,
    turns: Mutex<HashMap<ConversationId, ConversationTurn>>,
}

impl ConversationQueue {
    pub fn new(max_fragments: usize) -> Self {
        Self {
            max_fragments: max_fragments.max(1),
            turns: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationId, ConversationTurn>> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, target: SendTarget, sender: &str, text: impl Into<String>) {
        self.enqueue_at(target, sender, text, Instant::now());
    }

    /// Appends a fragment, evicting the oldest once the turn is full.
    pub fn enqueue_at(
        &self,
        target: SendTarget,
        sender: &str,
        text: impl Into<String>,
        at: Instant,
    ) {
        let fragment = Fragment {
            sender: sender.to_string(),
            text: text.into(),
            received_at: Local::now(),
        };
        let conversation_id = target.conversation_id();
        let mut turns = self.lock();
        let turn = turns
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationTurn {
                conversation_id,
                target: target.clone(),
                display_sender: sender.to_string(),
                fragments: VecDeque::with_capacity(self.max_fragments),
                last_activity: at,
            });
        while turn.fragments.len() >= self.max_fragments {
            if let Some(evicted) = turn.fragments.pop_front() {
                tracing::debug!(
                    conversation_id = %turn.conversation_id,
                    evicted_sender = %evicted.sender,
                    "turn at capacity; evicted oldest fragment"
                );
            }
        }
        turn.fragments.push_back(fragment);
        turn.target = target;
        turn.display_sender = sender.to_string();
        turn.last_activity = at;
    }

    /// Removes and returns every turn idle for longer than `idle_threshold`,
    /// oldest activity first.
    pub fn take_idle(&self, now: Instant, idle_threshold: Duration) -> Vec<ConversationTurn> {
        let mut turns = self.lock();
        let idle_ids: Vec<ConversationId> = turns
            .iter()
            .filter(|(_, turn)| now.saturating_duration_since(turn.last_activity) > idle_threshold)
            .map(|(id, _)| id.clone())
            .collect();
        let mut idle: Vec<ConversationTurn> = idle_ids
            .iter()
            .filter_map(|id| turns.remove(id))
            .collect();
        idle.sort_by_key(|turn| turn.last_activity);
        idle
    }

    /// Puts a promoted turn back. Fragments that arrived meanwhile stay after
    /// the requeued ones. Requeueing never refreshes the idle clock: the turn
    /// keeps its own `last_activity`, or that of the newer fragments.
    pub fn requeue(&self, mut turn: ConversationTurn) {
        let mut turns = self.lock();
        if let Some(newer) = turns.remove(&turn.conversation_id) {
            turn.fragments.extend(newer.fragments);
            while turn.fragments.len() > self.max_fragments {
                turn.fragments.pop_front();
            }
            turn.target = newer.target;
            turn.display_sender = newer.display_sender;
            turn.last_activity = newer.last_activity;
        }
        turns.insert(turn.conversation_id.clone(), turn);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<QueuedConversation> {
        let now = Instant::now();
        let mut out: Vec<QueuedConversation> = self
            .lock()
            .values()
            .map(|turn| QueuedConversation {
                conversation_id: turn.conversation_id.clone(),
                pending_fragments: turn.fragments.len(),
                idle_ms: now.saturating_duration_since(turn.last_activity).as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        out
    }
}
