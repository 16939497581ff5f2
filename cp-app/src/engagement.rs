//! Idle-engagement scheduler.
//!
//! Every watched conversation carries a randomly drawn wait. When it elapses
//! without activity the bot starts the conversation itself, unless local time
//! falls in quiet hours. Either way the timer is redrawn. A busy send gate
//! defers the fire to the next scan instead.

use crate::config::{DEFAULT_INTENT, EngagementConfig};
use crate::delivery::{DeliveryPipeline, DeliveryRequest};
use crate::gate::{SendGate, SendSlot};
use crate::responder::{ReplyPolicy, ResponseRequest, Responder};
use anyhow::Context;
use chrono::{Local, NaiveTime};
use cp_channels::{ConversationId, SendTarget};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Time-of-day window with inclusive bounds. Wraps past midnight when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    start: NaiveTime,
    end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> anyhow::Result<Self> {
        Ok(Self::new(
            parse_time_of_day(start).context("engagement.quiet_start")?,
            parse_time_of_day(end).context("engagement.quiet_end")?,
        ))
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

fn parse_time_of_day(raw: &str) -> anyhow::Result<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|e| anyhow::anyhow!("invalid time of day {raw:?}: {e}"))
}

#[derive(Debug, Clone)]
struct EngagementTimer {
    target: SendTarget,
    last_seen: Instant,
    next_fire_after: Duration,
}

impl EngagementTimer {
    fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) >= self.next_fire_after
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchEntry {
    pub conversation_id: ConversationId,
    pub due_in_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickOutcome {
    pub fired: usize,
    pub suppressed: usize,
    pub deferred: usize,
    pub failed: usize,
}

pub struct EngagementScheduler {
    timers: DashMap<ConversationId, EngagementTimer>,
    min_wait: Duration,
    max_wait: Duration,
    scan_interval: Duration,
    quiet: QuietHours,
    prompt: String,
    gate: Arc<SendGate>,
    responder: Arc<dyn Responder>,
    policy: ReplyPolicy,
    delivery: Arc<DeliveryPipeline>,
}

impl EngagementScheduler {
    pub fn new(
        cfg: &EngagementConfig,
        gate: Arc<SendGate>,
        responder: Arc<dyn Responder>,
        policy: ReplyPolicy,
        delivery: Arc<DeliveryPipeline>,
    ) -> anyhow::Result<Self> {
        let (min_wait, max_wait) = cfg.wait_range();
        Ok(Self {
            timers: DashMap::new(),
            min_wait,
            max_wait,
            scan_interval: cfg.scan_interval(),
            quiet: cfg.quiet_hours()?,
            prompt: cfg.prompt.clone(),
            gate,
            responder,
            policy,
            delivery,
        })
    }

    fn draw_wait(&self) -> Duration {
        if self.min_wait >= self.max_wait {
            return self.min_wait;
        }
        rand::thread_rng().gen_range(self.min_wait..self.max_wait)
    }

    /// Records activity for `target`, adding it to the watch-list if needed.
    pub fn touch(&self, target: &SendTarget) {
        self.touch_at(target, Instant::now());
    }

    pub fn touch_at(&self, target: &SendTarget, at: Instant) {
        let next_fire_after = self.draw_wait();
        let conversation_id = target.conversation_id();
        // Bot-initiated group messages address the whole group.
        let target = match target {
            SendTarget::Group { name, .. } => SendTarget::group(name.clone(), None),
            individual => individual.clone(),
        };
        let new = self
            .timers
            .insert(
                conversation_id.clone(),
                EngagementTimer {
                    target,
                    last_seen: at,
                    next_fire_after,
                },
            )
            .is_none();
        if new {
            tracing::debug!(%conversation_id, "conversation added to engagement watch-list");
        }
    }

    pub fn seed(&self, cfg: &EngagementConfig) {
        let now = Instant::now();
        for name in &cfg.individuals {
            self.touch_at(&SendTarget::individual(name.trim()), now);
        }
        for name in &cfg.groups {
            self.touch_at(&SendTarget::group(name.trim(), None), now);
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<WatchEntry> {
        let now = Instant::now();
        let mut out: Vec<WatchEntry> = self
            .timers
            .iter()
            .map(|entry| {
                let elapsed = now.saturating_duration_since(entry.last_seen);
                WatchEntry {
                    conversation_id: entry.key().clone(),
                    due_in_secs: entry.next_fire_after.saturating_sub(elapsed).as_secs(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        out
    }

    fn reset(&self, conversation_id: &ConversationId, at: Instant) {
        let next_fire_after = self.draw_wait();
        if let Some(mut timer) = self.timers.get_mut(conversation_id) {
            timer.last_seen = at;
            timer.next_fire_after = next_fire_after;
        }
    }

    /// One scan over the watch-list. Each fired conversation runs in its own
    /// task; a panic there is logged and its timer redrawn.
    pub async fn tick(self: &Arc<Self>, now: Instant, local_time: NaiveTime) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let due: Vec<(ConversationId, SendTarget)> = self
            .timers
            .iter()
            .filter(|entry| entry.is_due(now))
            .map(|entry| (entry.key().clone(), entry.target.clone()))
            .collect();

        for (conversation_id, target) in due {
            if self.quiet.contains(local_time) {
                tracing::debug!(%conversation_id, %local_time, "quiet hours; engagement suppressed");
                self.reset(&conversation_id, now);
                outcome.suppressed += 1;
                continue;
            }
            let Some(slot) = self.gate.try_reserve() else {
                tracing::debug!(%conversation_id, "send gate busy; engagement deferred");
                outcome.deferred += 1;
                continue;
            };

            tracing::info!(%conversation_id, "starting idle engagement");
            let this = Arc::clone(self);
            let id = conversation_id.clone();
            let task = tokio::spawn(async move { this.engage(slot, &id, &target).await });
            match task.await {
                Ok(()) => outcome.fired += 1,
                Err(e) => {
                    tracing::error!(%conversation_id, error = %e, "idle engagement aborted");
                    outcome.failed += 1;
                }
            }
            self.reset(&conversation_id, Instant::now());
        }
        outcome
    }

    async fn engage(&self, slot: SendSlot, conversation_id: &ConversationId, target: &SendTarget) {
        let request = ResponseRequest {
            conversation_id,
            sender: target.recipient(),
            text: &self.prompt,
            intent: DEFAULT_INTENT,
        };
        let reply = self.policy.generate(self.responder.as_ref(), request).await;
        self.delivery
            .deliver(
                &slot,
                DeliveryRequest {
                    target,
                    sender_name: target.recipient(),
                    original_text: &self.prompt,
                    reply: &reply,
                },
            )
            .await;
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.scan_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("engagement loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {}
                }
                let outcome = self.tick(Instant::now(), Local::now().time()).await;
                if outcome != TickOutcome::default() {
                    tracing::debug!(
                        fired = outcome.fired,
                        suppressed = outcome.suppressed,
                        deferred = outcome.deferred,
                        failed = outcome.failed,
                        "engagement scan finished"
                    );
                }
            }
        })
    }
}
