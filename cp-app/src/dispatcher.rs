//! Inactivity dispatcher.
//!
//! Each scan reserves the send slot first, then promotes every conversation
//! that has been quiet longer than the idle threshold. A turn is merged,
//! classified, answered and delivered while the slot is held, so nothing
//! else can send meanwhile.

use crate::config::QueueConfig;
use crate::delivery::{DeliveryPipeline, DeliveryRequest};
use crate::gate::{SendGate, SendSlot};
use crate::intent::IntentClassifier;
use crate::queue::{ConversationQueue, ConversationTurn};
use crate::responder::{ReplyPolicy, ResponseRequest, Responder};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub separator: String,
    pub timestamp_fragments: bool,
}

impl From<&QueueConfig> for MergeOptions {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            separator: cfg.separator.clone(),
            timestamp_fragments: cfg.timestamp_fragments,
        }
    }
}

/// Joins a turn's fragments in arrival order. Group fragments are attributed
/// to their sender.
pub fn merge_turn(turn: &ConversationTurn, opts: &MergeOptions) -> String {
    let group = turn.target.is_group();
    turn.fragments
        .iter()
        .map(|fragment| {
            let mut line = String::new();
            if opts.timestamp_fragments {
                line.push_str(&format!("[{}] ", fragment.received_at.format(TIMESTAMP_FORMAT)));
            }
            if group {
                line.push_str(&fragment.sender);
                line.push_str(": ");
            }
            line.push_str(&fragment.text);
            line
        })
        .collect::<Vec<_>>()
        .join(&opts.separator)
}

pub struct Dispatcher {
    queue: Arc<ConversationQueue>,
    gate: Arc<SendGate>,
    classifier: Arc<dyn IntentClassifier>,
    responder: Arc<dyn Responder>,
    policy: ReplyPolicy,
    delivery: Arc<DeliveryPipeline>,
    merge: MergeOptions,
    idle_threshold: Duration,
    scan_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        cfg: &QueueConfig,
        queue: Arc<ConversationQueue>,
        gate: Arc<SendGate>,
        classifier: Arc<dyn IntentClassifier>,
        responder: Arc<dyn Responder>,
        policy: ReplyPolicy,
        delivery: Arc<DeliveryPipeline>,
    ) -> Self {
        Self {
            queue,
            gate,
            classifier,
            responder,
            policy,
            delivery,
            merge: MergeOptions::from(cfg),
            idle_threshold: cfg.idle_threshold(),
            scan_interval: cfg.scan_interval(),
        }
    }

    /// One scan. Returns how many turns were answered.
    ///
    /// Each turn runs in its own task, so a panic while answering one
    /// conversation is logged and the rest of the batch still goes out.
    pub async fn tick(self: &Arc<Self>, now: Instant) -> usize {
        let Some(slot) = self.gate.try_reserve() else {
            return 0;
        };
        let slot = Arc::new(slot);
        let mut idle = self.queue.take_idle(now, self.idle_threshold).into_iter();
        let mut attempted = 0;
        let mut handled = 0;
        while let Some(turn) = idle.next() {
            if attempted > 0 && !slot.dispatch_allowed() {
                let mut deferred = 1;
                self.queue.requeue(turn);
                for rest in idle.by_ref() {
                    self.queue.requeue(rest);
                    deferred += 1;
                }
                tracing::debug!(deferred, "dispatch closed mid-batch; turns requeued");
                break;
            }
            attempted += 1;
            let conversation_id = turn.conversation_id.clone();
            let this = Arc::clone(self);
            let turn_slot = Arc::clone(&slot);
            let task = tokio::spawn(async move { this.process(&turn_slot, turn).await });
            match task.await {
                Ok(()) => handled += 1,
                Err(e) => tracing::error!(
                    %conversation_id,
                    error = %e,
                    "turn processing aborted"
                ),
            }
        }
        handled
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(conversation_id = %turn.conversation_id, fragments = turn.fragments.len())
    )]
    async fn process(&self, slot: &SendSlot, turn: ConversationTurn) {
        let merged = merge_turn(&turn, &self.merge);
        let plain = turn.texts().join(&self.merge.separator);
        let intent = self.classifier.classify(&plain);
        tracing::debug!(%intent, "turn classified");

        let request = ResponseRequest {
            conversation_id: &turn.conversation_id,
            sender: &turn.display_sender,
            text: &merged,
            intent: &intent,
        };
        let reply = self.policy.generate(self.responder.as_ref(), request).await;
        self.delivery
            .deliver(
                slot,
                DeliveryRequest {
                    target: &turn.target,
                    sender_name: &turn.display_sender,
                    original_text: &merged,
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
                        tracing::info!("dispatcher loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {}
                }
                let this = Arc::clone(&self);
                let scan = tokio::spawn(async move { this.tick(Instant::now()).await });
                match scan.await {
                    Ok(0) => {}
                    Ok(handled) => tracing::debug!(handled, "dispatch scan finished"),
                    Err(e) => tracing::error!(error = %e, "dispatch scan aborted"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::gate::DispatchHold;
    use crate::intent::KeywordIntentClassifier;
    use crate::testing::{MemoryLog, RecordingChannel, ScriptedResponder};
    use async_trait::async_trait;
    use cp_channels::SendTarget;
    use std::sync::Mutex;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        queue: Arc<ConversationQueue>,
        gate: Arc<SendGate>,
        channel: Arc<RecordingChannel>,
        log: Arc<MemoryLog>,
    }

    fn queue_cfg() -> QueueConfig {
        QueueConfig {
            timestamp_fragments: false,
            ..QueueConfig::default()
        }
    }

    fn harness_with(responder: Arc<dyn Responder>, channel: RecordingChannel, gate: Arc<SendGate>) -> Harness {
        let cfg = queue_cfg();
        let queue = Arc::new(ConversationQueue::new(cfg.max_fragments));
        let channel = Arc::new(channel);
        let log = Arc::new(MemoryLog::default());
        let delivery = Arc::new(DeliveryPipeline::new(
            channel.clone(),
            log.clone(),
            DeliveryConfig::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            &cfg,
            queue.clone(),
            gate.clone(),
            Arc::new(KeywordIntentClassifier::default()),
            responder,
            ReplyPolicy {
                fallback_reply: "sorry".to_string(),
                reasoning_marker: "</think>".to_string(),
            },
            delivery,
        ));
        Harness {
            dispatcher,
            queue,
            gate,
            channel,
            log,
        }
    }

    fn alice() -> SendTarget {
        SendTarget::individual("alice")
    }

    #[tokio::test]
    async fn dispatch_merges_capped_fragments_in_order() {
        let responder = Arc::new(ScriptedResponder::replying("ok"));
        let h = harness_with(responder.clone(), RecordingChannel::default(), SendGate::new());
        let t0 = Instant::now();
        for i in 1..=7 {
            h.queue.enqueue_at(alice(), "alice", format!("m{i}"), t0);
        }

        assert_eq!(h.dispatcher.tick(t0 + Duration::from_secs(6)).await, 0);
        assert_eq!(h.dispatcher.tick(t0 + Duration::from_secs(8)).await, 1);

        let requests = responder.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].text, "m3 m4 m5 m6 m7");
        assert_eq!(h.channel.texts(), vec!["ok"]);
        assert_eq!(h.log.records().len(), 1);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn busy_or_held_gate_leaves_turns_queued() {
        let responder = Arc::new(ScriptedResponder::replying("ok"));
        let h = harness_with(responder.clone(), RecordingChannel::default(), SendGate::new());
        let t0 = Instant::now();
        h.queue.enqueue_at(alice(), "alice", "hi", t0);
        let later = t0 + Duration::from_secs(8);

        assert!(h.gate.try_acquire_send_slot());
        assert_eq!(h.dispatcher.tick(later).await, 0);
        assert_eq!(h.queue.len(), 1);
        h.gate.release_send_slot();

        let hold = h.gate.hold_dispatch();
        assert_eq!(h.dispatcher.tick(later).await, 0);
        assert_eq!(h.queue.len(), 1);
        drop(hold);

        assert_eq!(h.dispatcher.tick(later).await, 1);
        assert_eq!(responder.requests().len(), 1);
    }

    #[tokio::test]
    async fn gate_reopens_after_failed_reply_and_send() {
        let h = harness_with(
            Arc::new(ScriptedResponder::failing()),
            RecordingChannel::failing(),
            SendGate::new(),
        );
        let t0 = Instant::now();
        h.queue.enqueue_at(alice(), "alice", "hi", t0);

        assert_eq!(h.dispatcher.tick(t0 + Duration::from_secs(8)).await, 1);
        assert_eq!(h.channel.texts(), vec!["sorry"]);
        assert_eq!(h.log.records()[0].reply, "sorry");
        assert!(!h.gate.send_in_progress());

        h.queue.enqueue_at(alice(), "alice", "again", t0);
        assert_eq!(h.dispatcher.tick(t0 + Duration::from_secs(8)).await, 1);
    }

    struct HoldingResponder {
        gate: Arc<SendGate>,
        holds: Mutex<Vec<DispatchHold>>,
    }

    #[async_trait]
    impl Responder for HoldingResponder {
        async fn respond(&self, _request: ResponseRequest<'_>) -> anyhow::Result<String> {
            self.holds.lock().expect("holds lock").push(self.gate.hold_dispatch());
            Ok("ok".to_string())
        }
    }

    #[tokio::test]
    async fn hold_taken_mid_batch_requeues_remaining_turns() {
        let gate = SendGate::new();
        let responder = Arc::new(HoldingResponder {
            gate: gate.clone(),
            holds: Mutex::new(Vec::new()),
        });
        let h = harness_with(responder.clone(), RecordingChannel::default(), gate);
        let t0 = Instant::now();
        h.queue.enqueue_at(alice(), "alice", "first", t0);
        h.queue
            .enqueue_at(SendTarget::individual("bob"), "bob", "second", t0 + Duration::from_secs(1));

        let later = t0 + Duration::from_secs(10);
        assert_eq!(h.dispatcher.tick(later).await, 1);
        assert_eq!(h.channel.sent().len(), 1);
        assert_eq!(h.queue.len(), 1, "second turn went back to the queue");

        responder.holds.lock().expect("holds lock").clear();
        assert_eq!(h.dispatcher.tick(later).await, 1);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn panic_in_one_conversation_does_not_drop_the_rest_of_the_batch() {
        let responder = Arc::new(ScriptedResponder::replying("ok").panicking_for("alice"));
        let h = harness_with(responder.clone(), RecordingChannel::default(), SendGate::new());
        let t0 = Instant::now();
        h.queue.enqueue_at(alice(), "alice", "hi", t0);
        h.queue
            .enqueue_at(SendTarget::individual("bob"), "bob", "hey", t0 + Duration::from_secs(1));

        let handled = h.dispatcher.tick(t0 + Duration::from_secs(10)).await;
        assert_eq!(handled, 1);
        assert_eq!(responder.requests().len(), 2);
        assert_eq!(
            h.channel.sent(),
            vec![crate::testing::Sent::Text {
                recipient: "bob".to_string(),
                text: "ok".to_string(),
            }]
        );
        assert_eq!(h.log.records().len(), 1);
        assert!(h.queue.is_empty());
        assert!(!h.gate.send_in_progress(), "slot released after the panic");
    }

    #[tokio::test]
    async fn group_turns_attribute_fragments_and_mention_latest_sender() {
        let responder = Arc::new(ScriptedResponder::replying("hi all"));
        let h = harness_with(responder.clone(), RecordingChannel::default(), SendGate::new());
        let t0 = Instant::now();
        let group = |sender: &str| SendTarget::group("family", Some(sender.to_string()));
        h.queue.enqueue_at(group("alice"), "alice", "hi", t0);
        h.queue.enqueue_at(group("bob"), "bob", "yo", t0);

        h.dispatcher.tick(t0 + Duration::from_secs(8)).await;
        assert_eq!(responder.requests()[0].text, "alice: hi bob: yo");
        assert_eq!(responder.requests()[0].sender, "bob");
        assert_eq!(h.channel.texts(), vec!["@bob hi all"]);
        assert_eq!(h.log.records()[0].sender_name, "bob");
    }

    #[test]
    fn timestamps_prefix_each_fragment() {
        let queue = ConversationQueue::new(5);
        let t0 = Instant::now();
        queue.enqueue_at(alice(), "alice", "hi", t0);
        queue.enqueue_at(alice(), "alice", "there", t0);
        let turn = queue
            .take_idle(t0 + Duration::from_secs(8), Duration::from_secs(7))
            .pop()
            .expect("idle turn");
        let merged = merge_turn(
            &turn,
            &MergeOptions {
                separator: "\n".to_string(),
                timestamp_fragments: true,
            },
        );
        let pattern = regex::Regex::new(
            r"^\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\] hi\n\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\] there$",
        )
        .expect("regex");
        assert!(pattern.is_match(&merged), "{merged}");
    }

    #[tokio::test(start_paused = true)]
    async fn loop_dispatches_after_idle_threshold_and_stops_on_cancel() {
        let responder = Arc::new(ScriptedResponder::replying("ok"));
        let h = harness_with(responder.clone(), RecordingChannel::default(), SendGate::new());
        let shutdown = CancellationToken::new();
        let handle = h.dispatcher.clone().spawn(shutdown.child_token());

        h.queue.enqueue(alice(), "alice", "hi");
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(h.channel.sent().is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.channel.texts(), vec!["ok"]);

        shutdown.cancel();
        handle.await.expect("dispatcher loop joins");
    }
}
