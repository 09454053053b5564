//! Log-compaction setter: a stateful write layer over one topic.
//!
//! On start it replays the topic's history through a consumer to learn the
//! last payload fingerprint per compaction id, then accepts writes and
//! suppresses the ones whose payload has not changed. Outbound writes go
//! through two queues — ordered appends and a compaction-keyed map where
//! newer pending values overwrite older ones — drained by a single actor
//! with a timer tick, so flushes are serialized by construction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::TuningConfig;
use crate::consumer::{Consumer, OnCrashed, OnDrained, OnMessage};
use crate::error::EngineError;
use crate::hash::fingerprint;
use crate::producer::Producer;

enum SetterCmd {
    Compacted {
        compaction_id: String,
        payload: Value,
        fingerprint: String,
        queued_at: Instant,
        seq: u64,
    },
    Append {
        payload: Value,
    },
    Flush,
}

struct PendingCompacted {
    payload: Value,
    fingerprint: String,
    queued_at: Instant,
    seq: u64,
}

/// State shared between the synchronous enqueue surface and the callbacks:
/// confirmed fingerprints and the readiness latch.
struct SetterShared {
    /// compaction id → fingerprint of the last confirmed payload. Updated
    /// from history replay and from successful flushes, never from enqueues.
    memory_hash: Mutex<HashMap<String, String>>,
    ready_tx: watch::Sender<bool>,
}

/// Deduplicating, batching writer for one topic.
///
/// Takes ownership of a constructed (unstarted) consumer and producer pair;
/// `start` brings both up. The sharding key applied to setter-emitted
/// writes is provisioned by the caller.
#[derive(Clone)]
pub struct TopicSetter {
    inner: Arc<SetterInner>,
}

struct SetterInner {
    consumer: Consumer,
    producer: Producer,
    sharding_key: String,
    tuning: TuningConfig,
    shared: Arc<SetterShared>,
    cmd_tx: mpsc::UnboundedSender<SetterCmd>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<SetterCmd>>>,
    actor: Mutex<Option<JoinHandle<()>>>,
    seq: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl TopicSetter {
    pub fn new(
        consumer: Consumer,
        producer: Producer,
        sharding_key: impl Into<String>,
        tuning: TuningConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SetterInner {
                consumer,
                producer,
                sharding_key: sharding_key.into(),
                tuning,
                shared: Arc::new(SetterShared {
                    memory_hash: Mutex::new(HashMap::new()),
                    ready_tx,
                }),
                cmd_tx,
                cmd_rx: Mutex::new(Some(cmd_rx)),
                actor: Mutex::new(None),
                seq: AtomicU64::new(0),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Start producer and consumer, replay the topic from the beginning to
    /// rebuild the fingerprint map, and begin the flush ticker. The setter
    /// becomes ready when the replay drains.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarting);
        }
        self.inner.producer.start().await?;
        self.inner.consumer.start().await?;

        let replay_shared = self.inner.shared.clone();
        let replay_topic = self.inner.producer.topic().to_string();
        let on_message: OnMessage = Arc::new(move |record| {
            let shared = replay_shared.clone();
            let topic = replay_topic.clone();
            Box::pin(async move {
                match record.log_compact_id {
                    Some(id) => {
                        let digest = fingerprint(&record.payload);
                        shared.memory_hash.lock().insert(id, digest);
                    }
                    None => warn!(
                        "message {} on {} has no compaction id; skipped during replay",
                        record.id, topic
                    ),
                }
                Ok(())
            })
        });

        let ready_shared = self.inner.shared.clone();
        let ready_topic = self.inner.producer.topic().to_string();
        let on_drained: OnDrained = Arc::new(move || {
            let shared = ready_shared.clone();
            let topic = ready_topic.clone();
            Box::pin(async move {
                if !*shared.ready_tx.borrow() {
                    info!("history replay for {} complete; setter ready", topic);
                    // send_replace: the latch must flip even with no waiter.
                    shared.ready_tx.send_replace(true);
                }
                Ok(())
            })
        });

        let crash_topic = self.inner.producer.topic().to_string();
        let on_crashed: OnCrashed = Arc::new(move |err| {
            let topic = crash_topic.clone();
            Box::pin(async move {
                error!("setter replay consumer for {} crashed: {}", topic, err);
                Ok(())
            })
        });

        self.inner
            .consumer
            .stream_messages_from(on_message, None, on_drained, on_crashed)
            .await?;

        let rx = self
            .inner
            .cmd_rx
            .lock()
            .take()
            .ok_or(EngineError::AlreadyStarting)?;
        let actor = self.inner.clone();
        *self.inner.actor.lock() = Some(tokio::spawn(actor.run_actor(rx)));
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.shared.ready_tx.borrow()
    }

    /// Wait until history replay has drained and writes are accepted.
    pub async fn wait_until_ready(&self) -> Result<(), EngineError> {
        let mut rx = self.inner.shared.ready_tx.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map_err(|_| EngineError::Stopped)?;
        Ok(())
    }

    /// Enqueue a compacted write. Dropped when the payload fingerprint
    /// equals the last confirmed fingerprint for this compaction id; a
    /// pending entry for the same id is overwritten (latest value wins).
    /// The confirmed map is only updated once the write is flushed.
    pub fn set_log_compacted_payload(
        &self,
        compaction_id: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.inner.ensure_writable()?;
        let digest = fingerprint(&payload);
        {
            let memory_hash = self.inner.shared.memory_hash.lock();
            if memory_hash.get(compaction_id).map(String::as_str) == Some(digest.as_str()) {
                debug!(
                    "unchanged payload for compaction id {}; write dropped",
                    compaction_id
                );
                return Ok(());
            }
        }
        let cmd = SetterCmd::Compacted {
            compaction_id: compaction_id.to_string(),
            payload,
            fingerprint: digest,
            queued_at: Instant::now(),
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
        };
        let _ = self.inner.cmd_tx.send(cmd);
        Ok(())
    }

    /// Enqueue a plain append. Never deduplicated; flushed in insertion
    /// order ahead of the compacted queue.
    pub fn set_payload(&self, payload: Value) -> Result<(), EngineError> {
        self.inner.ensure_writable()?;
        let _ = self.inner.cmd_tx.send(SetterCmd::Append { payload });
        Ok(())
    }

    /// Force a flush ahead of the next tick. If a flush is running the
    /// request coalesces into a re-run right after it.
    pub fn trigger_waiting_messages(&self) -> Result<(), EngineError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        let _ = self.inner.cmd_tx.send(SetterCmd::Flush);
        Ok(())
    }

    /// Stop the actor, the replay consumer and the producer. Pending queue
    /// entries are discarded.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.consumer.stop();
        self.inner.producer.stop();
        if let Some(actor) = self.inner.actor.lock().take() {
            actor.abort();
        }
        info!("setter for {} stopped", self.inner.producer.topic());
    }
}

struct FlushQueues {
    append_queue: VecDeque<Value>,
    compacted: HashMap<String, PendingCompacted>,
    /// Set when a flush aborted or a trigger arrived mid-cooldown; the next
    /// eligible tick re-flushes.
    pending_trigger: bool,
    cooldown_until: Option<Instant>,
}

impl SetterInner {
    fn ensure_writable(&self) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        if !*self.shared.ready_tx.borrow() {
            return Err(EngineError::NotReady);
        }
        Ok(())
    }

    async fn run_actor(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SetterCmd>) {
        let mut queues = FlushQueues {
            append_queue: VecDeque::new(),
            compacted: HashMap::new(),
            pending_trigger: false,
            cooldown_until: None,
        };
        let mut interval = tokio::time::interval(self.tuning.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None => break,
                    Some(SetterCmd::Append { payload }) => {
                        queues.append_queue.push_back(payload);
                    }
                    Some(SetterCmd::Compacted { compaction_id, payload, fingerprint, queued_at, seq }) => {
                        queues.compacted.insert(
                            compaction_id,
                            PendingCompacted { payload, fingerprint, queued_at, seq },
                        );
                    }
                    Some(SetterCmd::Flush) => {
                        queues.pending_trigger = true;
                        self.try_flush(&mut queues).await;
                    }
                },
                _ = interval.tick() => {
                    if queues.pending_trigger
                        || !queues.append_queue.is_empty()
                        || !queues.compacted.is_empty()
                    {
                        self.try_flush(&mut queues).await;
                    }
                }
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    async fn try_flush(&self, queues: &mut FlushQueues) {
        if queues.append_queue.is_empty() && queues.compacted.is_empty() {
            queues.pending_trigger = false;
            return;
        }
        if let Some(until) = queues.cooldown_until {
            if Instant::now() < until {
                debug!(
                    "flush for {} deferred; cooling down after a failed flush",
                    self.producer.topic()
                );
                return;
            }
            queues.cooldown_until = None;
        }
        match self.flush_once(queues).await {
            Ok(()) => {
                queues.pending_trigger = false;
            }
            Err(e) => {
                error!("flush for {} aborted: {}", self.producer.topic(), e);
                queues.cooldown_until = Some(Instant::now() + self.tuning.flush_cooldown);
                queues.pending_trigger = true;
            }
        }
    }

    /// Appends first, in insertion order; then compacted entries in queue
    /// order. Any push failure aborts the flush with everything unflushed
    /// still queued, so the next run picks up where this one stopped.
    async fn flush_once(&self, queues: &mut FlushQueues) -> Result<(), EngineError> {
        while let Some(payload) = queues.append_queue.pop_front() {
            if let Err(e) = self
                .producer
                .push_message(payload.clone(), &self.sharding_key, None)
                .await
            {
                queues.append_queue.push_front(payload);
                return Err(e);
            }
        }

        let mut order: Vec<String> = queues.compacted.keys().cloned().collect();
        order.sort_by_key(|id| {
            let entry = &queues.compacted[id];
            (entry.queued_at, entry.seq)
        });

        for id in order {
            let (payload, digest) = match queues.compacted.get(&id) {
                Some(entry) => (entry.payload.clone(), entry.fingerprint.clone()),
                None => continue,
            };
            if let Err(e) = self
                .producer
                .push_message(payload, &self.sharding_key, Some(&id))
                .await
            {
                // The entry stays queued; the latest value wins naturally.
                return Err(e);
            }
            queues.compacted.remove(&id);
            self.shared.memory_hash.lock().insert(id, digest);
        }
        Ok(())
    }
}
