//! Ordered-append producer. Order comes from the store's linearized
//! counter, not from wall time or insert arrival: allocate first, then
//! write, and let the read side sort by id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bus::{BusConnection, SignalBus};
use crate::config::{TopicConfig, TuningConfig};
use crate::error::{BusError, EngineError};
use crate::record::{wake_channel, MessageRecord, WAKE_TOKEN};
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerState {
    New,
    Starting,
    Started,
    Stopped,
}

/// Appends messages to one topic and fires a wake token after each durable
/// write. Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    topic: String,
    store: Arc<dyn RecordStore>,
    bus: SignalBus,
    tuning: TuningConfig,
    state: Mutex<ProducerState>,
    conn: Mutex<Option<Arc<dyn BusConnection>>>,
    stopped: AtomicBool,
    retry_armed: AtomicBool,
}

impl Producer {
    pub fn new(
        config: &TopicConfig,
        store: Arc<dyn RecordStore>,
        bus: SignalBus,
        tuning: TuningConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                topic: config.topic.clone(),
                store,
                bus,
                tuning,
                state: Mutex::new(ProducerState::New),
                conn: Mutex::new(None),
                stopped: AtomicBool::new(false),
                retry_armed: AtomicBool::new(false),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Acquire the bus session. A second in-flight or repeated start fails
    /// with `AlreadyStarting`; start after stop fails with `Stopped`.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ProducerState::New => *state = ProducerState::Starting,
                ProducerState::Starting | ProducerState::Started => {
                    return Err(EngineError::AlreadyStarting)
                }
                ProducerState::Stopped => return Err(EngineError::Stopped),
            }
        }
        match self.inner.bus.connect().await {
            Ok(conn) => {
                *self.inner.conn.lock() = Some(Arc::from(conn));
                *self.inner.state.lock() = ProducerState::Started;
                info!("producer for {} started", self.inner.topic);
                Ok(())
            }
            Err(e) => {
                // Roll back so the caller may retry start.
                let mut state = self.inner.state.lock();
                if *state == ProducerState::Starting {
                    *state = ProducerState::New;
                }
                let deadline = match e {
                    BusError::ConnectTimeout(d) => d,
                    _ => self.inner.tuning.connect_deadline,
                };
                Err(EngineError::BusConnectTimeout(deadline))
            }
        }
    }

    /// Append one message and return its id.
    ///
    /// Allocation failure leaves the counter untouched; the push may be
    /// retried with no gap. An unacknowledged insert burns the allocated id:
    /// it is never reused, and the resulting gap does not invert order. The
    /// wake publish is fire-and-forget and never fails the caller.
    pub async fn push_message(
        &self,
        payload: Value,
        sharding_key: &str,
        log_compact_id: Option<&str>,
    ) -> Result<i64, EngineError> {
        self.inner.ensure_started()?;
        if sharding_key.is_empty() {
            return Err(EngineError::EmptySharding);
        }

        let id = self
            .inner
            .store
            .allocate_next_id(&self.inner.topic)
            .await
            .map_err(EngineError::AllocFailed)?;

        let record = MessageRecord {
            id,
            created_at: Utc::now(),
            sharding_key: sharding_key.to_string(),
            log_compact_id: log_compact_id.map(str::to_string),
            payload,
        };

        if let Err(e) = self.inner.store.insert(&self.inner.topic, &record).await {
            error!(
                "insert on {} for id {} not acknowledged: {}",
                self.inner.topic, id, e
            );
            return Err(EngineError::NotAcknowledged { id, source: e });
        }

        self.inner.clone().fire_wake();
        Ok(id)
    }

    /// Close the session. Idempotent; subsequent operations fail `Stopped`.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.inner.state.lock() = ProducerState::Stopped;
        *self.inner.conn.lock() = None;
        info!("producer for {} stopped", self.inner.topic);
    }
}

impl ProducerInner {
    fn ensure_started(&self) -> Result<(), EngineError> {
        match *self.state.lock() {
            ProducerState::Started => Ok(()),
            ProducerState::Stopped => Err(EngineError::Stopped),
            ProducerState::New | ProducerState::Starting => Err(EngineError::NotStarted),
        }
    }

    /// Publish the wake token without making the caller wait. A failed
    /// publish arms the retry loop instead of surfacing.
    fn fire_wake(self: Arc<Self>) {
        tokio::spawn(async move {
            if !self.publish_wake().await {
                self.arm_retry();
            }
        });
    }

    async fn publish_wake(&self) -> bool {
        let channel = wake_channel(&self.topic);
        let cached = self.conn.lock().clone();
        let conn = match cached {
            Some(conn) => conn,
            None => match self.bus.connect_now().await {
                Ok(fresh) => {
                    let fresh: Arc<dyn BusConnection> = Arc::from(fresh);
                    *self.conn.lock() = Some(fresh.clone());
                    fresh
                }
                Err(e) => {
                    warn!("bus reconnect for wake on {} failed: {}", channel, e);
                    return false;
                }
            },
        };
        match conn.publish(&channel, WAKE_TOKEN).await {
            Ok(()) => true,
            Err(e) => {
                warn!("wake publish on {} failed: {}", channel, e);
                // Drop the session; the next attempt reconnects.
                *self.conn.lock() = None;
                false
            }
        }
    }

    /// Retry the dropped wake on a fixed schedule until it lands or the
    /// producer stops. Consumers would still drain via their lifecycle
    /// events or later tokens; the retry just keeps latency bounded.
    fn arm_retry(self: Arc<Self>) {
        if self.retry_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tuning.publish_retry);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // the first tick completes immediately
            loop {
                interval.tick().await;
                if self.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if self.publish_wake().await {
                    debug!("deferred wake for {} delivered", self.topic);
                    break;
                }
            }
            self.retry_armed.store(false, Ordering::SeqCst);
        });
    }
}
