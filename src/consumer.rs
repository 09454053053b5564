//! Wake-driven streaming consumer.
//!
//! Delivery is dual-path: the record store is the source of truth, the bus
//! is a latency hint. A ticker polls the store whenever the wake flag says
//! there may be more; any token on the wake channel raises the flag, and so
//! do the session lifecycle events `FirstReady` and `Reconnected` — a token
//! dropped during an outage must never strand a message.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bus::{BusConnection, LifecycleEvent, OnLifecycle, OnToken, SessionHandle, SignalBus};
use crate::config::{TopicConfig, TuningConfig};
use crate::error::{BusError, EngineError};
use crate::record::{wake_channel, MessageRecord};
use crate::store::RecordStore;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Invoked once per delivered record, awaited before the next delivery.
/// An `Err` crashes the consumer: `on_crashed` fires, then the consumer
/// stops. The cursor has already advanced past the failing record.
pub type OnMessage = Arc<dyn Fn(MessageRecord) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// Invoked when a poll comes back empty, once per drain; re-armed by the
/// next wake. Errors are logged and swallowed.
pub type OnDrained = Arc<dyn Fn() -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// Invoked exactly once when the message callback fails. Errors are logged
/// and swallowed.
pub type OnCrashed = Arc<dyn Fn(anyhow::Error) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    New,
    Starting,
    Started,
    Streaming,
    Stopped,
    Crashed,
}

/// Internal observations for tests and debugging harnesses.
#[derive(Debug, Clone)]
pub enum ConsumerDebugEvent {
    State(ConsumerState),
    Wake { source: &'static str },
    PollStarted { after_id: Option<i64> },
    PollFetched { count: usize },
    PollFailed { reason: String },
    Delivered { id: i64 },
    Drained,
}

type DebugHandler = Box<dyn Fn(&ConsumerDebugEvent) + Send + Sync>;

/// Streams one topic through user callbacks. Cheap to clone; clones share
/// the same cursor and state machine.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    topic: String,
    store: Arc<dyn RecordStore>,
    bus: SignalBus,
    tuning: TuningConfig,
    state: Mutex<ConsumerState>,
    stopped: AtomicBool,
    more_messages: AtomicBool,
    polling: AtomicBool,
    drained_announced: AtomicBool,
    last_id: Mutex<Option<i64>>,
    initial_conn: Mutex<Option<Box<dyn BusConnection>>>,
    session: Mutex<Option<SessionHandle>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    debug_handlers: RwLock<Vec<DebugHandler>>,
}

impl Consumer {
    pub fn new(
        config: &TopicConfig,
        store: Arc<dyn RecordStore>,
        bus: SignalBus,
        tuning: TuningConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                topic: config.topic.clone(),
                store,
                bus,
                tuning,
                state: Mutex::new(ConsumerState::New),
                stopped: AtomicBool::new(false),
                more_messages: AtomicBool::new(true),
                polling: AtomicBool::new(false),
                drained_announced: AtomicBool::new(false),
                last_id: Mutex::new(None),
                initial_conn: Mutex::new(None),
                session: Mutex::new(None),
                ticker: Mutex::new(None),
                debug_handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.lock()
    }

    /// Current cursor: the highest id handed to the message callback (or the
    /// caller-provided starting point). Callers persist this themselves if
    /// they need it across restarts.
    pub fn last_id(&self) -> Option<i64> {
        *self.inner.last_id.lock()
    }

    /// Register an observer of internal events. Handlers must be fast; they
    /// run inline on the polling path.
    pub fn add_debug_handler(&self, handler: impl Fn(&ConsumerDebugEvent) + Send + Sync + 'static) {
        self.inner.debug_handlers.write().push(Box::new(handler));
    }

    /// Acquire the bus session. The initial connect is bounded by the
    /// configured deadline; exceeding it fails here and nowhere else.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConsumerState::New => *state = ConsumerState::Starting,
                ConsumerState::Starting | ConsumerState::Started | ConsumerState::Streaming => {
                    return Err(EngineError::AlreadyStarting)
                }
                ConsumerState::Stopped | ConsumerState::Crashed => {
                    return Err(EngineError::Stopped)
                }
            }
        }
        self.inner.emit_state(ConsumerState::Starting);

        match self.inner.bus.connect().await {
            Ok(conn) => {
                *self.inner.initial_conn.lock() = Some(conn);
                *self.inner.state.lock() = ConsumerState::Started;
                self.inner.emit_state(ConsumerState::Started);
                info!("consumer for {} started", self.inner.topic);
                Ok(())
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                if *state == ConsumerState::Starting {
                    *state = ConsumerState::New;
                }
                let deadline = match e {
                    BusError::ConnectTimeout(d) => d,
                    _ => self.inner.tuning.connect_deadline,
                };
                Err(EngineError::BusConnectTimeout(deadline))
            }
        }
    }

    /// Begin streaming from `from_id` (exclusive; `None` replays from the
    /// beginning). Messages already in the store are delivered without any
    /// wake, then the consumer follows the tail live.
    pub async fn stream_messages_from(
        &self,
        on_message: OnMessage,
        from_id: Option<i64>,
        on_drained: OnDrained,
        on_crashed: OnCrashed,
    ) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConsumerState::Started => *state = ConsumerState::Streaming,
                ConsumerState::Streaming => return Err(EngineError::AlreadyStreaming),
                ConsumerState::Stopped | ConsumerState::Crashed => {
                    return Err(EngineError::Stopped)
                }
                ConsumerState::New | ConsumerState::Starting => {
                    return Err(EngineError::NotStarted)
                }
            }
        }
        self.inner.emit_state(ConsumerState::Streaming);

        *self.inner.last_id.lock() = from_id;
        self.inner.more_messages.store(true, Ordering::SeqCst);
        self.inner.drained_announced.store(false, Ordering::SeqCst);

        // Wake plumbing: tokens and session lifecycle both raise the flag.
        let wake_target = self.inner.clone();
        let on_token: OnToken = Arc::new(move |_token| wake_target.wake("token"));

        let lifecycle_target = self.inner.clone();
        let on_lifecycle: OnLifecycle = Arc::new(move |event| match event {
            LifecycleEvent::FirstReady => lifecycle_target.wake("first-ready"),
            LifecycleEvent::Reconnected { downtime } => {
                info!(
                    "wake channel for {} back after {:?}; polling for backlog",
                    lifecycle_target.topic, downtime
                );
                lifecycle_target.wake("reconnected");
            }
            LifecycleEvent::Reconnecting { attempt, elapsed } => {
                debug!(
                    "wake channel for {} still down (attempt {}, {:?})",
                    lifecycle_target.topic, attempt, elapsed
                );
            }
        });

        let initial = self.inner.initial_conn.lock().take();
        let session = self.inner.bus.subscribe(
            initial,
            &wake_channel(&self.inner.topic),
            on_token,
            on_lifecycle,
        );
        *self.inner.session.lock() = Some(session);

        // Poll ticker: the only place fetches happen.
        let ticker_inner = self.inner.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ticker_inner.tuning.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if ticker_inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                ticker_inner
                    .tick(&on_message, &on_drained, &on_crashed)
                    .await;
            }
        });
        *self.inner.ticker.lock() = Some(ticker);

        Ok(())
    }

    /// Stop streaming. Cancels the ticker and the bus session without
    /// waiting for in-flight queries; no callback fires after this returns.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("consumer for {} stopping", self.inner.topic);
        self.inner.shutdown(true);
    }
}

impl ConsumerInner {
    fn wake(&self, source: &'static str) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.more_messages.store(true, Ordering::SeqCst);
        self.drained_announced.store(false, Ordering::SeqCst);
        self.emit(&ConsumerDebugEvent::Wake { source });
    }

    async fn tick(
        self: &Arc<Self>,
        on_message: &OnMessage,
        on_drained: &OnDrained,
        on_crashed: &OnCrashed,
    ) {
        if !self.more_messages.load(Ordering::SeqCst) && !self.polling.load(Ordering::SeqCst) {
            if !self.drained_announced.swap(true, Ordering::SeqCst) {
                self.emit(&ConsumerDebugEvent::Drained);
                if let Err(e) = on_drained().await {
                    warn!("drained callback for {} failed: {}", self.topic, e);
                }
            }
            return;
        }
        if self.polling.swap(true, Ordering::SeqCst) {
            return; // previous poll still running
        }
        self.poll_step(on_message, on_crashed).await;
        self.polling.store(false, Ordering::SeqCst);
    }

    async fn poll_step(self: &Arc<Self>, on_message: &OnMessage, on_crashed: &OnCrashed) {
        let after_id = *self.last_id.lock();
        self.emit(&ConsumerDebugEvent::PollStarted { after_id });

        let batch = match self
            .store
            .fetch_after(&self.topic, after_id, self.tuning.fetch_limit)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                if self.stopped.load(Ordering::SeqCst) {
                    // In-flight query raced shutdown; benign.
                    debug!("fetch for {} failed during shutdown: {}", self.topic, e);
                } else {
                    warn!("fetch for {} failed: {}", self.topic, e);
                }
                self.emit(&ConsumerDebugEvent::PollFailed {
                    reason: e.to_string(),
                });
                return;
            }
        };

        self.emit(&ConsumerDebugEvent::PollFetched { count: batch.len() });

        if batch.is_empty() {
            self.more_messages.store(false, Ordering::SeqCst);
            return;
        }

        for record in batch {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let id = record.id;
            // Advance before delivering: a failing callback is not redelivered
            // by a later session that reuses this cursor.
            *self.last_id.lock() = Some(id);
            if let Err(err) = on_message(record).await {
                error!(
                    "message callback for {} failed on id {}: {}",
                    self.topic, id, err
                );
                self.crash(err, on_crashed).await;
                return;
            }
            self.emit(&ConsumerDebugEvent::Delivered { id });
        }

        // Keep the flag raised: a full batch means the next tick should poll
        // again immediately so backlogs larger than one fetch drain fast.
        self.more_messages.store(true, Ordering::SeqCst);
    }

    async fn crash(self: &Arc<Self>, err: anyhow::Error, on_crashed: &OnCrashed) {
        *self.state.lock() = ConsumerState::Crashed;
        self.emit_state(ConsumerState::Crashed);
        if let Err(e) = on_crashed(err).await {
            warn!("crash callback for {} itself failed: {}", self.topic, e);
        }
        self.stopped.store(true, Ordering::SeqCst);
        // Runs on the ticker task: leave the ticker to observe the latch and
        // exit on its own rather than aborting ourselves mid-poll.
        self.shutdown(false);
    }

    fn shutdown(&self, abort_ticker: bool) {
        if let Some(session) = self.session.lock().take() {
            session.stop();
        }
        if abort_ticker {
            if let Some(ticker) = self.ticker.lock().take() {
                ticker.abort();
            }
        }
        *self.initial_conn.lock() = None;
        *self.state.lock() = ConsumerState::Stopped;
        self.emit_state(ConsumerState::Stopped);
    }

    fn emit_state(&self, state: ConsumerState) {
        self.emit(&ConsumerDebugEvent::State(state));
    }

    fn emit(&self, event: &ConsumerDebugEvent) {
        for handler in self.debug_handlers.read().iter() {
            handler(event);
        }
    }
}
