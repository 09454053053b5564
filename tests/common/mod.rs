#![allow(dead_code)]

//! Shared harness for the integration suites: unique topics per test, an
//! in-process store/bus pair, and recorders for the consumer callbacks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use remora::{
    BusConnection, BusError, BusTransport, Consumer, MemoryBus, MemoryStore, MessageRecord,
    OnCrashed, OnDrained, OnMessage, Producer, SignalBus, TokenStream, TopicConfig, TuningConfig,
};
use serde_json::Value;

static TOPIC_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn unique_topic(prefix: &str) -> String {
    format!(
        "{}-{}-{:x}-{}",
        prefix,
        std::process::id(),
        rand::random::<u32>(),
        TOPIC_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Production timings shrunk so the suites run in milliseconds.
pub fn fast_tuning() -> TuningConfig {
    TuningConfig {
        poll_interval: Duration::from_millis(20),
        fetch_limit: 100,
        flush_interval: Duration::from_millis(100),
        publish_retry: Duration::from_millis(50),
        flush_cooldown: Duration::from_millis(200),
        connect_deadline: Duration::from_millis(500),
        backoff_floor: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
    }
}

/// One topic plus the store/bus pair every engine piece shares.
pub struct Harness {
    pub topic: String,
    pub config: TopicConfig,
    pub store: Arc<MemoryStore>,
    pub bus: MemoryBus,
    pub signal: SignalBus,
    pub tuning: TuningConfig,
}

impl Harness {
    pub fn new(prefix: &str) -> Self {
        Self::with_tuning(prefix, fast_tuning())
    }

    pub fn with_tuning(prefix: &str, tuning: TuningConfig) -> Self {
        init_tracing();
        let topic = unique_topic(prefix);
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let signal = SignalBus::new(Arc::new(bus.clone()), tuning);
        Self {
            config: TopicConfig::for_topic(topic.clone()),
            topic,
            store,
            bus,
            signal,
            tuning,
        }
    }

    pub fn producer(&self) -> Producer {
        Producer::new(
            &self.config,
            self.store.clone(),
            self.signal.clone(),
            self.tuning,
        )
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(
            &self.config,
            self.store.clone(),
            self.signal.clone(),
            self.tuning,
        )
    }

    /// Producer wired through its own bus handle, e.g. a [`FlakyTransport`].
    pub fn producer_on(&self, transport: Arc<dyn BusTransport>) -> Producer {
        Producer::new(
            &self.config,
            self.store.clone(),
            SignalBus::new(transport, self.tuning),
            self.tuning,
        )
    }
}

/// Collects everything the consumer callbacks see.
#[derive(Default)]
pub struct Recorder {
    records: Mutex<Vec<MessageRecord>>,
    drains: AtomicU64,
    crashes: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_message(self: &Arc<Self>) -> OnMessage {
        let recorder = self.clone();
        Arc::new(move |record| {
            let recorder = recorder.clone();
            Box::pin(async move {
                recorder.records.lock().unwrap().push(record);
                Ok(())
            })
        })
    }

    /// Fails on `failing_id`; the failing record is not recorded.
    pub fn on_message_failing_at(self: &Arc<Self>, failing_id: i64) -> OnMessage {
        let recorder = self.clone();
        Arc::new(move |record| {
            let recorder = recorder.clone();
            Box::pin(async move {
                if record.id == failing_id {
                    anyhow::bail!("callback rejected id {}", record.id);
                }
                recorder.records.lock().unwrap().push(record);
                Ok(())
            })
        })
    }

    pub fn on_drained(self: &Arc<Self>) -> OnDrained {
        let recorder = self.clone();
        Arc::new(move || {
            let recorder = recorder.clone();
            Box::pin(async move {
                recorder.drains.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    pub fn on_crashed(self: &Arc<Self>) -> OnCrashed {
        let recorder = self.clone();
        Arc::new(move |err| {
            let recorder = recorder.clone();
            Box::pin(async move {
                recorder.crashes.lock().unwrap().push(err.to_string());
                Ok(())
            })
        })
    }

    pub fn ids(&self) -> Vec<i64> {
        self.records.lock().unwrap().iter().map(|r| r.id).collect()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.payload.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn drain_count(&self) -> u64 {
        self.drains.load(Ordering::SeqCst)
    }

    pub fn crash_count(&self) -> usize {
        self.crashes.lock().unwrap().len()
    }

    pub fn crashes(&self) -> Vec<String> {
        self.crashes.lock().unwrap().clone()
    }
}

/// Poll `cond` every 10 ms until it holds or `deadline_ms` passes.
pub async fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Transport wrapper whose publishes can be forced to fail while
/// subscriptions keep working: the producer-side-outage case.
pub struct FlakyTransport {
    inner: MemoryBus,
    fail_publish: Arc<AtomicBool>,
}

impl FlakyTransport {
    pub fn new(inner: MemoryBus) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_publish: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn fail_publish(&self, on: bool) {
        self.fail_publish.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl BusTransport for FlakyTransport {
    async fn connect(&self) -> Result<Box<dyn BusConnection>, BusError> {
        let inner = self.inner.connect().await?;
        Ok(Box::new(FlakyConnection {
            inner,
            fail_publish: self.fail_publish.clone(),
        }))
    }
}

struct FlakyConnection {
    inner: Box<dyn BusConnection>,
    fail_publish: Arc<AtomicBool>,
}

#[async_trait]
impl BusConnection for FlakyConnection {
    async fn publish(&self, channel: &str, token: &[u8]) -> Result<(), BusError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::PublishFailed("forced publish failure".into()));
        }
        self.inner.publish(channel, token).await
    }

    async fn subscribe(&self, channel: &str) -> Result<TokenStream, BusError> {
        self.inner.subscribe(channel).await
    }
}
