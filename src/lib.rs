//! # Remora
//!
//! Ordered, durable, append-only topics over a record store and a wake-signal
//! bus. Producers append messages behind a linearized per-topic counter;
//! consumers stream from any past position and follow the tail with
//! low latency, woken by best-effort bus tokens and kept correct by the
//! durable store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use remora::{
//!     Consumer, MemoryBus, MemoryStore, OnCrashed, OnDrained, OnMessage, Producer, SignalBus,
//!     TopicConfig, TuningConfig,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = TopicConfig::for_topic("example-42");
//! let tuning = TuningConfig::default();
//! let store = Arc::new(MemoryStore::new());
//! let bus = SignalBus::new(Arc::new(MemoryBus::new()), tuning);
//!
//! // Append a message; the wake token fires after the durable write.
//! let producer = Producer::new(&config, store.clone(), bus.clone(), tuning);
//! producer.start().await?;
//! producer
//!     .push_message(json!({ "hello": "world" }), "shard-a", None)
//!     .await?;
//!
//! // Stream everything from the beginning, then follow the tail.
//! let on_message: OnMessage = Arc::new(|record| {
//!     Box::pin(async move {
//!         println!("got {}: {}", record.id, record.payload);
//!         Ok(())
//!     })
//! });
//! let on_drained: OnDrained = Arc::new(|| Box::pin(async { Ok(()) }));
//! let on_crashed: OnCrashed = Arc::new(|_err| Box::pin(async { Ok(()) }));
//!
//! let consumer = Consumer::new(&config, store, bus, tuning);
//! consumer.start().await?;
//! consumer
//!     .stream_messages_from(on_message, None, on_drained, on_crashed)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - Global topic order is the counter order: ids ascend strictly, across
//!   processes, independent of insert arrival order.
//! - The bus is advisory. A lost wake token costs latency, never a message;
//!   reconnects trigger a catch-up poll.
//! - Delivery is at-least-once with a monotonic in-memory cursor; the cursor
//!   advances past a record before its callback runs.

pub mod bus;
mod config;
mod consumer;
mod error;
mod hash;
mod producer;
mod record;
mod setter;
pub mod store;

pub use bus::{
    BusConnection, BusTransport, LifecycleEvent, MemoryBus, OnLifecycle, OnToken, SessionHandle,
    SignalBus, TokenStream,
};
pub use config::{TopicConfig, TuningConfig};
pub use consumer::{
    BoxFuture, Consumer, ConsumerDebugEvent, ConsumerState, OnCrashed, OnDrained, OnMessage,
};
pub use error::{BusError, EngineError, StoreError};
pub use hash::fingerprint;
pub use producer::Producer;
pub use record::{wake_channel, MessageRecord, WAKE_CHANNEL_PREFIX, WAKE_TOKEN};
pub use setter::TopicSetter;
pub use store::{MemoryStore, RecordStore};
