//! In-process pub/sub: per-channel broadcast fan-out plus an outage switch.
//! While the bus is "down", connects fail, publishes fail, and live token
//! streams terminate — the same failure surface a real bus outage presents.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use crate::bus::{BusConnection, BusTransport, TokenStream};
use crate::error::BusError;

const CHANNEL_CAPACITY: usize = 64;

struct Shared {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    down_tx: watch::Sender<bool>,
}

impl Shared {
    fn is_down(&self) -> bool {
        *self.down_tx.borrow()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// Reference [`BusTransport`] backed by process memory.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (down_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                channels: Mutex::new(HashMap::new()),
                down_tx,
            }),
        }
    }

    /// Flip the outage switch. Going down severs every live subscription.
    pub fn set_down(&self, down: bool) {
        // send_replace: the switch must hold even with no live subscriber.
        self.shared.down_tx.send_replace(down);
    }
}

#[async_trait]
impl BusTransport for MemoryBus {
    async fn connect(&self) -> Result<Box<dyn BusConnection>, BusError> {
        if self.shared.is_down() {
            return Err(BusError::Unavailable("bus is down".into()));
        }
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn publish(&self, channel: &str, token: &[u8]) -> Result<(), BusError> {
        if self.shared.is_down() {
            return Err(BusError::PublishFailed("bus is down".into()));
        }
        // No subscribers is not an error; the token is simply dropped.
        let _ = self.shared.sender_for(channel).send(token.to_vec());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<TokenStream, BusError> {
        if self.shared.is_down() {
            return Err(BusError::SubscribeFailed("bus is down".into()));
        }
        let mut source = self.shared.sender_for(channel).subscribe();
        let mut down_rx = self.shared.down_tx.subscribe();
        let (tx, stream) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = down_rx.changed() => {
                        if changed.is_err() || *down_rx.borrow() {
                            break;
                        }
                    }
                    msg = source.recv() => match msg {
                        Ok(token) => {
                            if tx.send(token).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Lost tokens only cost latency; keep the stream.
                            tracing::warn!("wake stream lagged; {} tokens dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(stream)
    }
}
