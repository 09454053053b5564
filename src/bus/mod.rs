//! Signal-bus adapter: best-effort wake delivery over an ephemeral pub/sub
//! fabric. The bus is advisory — a lost token costs latency, never a
//! message — so this layer trades guarantees for resilience: publishes are
//! fire-and-forget and subscriptions reconnect forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;

use crate::config::TuningConfig;
use crate::error::BusError;

mod memory;
mod session;

pub use memory::MemoryBus;
pub use session::SessionHandle;

/// Raw tokens received on a channel. The stream ending means the connection
/// was lost and a reconnect is needed.
pub type TokenStream = mpsc::Receiver<Vec<u8>>;

/// Invoked for every token received on a subscribed channel.
pub type OnToken = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Invoked on connection lifecycle transitions of a subscription session.
pub type OnLifecycle = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Connection lifecycle of a subscription session.
///
/// `FirstReady` and `Reconnected` double as implicit wake tokens on the
/// consumer side: any message published while the session was down had its
/// token dropped, so coming (back) up must trigger a poll.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The session's first successful subscribe.
    FirstReady,
    /// A reconnect attempt failed; another follows after backoff.
    Reconnecting { attempt: u32, elapsed: Duration },
    /// The session is live again and the subscription was re-issued.
    Reconnected { downtime: Duration },
}

/// Capability to open connections to the pub/sub fabric.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn BusConnection>, BusError>;
}

/// One live connection. Dropped on failure; never reused across outages.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Best-effort publish. `Ok` does not guarantee delivery; `Err`
    /// guarantees non-delivery for this call.
    async fn publish(&self, channel: &str, token: &[u8]) -> Result<(), BusError>;

    /// Subscribe to a channel. The underlying bus is not assumed to
    /// auto-resubscribe; callers re-issue this after every reconnect.
    async fn subscribe(&self, channel: &str) -> Result<TokenStream, BusError>;
}

/// Engine-facing bus handle: bounded initial connect plus resilient
/// subscription sessions over a [`BusTransport`].
#[derive(Clone)]
pub struct SignalBus {
    transport: Arc<dyn BusTransport>,
    tuning: TuningConfig,
}

impl SignalBus {
    pub fn new(transport: Arc<dyn BusTransport>, tuning: TuningConfig) -> Self {
        Self { transport, tuning }
    }

    /// Single connection attempt, no deadline. Used by the wake-publish
    /// retry loop, which brings its own schedule.
    pub async fn connect_now(&self) -> Result<Box<dyn BusConnection>, BusError> {
        self.transport.connect().await
    }

    /// Connect with backoff under the configured deadline. Exceeding the
    /// deadline fails with [`BusError::ConnectTimeout`]; this is the only
    /// bus failure that is fatal to `start`.
    pub async fn connect(&self) -> Result<Box<dyn BusConnection>, BusError> {
        let deadline = tokio::time::Instant::now() + self.tuning.connect_deadline;
        let mut attempt: u32 = 0;
        loop {
            match self.transport.connect().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    attempt += 1;
                    let delay = session::backoff_delay(attempt, &self.tuning);
                    if tokio::time::Instant::now() + delay >= deadline {
                        error!("bus connect gave up after {} attempts: {}", attempt, e);
                        return Err(BusError::ConnectTimeout(self.tuning.connect_deadline));
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Spawn a resilient subscription session on `channel`. `initial`, when
    /// present, is an already-open connection used for the first subscribe
    /// (typically the one `start` validated).
    pub fn subscribe(
        &self,
        initial: Option<Box<dyn BusConnection>>,
        channel: &str,
        on_token: OnToken,
        on_lifecycle: OnLifecycle,
    ) -> SessionHandle {
        session::spawn(
            self.transport.clone(),
            self.tuning,
            initial,
            channel.to_string(),
            on_token,
            on_lifecycle,
        )
    }
}
