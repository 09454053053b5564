//! Resilient subscription session: connect, subscribe, forward tokens, and
//! on any loss reconnect forever with capped exponential backoff. The
//! subscription is re-issued after every reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::{BusConnection, BusTransport, LifecycleEvent, OnLifecycle, OnToken};
use crate::config::TuningConfig;

/// Handle to a running session. Stopping aborts the session task; no
/// callbacks fire after `stop` returns.
pub struct SessionHandle {
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

pub(crate) fn spawn(
    transport: Arc<dyn BusTransport>,
    tuning: TuningConfig,
    initial: Option<Box<dyn BusConnection>>,
    channel: String,
    on_token: OnToken,
    on_lifecycle: OnLifecycle,
) -> SessionHandle {
    let task = tokio::spawn(run(
        transport,
        tuning,
        initial,
        channel,
        on_token,
        on_lifecycle,
    ));
    SessionHandle { task }
}

async fn run(
    transport: Arc<dyn BusTransport>,
    tuning: TuningConfig,
    mut initial: Option<Box<dyn BusConnection>>,
    channel: String,
    on_token: OnToken,
    on_lifecycle: OnLifecycle,
) {
    let mut first = true;
    let mut attempt: u32 = 0;
    let mut down_since = Instant::now();

    loop {
        let connected = match initial.take() {
            Some(conn) => Ok(conn),
            None => transport.connect().await,
        };
        let subscribed = match connected {
            // The connection must outlive its token stream; keep both.
            Ok(conn) => match conn.subscribe(&channel).await {
                Ok(stream) => Ok((conn, stream)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match subscribed {
            Ok((_conn, mut stream)) => {
                attempt = 0;
                if first {
                    first = false;
                    debug!("wake subscription on {} established", channel);
                    on_lifecycle(LifecycleEvent::FirstReady);
                } else {
                    let downtime = down_since.elapsed();
                    warn!(
                        "wake subscription on {} restored after {:?}",
                        channel, downtime
                    );
                    on_lifecycle(LifecycleEvent::Reconnected { downtime });
                }

                while let Some(token) = stream.recv().await {
                    on_token(token);
                }

                warn!("wake subscription on {} lost; reconnecting", channel);
                down_since = Instant::now();
            }
            Err(e) => {
                attempt += 1;
                let elapsed = down_since.elapsed();
                warn!(
                    "bus connect for {} failed (attempt {}, down {:?}): {}",
                    channel, attempt, elapsed, e
                );
                on_lifecycle(LifecycleEvent::Reconnecting { attempt, elapsed });
                tokio::time::sleep(backoff_delay(attempt, &tuning)).await;
            }
        }
    }
}

/// `floor * 2^(attempt-1)`, capped. Retries never give up; the cap keeps
/// recovery latency bounded once an outage ends.
pub(crate) fn backoff_delay(attempt: u32, tuning: &TuningConfig) -> Duration {
    let shift = attempt.saturating_sub(1).min(10);
    tuning
        .backoff_floor
        .saturating_mul(1u32 << shift)
        .min(tuning.backoff_cap)
}
