use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by a [`RecordStore`](crate::store::RecordStore)
/// implementation. The adapter never retries internally; every variant is
/// retryable from the caller's perspective.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("counter increment failed: {0}")]
    AllocFailed(String),

    #[error("insert not acknowledged: {0}")]
    NotAcknowledged(String),

    #[error("fetch failed: {0}")]
    FetchFailed(String),
}

/// Failures surfaced by the signal-bus transport. The bus is advisory:
/// everything here is survivable as long as the record store is reachable.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("signal bus unavailable: {0}")]
    Unavailable(String),

    #[error("wake publish failed: {0}")]
    PublishFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("bus connect deadline of {0:?} exceeded")]
    ConnectTimeout(Duration),
}

/// Errors raised by the engine's public surface. State-guard variants
/// (`AlreadyStarting`, `AlreadyStreaming`, `Stopped`, `NotStarted`,
/// `NotReady`) indicate programmer error and are raised synchronously;
/// the rest wrap collaborator failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("start already in flight")]
    AlreadyStarting,

    #[error("a stream is already running")]
    AlreadyStreaming,

    #[error("instance is stopped")]
    Stopped,

    #[error("instance is not started")]
    NotStarted,

    #[error("history replay still in progress")]
    NotReady,

    #[error("sharding key must be non-empty")]
    EmptySharding,

    #[error("bus connect deadline of {0:?} exceeded")]
    BusConnectTimeout(Duration),

    /// The counter did not advance; the push may be retried without
    /// leaving a gap in the sequence.
    #[error("id allocation failed")]
    AllocFailed(#[source] StoreError),

    /// The counter advanced but the write was not acknowledged. The
    /// allocated id is burned and is never reused.
    #[error("insert of message {id} not acknowledged; id is burned")]
    NotAcknowledged {
        id: i64,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
