//! Record-store adapter: the capability the engine requires from the
//! durable store of record. Implementations wrap a real database; the
//! in-tree [`MemoryStore`] is the reference and test backend.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::record::MessageRecord;

mod memory;

pub use memory::MemoryStore;

/// Durable store of record for one or more topics.
///
/// The store is the single source of truth for both content and order.
/// Implementations must not retry internally: a failed insert or fetch is
/// reported loudly and the engine's loops decide what happens next.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Atomically increment the topic's named counter, creating it at 1 if
    /// missing, and return the post-increment value. Must be linearizable
    /// across concurrent callers: the commit order of increments is the
    /// topic order.
    async fn allocate_next_id(&self, topic: &str) -> Result<i64, StoreError>;

    /// Durably append one record. Must not acknowledge before the write is
    /// durable, and must fail with [`StoreError::NotAcknowledged`] on any
    /// non-acknowledgement.
    async fn insert(&self, topic: &str, record: &MessageRecord) -> Result<(), StoreError>;

    /// Up to `limit` records with `id > after_id`, ascending by id. When
    /// `after_id` is `None` the fetch starts from the beginning. The sort is
    /// the adapter's job; storage arrival order is not acceptable.
    async fn fetch_after(
        &self,
        topic: &str,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;
}
