//! In-process record store: a linearizable counter and an append log per
//! topic, plus failure-injection switches for the integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::record::MessageRecord;
use crate::store::RecordStore;

#[derive(Default)]
struct TopicLog {
    counter: i64,
    /// Arrival order, deliberately not id order: under concurrent producers
    /// a smaller id may commit its insert later. The fetch-side sort is what
    /// restores topic order.
    records: Vec<MessageRecord>,
}

/// Reference [`RecordStore`] backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    topics: RwLock<HashMap<String, TopicLog>>,
    fail_alloc: AtomicBool,
    fail_insert: AtomicBool,
    fail_fetch: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force every `allocate_next_id` to fail until cleared.
    pub fn fail_alloc(&self, on: bool) {
        self.fail_alloc.store(on, Ordering::SeqCst);
    }

    /// Force every `insert` to fail until cleared. The counter still
    /// advances on allocation, so this burns ids like a real outage would.
    pub fn fail_insert(&self, on: bool) {
        self.fail_insert.store(on, Ordering::SeqCst);
    }

    /// Force every `fetch_after` to fail until cleared.
    pub fn fail_fetch(&self, on: bool) {
        self.fail_fetch.store(on, Ordering::SeqCst);
    }

    /// Snapshot of committed ids for a topic, in id order.
    pub async fn committed_ids(&self, topic: &str) -> Vec<i64> {
        let topics = self.topics.read().await;
        let mut ids: Vec<i64> = topics
            .get(topic)
            .map(|log| log.records.iter().map(|r| r.id).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of committed records for a topic, in id order.
    pub async fn committed_records(&self, topic: &str) -> Vec<MessageRecord> {
        let topics = self.topics.read().await;
        let mut records = topics
            .get(topic)
            .map(|log| log.records.clone())
            .unwrap_or_default();
        records.sort_unstable_by_key(|r| r.id);
        records
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn allocate_next_id(&self, topic: &str) -> Result<i64, StoreError> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return Err(StoreError::AllocFailed("forced alloc failure".into()));
        }
        let mut topics = self.topics.write().await;
        let log = topics.entry(topic.to_string()).or_default();
        log.counter += 1;
        Ok(log.counter)
    }

    async fn insert(&self, topic: &str, record: &MessageRecord) -> Result<(), StoreError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(StoreError::NotAcknowledged("forced insert failure".into()));
        }
        let mut topics = self.topics.write().await;
        let log = topics.entry(topic.to_string()).or_default();
        log.records.push(record.clone());
        Ok(())
    }

    async fn fetch_after(
        &self,
        topic: &str,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(StoreError::FetchFailed("forced fetch failure".into()));
        }
        let topics = self.topics.read().await;
        let Some(log) = topics.get(topic) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<MessageRecord> = log
            .records
            .iter()
            .filter(|r| after_id.map_or(true, |after| r.id > after))
            .cloned()
            .collect();
        hits.sort_unstable_by_key(|r| r.id);
        hits.truncate(limit);
        Ok(hits)
    }
}
