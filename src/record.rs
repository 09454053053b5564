use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wake channels share a namespace with other bus users; the prefix keeps
/// topic channels out of everyone else's way.
pub const WAKE_CHANNEL_PREFIX: &str = "TOPIC-";

/// The wake token published after every durable write. Receivers must not
/// parse it: the presence of any token on the channel is the signal.
pub const WAKE_TOKEN: &[u8] = br#"{"newMessage":true}"#;

/// Name of the wake channel for a topic.
pub fn wake_channel(topic: &str) -> String {
    format!("{WAKE_CHANNEL_PREFIX}{topic}")
}

/// The unit stored in the record store and streamed to consumers.
///
/// `id` is allocated from the topic's linearized counter before the insert,
/// so the global order of a topic is the order of counter increments, not
/// insert arrival order. Field names follow the persisted schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Strictly increasing within a topic. Gaps are allowed (a burned id
    /// after an unacknowledged insert) but never invert order.
    pub id: i64,

    /// Producer wall clock at insert. Informational only; ordering is by id.
    pub created_at: DateTime<Utc>,

    /// Non-empty routing attribute for downstream shard routers.
    pub sharding_key: String,

    /// Marks this record as a version of a compactable logical entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_compact_id: Option<String>,

    /// Opaque caller payload.
    pub payload: Value,
}
