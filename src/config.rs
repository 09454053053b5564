use std::time::Duration;

/// Connection-level options recognized by the engine. The in-tree memory
/// backends only look at `topic`; real adapters consume the rest.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub store_connection_string: String,
    pub store_database: String,
    /// Topic name. Doubles as the record-store collection name, the counter
    /// name, and the suffix of the wake channel.
    pub topic: String,
    pub bus_host: String,
    pub bus_port: u16,
}

impl TopicConfig {
    /// Local defaults for every field except the topic name.
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self {
            store_connection_string: "mongodb://127.0.0.1:27017".into(),
            store_database: "remora".into(),
            topic: topic.into(),
            bus_host: "127.0.0.1".into(),
            bus_port: 6379,
        }
    }
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_FETCH_LIMIT: usize = 100;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_PUBLISH_RETRY: Duration = Duration::from_secs(10);
const DEFAULT_FLUSH_COOLDOWN: Duration = Duration::from_secs(20);
const DEFAULT_CONNECT_DEADLINE: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_FLOOR: Duration = Duration::from_millis(250);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Engine timings. Defaults are the production values; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct TuningConfig {
    /// Consumer poll tick.
    pub poll_interval: Duration,
    /// Max records per fetch.
    pub fetch_limit: usize,
    /// Setter flush tick.
    pub flush_interval: Duration,
    /// Delay between wake-publish retries after a failed publish.
    pub publish_retry: Duration,
    /// Hold-off before the setter re-flushes after an aborted flush.
    pub flush_cooldown: Duration,
    /// Bound on the initial bus connect; exceeding it fails `start`.
    pub connect_deadline: Duration,
    /// First reconnect backoff step.
    pub backoff_floor: Duration,
    /// Reconnect backoff ceiling.
    pub backoff_cap: Duration,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            fetch_limit: DEFAULT_FETCH_LIMIT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            publish_retry: DEFAULT_PUBLISH_RETRY,
            flush_cooldown: DEFAULT_FLUSH_COOLDOWN,
            connect_deadline: DEFAULT_CONNECT_DEADLINE,
            backoff_floor: DEFAULT_BACKOFF_FLOOR,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl TuningConfig {
    /// Defaults with `REMORA_*_MS` environment overrides applied. Intended
    /// for harnesses that cannot thread a config through.
    pub fn from_env() -> Self {
        let mut tuning = Self::default();
        if let Some(ms) = env_millis("REMORA_POLL_MS") {
            tuning.poll_interval = ms;
        }
        if let Some(ms) = env_millis("REMORA_FLUSH_MS") {
            tuning.flush_interval = ms;
        }
        if let Some(ms) = env_millis("REMORA_PUBLISH_RETRY_MS") {
            tuning.publish_retry = ms;
        }
        if let Some(ms) = env_millis("REMORA_CONNECT_DEADLINE_MS") {
            tuning.connect_deadline = ms;
        }
        tuning
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    let parsed = raw.parse::<u64>().ok()?;
    Some(Duration::from_millis(parsed.max(1)))
}
