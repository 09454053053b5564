//! Structural payload fingerprinting for the log-compaction setter.
//!
//! Two payloads are "the same write" when their canonical renderings hash
//! equal. Canonicalization sorts object keys at every level and normalizes
//! timestamp wrappers of the shape `{"$date": <millis | RFC 3339 string>}`
//! to a single RFC 3339 UTC string, so semantically equal timestamps compare
//! equal no matter which serialization boundary they crossed. The same
//! function runs on the write path and on history replay.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Lowercase hex sha-256 of the canonical rendering of `payload`.
pub fn fingerprint(payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            if let Some(stamp) = date_wrapper(map) {
                out.push_str(&Value::String(stamp).to_string());
                return;
            }
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Recognize `{"$date": ...}` and render it as one RFC 3339 UTC string.
/// Anything that does not parse cleanly is left for plain canonicalization.
fn date_wrapper(map: &Map<String, Value>) -> Option<String> {
    if map.len() != 1 {
        return None;
    }
    match map.get("$date")? {
        Value::Number(n) => {
            let millis = n.as_i64()?;
            let stamp = Utc.timestamp_millis_opt(millis).single()?;
            Some(stamp.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        Value::String(s) => {
            let parsed = DateTime::parse_from_rfc3339(s).ok()?;
            Some(
                parsed
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            )
        }
        _ => None,
    }
}
