//! Duplicate suppression over a short window
//!
//! An event is a duplicate when an earlier accepted event with the same name
//! and payload hash is still inside the window. Only accepted events are
//! recorded, so the first occurrence sets the bar and later copies inside
//! the window are suppressed.

use super::window::{SlidingWindow, Stamped};
use crate::logging::{Log, LogLevel};
use serde_json::{Map, Value};

/// Emergency cap on the dedup buffer
pub const EMERGENCY_CAP: usize = 200;

/// Hash used when an event carries no payload
pub const EMPTY_PAYLOAD_HASH: &str = "empty";

#[derive(Debug, Clone)]
struct DedupEntry {
    name: String,
    payload_hash: String,
    timestamp: u64,
}

impl Stamped for DedupEntry {
    fn stamp(&self) -> u64 {
        self.timestamp
    }
}

pub struct Deduplicator {
    window_ms: u64,
    window: SlidingWindow<DedupEntry>,
    log: Log,
}

impl Deduplicator {
    pub fn new(window_ms: u64, log: Log) -> Self {
        Self {
            window_ms,
            window: SlidingWindow::new(EMERGENCY_CAP),
            log,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Whether `(name, payload_hash)` was recorded within the window ending at `now`.
    pub fn is_duplicate(&mut self, name: &str, payload_hash: &str, now: u64) -> bool {
        self.window.expire_before(now.saturating_sub(self.window_ms));
        self.window
            .active()
            .iter()
            .any(|e| e.name == name && e.payload_hash == payload_hash)
    }

    pub fn record(&mut self, name: &str, payload_hash: &str, now: u64) {
        let entry = DedupEntry {
            name: name.to_string(),
            payload_hash: payload_hash.to_string(),
            timestamp: now,
        };
        if let Some(dropped) = self.window.push(entry) {
            self.log.emit(
                LogLevel::Warn,
                "dedup",
                "dedup window hit emergency cap, discarded oldest entries",
                vec![("dropped", dropped.to_string())],
            );
        }
    }

    /// Returns true for a duplicate; otherwise records the event and returns false.
    pub fn check_and_record(&mut self, name: &str, payload_hash: &str, now: u64) -> bool {
        if self.is_duplicate(name, payload_hash, now) {
            return true;
        }
        self.record(name, payload_hash, now);
        false
    }

    pub fn prune(&mut self, now: u64) {
        self.window.prune(now.saturating_sub(self.window_ms));
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }

    #[cfg(test)]
    fn raw_len(&self) -> usize {
        self.window.raw_len()
    }
}

/// Order-independent payload hash.
///
/// Keys are sorted, each `key=value;` pair is concatenated and the result is
/// run through a 32-bit djb2 hash, rendered in base 36.
///
/// Strings contribute their raw text. Integral floats render without a
/// fractional part, so `1` and `1.0` hash alike. The hash runs over UTF-16
/// code units, matching hashes computed by browser-side code for the same
/// payload.
pub fn hash_payload(payload: Option<&Map<String, Value>>) -> String {
    let payload = match payload {
        Some(p) if !p.is_empty() => p,
        _ => return EMPTY_PAYLOAD_HASH.to_string(),
    };

    let mut keys: Vec<&String> = payload.keys().collect();
    keys.sort();

    let mut input = String::new();
    for key in keys {
        input.push_str(key);
        input.push('=');
        match &payload[key.as_str()] {
            Value::String(s) => input.push_str(s),
            Value::Number(n) => input.push_str(&render_number(n)),
            other => input.push_str(&other.to_string()),
        }
        input.push(';');
    }

    to_base36(djb2(&input).unsigned_abs())
}

/// Largest magnitude rendered as a plain integer
const MAX_PLAIN_INTEGER: f64 = 1e15;

fn render_number(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_PLAIN_INTEGER => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

fn djb2(input: &str) -> i32 {
    let mut hash: i32 = 5381;
    for unit in input.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_add(hash)
            .wrapping_add(i32::from(unit));
    }
    hash
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogger;
    use serde_json::json;
    use std::sync::Arc;

    fn dedup(window_ms: u64) -> Deduplicator {
        Deduplicator::new(window_ms, Log::new(Arc::new(MemoryLogger::new())))
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_hash_is_key_order_independent() {
        let mut a = Map::new();
        a.insert("a".to_string(), json!(1));
        a.insert("b".to_string(), json!(2));
        let mut b = Map::new();
        b.insert("b".to_string(), json!(2));
        b.insert("a".to_string(), json!(1));

        assert_eq!(hash_payload(Some(&a)), hash_payload(Some(&b)));
        assert_ne!(
            hash_payload(Some(&a)),
            hash_payload(Some(&obj(json!({"a": 1, "b": 3}))))
        );
    }

    #[test]
    fn test_hash_empty_sentinel() {
        assert_eq!(hash_payload(None), EMPTY_PAYLOAD_HASH);
        assert_eq!(hash_payload(Some(&Map::new())), EMPTY_PAYLOAD_HASH);
    }

    #[test]
    fn test_hash_is_deterministic_base36() {
        let payload = obj(json!({"plan": "pro", "seats": 4}));
        let h1 = hash_payload(Some(&payload));
        let h2 = hash_payload(Some(&payload));
        assert_eq!(h1, h2);
        assert!(h1.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_djb2_known_values() {
        assert_eq!(djb2(""), 5381);
        // 5381 * 33 + 'a'
        assert_eq!(djb2("a"), 177_670);
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn test_integral_float_hashes_like_integer() {
        assert_eq!(
            hash_payload(Some(&obj(json!({"qty": 1})))),
            hash_payload(Some(&obj(json!({"qty": 1.0}))))
        );
        assert_ne!(
            hash_payload(Some(&obj(json!({"qty": 1})))),
            hash_payload(Some(&obj(json!({"qty": 1.5}))))
        );
    }

    #[test]
    fn test_djb2_uses_utf16_units() {
        // U+1F600 is a surrogate pair: 0xD83D 0xDE00.
        let expected = 5381i32
            .wrapping_mul(33)
            .wrapping_add(0xD83D)
            .wrapping_mul(33)
            .wrapping_add(0xDE00);
        assert_eq!(djb2("\u{1F600}"), expected);
    }

    #[test]
    fn test_second_occurrence_suppressed_within_window() {
        let mut d = dedup(1_000);
        let h = hash_payload(Some(&obj(json!({"a": 1}))));
        assert!(!d.check_and_record("x", &h, 0));
        assert!(d.check_and_record("x", &h, 500));
        // Window measured from the first occurrence.
        assert!(!d.check_and_record("x", &h, 1_001));
    }

    #[test]
    fn test_different_name_or_payload_not_duplicate() {
        let mut d = dedup(1_000);
        let h1 = hash_payload(Some(&obj(json!({"a": 1}))));
        let h2 = hash_payload(Some(&obj(json!({"a": 2}))));
        assert!(!d.check_and_record("x", &h1, 0));
        assert!(!d.check_and_record("y", &h1, 1));
        assert!(!d.check_and_record("x", &h2, 2));
    }

    #[test]
    fn test_is_duplicate_does_not_record() {
        let mut d = dedup(1_000);
        assert!(!d.is_duplicate("x", EMPTY_PAYLOAD_HASH, 0));
        assert!(!d.is_duplicate("x", EMPTY_PAYLOAD_HASH, 1));
        d.record("x", EMPTY_PAYLOAD_HASH, 1);
        assert!(d.is_duplicate("x", EMPTY_PAYLOAD_HASH, 2));
    }

    #[test]
    fn test_buffer_bounded_under_unique_flood() {
        let mut d = dedup(60_000);
        for i in 0..1_000u64 {
            d.check_and_record(&format!("event_{}", i), EMPTY_PAYLOAD_HASH, i);
            assert!(d.raw_len() <= EMERGENCY_CAP);
        }
    }

    #[test]
    fn test_prune_and_reset() {
        let mut d = dedup(100);
        d.record("x", EMPTY_PAYLOAD_HASH, 0);
        d.prune(500);
        assert_eq!(d.raw_len(), 0);
        d.record("x", EMPTY_PAYLOAD_HASH, 600);
        d.reset();
        assert!(!d.is_duplicate("x", EMPTY_PAYLOAD_HASH, 601));
    }
}
