//! Core domain types for trackgate
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Collector** | The external analytics ingestion service events are sent to |
//! | **Dispatch handle** | The callable that hands commands to the collector's script |
//! | **Preflight** | The synchronous accept/reject evaluation before dispatch |
//! | **Consent category** | `necessary`, `analytics` or `marketing`, each independently granted |
//!
//! Event payloads arrive as arbitrary JSON objects and leave preflight as a
//! flat [`Payload`] of scalars the collector accepts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================
// Consent
// ============================================

/// A user-grantable consent category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentCategory {
    Necessary,
    Analytics,
    Marketing,
}

impl ConsentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentCategory::Necessary => "necessary",
            ConsentCategory::Analytics => "analytics",
            ConsentCategory::Marketing => "marketing",
        }
    }
}

impl std::str::FromStr for ConsentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "necessary" => Ok(ConsentCategory::Necessary),
            "analytics" => Ok(ConsentCategory::Analytics),
            "marketing" => Ok(ConsentCategory::Marketing),
            _ => Err(format!("unknown consent category: {}", s)),
        }
    }
}

/// The user's consent choices at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentState {
    pub necessary: bool,
    pub analytics: bool,
    pub marketing: bool,
}

impl ConsentState {
    /// Only strictly necessary storage
    pub fn denied() -> Self {
        Self {
            necessary: true,
            analytics: false,
            marketing: false,
        }
    }

    pub fn granted() -> Self {
        Self {
            necessary: true,
            analytics: true,
            marketing: true,
        }
    }

    pub fn allows(&self, category: ConsentCategory) -> bool {
        match category {
            ConsentCategory::Necessary => self.necessary,
            ConsentCategory::Analytics => self.analytics,
            ConsentCategory::Marketing => self.marketing,
        }
    }
}

// ============================================
// Events
// ============================================

/// A sanitized payload value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Number(n) => write!(f, "{}", n),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<ParamValue> for serde_json::Value {
    fn from(value: ParamValue) -> Self {
        match value {
            ParamValue::Bool(b) => serde_json::Value::Bool(b),
            ParamValue::Number(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ParamValue::Text(s) => serde_json::Value::String(s),
        }
    }
}

/// Flat, sanitized event parameters, ordered by key
pub type Payload = BTreeMap<String, ParamValue>;

/// An event that passed preflight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl TrackedEvent {
    pub fn new(name: impl Into<String>, payload: Option<Payload>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Payload as a JSON object, the shape the collector expects
    pub fn params(&self) -> serde_json::Map<String, serde_json::Value> {
        self.payload
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(v.clone())))
            .collect()
    }
}

/// An event waiting in the offline queue
///
/// Serialized with camelCase keys; the durable queue is a JSON array of
/// these records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEvent {
    #[serde(flatten)]
    pub event: TrackedEvent,
    /// Milliseconds since the Unix epoch
    pub enqueued_at: u64,
    pub retry_count: u32,
}

impl QueuedEvent {
    pub fn new(event: TrackedEvent, enqueued_at: u64) -> Self {
        Self {
            event,
            enqueued_at,
            retry_count: 0,
        }
    }
}

/// Why preflight turned an event away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// No host to dispatch into
    Unavailable,
    SampledOut,
    NoConsent,
    NotLoaded,
    InvalidName,
    RateLimited,
    Duplicate,
}

impl RejectReason {
    pub const ALL: [RejectReason; 7] = [
        RejectReason::Unavailable,
        RejectReason::SampledOut,
        RejectReason::NoConsent,
        RejectReason::NotLoaded,
        RejectReason::InvalidName,
        RejectReason::RateLimited,
        RejectReason::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Unavailable => "unavailable",
            RejectReason::SampledOut => "sampled_out",
            RejectReason::NoConsent => "no_consent",
            RejectReason::NotLoaded => "not_loaded",
            RejectReason::InvalidName => "invalid_name",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
