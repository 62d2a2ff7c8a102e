//! Commands handed to the collector's dispatch handle
//!
//! Each call mirrors one invocation of the page-global handle:
//!
//! ```text
//! handle("config", "G-XXXX", { anonymize_ip: true })
//! handle("event",  "sign_up", { method: "email" })
//! handle("consent", "update", { analytics_storage: "granted", ... })
//! ```
//!
//! [`CollectorCall::to_args`] renders the argument array the handle pushes
//! into its buffer.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::TrackedEvent;

/// One command to the collector
#[derive(Debug, Clone, PartialEq)]
pub enum CollectorCall {
    /// Start-of-session timestamp
    Js(DateTime<Utc>),
    /// Configure a measurement target
    Config {
        target: String,
        params: Map<String, Value>,
    },
    /// A behavioral event
    Event {
        name: String,
        params: Map<String, Value>,
    },
    /// Global parameters for later calls
    Set { params: Map<String, Value> },
    /// Consent-mode signal
    Consent {
        mode: ConsentMode,
        params: ConsentParams,
    },
}

impl CollectorCall {
    pub fn event(event: &TrackedEvent) -> Self {
        CollectorCall::Event {
            name: event.name.clone(),
            params: event.params(),
        }
    }

    /// The command string the handle receives first
    pub fn command(&self) -> &'static str {
        match self {
            CollectorCall::Js(_) => "js",
            CollectorCall::Config { .. } => "config",
            CollectorCall::Event { .. } => "event",
            CollectorCall::Set { .. } => "set",
            CollectorCall::Consent { .. } => "consent",
        }
    }

    /// `[command, target, params?]` as pushed into the event buffer
    pub fn to_args(&self) -> Value {
        let command = Value::String(self.command().to_string());
        match self {
            CollectorCall::Js(at) => Value::Array(vec![
                command,
                Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ]),
            CollectorCall::Config { target, params } => Value::Array(vec![
                command,
                Value::String(target.clone()),
                Value::Object(params.clone()),
            ]),
            CollectorCall::Event { name, params } => Value::Array(vec![
                command,
                Value::String(name.clone()),
                Value::Object(params.clone()),
            ]),
            CollectorCall::Set { params } => {
                Value::Array(vec![command, Value::Object(params.clone())])
            }
            CollectorCall::Consent { mode, params } => Value::Array(vec![
                command,
                Value::String(mode.as_str().to_string()),
                serde_json::to_value(params).unwrap_or(Value::Null),
            ]),
        }
    }
}

/// Which consent-mode command is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentMode {
    /// Before the collector loads; carries a wait-for-update delay
    Default,
    /// Whenever consent changes
    Update,
}

impl ConsentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentMode::Default => "default",
            ConsentMode::Update => "update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentSignal {
    Granted,
    Denied,
}

impl From<bool> for ConsentSignal {
    fn from(granted: bool) -> Self {
        if granted {
            ConsentSignal::Granted
        } else {
            ConsentSignal::Denied
        }
    }
}

/// The four storage categories of the consent-mode protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentParams {
    pub analytics_storage: ConsentSignal,
    pub ad_storage: ConsentSignal,
    pub ad_user_data: ConsentSignal,
    pub ad_personalization: ConsentSignal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_update: Option<u64>,
}

impl ConsentParams {
    /// Analytics maps to analytics storage; the three ad categories all
    /// follow the marketing flag.
    pub fn from_flags(analytics: bool, marketing: bool) -> Self {
        Self {
            analytics_storage: analytics.into(),
            ad_storage: marketing.into(),
            ad_user_data: marketing.into(),
            ad_personalization: marketing.into(),
            wait_for_update: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParamValue, Payload};
    use chrono::TimeZone;

    #[test]
    fn test_event_args() {
        let mut payload = Payload::new();
        payload.insert("method".to_string(), ParamValue::Text("email".to_string()));
        let call = CollectorCall::event(&TrackedEvent::new("sign_up", Some(payload)));

        assert_eq!(call.command(), "event");
        assert_eq!(
            call.to_args(),
            serde_json::json!(["event", "sign_up", {"method": "email"}])
        );
    }

    #[test]
    fn test_js_args_use_iso_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            CollectorCall::Js(at).to_args(),
            serde_json::json!(["js", "2024-03-01T12:00:00.000Z"])
        );
    }

    #[test]
    fn test_consent_params_mapping() {
        let params = ConsentParams::from_flags(true, false);
        assert_eq!(params.analytics_storage, ConsentSignal::Granted);
        assert_eq!(params.ad_storage, ConsentSignal::Denied);
        assert_eq!(params.ad_user_data, ConsentSignal::Denied);
        assert_eq!(params.ad_personalization, ConsentSignal::Denied);

        let call = CollectorCall::Consent {
            mode: ConsentMode::Update,
            params,
        };
        assert_eq!(
            call.to_args(),
            serde_json::json!(["consent", "update", {
                "analytics_storage": "granted",
                "ad_storage": "denied",
                "ad_user_data": "denied",
                "ad_personalization": "denied"
            }])
        );
    }

    #[test]
    fn test_wait_for_update_serialized_when_present() {
        let mut params = ConsentParams::from_flags(false, true);
        params.wait_for_update = Some(500);
        let json = serde_json::to_value(params).unwrap();
        assert_eq!(json["wait_for_update"], 500);
        assert_eq!(json["ad_storage"], "granted");
    }
}
