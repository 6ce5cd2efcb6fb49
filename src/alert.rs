//! Alert values: what watchers emit and what goes over the wire.
use crate::context::CallContext;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Which watcher (or reporter) produced an alert. Serialized as the payload `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Heartbeat,
    Pattern,
    Liveness,
    Stalled,
    Decorator,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Heartbeat => "heartbeat",
            AlertKind::Pattern => "pattern",
            AlertKind::Liveness => "liveness",
            AlertKind::Stalled => "stalled",
            AlertKind::Decorator => "decorator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Success,
    Error,
}

/// Produced by a watcher on a firing transition.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub target: String,
    pub message: String,
    pub detected_at: DateTime<Utc>,
    /// Extra fields merged into the payload body (e.g. the matched line).
    pub detail: Map<String, Value>,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            message: message.into(),
            detected_at: Utc::now(),
            detail: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    /// Build the wire payload for this event.
    pub fn into_payload(self, source: CallContext) -> AlertPayload {
        let mut body = Map::new();
        body.insert("message".to_string(), Value::String(self.message));
        body.insert("target".to_string(), Value::String(self.target));
        body.insert(
            "detected_at".to_string(),
            Value::String(self.detected_at.to_rfc3339()),
        );
        body.extend(self.detail);

        AlertPayload {
            source,
            kind: self.kind,
            status: AlertStatus::Success,
            body: Some(body),
            error: None,
        }
    }
}

/// The JSON document POSTed to the alert endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub source: CallContext,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub status: AlertStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AlertPayload {
    pub fn success(source: CallContext, kind: AlertKind, body: Option<Map<String, Value>>) -> Self {
        Self {
            source,
            kind,
            status: AlertStatus::Success,
            body,
            error: None,
        }
    }

    pub fn failure(
        source: CallContext,
        kind: AlertKind,
        body: Option<Map<String, Value>>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            source,
            kind,
            status: AlertStatus::Error,
            body,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CallContext {
        CallContext {
            hostname: "box".to_string(),
            ip: "10.0.0.2".to_string(),
            user: "ops".to_string(),
            cmdline: "warden watch".to_string(),
        }
    }

    #[test]
    fn test_event_payload_shape() {
        let event = AlertEvent::new(AlertKind::Pattern, "/var/log/app.log", "matched ERROR")
            .with_detail("pattern", "ERROR")
            .with_detail("line", "ERROR boom");
        let json = serde_json::to_value(event.into_payload(ctx())).unwrap();

        assert_eq!(json["type"], "pattern");
        assert_eq!(json["status"], "success");
        assert_eq!(json["source"]["hostname"], "box");
        assert_eq!(json["source"]["ip"], "10.0.0.2");
        assert_eq!(json["body"]["target"], "/var/log/app.log");
        assert_eq!(json["body"]["pattern"], "ERROR");
        assert_eq!(json["body"]["line"], "ERROR boom");
        assert!(json["body"]["detected_at"].is_string());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failure_payload_carries_error() {
        let payload = AlertPayload::failure(ctx(), AlertKind::Decorator, None, "exit status 3");
        let json = serde_json::to_value(payload).unwrap();
        assert_eq!(json["type"], "decorator");
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "exit status 3");
        assert!(json.get("body").is_none());
    }

    #[test]
    fn test_kind_labels_match_serialization() {
        for kind in [
            AlertKind::Heartbeat,
            AlertKind::Pattern,
            AlertKind::Liveness,
            AlertKind::Stalled,
            AlertKind::Decorator,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }
}
