use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::usage::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolUse,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolUse => write!(f, "tool_use"),
        }
    }
}

/// One span of a session trace: a single tool invocation.
///
/// The session is the trace root, so `trace_id` always equals `session_id`.
/// Events are immutable once written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub session_id: String,
    pub trace_id: String,
    pub span_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventKind,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub tool_input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl TraceEvent {
    /// A fresh `tool_use` span with a newly generated span id and no metrics.
    pub fn tool_use(
        session_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            trace_id: session_id.clone(),
            session_id,
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            timestamp,
            event_type: EventKind::ToolUse,
            tool_name: tool_name.into(),
            tool_input,
            tool_use_id: None,
            model: None,
            end_time: None,
            duration_ms: None,
            metrics: Metrics::default(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::TokenUsage;

    #[test]
    fn tool_use_roots_trace_at_session() {
        let ev = TraceEvent::tool_use("sess-1", Utc::now(), "FileRead", serde_json::json!({"path": "x"}));
        assert_eq!(ev.trace_id, "sess-1");
        assert_eq!(ev.event_type, EventKind::ToolUse);
        assert!(ev.parent_span_id.is_none());

        let other = TraceEvent::tool_use("sess-1", Utc::now(), "FileRead", serde_json::Value::Null);
        assert_ne!(ev.span_id, other.span_id);
    }

    #[test]
    fn serialized_shape() {
        let usage = TokenUsage { input: 10, cache_write: 0, cache_read: 0, output: 5 };
        let ev = TraceEvent::tool_use("s", Utc::now(), "Bash", serde_json::Value::Null)
            .with_metrics(Metrics::new(usage, 0.5))
            .with_tag("label", "demo");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event_type"], "tool_use");
        assert_eq!(json["metrics"]["input_tokens"], 10);
        assert_eq!(json["tags"]["label"], "demo");
        assert!(json.get("tool_input").is_none());
        assert!(json.get("parent_span_id").is_none());

        let back: TraceEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }
}
