use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use trail_types::trace::TraceEvent;
use trail_types::usage::Metrics;

use crate::parser::{OUTCOME_TAG, USAGE_SHARED_TAG};

/// Per-tool totals within one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolStat {
    pub calls: usize,
    pub errors: usize,
    pub metrics: Metrics,
}

/// Aggregate view of one session's stored trace events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub events: usize,
    /// Token and cost totals. Metrics shared by several invocations of one
    /// message are counted once.
    pub total: Metrics,
    pub tools: BTreeMap<String, ToolStat>,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
}

impl SessionSummary {
    pub fn from_events(session_id: &str, events: &[TraceEvent]) -> Self {
        let mut summary = Self {
            session_id: session_id.to_string(),
            events: 0,
            total: Metrics::default(),
            tools: BTreeMap::new(),
            first_event: None,
            last_event: None,
        };

        // Events of one multi-tool message sit next to each other and carry
        // identical metrics; only the first of each run is summed.
        let mut shared_left = 0usize;

        for event in events.iter().filter(|e| e.session_id == session_id) {
            summary.events += 1;

            let stat = summary.tools.entry(event.tool_name.clone()).or_default();
            stat.calls += 1;
            stat.metrics.accumulate(&event.metrics);
            if event.tags.get(OUTCOME_TAG).map(String::as_str) == Some("error") {
                stat.errors += 1;
            }

            if shared_left > 0 {
                shared_left -= 1;
            } else {
                summary.total.accumulate(&event.metrics);
                if let Some(n) = event
                    .tags
                    .get(USAGE_SHARED_TAG)
                    .and_then(|n| n.parse::<usize>().ok())
                {
                    shared_left = n.saturating_sub(1);
                }
            }

            summary.first_event = Some(match summary.first_event {
                Some(t) => t.min(event.timestamp),
                None => event.timestamp,
            });
            let end = event.end_time.unwrap_or(event.timestamp);
            summary.last_event = Some(match summary.last_event {
                Some(t) => t.max(end),
                None => end,
            });
        }

        summary
    }

    /// Wall time between the first and last recorded activity.
    pub fn wall_duration_ms(&self) -> Option<i64> {
        match (self.first_event, self.last_event) {
            (Some(first), Some(last)) => Some((last - first).num_milliseconds()),
            _ => None,
        }
    }
}
