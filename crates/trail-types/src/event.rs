use std::fmt;

use serde::{Deserialize, Serialize};

use crate::live::LiveStats;
use crate::usage::Metrics;

/// Why a live watcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Stopped by its owner, normally at session end.
    Requested,
    TranscriptRemoved,
    TranscriptTruncated,
    /// No new transcript content within the configured idle window.
    IdleTimeout,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::TranscriptRemoved => "transcript_removed",
            Self::TranscriptTruncated => "transcript_truncated",
            Self::IdleTimeout => "idle_timeout",
        };
        f.write_str(s)
    }
}

/// Outcome of the end-of-session pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEndReport {
    pub session_id: String,
    /// Events produced by the full parse.
    pub events: usize,
    pub written: usize,
    pub failed: usize,
    /// Sum of the metrics of every parsed event.
    pub total: Metrics,
    /// Last live snapshot, when a watcher was running for the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveStats>,
}

/// Progress notifications published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionStarted {
        session_id: String,
    },
    LiveUpdate {
        stats: LiveStats,
    },
    WatcherStopped {
        session_id: String,
        reason: StopReason,
    },
    SessionEnded {
        report: SessionEndReport,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStarted { session_id } | Self::WatcherStopped { session_id, .. } => {
                session_id
            }
            Self::LiveUpdate { stats } => &stats.session_id,
            Self::SessionEnded { report } => &report.session_id,
        }
    }
}
