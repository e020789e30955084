use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One entry of the append-only session registry.
///
/// The registry never rewrites history: closing a session appends a copy of
/// its record with `ended_at` set, and readers take the last entry per
/// `session_id` as current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub transcript_path: PathBuf,
    #[serde(default)]
    pub source: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(
        session_id: impl Into<String>,
        transcript_path: impl Into<PathBuf>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            transcript_path: transcript_path.into(),
            source: source.into(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// The superseding record that marks this session ended at `at`.
    pub fn closed_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            ended_at: Some(at),
            ..self.clone()
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Failed to decode hook payload")]
    Decode(#[from] serde_json::Error),

    #[error("Hook payload is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Unsupported hook event: {0}")]
    UnknownEvent(String),
}

/// Hook payload as received; every field optional so validation can name
/// exactly what is missing.
#[derive(Debug, Default, Deserialize)]
struct RawSignal {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    transcript_path: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    hook_event_name: Option<String>,
}

impl RawSignal {
    fn parse(raw: &str) -> Result<Self, SignalError> {
        Ok(serde_json::from_str(raw)?)
    }

    fn session_id(&self) -> Result<String, SignalError> {
        let id = required(&self.session_id, "session_id")?;
        validate_session_id(&id)?;
        Ok(id)
    }

    fn transcript_path(&self) -> Result<PathBuf, SignalError> {
        required(&self.transcript_path, "transcript_path").map(PathBuf::from)
    }
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, SignalError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(SignalError::MissingField(name)),
    }
}

/// Session ids end up in file names, so reject anything path-like.
pub fn validate_session_id(id: &str) -> Result<(), SignalError> {
    let bad = id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.chars().any(char::is_control);
    if bad {
        return Err(SignalError::InvalidSessionId(id.to_string()));
    }
    Ok(())
}

/// "Session started" notification from the agent runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStartSignal {
    pub session_id: String,
    pub transcript_path: PathBuf,
    pub source: String,
}

impl SessionStartSignal {
    pub fn from_json(raw: &str) -> Result<Self, SignalError> {
        Self::from_raw(RawSignal::parse(raw)?)
    }

    fn from_raw(raw: RawSignal) -> Result<Self, SignalError> {
        Ok(Self {
            session_id: raw.session_id()?,
            transcript_path: raw.transcript_path()?,
            source: raw.source.unwrap_or_default(),
        })
    }
}

/// "Session ended" notification from the agent runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndSignal {
    pub session_id: String,
    pub transcript_path: PathBuf,
    pub reason: Option<String>,
}

impl SessionEndSignal {
    pub fn from_json(raw: &str) -> Result<Self, SignalError> {
        Self::from_raw(RawSignal::parse(raw)?)
    }

    fn from_raw(raw: RawSignal) -> Result<Self, SignalError> {
        Ok(Self {
            session_id: raw.session_id()?,
            transcript_path: raw.transcript_path()?,
            reason: raw.reason,
        })
    }
}

/// A lifecycle signal dispatched on `hook_event_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookSignal {
    Start(SessionStartSignal),
    End(SessionEndSignal),
}

impl HookSignal {
    pub fn from_json(raw: &str) -> Result<Self, SignalError> {
        let parsed = RawSignal::parse(raw)?;
        let event = required(&parsed.hook_event_name, "hook_event_name")?;
        match event.as_str() {
            "SessionStart" => Ok(Self::Start(SessionStartSignal::from_raw(parsed)?)),
            "SessionEnd" => Ok(Self::End(SessionEndSignal::from_raw(parsed)?)),
            _ => Err(SignalError::UnknownEvent(event)),
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Start(s) => &s.session_id,
            Self::End(s) => &s.session_id,
        }
    }
}
