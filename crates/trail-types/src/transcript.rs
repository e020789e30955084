//! Raw transcript records as written by the agent runtime, one JSON object
//! per line. Only the fields the tracer needs are modelled; everything else
//! in a line is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::usage::TokenUsage;

/// Record kind of lines produced by the model.
pub const ASSISTANT: &str = "assistant";

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptLine {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: Option<TranscriptMessage>,
    /// `None` when absent or unparseable; the line itself is still kept.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub usage: Option<TranscriptUsage>,
}

/// User lines often carry a bare string; assistant lines carry item lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Items(Vec<ContentItem>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Items(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

impl From<&TranscriptUsage> for TokenUsage {
    fn from(usage: &TranscriptUsage) -> Self {
        TokenUsage {
            input: usage.input_tokens.unwrap_or(0),
            cache_write: usage.cache_creation_input_tokens.unwrap_or(0),
            cache_read: usage.cache_read_input_tokens.unwrap_or(0),
            output: usage.output_tokens.unwrap_or(0),
        }
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse::<DateTime<Utc>>().ok()))
}

/// A tool invocation found in an assistant line.
#[derive(Debug, Clone, Copy)]
pub struct ToolInvocation<'a> {
    pub id: Option<&'a str>,
    pub name: &'a str,
    pub input: &'a serde_json::Value,
}

/// A tool result found in a (usually user) line.
#[derive(Debug, Clone, Copy)]
pub struct ToolOutcome<'a> {
    pub tool_use_id: &'a str,
    pub is_error: bool,
}

impl TranscriptLine {
    /// Decode one raw line. Blank or undecodable lines yield `None`.
    pub fn decode(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    pub fn is_assistant(&self) -> bool {
        self.kind == ASSISTANT
    }

    /// Model identifier of the enclosing message, or `""` when absent.
    pub fn model(&self) -> &str {
        self.message
            .as_ref()
            .and_then(|m| m.model.as_deref())
            .unwrap_or("")
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.message
            .as_ref()
            .and_then(|m| m.usage.as_ref())
            .map(TokenUsage::from)
    }

    pub fn items(&self) -> &[ContentItem] {
        match self.message.as_ref().map(|m| &m.content) {
            Some(MessageContent::Items(items)) => items,
            _ => &[],
        }
    }

    /// Tool invocations with a non-empty name, in content order.
    pub fn tool_invocations(&self) -> impl Iterator<Item = ToolInvocation<'_>> {
        self.items().iter().filter_map(|item| match item {
            ContentItem::ToolUse { id, name, input } if !name.is_empty() => Some(ToolInvocation {
                id: id.as_deref(),
                name,
                input,
            }),
            _ => None,
        })
    }

    pub fn tool_outcomes(&self) -> impl Iterator<Item = ToolOutcome<'_>> {
        self.items().iter().filter_map(|item| match item {
            ContentItem::ToolResult { tool_use_id, is_error } => Some(ToolOutcome {
                tool_use_id,
                is_error: is_error.unwrap_or(false),
            }),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_assistant_tool_use() {
        let raw = r#"{"type":"assistant","timestamp":"2026-01-31T10:00:00Z","sessionId":"s1",
            "message":{"id":"msg_1","model":"claude-sonnet-4-5-20250929",
            "content":[{"type":"text","text":"reading"},
                       {"type":"tool_use","id":"toolu_1","name":"FileRead","input":{"path":"a.rs"}},
                       {"type":"thinking","thinking":"hmm"}],
            "usage":{"input_tokens":1000,"output_tokens":500,"cache_creation_input_tokens":7,"cache_read_input_tokens":null}}}"#;
        let line = TranscriptLine::decode(raw).unwrap();
        assert!(line.is_assistant());
        assert_eq!(line.model(), "claude-sonnet-4-5-20250929");
        assert_eq!(line.items().len(), 3);

        let tools: Vec<_> = line.tool_invocations().collect();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "FileRead");
        assert_eq!(tools[0].id, Some("toolu_1"));
        assert_eq!(tools[0].input["path"], "a.rs");

        let usage = line.usage().unwrap();
        assert_eq!(usage, TokenUsage { input: 1000, cache_write: 7, cache_read: 0, output: 500 });
    }

    #[test]
    fn decodes_user_string_content() {
        let raw = r#"{"type":"user","message":{"role":"user","content":"hello"}}"#;
        let line = TranscriptLine::decode(raw).unwrap();
        assert!(!line.is_assistant());
        assert!(line.items().is_empty());
        assert!(line.usage().is_none());
    }

    #[test]
    fn decodes_tool_results() {
        let raw = r#"{"type":"user","message":{"content":[
            {"type":"tool_result","tool_use_id":"toolu_1","content":"ok"},
            {"type":"tool_result","tool_use_id":"toolu_2","is_error":true,"content":[{"type":"text","text":"boom"}]}]}}"#;
        let line = TranscriptLine::decode(raw).unwrap();
        let outcomes: Vec<_> = line.tool_outcomes().collect();
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].is_error);
        assert_eq!(outcomes[1].tool_use_id, "toolu_2");
        assert!(outcomes[1].is_error);
    }

    #[test]
    fn rejects_garbage_and_blank() {
        assert!(TranscriptLine::decode("").is_none());
        assert!(TranscriptLine::decode("   ").is_none());
        assert!(TranscriptLine::decode("not json").is_none());
        assert!(TranscriptLine::decode(r#"{"message":{}}"#).is_none());
    }

    #[test]
    fn bad_timestamp_keeps_the_line() {
        let raw = r#"{"type":"assistant","timestamp":"yesterday",
            "message":{"content":[{"type":"tool_use","name":"Bash","input":{}}]}}"#;
        let line = TranscriptLine::decode(raw).unwrap();
        assert!(line.timestamp.is_none());
        assert_eq!(line.tool_invocations().count(), 1);

        let numeric = TranscriptLine::decode(r#"{"type":"user","timestamp":12}"#).unwrap();
        assert!(numeric.timestamp.is_none());

        let good = TranscriptLine::decode(r#"{"type":"user","timestamp":"2026-01-31T10:00:00.123Z"}"#).unwrap();
        assert!(good.timestamp.is_some());
    }

    #[test]
    fn unnamed_tool_use_is_ignored() {
        let raw = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":""}]}}"#;
        let line = TranscriptLine::decode(raw).unwrap();
        assert_eq!(line.tool_invocations().count(), 0);
    }
}
