//! Span pairing strategies.
//!
//! Transcripts record a tool invocation in an assistant line and, usually,
//! its result in a later user line. A strategy decides whether such a result
//! is correlated back to the invocation's span.

use std::collections::HashMap;

use trail_types::config::PairingMode;

pub trait SpanPairing: Send {
    /// A tool invocation was emitted as event number `event_index`.
    fn on_invocation(&mut self, tool_use_id: Option<&str>, event_index: usize);

    /// A tool result was seen. Returns the index of the event it completes.
    fn on_result(&mut self, tool_use_id: &str) -> Option<usize>;
}

/// Every invocation is a complete span; results are ignored.
#[derive(Debug, Default)]
pub struct SelfContained;

impl SpanPairing for SelfContained {
    fn on_invocation(&mut self, _tool_use_id: Option<&str>, _event_index: usize) {}

    fn on_result(&mut self, _tool_use_id: &str) -> Option<usize> {
        None
    }
}

/// Correlates `tool_result` items with their invocation by tool use id.
/// Each invocation is completed at most once.
#[derive(Debug, Default)]
pub struct ToolResultPairing {
    pending: HashMap<String, usize>,
}

impl SpanPairing for ToolResultPairing {
    fn on_invocation(&mut self, tool_use_id: Option<&str>, event_index: usize) {
        if let Some(id) = tool_use_id {
            self.pending.insert(id.to_string(), event_index);
        }
    }

    fn on_result(&mut self, tool_use_id: &str) -> Option<usize> {
        self.pending.remove(tool_use_id)
    }
}

pub fn pairing_for(mode: PairingMode) -> Box<dyn SpanPairing> {
    match mode {
        PairingMode::SelfContained => Box::new(SelfContained),
        PairingMode::ToolResult => Box::new(ToolResultPairing::default()),
    }
}
