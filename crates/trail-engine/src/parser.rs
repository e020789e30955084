//! Transcript → trace events.
//!
//! The parser reads a transcript line by line, skips anything it cannot
//! decode, and emits one `tool_use` event per tool invocation found in an
//! assistant line. When the line carries a usage block, its token counts and
//! cost are attached to each of the line's events.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use trail_types::config::PairingMode;
use trail_types::pricing::PricingTable;
use trail_types::trace::TraceEvent;
use trail_types::transcript::TranscriptLine;
use trail_types::usage::{Metrics, TokenUsage};

use crate::error::ParseError;
use crate::pairing::{pairing_for, SpanPairing};

/// Tag set on events whose metrics are shared with sibling invocations of
/// the same assistant message. The value is the number of siblings.
pub const USAGE_SHARED_TAG: &str = "usage_shared";

/// Tag set by result pairing: `ok` or `error`.
pub const OUTCOME_TAG: &str = "outcome";

/// Token usage and cost of one assistant line, if it carries a usage block.
///
/// This is the unit both the full parser and the live watcher price, so the
/// two always agree on what a message costs.
pub fn priced_usage(line: &TranscriptLine, pricing: &PricingTable) -> Option<(TokenUsage, f64)> {
    if !line.is_assistant() {
        return None;
    }
    let usage = line.usage()?;
    Some((usage, pricing.cost(line.model(), &usage)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Non-blank lines seen.
    pub lines: usize,
    pub malformed: usize,
    pub assistant_messages: usize,
    pub tool_events: usize,
    pub paired_results: usize,
}

#[derive(Clone)]
pub struct TranscriptParser {
    pricing: Arc<PricingTable>,
    pairing: PairingMode,
}

impl TranscriptParser {
    pub fn new(pricing: Arc<PricingTable>, pairing: PairingMode) -> Self {
        Self { pricing, pairing }
    }

    /// Parse the transcript at `path`. A missing or unreadable file is an
    /// error; undecodable lines are not.
    pub fn parse(&self, path: &Path, session_id: &str) -> Result<Vec<TraceEvent>, ParseError> {
        self.parse_with_stats(path, session_id).map(|(events, _)| events)
    }

    pub fn parse_with_stats(
        &self,
        path: &Path,
        session_id: &str,
    ) -> Result<(Vec<TraceEvent>, ParseStats), ParseError> {
        let file = File::open(path).map_err(|source| ParseError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let (events, stats) = self
            .parse_reader(BufReader::new(file), session_id)
            .map_err(|source| ParseError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        debug!(
            session_id,
            path = %path.display(),
            lines = stats.lines,
            malformed = stats.malformed,
            events = stats.tool_events,
            "Parsed transcript"
        );
        Ok((events, stats))
    }

    /// Parse from any buffered reader. Lines are split on `\n` and decoded
    /// lossily, so invalid UTF-8 only costs the line it appears in.
    pub fn parse_reader<R: BufRead>(
        &self,
        reader: R,
        session_id: &str,
    ) -> io::Result<(Vec<TraceEvent>, ParseStats)> {
        let mut assembler = Assembler::new(session_id, &self.pricing, pairing_for(self.pairing));
        for chunk in reader.split(b'\n') {
            let chunk = chunk?;
            assembler.feed(&String::from_utf8_lossy(&chunk));
        }
        Ok(assembler.finish())
    }
}

struct Assembler<'a> {
    session_id: &'a str,
    pricing: &'a PricingTable,
    pairing: Box<dyn SpanPairing>,
    events: Vec<TraceEvent>,
    // Lines without their own timestamp inherit the previous one.
    last_timestamp: DateTime<Utc>,
    stats: ParseStats,
}

impl<'a> Assembler<'a> {
    fn new(session_id: &'a str, pricing: &'a PricingTable, pairing: Box<dyn SpanPairing>) -> Self {
        Self {
            session_id,
            pricing,
            pairing,
            events: Vec::new(),
            last_timestamp: Utc::now(),
            stats: ParseStats::default(),
        }
    }

    fn feed(&mut self, raw: &str) {
        if raw.trim().is_empty() {
            return;
        }
        self.stats.lines += 1;

        let Some(line) = TranscriptLine::decode(raw) else {
            self.stats.malformed += 1;
            return;
        };

        let timestamp = line.timestamp.unwrap_or(self.last_timestamp);
        self.last_timestamp = timestamp;

        if line.is_assistant() {
            self.stats.assistant_messages += 1;
            self.emit_invocations(&line, timestamp);
        }
        self.complete_results(&line, timestamp);
    }

    fn emit_invocations(&mut self, line: &TranscriptLine, timestamp: DateTime<Utc>) {
        let metrics = priced_usage(line, self.pricing).map(|(usage, cost)| Metrics::new(usage, cost));
        let invocations: Vec<_> = line.tool_invocations().collect();
        let shared = invocations.len() > 1 && metrics.is_some();
        let model = line.model();

        for invocation in &invocations {
            let mut event = TraceEvent::tool_use(
                self.session_id,
                timestamp,
                invocation.name,
                invocation.input.clone(),
            );
            event.tool_use_id = invocation.id.map(str::to_string);
            if !model.is_empty() {
                event.model = Some(model.to_string());
            }
            if let Some(metrics) = metrics {
                event.metrics = metrics;
            }
            if shared {
                event
                    .tags
                    .insert(USAGE_SHARED_TAG.to_string(), invocations.len().to_string());
            }

            self.pairing.on_invocation(invocation.id, self.events.len());
            self.events.push(event);
            self.stats.tool_events += 1;
        }
    }

    fn complete_results(&mut self, line: &TranscriptLine, timestamp: DateTime<Utc>) {
        for outcome in line.tool_outcomes() {
            let Some(index) = self.pairing.on_result(outcome.tool_use_id) else {
                continue;
            };
            let Some(event) = self.events.get_mut(index) else {
                continue;
            };
            event.end_time = Some(timestamp);
            event.duration_ms = Some((timestamp - event.timestamp).num_milliseconds().max(0));
            let verdict = if outcome.is_error { "error" } else { "ok" };
            event.tags.insert(OUTCOME_TAG.to_string(), verdict.to_string());
            self.stats.paired_results += 1;
        }
    }

    fn finish(self) -> (Vec<TraceEvent>, ParseStats) {
        (self.events, self.stats)
    }
}
