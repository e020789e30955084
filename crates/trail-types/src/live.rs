use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::usage::TokenUsage;

/// Running token and cost totals for a session that is still in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStats {
    pub session_id: String,
    pub input_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub message_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl LiveStats {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            input_tokens: 0,
            cache_write_tokens: 0,
            cache_read_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            message_count: 0,
            last_updated: Utc::now(),
        }
    }

    /// Fold one assistant message into the totals. Cost is additive, so the
    /// new running cost is the previous one plus this message's cost.
    pub fn record(&mut self, usage: &TokenUsage, cost_usd: f64) {
        let total = self.usage() + *usage;
        self.input_tokens = total.input;
        self.cache_write_tokens = total.cache_write;
        self.cache_read_tokens = total.cache_read;
        self.output_tokens = total.output;
        self.cost_usd += cost_usd;
        self.message_count += 1;
        self.last_updated = Utc::now();
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input: self.input_tokens,
            cache_write: self.cache_write_tokens,
            cache_read: self.cache_read_tokens,
            output: self.output_tokens,
        }
    }
}
