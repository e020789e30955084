use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token counters for one assistant turn (or a running sum of turns).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub cache_write: u64,
    pub cache_read: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.cache_write)
            .saturating_add(self.cache_read)
            .saturating_add(self.output)
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input: self.input.saturating_add(rhs.input),
            cache_write: self.cache_write.saturating_add(rhs.cache_write),
            cache_read: self.cache_read.saturating_add(rhs.cache_read),
            output: self.output.saturating_add(rhs.output),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

/// Token and cost metrics attached to a trace event.
///
/// `cost_usd` is always derived from the token counts and the model in effect
/// when the event was built; it is never taken from input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub input_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl Metrics {
    pub fn new(usage: TokenUsage, cost_usd: f64) -> Self {
        Self {
            input_tokens: usage.input,
            cache_write_tokens: usage.cache_write,
            cache_read_tokens: usage.cache_read,
            output_tokens: usage.output,
            cost_usd,
        }
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input: self.input_tokens,
            cache_write: self.cache_write_tokens,
            cache_read: self.cache_read_tokens,
            output: self.output_tokens,
        }
    }

    /// Fold another event's metrics into a running total. Token counts come
    /// straight from transcripts and saturate instead of overflowing.
    pub fn accumulate(&mut self, other: &Metrics) {
        let usage = self.usage() + other.usage();
        self.input_tokens = usage.input;
        self.cache_write_tokens = usage.cache_write;
        self.cache_read_tokens = usage.cache_read;
        self.output_tokens = usage.output;
        self.cost_usd += other.cost_usd;
    }
}
