//! Per-model token pricing.
//!
//! Rates are expressed in USD per million tokens and looked up by model
//! family, i.e. the first [`FAMILY_SEGMENTS`] hyphen-delimited segments of a
//! full model identifier (`claude-sonnet-4-5-20250929` → `claude-sonnet-4-5`).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::usage::TokenUsage;

/// Number of leading hyphen-delimited segments that make up a model family.
pub const FAMILY_SEGMENTS: usize = 4;

const TOKENS_PER_UNIT: f64 = 1_000_000.0;

/// Four per-million-token rates for one model family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: f64,
    pub cache_read_per_million: f64,
}

impl PricingEntry {
    pub const fn new(input: f64, output: f64, cache_write: f64, cache_read: f64) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
            cache_write_per_million: cache_write,
            cache_read_per_million: cache_read,
        }
    }

    fn is_valid(&self) -> bool {
        [
            self.input_per_million,
            self.output_per_million,
            self.cache_write_per_million,
            self.cache_read_per_million,
        ]
        .iter()
        .all(|rate| rate.is_finite() && *rate >= 0.0)
    }

    /// Cost of `usage` at these rates.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        usage.input as f64 / TOKENS_PER_UNIT * self.input_per_million
            + usage.cache_write as f64 / TOKENS_PER_UNIT * self.cache_write_per_million
            + usage.cache_read as f64 / TOKENS_PER_UNIT * self.cache_read_per_million
            + usage.output as f64 / TOKENS_PER_UNIT * self.output_per_million
    }
}

const SONNET: PricingEntry = PricingEntry::new(3.00, 15.00, 3.75, 0.30);
const OPUS: PricingEntry = PricingEntry::new(15.00, 75.00, 18.75, 1.50);
const HAIKU_4: PricingEntry = PricingEntry::new(1.00, 5.00, 1.25, 0.10);
const HAIKU_3_5: PricingEntry = PricingEntry::new(0.80, 4.00, 1.00, 0.08);

const BUILTIN: &[(&str, PricingEntry)] = &[
    ("claude-sonnet-4-5", SONNET),
    // Only four segments, so the dated identifier is its own family.
    ("claude-sonnet-4-20250514", SONNET),
    ("claude-opus-4-5", OPUS),
    ("claude-opus-4-1", OPUS),
    ("claude-opus-4-20250514", OPUS),
    ("claude-haiku-4-5", HAIKU_4),
    ("claude-haiku-3-5", HAIKU_3_5),
];

/// Reduce a full model identifier to its pricing family.
pub fn model_family(model: &str) -> &str {
    match model.match_indices('-').nth(FAMILY_SEGMENTS - 1) {
        Some((idx, _)) => &model[..idx],
        None => model,
    }
}

/// Static model-family → rates lookup. Built once at startup, read-only after.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: HashMap<String, PricingEntry>,
}

impl PricingTable {
    /// The built-in table.
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN
                .iter()
                .map(|(family, entry)| (family.to_string(), *entry))
                .collect(),
        }
    }

    /// Merge configured entries over the current ones. Entries with negative
    /// or non-finite rates are skipped and their keys returned.
    pub fn merge(&mut self, overrides: &BTreeMap<String, PricingEntry>) -> Vec<String> {
        let mut rejected = Vec::new();
        for (family, entry) in overrides {
            if entry.is_valid() {
                self.entries.insert(family.clone(), *entry);
            } else {
                rejected.push(family.clone());
            }
        }
        rejected
    }

    pub fn entry_for(&self, model: &str) -> Option<&PricingEntry> {
        self.entries.get(model_family(model))
    }

    /// Cost in USD of `usage` under `model`. Unknown families cost 0.
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.entry_for(model).map_or(0.0, |entry| entry.cost(usage))
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}
