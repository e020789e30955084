use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::pricing::PricingEntry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrailConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Trace directory. Unset means `~/.claude/traces`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    /// Stop a watcher whose transcript has not grown for this long. Unset
    /// means watchers only stop on an explicit stop or transcript removal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    /// Use filesystem notifications as a wake-up hint on top of polling.
    #[serde(default = "default_true")]
    pub fs_events: bool,
    #[serde(default = "default_true")]
    pub stop_on_truncate: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            idle_timeout_secs: None,
            fs_events: true,
            stop_on_truncate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingMode {
    /// Every tool invocation is a complete span on its own.
    #[default]
    SelfContained,
    /// Correlate invocations with later `tool_result` items by tool use id.
    ToolResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Upper bound on the end-of-session parse and write pass.
    pub timeout_secs: u64,
    #[serde(default)]
    pub pairing: PairingMode,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            pairing: PairingMode::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Extra or overriding families, merged over the built-in table.
    #[serde(default)]
    pub models: BTreeMap<String, PricingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}
