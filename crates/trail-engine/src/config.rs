use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::warn;

use trail_types::config::TrailConfig;
use trail_types::pricing::PricingTable;

/// Returns the Trail home directory (~/.trail/)
pub fn trail_home() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".trail"))
        .context("Could not determine home directory")
}

/// Returns the default config file path (~/.trail/config.toml)
pub fn config_path() -> Result<PathBuf> {
    Ok(trail_home()?.join("config.toml"))
}

/// Default trace directory (~/.claude/traces/), shared with other tooling
/// that reads the same trace files.
pub fn default_traces_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".claude").join("traces"))
        .context("Could not determine home directory")
}

/// Load config from `path`, writing the defaults there if it doesn't exist.
pub fn load_config(path: &Path) -> Result<TrailConfig> {
    if !path.exists() {
        let default = TrailConfig::default();
        save_config(path, &default)?;
        return Ok(default);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: TrailConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// Save config to disk, overwriting the existing file.
pub fn save_config(path: &Path, config: &TrailConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let toml_str = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}

/// Build the pricing table: built-in rates with configured families merged on top.
pub fn pricing_table(config: &TrailConfig) -> PricingTable {
    let mut table = PricingTable::builtin();
    for family in table.merge(&config.pricing.models) {
        warn!(%family, "Ignoring pricing entry with negative or non-finite rates");
    }
    table
}

/// Where every persisted artifact lives. Resolved once at startup and handed
/// to each component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    traces_dir: PathBuf,
}

impl Layout {
    pub fn new(traces_dir: impl Into<PathBuf>) -> Self {
        Self {
            traces_dir: traces_dir.into(),
        }
    }

    pub fn from_config(config: &TrailConfig) -> Result<Self> {
        let dir = match &config.storage.dir {
            Some(dir) => dir.clone(),
            None => default_traces_dir()?,
        };
        Ok(Self::new(dir))
    }

    pub fn traces_dir(&self) -> &Path {
        &self.traces_dir
    }

    /// Append-only session registry (sessions.jsonl)
    pub fn registry_path(&self) -> PathBuf {
        self.traces_dir.join("sessions.jsonl")
    }

    /// Daily trace partition (traces-YYYY-MM-DD.jsonl)
    pub fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.traces_dir
            .join(format!("traces-{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Live stats snapshot for an active session (session-<id>-live.json)
    pub fn live_stats_path(&self, session_id: &str) -> PathBuf {
        self.traces_dir.join(format!("session-{session_id}-live.json"))
    }
}
