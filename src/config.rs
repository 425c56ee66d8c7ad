// src/config.rs
//! Process configuration. Everything arrives via the environment; per-source
//! polling intervals may additionally be overridden from a small TOML file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

const ENV_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
const ENV_STORAGE_PATH: &str = "DATA_STORAGE_PATH";
const ENV_POLLING_INTERVAL_MIN: &str = "POLLING_INTERVAL_MIN";
const ENV_TICK_INTERVAL_SECS: &str = "TICK_INTERVAL_SECS";
const ENV_SOURCES_PATH: &str = "SOURCES_CONFIG_PATH";

const DEFAULT_POLLING_INTERVAL_MIN: u64 = 5;
const DEFAULT_TICK_INTERVAL_SECS: u64 = 10;
const DEFAULT_SOURCES_PATH: &str = "config/sources.toml";

#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token. Required; the process cannot run without its
    /// delivery channel.
    pub bot_token: String,
    /// Directory holding `db.json`. Empty means the current directory.
    pub storage_dir: String,
    /// Default per-source polling interval, in minutes.
    pub polling_interval_min: u64,
    /// Scheduler tick period, in seconds.
    pub tick_interval_secs: u64,
    /// Optional per-source interval overrides.
    pub intervals: SourceIntervals,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bot_token = std::env::var(ENV_BOT_TOKEN)
            .map_err(|_| anyhow!("{ENV_BOT_TOKEN} is not set"))?;
        let storage_dir = std::env::var(ENV_STORAGE_PATH)
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        let polling_interval_min =
            env_u64(ENV_POLLING_INTERVAL_MIN, DEFAULT_POLLING_INTERVAL_MIN);
        let tick_interval_secs = env_u64(ENV_TICK_INTERVAL_SECS, DEFAULT_TICK_INTERVAL_SECS);
        let intervals = SourceIntervals::load_default()?;
        Ok(Self {
            bot_token,
            storage_dir,
            polling_interval_min,
            tick_interval_secs,
            intervals,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Polling interval for `source`: the override if one is configured,
    /// the process-wide default otherwise.
    pub fn polling_interval(&self, source: &str) -> Duration {
        let minutes = self
            .intervals
            .minutes_for(source)
            .unwrap_or(self.polling_interval_min);
        Duration::from_secs(minutes * 60)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Per-source polling interval overrides, in minutes.
#[derive(Debug, Clone, Default)]
pub struct SourceIntervals {
    minutes: BTreeMap<String, u64>,
}

impl SourceIntervals {
    /// Load overrides using env var + fallback:
    /// 1) $SOURCES_CONFIG_PATH
    /// 2) config/sources.toml
    /// 3) no overrides
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_SOURCES_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            } else {
                return Err(anyhow!("{ENV_SOURCES_PATH} points to non-existent path"));
            }
        }
        let toml_p = PathBuf::from(DEFAULT_SOURCES_PATH);
        if toml_p.exists() {
            return Self::load_from(&toml_p);
        }
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading source config from {}", path.display()))?;
        parse_intervals(&content)
    }

    pub fn minutes_for(&self, source: &str) -> Option<u64> {
        self.minutes.get(source).copied()
    }
}

fn parse_intervals(s: &str) -> Result<SourceIntervals> {
    #[derive(serde::Deserialize)]
    struct SourcesToml {
        #[serde(default)]
        intervals: BTreeMap<String, u64>,
    }
    let v: SourcesToml = toml::from_str(s).context("parsing source config toml")?;
    Ok(SourceIntervals {
        minutes: v.intervals,
    })
}
