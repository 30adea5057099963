use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment override for the delivery strategy.
pub const STRATEGY_ENV: &str = "NICPLUG_STRATEGY";

/// Upper bound for every configured wait (one day).
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// How a hotplug request reaches a running instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Attach/detach devices on the live instance.
    #[default]
    InPlace,
    /// Live-migrate to a new instance built from the desired template.
    Migration,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InPlace => write!(f, "in-place"),
            Self::Migration => write!(f, "migration"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in-place" | "inplace" | "in_place" => Ok(Self::InPlace),
            "migration" | "migration-based" => Ok(Self::Migration),
            other => anyhow::bail!("Unknown strategy {:?} (expected in-place or migration)", other),
        }
    }
}

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hotplug: HotplugConfig,
}

/// Controller timing and strategy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotplugConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Max time for interface status to match the template (seconds).
    #[serde(default = "default_convergence_timeout")]
    pub convergence_timeout_secs: u64,
    /// Interval between status samples (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Max time for a new instance to reach Running after restart (seconds).
    #[serde(default = "default_running_timeout")]
    pub running_timeout_secs: u64,
    /// Max time for a migration to reach a terminal phase (seconds).
    #[serde(default = "default_migration_timeout")]
    pub migration_timeout_secs: u64,
    /// Attempts for a conditional patch that keeps conflicting.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    /// Delay after the first conflict, doubled on each retry (milliseconds).
    #[serde(default = "default_conflict_backoff")]
    pub conflict_backoff_ms: u64,
}

fn default_convergence_timeout() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_running_timeout() -> u64 {
    90
}
fn default_migration_timeout() -> u64 {
    240
}
fn default_conflict_retries() -> u32 {
    5
}
fn default_conflict_backoff() -> u64 {
    50
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            convergence_timeout_secs: default_convergence_timeout(),
            poll_interval_ms: default_poll_interval(),
            running_timeout_secs: default_running_timeout(),
            migration_timeout_secs: default_migration_timeout(),
            conflict_retries: default_conflict_retries(),
            conflict_backoff_ms: default_conflict_backoff(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse config TOML")?;
        config.hotplug.validate()?;
        Ok(config)
    }

    /// Apply `NICPLUG_STRATEGY` if set.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(v) = std::env::var(STRATEGY_ENV) {
            self.hotplug.strategy = v
                .parse()
                .with_context(|| format!("Invalid {}", STRATEGY_ENV))?;
        }
        Ok(self)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).with_context(|| "Failed to serialize config")
    }
}

impl HotplugConfig {
    fn validate(&self) -> Result<()> {
        if self.convergence_timeout_secs == 0 {
            anyhow::bail!("convergence_timeout_secs must be greater than zero");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than zero");
        }
        for (field, secs) in [
            ("convergence_timeout_secs", self.convergence_timeout_secs),
            ("running_timeout_secs", self.running_timeout_secs),
            ("migration_timeout_secs", self.migration_timeout_secs),
        ] {
            if secs > MAX_TIMEOUT_SECS {
                anyhow::bail!("{} ({}) exceeds the maximum of {}s", field, secs, MAX_TIMEOUT_SECS);
            }
        }
        if self.conflict_backoff_ms > MAX_TIMEOUT_SECS * 1000 {
            anyhow::bail!(
                "conflict_backoff_ms ({}) exceeds the maximum of {}ms",
                self.conflict_backoff_ms,
                MAX_TIMEOUT_SECS * 1000
            );
        }
        if self.poll_interval_ms > self.convergence_timeout_secs.saturating_mul(1000) {
            anyhow::bail!(
                "poll_interval_ms ({}) exceeds convergence_timeout_secs ({}s)",
                self.poll_interval_ms,
                self.convergence_timeout_secs
            );
        }
        if self.conflict_retries == 0 {
            anyhow::bail!("conflict_retries must be at least 1");
        }
        Ok(())
    }

    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_secs(self.convergence_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn running_timeout(&self) -> Duration {
        Duration::from_secs(self.running_timeout_secs)
    }

    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout_secs)
    }

    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_millis(self.conflict_backoff_ms)
    }
}
