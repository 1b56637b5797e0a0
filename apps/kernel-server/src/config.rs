// [[MISSION]]/apps/kernel-server/src/config.rs
// Purpose: Process configuration, sourced from the environment at boot.
// Architecture: Application Boot
// Dependencies: anyhow

use anyhow::{bail, Context};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    pub port: u16,

    /// Redis connection string. Without it projects live in memory only.
    pub redis_url: Option<String>,

    /// Base URL of a remote agent service. Without it steps use canned results.
    pub agent_endpoint: Option<String>,

    /// Spacing between two progress ticks of a step.
    pub progress_tick_ms: u64,

    /// Pause inserted after each completed step.
    pub step_settle_ms: u64,

    /// How long a stopped run stays queryable before removal.
    pub stop_grace_ms: u64,

    pub step_timeout_secs: u64,
}

fn default_port() -> u16 {
    8000
}

fn default_progress_tick_ms() -> u64 {
    500
}

fn default_step_settle_ms() -> u64 {
    1000
}

fn default_stop_grace_ms() -> u64 {
    1000
}

fn default_step_timeout_secs() -> u64 {
    120
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            redis_url: None,
            agent_endpoint: None,
            progress_tick_ms: default_progress_tick_ms(),
            step_settle_ms: default_step_settle_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl KernelConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = lookup("KERNEL_PORT") {
            config.port = port
                .parse()
                .with_context(|| format!("KERNEL_PORT is not a port: {}", port))?;
        }
        config.redis_url = lookup("REDIS_URL").filter(|v| !v.is_empty());
        config.agent_endpoint = lookup("AGENT_ENDPOINT")
            .filter(|v| !v.is_empty())
            .map(|v| v.trim_end_matches('/').to_string());

        config.progress_tick_ms = parse_u64(&lookup, "PROGRESS_TICK_MS", config.progress_tick_ms)?;
        config.step_settle_ms = parse_u64(&lookup, "STEP_SETTLE_MS", config.step_settle_ms)?;
        config.stop_grace_ms = parse_u64(&lookup, "STOP_GRACE_MS", config.stop_grace_ms)?;
        config.step_timeout_secs =
            parse_u64(&lookup, "STEP_TIMEOUT_SECS", config.step_timeout_secs)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            bail!("port must be non-zero");
        }
        if self.step_timeout_secs == 0 {
            bail!("step timeout must be at least one second");
        }
        Ok(())
    }

    pub fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms)
    }

    pub fn step_settle(&self) -> Duration {
        Duration::from_millis(self.step_settle_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn parse_u64<F>(lookup: &F, key: &str, fallback: u64) -> anyhow::Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{} is not a non-negative integer: {}", key, raw)),
        None => Ok(fallback),
    }
}
