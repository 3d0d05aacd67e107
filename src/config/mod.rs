//! Typed configuration.
//!
//! Process-level settings (paths, endpoints) come from environment
//! variables, loaded once at startup. Engine tuning (pool sizes, queue
//! bounds, retry budgets, cadences) comes from an optional TOML file
//! merged over defaults that mirror the documented policy.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::ClassConfig;
use crate::error::{Error, Result};
use crate::model::{PriorityClass, TaskKind};
use crate::retry::{RetryPolicies, RetryPolicy};

/// Process-level configuration from environment variables.
///
/// In local dev, call `dotenvy::dotenv().ok()` before this.
#[derive(Debug)]
pub struct Config {
    pub database_path: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("FORAGE_DB").unwrap_or_else(|_| "forage.db".to_string()),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// Engine tuning, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub classes: ClassesConfig,
    /// Per-kind retry overrides, keyed by kind name
    /// (e.g. `[retry.scrape]`). Kinds not named keep their defaults.
    #[serde(default)]
    pub retry: HashMap<String, RetrySettings>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pump: PumpConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassesConfig {
    #[serde(default = "ClassSettings::high_priority")]
    pub high_priority: ClassSettings,
    #[serde(default = "ClassSettings::scraping")]
    pub scraping: ClassSettings,
    #[serde(default = "ClassSettings::processing")]
    pub processing: ClassSettings,
}

impl Default for ClassesConfig {
    fn default() -> Self {
        Self {
            high_priority: ClassSettings::high_priority(),
            scraping: ClassSettings::scraping(),
            processing: ClassSettings::processing(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassSettings {
    pub workers: usize,
    pub capacity: usize,
}

impl ClassSettings {
    fn high_priority() -> Self {
        Self {
            workers: 4,
            capacity: 128,
        }
    }

    fn scraping() -> Self {
        Self {
            workers: 2,
            capacity: 256,
        }
    }

    fn processing() -> Self {
        Self {
            workers: 2,
            capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub base_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    pub max_attempts: u32,
}

fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Cadence for source re-scan eligibility checks.
    #[serde(default = "default_source_scan_secs")]
    pub source_scan_secs: u64,
    /// Cadence for sweeping stuck pending content.
    #[serde(default = "default_pending_sweep_secs")]
    pub pending_sweep_secs: u64,
    /// Content still pending after this long counts as stuck.
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
}

fn default_source_scan_secs() -> u64 {
    900 // 15 minutes
}

fn default_pending_sweep_secs() -> u64 {
    600 // 10 minutes
}

fn default_stuck_after_secs() -> u64 {
    600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            source_scan_secs: default_source_scan_secs(),
            pending_sweep_secs: default_pending_sweep_secs(),
            stuck_after_secs: default_stuck_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PumpConfig {
    /// Cadence for promoting retry-due tasks and sweeping the cache.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

fn default_poll_secs() -> u64 {
    5
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file. A missing file is an error; call sites
    /// that treat the file as optional should check existence first.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad engine config {}: {e}", path.display())))
    }

    /// Dispatcher sizing per priority class.
    pub fn class_configs(&self) -> HashMap<PriorityClass, ClassConfig> {
        let mut configs = HashMap::new();
        for (class, settings) in [
            (PriorityClass::HighPriority, self.classes.high_priority),
            (PriorityClass::Scraping, self.classes.scraping),
            (PriorityClass::Processing, self.classes.processing),
        ] {
            configs.insert(
                class,
                ClassConfig {
                    workers: settings.workers,
                    capacity: settings.capacity,
                },
            );
        }
        configs
    }

    /// Per-kind retry policy table (overrides merged over defaults).
    pub fn retry_policies(&self) -> Result<RetryPolicies> {
        let mut overrides = HashMap::new();
        for (name, settings) in &self.retry {
            let kind: TaskKind = name
                .parse()
                .map_err(|_| Error::Config(format!("unknown task kind in [retry]: {name}")))?;
            overrides.insert(
                kind,
                RetryPolicy::new(
                    Duration::from_secs(settings.base_delay_secs),
                    settings.multiplier,
                    settings.max_attempts,
                ),
            );
        }
        Ok(RetryPolicies::new(overrides))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_secs(self.pump.poll_secs)
    }
}
