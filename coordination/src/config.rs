// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub redis: RedisConfig,
    pub lease: LeaseSettings,
    pub scheduler: SchedulerSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Lease timings as they appear in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSettings {
    /// Server-enforced lease duration in seconds.
    pub duration_seconds: u64,
    /// Cadence of the background renewal, strictly shorter than the duration.
    pub renew_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// How long a contended one-time caller waits before polling again.
    pub poll_interval_seconds: u64,
    /// Floor on the gap between recurring ticks against a shared target.
    pub minimum_spacing_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }

        if self.lease.duration_seconds == 0 {
            return Err("Lease duration_seconds must be greater than 0".to_string());
        }
        if self.lease.renew_interval_seconds == 0 {
            return Err("Lease renew_interval_seconds must be greater than 0".to_string());
        }
        // The renewal must land with a safety margin before the lease lapses.
        if self.lease.renew_interval_seconds >= self.lease.duration_seconds {
            return Err(
                "Lease renew_interval_seconds must be shorter than duration_seconds".to_string(),
            );
        }

        if self.scheduler.poll_interval_seconds == 0 {
            return Err("Scheduler poll_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.minimum_spacing_seconds == 0 {
            return Err("Scheduler minimum_spacing_seconds must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
            },
            lease: LeaseSettings {
                duration_seconds: 60,
                renew_interval_seconds: 40,
            },
            scheduler: SchedulerSettings {
                poll_interval_seconds: 5,
                minimum_spacing_seconds: 5,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
            },
        }
    }
}

impl LeaseSettings {
    pub fn to_lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            duration: Duration::from_secs(self.duration_seconds),
            renew_interval: Duration::from_secs(self.renew_interval_seconds),
        }
    }
}

/// Runtime timings for a single lease acquisition.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub duration: Duration,
    pub renew_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            renew_interval: Duration::from_secs(40),
        }
    }
}
