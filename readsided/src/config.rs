//! Daemon configuration.
//!
//! Loads configuration from `READSIDE_*` environment variables with sensible
//! defaults.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use readside_domain::{AggregateEventTag, WorkerId};
use readside_eventlog::SubscribeOptions;
use readside_projector::{ProjectorConfig, RetryPolicy};

use crate::error::{DaemonError, DaemonResult};

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiConfig,

    /// Projection configuration
    pub projection: ProjectionConfig,

    /// PostgreSQL connection string; the in-memory backend is used without it
    pub database_url: Option<String>,

    /// Environment (test, development, production)
    pub environment: Environment,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// Projection configuration.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// Identity of this worker in the cluster
    pub worker_id: WorkerId,
    /// Tag name prefix (`HelloEvent` gives `HelloEvent0..N`)
    pub tag_base: String,
    /// Number of tag partitions
    pub num_shards: u32,
    /// Most partitions this worker owns at once
    pub max_partitions: usize,
    pub lease_ttl_ms: u64,
    /// Must be below `lease_ttl_ms`
    pub renew_interval_ms: u64,
    /// Pause before claiming a busy or lost partition again
    pub claim_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// Attempts per event before the partition faults
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> DaemonResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let config = Self {
            api: Self::load_api_config(&vars)?,
            projection: Self::load_projection_config(&vars)?,
            database_url: vars.get("DATABASE_URL"),
            environment: Self::load_environment(&vars)?,
        };
        config.projection.validate()?;

        Ok(config)
    }

    /// Create test configuration.
    pub fn test() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
            },
            projection: ProjectionConfig {
                num_shards: 2,
                lease_ttl_ms: 1_000,
                renew_interval_ms: 200,
                claim_interval_ms: 50,
                poll_interval_ms: 10,
                batch_size: 16,
                max_attempts: 3,
                backoff_initial_ms: 5,
                backoff_max_ms: 20,
                ..ProjectionConfig::default()
            },
            database_url: None,
            environment: Environment::Test,
        }
    }

    fn load_environment(vars: &Vars<'_>) -> DaemonResult<Environment> {
        let env_str = vars.get("READSIDE_ENV").unwrap_or_else(|| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid READSIDE_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_api_config(vars: &Vars<'_>) -> DaemonResult<ApiConfig> {
        let host = vars.get("READSIDE_API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = vars.parse("READSIDE_API_PORT", 8080u16)?;

        Ok(ApiConfig { host, port })
    }

    fn load_projection_config(vars: &Vars<'_>) -> DaemonResult<ProjectionConfig> {
        let defaults = ProjectionConfig::default();

        let worker_id = match vars.get("READSIDE_WORKER_ID") {
            Some(id) => WorkerId::new(id)
                .map_err(|e| DaemonError::Config(format!("Invalid READSIDE_WORKER_ID: {}", e)))?,
            None => defaults.worker_id,
        };

        Ok(ProjectionConfig {
            worker_id,
            tag_base: vars.get("READSIDE_TAG_BASE").unwrap_or(defaults.tag_base),
            num_shards: vars.parse("READSIDE_NUM_SHARDS", defaults.num_shards)?,
            max_partitions: vars.parse("READSIDE_MAX_PARTITIONS", defaults.max_partitions)?,
            lease_ttl_ms: vars.parse("READSIDE_LEASE_TTL_MS", defaults.lease_ttl_ms)?,
            renew_interval_ms: vars.parse("READSIDE_RENEW_INTERVAL_MS", defaults.renew_interval_ms)?,
            claim_interval_ms: vars.parse("READSIDE_CLAIM_INTERVAL_MS", defaults.claim_interval_ms)?,
            poll_interval_ms: vars.parse("READSIDE_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            batch_size: vars.parse("READSIDE_BATCH_SIZE", defaults.batch_size)?,
            max_attempts: vars.parse("READSIDE_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_initial_ms: vars
                .parse("READSIDE_BACKOFF_INITIAL_MS", defaults.backoff_initial_ms)?,
            backoff_max_ms: vars.parse("READSIDE_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
        })
    }
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> DaemonResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(val) => val
                .trim()
                .parse()
                .map_err(|e| DaemonError::Config(format!("Invalid {} value: {} ({})", key, val, e))),
            None => Ok(default),
        }
    }
}

impl ProjectionConfig {
    /// Reject settings the projector cannot run with.
    pub fn validate(&self) -> DaemonResult<()> {
        let positive = [
            ("READSIDE_NUM_SHARDS", self.num_shards as u64),
            ("READSIDE_MAX_PARTITIONS", self.max_partitions as u64),
            ("READSIDE_LEASE_TTL_MS", self.lease_ttl_ms),
            ("READSIDE_RENEW_INTERVAL_MS", self.renew_interval_ms),
            ("READSIDE_POLL_INTERVAL_MS", self.poll_interval_ms),
            ("READSIDE_BATCH_SIZE", self.batch_size as u64),
            ("READSIDE_MAX_ATTEMPTS", self.max_attempts as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(DaemonError::Config(format!("{} must be greater than zero", key)));
            }
        }

        if self.renew_interval_ms >= self.lease_ttl_ms {
            return Err(DaemonError::Config(format!(
                "READSIDE_RENEW_INTERVAL_MS ({}) must be below READSIDE_LEASE_TTL_MS ({})",
                self.renew_interval_ms, self.lease_ttl_ms
            )));
        }

        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(DaemonError::Config(format!(
                "READSIDE_BACKOFF_INITIAL_MS ({}) exceeds READSIDE_BACKOFF_MAX_MS ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }

        self.tags().map(|_| ())
    }

    /// The tag set this daemon projects.
    pub fn tags(&self) -> DaemonResult<AggregateEventTag> {
        AggregateEventTag::sharded(self.tag_base.clone(), self.num_shards)
            .map_err(|e| DaemonError::Config(format!("Invalid tag set: {}", e)))
    }

    pub fn claim_interval(&self) -> Duration {
        Duration::from_millis(self.claim_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.backoff_initial_ms),
            max_backoff: Duration::from_millis(self.backoff_max_ms),
        }
    }

    /// Settings for one per-tag projector.
    pub fn projector_config(&self) -> ProjectorConfig {
        ProjectorConfig {
            worker_id: self.worker_id.clone(),
            lease_ttl: Duration::from_millis(self.lease_ttl_ms),
            renew_interval: Duration::from_millis(self.renew_interval_ms),
            retry: self.retry_policy(),
            subscribe: SubscribeOptions {
                batch_size: self.batch_size,
                poll_interval: Duration::from_millis(self.poll_interval_ms),
            },
        }
    }
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            tag_base: "HelloEvent".to_string(),
            num_shards: 4,
            max_partitions: 4,
            lease_ttl_ms: 10_000,
            renew_interval_ms: 3_000,
            claim_interval_ms: 2_000,
            poll_interval_ms: 500,
            batch_size: 256,
            max_attempts: 5,
            backoff_initial_ms: 100,
            backoff_max_ms: 10_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            projection: ProjectionConfig::default(),
            database_url: None,
            environment: Environment::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
