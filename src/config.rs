//! Application configuration module
//!
//! Loads the source target, sandbox, bridge and results settings from
//! environment variables (and `.env` when present).

use crate::bridge::BridgeSettings;
use crate::connection::ConnectionTarget;
use crate::db::PoolLimits;
use crate::sandbox::SandboxConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to parse {name}: {reason}")]
    ParseError { name: String, reason: String },
}

pub const DEFAULT_RESULTS_PATH: &str = "benchmark_results.txt";

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub source: ConnectionTarget,
    pub sandbox: SandboxConfig,
    pub bridge: BridgeSettings,
    pub results_path: PathBuf,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        // SOURCE_DATABASE_URL wins over the individual variables
        let source = match env.get("SOURCE_DATABASE_URL") {
            Some(url) => ConnectionTarget::from_connection_string(&url)
                .map_err(|e| ConfigError::InvalidValue(format!("SOURCE_DATABASE_URL: {}", e)))?,
            None => {
                let host = env
                    .get("SOURCE_DB_HOST")
                    .ok_or_else(|| ConfigError::MissingVar("SOURCE_DATABASE_URL or SOURCE_DB_HOST".into()))?;
                ConnectionTarget::new(
                    host,
                    env.parse("SOURCE_DB_PORT")?.unwrap_or(5432),
                    env.get("SOURCE_DB_USER").unwrap_or_else(|| "postgres".to_string()),
                    env.get("SOURCE_DB_PASSWORD").unwrap_or_default(),
                    env.get("SOURCE_DB_NAME").unwrap_or_else(|| "postgres".to_string()),
                    env.get("SOURCE_DB_SSLMODE"),
                )
                .map_err(|e| ConfigError::InvalidValue(e.to_string()))?
            }
        };

        let defaults = SandboxConfig::default();
        let sandbox = SandboxConfig {
            image: env.get("SANDBOX_IMAGE").unwrap_or(defaults.image),
            tag: env.get("SANDBOX_TAG").unwrap_or(defaults.tag),
            database: env.get("SANDBOX_DB_NAME").unwrap_or_else(|| source.database.clone()),
            user: env.get("SANDBOX_USER").unwrap_or(defaults.user),
            password: env.get("SANDBOX_PASSWORD").unwrap_or(defaults.password),
            ready_log: env.get("SANDBOX_READY_LOG").unwrap_or(defaults.ready_log),
            ready_occurrences: env
                .parse("SANDBOX_READY_OCCURRENCES")?
                .unwrap_or(defaults.ready_occurrences),
            startup_timeout: env
                .parse("SANDBOX_STARTUP_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.startup_timeout),
            pool: PoolLimits {
                max_size: env.parse("SANDBOX_POOL_SIZE")?.unwrap_or(defaults.pool.max_size),
                ..defaults.pool
            },
        };
        if sandbox.pool.max_size == 0 || sandbox.ready_occurrences == 0 {
            return Err(ConfigError::InvalidValue(
                "SANDBOX_POOL_SIZE and SANDBOX_READY_OCCURRENCES must be positive".into(),
            ));
        }

        let defaults = BridgeSettings::default();
        let bridge = BridgeSettings {
            server_name: env.get("BRIDGE_SERVER_NAME").unwrap_or(defaults.server_name),
            fetch_size: env.parse("BRIDGE_FETCH_SIZE")?.unwrap_or(defaults.fetch_size),
            remote_extensions: env.list("BRIDGE_REMOTE_EXTENSIONS").unwrap_or(defaults.remote_extensions),
            auxiliary_extensions: env.list("BRIDGE_AUX_EXTENSIONS").unwrap_or(defaults.auxiliary_extensions),
            keep_connections: defaults.keep_connections,
            host: env.get("BRIDGE_HOST"),
        };
        bridge
            .validate()
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

        let results_path = env
            .get("BENCHMARK_RESULTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS_PATH));

        Ok(Self {
            source,
            sandbox,
            bridge,
            results_path,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Non-blank value of `key`
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse().map_err(|e: T::Err| ConfigError::ParseError {
                    name: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Comma separated list; an explicitly empty list is allowed
    fn list(&self, key: &str) -> Option<Vec<String>> {
        (self.0)(key).map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }
}
