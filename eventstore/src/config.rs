use std::env;

use thiserror::Error;
use tracing::debug;
use uuid::{uuid, Uuid};

/// Plan GUID applied to every application usage interval, whatever plan the
/// event itself declares. Deployments that price compute under a different
/// plan override it via `BILLING_COMPUTE_PLAN_GUID`.
pub const COMPUTE_PLAN_GUID: Uuid = uuid!("f4d4b95a-f55e-4593-8d54-3364c25798c4");

/// Plan name reported for application usage intervals.
pub const COMPUTE_PLAN_NAME: &str = "app";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Tunables of the event store itself.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// The built-in compute plan bound to `app` events.
    pub compute_plan_guid: Uuid,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            compute_plan_guid: COMPUTE_PLAN_GUID,
        }
    }
}

impl StoreConfig {
    /// Load store configuration from environment variables, falling back to
    /// the built-in defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let compute_plan_guid = match env::var("BILLING_COMPUTE_PLAN_GUID") {
            Ok(raw) => raw.parse::<Uuid>().map_err(|e| {
                ConfigError::InvalidConfig(format!("invalid BILLING_COMPUTE_PLAN_GUID: {e}"))
            })?,
            Err(_) => COMPUTE_PLAN_GUID,
        };

        debug!(%compute_plan_guid, "store configuration loaded");

        Ok(StoreConfig { compute_plan_guid })
    }
}

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Load database configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let connection_string = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnv("DATABASE_URL".to_string()))?;

        let max_connections = env::var("DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u32>()
            .map_err(|e| ConfigError::InvalidConfig(format!("invalid max_connections: {e}")))?;

        debug!(max_connections, "database configuration loaded");

        Ok(DatabaseConfig {
            connection_string,
            max_connections,
        })
    }
}
