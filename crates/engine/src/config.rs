//! Engine configuration loaded from environment variables.

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

/// Engine configuration.
///
/// Environment variables are prefixed with `OPCHAIN_`:
/// - `OPCHAIN_NATS_URL`: NATS server URL for event publishing (optional)
/// - `OPCHAIN_CLONE_PREFIX`: Prefix applied to cloned playbook names
/// - `OPCHAIN_DEBUG`: Enable debug mode (default: false)
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// NATS URL for the event notifier. The engine runs without a broker
    /// when unset; events are then dropped.
    #[serde(default)]
    pub nats_url: Option<String>,

    /// Name prefix for cloned playbooks.
    #[serde(default = "default_clone_prefix")]
    pub clone_prefix: String,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,
}

fn default_clone_prefix() -> String {
    "Clone of ".to_string()
}

impl EngineConfig {
    /// Load configuration from environment variables prefixed with `OPCHAIN_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::prefixed("OPCHAIN_").from_env::<EngineConfig>()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            clone_prefix: default_clone_prefix(),
            debug: false,
        }
    }
}

/// Database configuration.
///
/// Environment variables are prefixed with `OPCHAIN_DB_`:
/// - `OPCHAIN_DB_HOST`: Database host (default: "localhost")
/// - `OPCHAIN_DB_PORT`: Database port (default: "5432")
/// - `OPCHAIN_DB_USER`: Database user
/// - `OPCHAIN_DB_PASSWORD`: Database password
/// - `OPCHAIN_DB_DATABASE`: Database name (default: "opchain")
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database host
    #[serde(default = "default_host")]
    pub host: String,

    /// Database port
    #[serde(default = "default_port")]
    pub port: String,

    /// Database user
    #[serde(default = "default_user")]
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Database name
    #[serde(default = "default_database")]
    pub database: String,

    /// Maximum connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> String {
    "5432".to_string()
}

fn default_user() -> String {
    "opchain".to_string()
}

fn default_database() -> String {
    "opchain".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    30
}

impl DatabaseConfig {
    /// Load configuration from environment variables prefixed with `OPCHAIN_DB_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::prefixed("OPCHAIN_DB_").from_env::<DatabaseConfig>()
    }

    /// Get PostgreSQL connection options.
    pub fn connect_options(&self) -> PgConnectOptions {
        let port: u16 = self.port.parse().unwrap_or(5432);

        PgConnectOptions::new()
            .host(&self.host)
            .port(port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config() {
        let config = EngineConfig::default();
        assert!(config.nats_url.is_none());
        assert_eq!(config.clone_prefix, "Clone of ");
        assert!(!config.debug);
    }

    #[test]
    fn test_default_database_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.database, "opchain");
        assert_eq!(config.max_connections, 10);
    }
}
