//! Gateway configuration.
//!
//! Configuration is layered: compiled-in defaults, then an optional
//! `labgw.toml` file, then `LABGW_`-prefixed environment variables
//! (`LABGW_DATABASE__HOST=db` overrides `[database] host`). Values are
//! validated after extraction so a typo fails startup instead of
//! surfacing later as odd runtime behavior.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "lab_instruments".to_string(),
            user: "labgw".to_string(),
            password: String::new(),
            ssl_mode: "disable".to_string(),
            max_connections: 100,
            min_connections: 25,
            max_lifetime_secs: 300,
            idle_timeout_secs: 60,
        }
    }
}

impl DatabaseConfig {
    /// Connection string in the form sqlx expects.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.name, self.ssl_mode
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// pretty | compact | json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8081,
            path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub jwt_secret: String,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            rate_limit_requests: 100,
            rate_limit_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub max_message_size: usize,
    pub max_concurrent_streams: u32,
    pub connection_timeout_secs: u64,
    pub keepalive_time_secs: u64,
    pub keepalive_timeout_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_message_size: 4 * 1024 * 1024,
            max_concurrent_streams: 1000,
            connection_timeout_secs: 30,
            keepalive_time_secs: 30,
            keepalive_timeout_secs: 5,
        }
    }
}

/// Liveness and housekeeping knobs consumed by the session registry and
/// the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Connections without a heartbeat for this long are demoted.
    pub heartbeat_timeout_secs: u64,
    /// Supervisor tick period.
    pub cleanup_interval_secs: u64,
    /// Entries offline longer than this are evicted from the registry.
    pub stale_connection_secs: u64,
    /// How many months of measurement partitions to create ahead.
    pub partition_lookahead_months: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 120,
            cleanup_interval_secs: 30,
            stale_connection_secs: 3600,
            partition_lookahead_months: 2,
        }
    }
}

impl LifecycleConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn stale_connection_horizon(&self) -> Duration {
        Duration::from_secs(self.stale_connection_secs)
    }
}

/// Root configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
    pub lifecycle: LifecycleConfig,
}

impl GatewayConfig {
    /// Load configuration from defaults, `labgw.toml`, and `LABGW_*` env.
    pub fn load() -> GatewayResult<Self> {
        Self::load_from(PathBuf::from("labgw.toml"))
    }

    /// Load with an explicit config file path (used by tests and the CLI).
    pub fn load_from(path: PathBuf) -> GatewayResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(&path));
        }
        let config: GatewayConfig = figment
            .merge(Env::prefixed("LABGW_").split("__"))
            .extract()
            .map_err(|e| GatewayError::validation(format!("configuration error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> GatewayResult<()> {
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(GatewayError::validation(format!(
                    "invalid log level: {other}"
                )))
            }
        }
        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            other => {
                return Err(GatewayError::validation(format!(
                    "invalid log format: {other}"
                )))
            }
        }
        if self.database.max_connections == 0 {
            return Err(GatewayError::validation(
                "database.max_connections must be positive",
            ));
        }
        if self.lifecycle.heartbeat_timeout_secs == 0 || self.lifecycle.cleanup_interval_secs == 0 {
            return Err(GatewayError::validation(
                "lifecycle intervals must be positive",
            ));
        }
        if self.server.tls_cert_path.is_some() != self.server.tls_key_path.is_some() {
            return Err(GatewayError::validation(
                "TLS requires both server.tls_cert_path and server.tls_key_path",
            ));
        }
        Ok(())
    }
}
