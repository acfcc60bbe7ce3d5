//! TOML configuration of the control-plane process.
//!
//! Every section and key is optional. Durations are whole seconds.

use crate::error::{PghaError, Result};
use crate::ha::HaSettings;
use crate::meta::{Cluster, Node};
use crate::observability::{LogConfig, LogFormat};
use crate::rpc::ClientOptions;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    /// Handler bodies allowed to run at once
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            password: String::new(),
            workers: default_workers(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    4342
}

fn default_workers() -> usize {
    64
}

/// How the control plane reaches host agents
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_conn_timeout")]
    pub conn_timeout: u64,
    #[serde(default = "default_data_timeout")]
    pub data_timeout: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: default_agent_port(),
            password: String::new(),
            conn_timeout: default_conn_timeout(),
            data_timeout: default_data_timeout(),
        }
    }
}

impl AgentConfig {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            conn_timeout: Duration::from_secs(self.conn_timeout),
            data_timeout: Duration::from_secs(self.data_timeout),
        }
    }
}

fn default_agent_port() -> u16 {
    4243
}

fn default_conn_timeout() -> u64 {
    10
}

fn default_data_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct HaConfig {
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval: u64,
    #[serde(default = "default_restart_retries")]
    pub restart_retries: u32,
    #[serde(default = "default_restart_delay")]
    pub restart_delay: u64,
    #[serde(default = "default_failback_settle")]
    pub failback_settle: u64,
    #[serde(default = "default_fence_settle")]
    pub fence_settle: u64,
    #[serde(default = "default_max_failback_count")]
    pub max_failback_count: u32,
    #[serde(default = "default_sql_timeout")]
    pub sql_timeout: u64,
    #[serde(default = "default_task_workers")]
    pub task_workers: usize,
    /// Finished tasks kept per cluster
    #[serde(default = "default_task_history")]
    pub task_history: usize,
    /// Echo requests sent per host by the isolation check
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default = "default_fence_timeout")]
    pub fence_timeout: u64,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            discovery_interval: default_discovery_interval(),
            restart_retries: default_restart_retries(),
            restart_delay: default_restart_delay(),
            failback_settle: default_failback_settle(),
            fence_settle: default_fence_settle(),
            max_failback_count: default_max_failback_count(),
            sql_timeout: default_sql_timeout(),
            task_workers: default_task_workers(),
            task_history: default_task_history(),
            ping_count: default_ping_count(),
            ping_timeout: default_ping_timeout(),
            fence_timeout: default_fence_timeout(),
        }
    }
}

fn default_discovery_interval() -> u64 {
    10
}

fn default_restart_retries() -> u32 {
    3
}

fn default_restart_delay() -> u64 {
    5
}

fn default_failback_settle() -> u64 {
    5
}

fn default_fence_settle() -> u64 {
    2
}

fn default_max_failback_count() -> u32 {
    3
}

fn default_sql_timeout() -> u64 {
    10
}

fn default_task_workers() -> usize {
    8
}

fn default_task_history() -> usize {
    100
}

fn default_ping_count() -> u32 {
    3
}

fn default_ping_timeout() -> u64 {
    3
}

fn default_fence_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_lb_timeout")]
    pub timeout: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            timeout: default_lb_timeout(),
        }
    }
}

fn default_lb_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// text or json
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub ha: HaConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Seed records for the in-memory metadata store
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| PghaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PghaError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if LogConfig::parse_level(&self.logging.level).is_none() {
            return Err(PghaError::Config(format!(
                "invalid log level '{}'",
                self.logging.level
            )));
        }
        if LogFormat::parse(&self.logging.format).is_none() {
            return Err(PghaError::Config(format!(
                "invalid log format '{}'",
                self.logging.format
            )));
        }
        for node in &self.nodes {
            if !self.clusters.iter().any(|c| c.id == node.cluster_id) {
                return Err(PghaError::Config(format!(
                    "node {} refers to unknown cluster {}",
                    node.id, node.cluster_id
                )));
            }
        }
        Ok(())
    }

    pub fn ha_settings(&self) -> HaSettings {
        let ha = &self.ha;
        HaSettings {
            discovery_interval: Duration::from_secs(ha.discovery_interval),
            restart_retries: ha.restart_retries,
            restart_delay: Duration::from_secs(ha.restart_delay),
            failback_settle: Duration::from_secs(ha.failback_settle),
            fence_settle: Duration::from_secs(ha.fence_settle),
            max_failback_count: ha.max_failback_count,
            sql_timeout: Duration::from_secs(ha.sql_timeout),
            ..HaSettings::default()
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: LogConfig::parse_level(&self.logging.level).unwrap_or(tracing::Level::INFO),
            format: LogFormat::parse(&self.logging.format).unwrap_or_default(),
            file_path: self.logging.file.clone(),
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ClusterState;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server_addr(), "127.0.0.1:4342");
        assert_eq!(config.ha.max_failback_count, 3);
        assert_eq!(config.ha_settings().restart_delay, Duration::from_secs(5));
        assert!(config.clusters.is_empty());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 5000
password = "secret"

[ha]
restart_retries = 1
fence_settle = 0

[logging]
level = "debug"
format = "json"

[[clusters]]
id = 1
name = "orders"
vip = "10.0.0.100"
state = "OFFLINE"
auto_failback = true

[[nodes]]
id = 1
cluster_id = 1
host = "10.0.0.1"
pgdata = "/data/pg"
is_primary = true

[[nodes]]
id = 2
cluster_id = 1
host = "10.0.0.2"
pgdata = "/data/pg"
up_db_id = 1
score = 2
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.password, "secret");
        assert_eq!(config.ha_settings().restart_retries, 1);
        assert_eq!(config.ha_settings().fence_settle, Duration::ZERO);
        assert_eq!(config.log_config().format, LogFormat::Json);
        assert_eq!(config.clusters[0].state, ClusterState::Offline);
        assert!(config.clusters[0].auto_failback);
        assert_eq!(config.nodes[1].up_db_id, Some(1));
        assert_eq!(config.nodes[1].port, 5432);
    }

    #[test]
    fn test_rejects_orphan_node() {
        let content = r#"
[[nodes]]
id = 9
cluster_id = 4
host = "h"
pgdata = "/d"
"#;
        assert!(matches!(Config::from_toml(content), Err(PghaError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_level() {
        let content = "[logging]\nlevel = \"loud\"\n";
        assert!(Config::from_toml(content).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::from_file("/nonexistent/pgha.toml").is_err());
        assert!(Config::load(None).is_ok());
    }
}
