use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StorageStrategy {
    Memory,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionOptions {
    #[serde(default)]
    pub force: bool,
}

/// The configuration contract recognized by the runtime. Deserializable from
/// TOML or constructed directly — there is no dedicated config-service crate,
/// matching the plain-struct configuration style used throughout the
/// surrounding client and server modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub remote_url: String,
    pub local_db_name: String,
    pub storage_strategy: StorageStrategy,
    pub namespace: String,
    pub database: String,
    #[serde(default)]
    pub provision: ProvisionOptions,
    pub log_level: LogLevel,
    /// Deadline for a single remote call (`register_query`, `heartbeat`,
    /// `fetch_records`, ...) before it fails with `RemoteTimeout`. Remote
    /// calls otherwise carry no built-in timeout, so this is configurable
    /// rather than hardcoded.
    #[serde(default = "default_remote_call_timeout_ms")]
    pub remote_call_timeout_ms: u64,
}

fn default_remote_call_timeout_ms() -> u64 {
    10_000
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn local_connect_url(&self) -> String {
        match self.storage_strategy {
            StorageStrategy::Memory => "sqlite::memory:".to_string(),
            StorageStrategy::Persistent => format!("sqlite://{}", self.local_db_name),
        }
    }

    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_strategy_maps_to_in_memory_url() {
        let cfg = Config {
            remote_url: "ws://localhost:8000/rpc".into(),
            local_db_name: "client.db".into(),
            storage_strategy: StorageStrategy::Memory,
            namespace: "ns".into(),
            database: "db".into(),
            provision: ProvisionOptions::default(),
            log_level: LogLevel::Info,
            remote_call_timeout_ms: default_remote_call_timeout_ms(),
        };
        assert_eq!(cfg.local_connect_url(), "sqlite::memory:");
    }

    #[test]
    fn persistent_strategy_maps_to_file_url() {
        let cfg = Config {
            remote_url: "ws://localhost:8000/rpc".into(),
            local_db_name: "client.db".into(),
            storage_strategy: StorageStrategy::Persistent,
            namespace: "ns".into(),
            database: "db".into(),
            provision: ProvisionOptions::default(),
            log_level: LogLevel::Info,
            remote_call_timeout_ms: default_remote_call_timeout_ms(),
        };
        assert_eq!(cfg.local_connect_url(), "sqlite://client.db");
    }

    #[test]
    fn parses_from_toml() {
        let toml = r#"
            remote_url = "ws://localhost:8000/rpc"
            local_db_name = "client.db"
            storage_strategy = "persistent"
            namespace = "app"
            database = "main"
            log_level = "debug"
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.namespace, "app");
        assert_eq!(cfg.storage_strategy, StorageStrategy::Persistent);
        assert!(!cfg.provision.force);
        assert_eq!(cfg.remote_call_timeout(), Duration::from_millis(10_000));
    }

    #[test]
    fn remote_call_timeout_is_configurable() {
        let toml = r#"
            remote_url = "ws://localhost:8000/rpc"
            local_db_name = "client.db"
            storage_strategy = "persistent"
            namespace = "app"
            database = "main"
            log_level = "debug"
            remote_call_timeout_ms = 2500
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.remote_call_timeout(), Duration::from_millis(2500));
    }
}
