//! Process bootstrap: configuration file loading and logging.

use anyhow::Context;
use corral_dns_domain::DnsConfig;
use corral_dns_infrastructure::catalog::CatalogSeed;
use serde::Deserialize;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Command-line values that override the configuration file.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub dns_port: Option<u16>,
    pub bind_address: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            dns_port: default_dns_port(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    /// Startup registrations for the in-memory catalog.
    #[serde(default)]
    pub catalog: CatalogSeed,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_dns_port() -> u16 {
    8600
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: Option<&str>, overrides: CliOverrides) -> anyhow::Result<AppConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(Path::new(path))
                .with_context(|| format!("failed to read config file {path}"))?;
            toml::from_str(&raw).with_context(|| format!("failed to parse config file {path}"))?
        }
        None => AppConfig::default(),
    };

    if let Some(port) = overrides.dns_port {
        config.server.dns_port = port;
    }
    if let Some(bind) = overrides.bind_address {
        config.server.bind_address = bind;
    }
    if let Some(level) = overrides.log_level {
        config.server.log_level = level;
    }
    Ok(config)
}

/// `RUST_LOG` wins over the configured level when set.
pub fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let config = load_config(None, CliOverrides::default()).unwrap();
        assert_eq!(config.server.dns_port, 8600);
        assert_eq!(config.dns.domain, "corral");
        assert!(config.catalog.instances.is_empty());
    }

    #[test]
    fn overrides_win() {
        let config = load_config(
            None,
            CliOverrides {
                dns_port: Some(53),
                bind_address: Some("127.0.0.1".into()),
                log_level: Some("debug".into()),
            },
        )
        .unwrap();
        assert_eq!(config.server.dns_port, 53);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.log_level, "debug");
    }

    #[test]
    fn config_file_round_trip() {
        let raw = r#"
            [server]
            dns_port = 5300

            [dns]
            domain = "corral"
            recursors = ["1.1.1.1"]

            [dns.service_ttl]
            "db" = 10
            "*" = 5

            [[catalog.instances]]
            [catalog.instances.node]
            name = "foo"
            datacenter = "dc1"
            address = "10.0.0.1"
            [catalog.instances.service]
            name = "db"
            port = 5432
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.dns_port, 5300);
        assert_eq!(config.dns.recursors, vec!["1.1.1.1".to_string()]);
        assert_eq!(config.catalog.instances.len(), 1);
        assert_eq!(config.catalog.instances[0].service.name, "db");
    }
}
