use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::BackendKind;

/// Environment variable that overrides the configuration file location.
pub const CONFIG_ENV: &str = "REMOTE_VTAB_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdapterConfig {
    /// Seconds to wait for a backend connection to open.
    pub connect_timeout_secs: u64,
    pub modules: ModuleNames,
    pub postgres: PostgresTlsConfig,
    /// Named connections the command-line driver can attach.
    pub connections: Vec<SavedConnection>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            modules: ModuleNames::default(),
            postgres: PostgresTlsConfig::default(),
            connections: Vec::new(),
        }
    }
}

/// SQLite module name installed for each backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModuleNames {
    pub postgres: String,
    pub mssql: String,
    pub mysql: String,
}

impl Default for ModuleNames {
    fn default() -> Self {
        Self {
            postgres: String::from("pgsql"),
            mssql: String::from("mssql"),
            mysql: String::from("mysql"),
        }
    }
}

impl ModuleNames {
    pub fn name(&self, kind: BackendKind) -> &str {
        match kind {
            BackendKind::Postgres => &self.postgres,
            BackendKind::Mssql => &self.mssql,
            BackendKind::Mysql => &self.mysql,
        }
    }
}

/// Certificate handling for TLS connections to PostgreSQL.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostgresTlsConfig {
    /// Accept invalid/self-signed certificates. Use with caution.
    pub accept_invalid_certs: bool,
    /// Optional path to a PEM bundle of extra root certificates.
    pub ca_cert_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedConnection {
    pub name: String,
    pub backend: BackendKind,
    pub connection_string: String,
    /// Remote table attached by default.
    pub table: String,
}

impl AdapterConfig {
    pub fn get_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("remote-vtab")
            .join("config.toml")
    }

    /// Load the configuration file, falling back to defaults when it is absent.
    pub fn load() -> Result<Self> {
        let path = Self::get_config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AdapterConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn find_connection(&self, name: &str) -> Option<&SavedConnection> {
        self.connections
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}
