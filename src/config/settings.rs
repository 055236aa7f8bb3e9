//! Server settings
//!
//! Loads server settings from a TOML file. Command line flags override
//! whatever the file sets.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::server::ServerConfig;
use crate::transport::ROOT_NAMESPACE;

/// Default settings file name
pub const CONFIG_FILE: &str = "sockctx.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Bind address
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Trust `X-Forwarded-*` headers
    pub proxy: bool,
    /// Cookie signing keys, newest first
    pub keys: Vec<String>,
    /// Namespaces served besides the root one
    pub namespaces: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9000,
            proxy: false,
            keys: Vec::new(),
            namespaces: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Served namespaces, root first and without duplicates
    pub fn namespaces(&self) -> Vec<String> {
        let mut served = vec![ROOT_NAMESPACE.to_string()];
        for name in &self.namespaces {
            if !served.contains(name) {
                served.push(name.clone());
            }
        }
        served
    }

    pub fn into_server_config(self) -> ServerConfig {
        let namespaces = self.namespaces();
        ServerConfig::new(self.bind, self.port)
            .with_proxy(self.proxy)
            .with_keys(self.keys)
            .with_namespaces(namespaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.bind, "127.0.0.1");
        assert_eq!(settings.port, 9000);
        assert!(!settings.proxy);
        assert!(settings.keys.is_empty());
        assert_eq!(settings.namespaces(), vec!["/"]);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
port = 8080
proxy = true
keys = ["newest", "older"]
namespaces = ["/chat", "/", "/chat"]
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.bind, "127.0.0.1");
        assert_eq!(settings.port, 8080);
        assert!(settings.proxy);
        assert_eq!(settings.keys, vec!["newest", "older"]);
        assert_eq!(settings.namespaces(), vec!["/", "/chat"]);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "port = \"not a number\"").unwrap();

        let result = Settings::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_into_server_config() {
        let settings = Settings {
            bind: "0.0.0.0".to_string(),
            port: 7000,
            proxy: true,
            keys: vec!["secret".to_string()],
            namespaces: vec!["/admin".to_string()],
        };

        let config = settings.into_server_config();
        assert_eq!(config.socket_addr(), "0.0.0.0:7000");
        assert!(config.proxy);
        assert_eq!(config.keys, vec!["secret"]);
        assert_eq!(config.namespaces, vec!["/", "/admin"]);
    }
}
