//! Server configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// SSH listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Diagnostics HTTP address (empty = disabled)
    pub debug_addr: String,

    /// Path to the key index database
    pub db_path: PathBuf,

    /// Path to the RSA-family SSH host key (PEM/OpenSSH)
    pub host_key_path: PathBuf,

    /// Path to the Ed25519 SSH host key (PEM/OpenSSH)
    pub host_key_ed25519_path: PathBuf,

    /// GitHub API token; falls back to the GITHUB_TOKEN environment variable
    #[serde(default)]
    pub github_token: String,

    /// Number of pooled read connections to the key index
    pub index_pool_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("keyhole");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            debug_addr: String::new(),
            db_path: data_dir.join("keys.db"),
            host_key_path: data_dir.join("host_key_rsa"),
            host_key_ed25519_path: data_dir.join("host_key_ed25519"),
            github_token: String::new(),
            index_pool_size: 3,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// The GitHub token from the config file or the environment.
    pub fn github_token(&self) -> Option<String> {
        if !self.github_token.is_empty() {
            return Some(self.github_token.clone());
        }
        std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty())
    }
}
