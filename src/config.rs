//! Configuration for taskdeck-sync
//!
//! One TOML file covers both roles: `[server]`/`[database]` for the sync
//! service, `[client]` for a device running sync cycles against it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Present on devices only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the sync service
    pub server_url: String,
    /// API token issued by `taskdeck-sync token`
    pub token: String,
    /// Taskdeck project this device mirrors (one device, one project)
    #[serde(default = "default_project")]
    pub project: String,
    /// Where snapshot, lock and conflict log live
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// The Taskdeck board file the built-in adapter reads and writes
    pub host_file: PathBuf,
    /// Seconds between daemon cycles
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Per-request HTTP timeout
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3030
}

fn default_db_path() -> PathBuf {
    PathBuf::from("taskdeck-sync.sqlite")
}

fn default_project() -> String {
    "inbox".to_string()
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("taskdeck-sync"))
        .unwrap_or_else(|| PathBuf::from(".taskdeck-sync"))
}

fn default_interval() -> u64 {
    30
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            client: None,
        }
    }
}

impl Config {
    /// Default config path
    pub fn default_path() -> Result<PathBuf> {
        // Check environment variable first
        if let Ok(env_path) = std::env::var("TASKDECK_SYNC_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        // Check for config in current directory
        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        // Check /data/config.toml (Docker default)
        let data_config = PathBuf::from("/data/config.toml");
        if data_config.exists() {
            return Ok(data_config);
        }

        // Then check XDG config
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("taskdeck-sync");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from default path
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // Add helpful comments
        let with_comments = format!(
            "# taskdeck-sync configuration\n\
             # See: https://github.com/taskdeck/taskdeck-sync\n\n\
             {}\n\n\
             # Issue device tokens with: taskdeck-sync token --name <device-name>\n\
             # Devices also need a [client] section with server_url, token and host_file.\n",
            content
        );

        std::fs::write(path, with_comments).context("Failed to write config file")?;

        Ok(())
    }

    /// The client section, required for device subcommands.
    pub fn client(&self) -> Result<&ClientConfig> {
        self.client
            .as_ref()
            .context("config has no [client] section; this host is not set up as a device")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_client_section_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [client]
            server_url = "http://sync.example:3030"
            token = "tds_abc"
            host_file = "/tmp/board.json"
            "#,
        )
        .unwrap();

        let client = cfg.client().unwrap();
        assert_eq!(client.project, "inbox");
        assert_eq!(client.interval_secs, 30);
        assert_eq!(client.http_timeout_secs, 30);
        assert_eq!(cfg.server.port, 3030);
    }

    #[test]
    fn server_only_config_has_no_client() {
        let cfg: Config = toml::from_str("[server]\nport = 4000\n").unwrap();
        assert_eq!(cfg.server.port, 4000);
        assert!(cfg.client().is_err());
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = Config::default();
        cfg.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.server.bind, "0.0.0.0");
        assert!(reloaded.client.is_none());
    }
}
