//! Configuration management for the fleet command central server
//!
//! This module handles loading, validation, and management of server
//! configuration from a `server.toml` file.

use anyhow::{Context, Result};
use shared::config::ServerConfig;
use std::path::PathBuf;
use tracing::{debug, info};

/// The expected name of the configuration file.
const SERVER_CONFIG_FILE: &str = "server.toml";

/// Manages the server's configuration.
/// This struct is responsible for the entire lifecycle of the server's
/// configuration, including initial loading, validation, and overrides.
pub struct ConfigManager {
    /// The full path to the configuration file.
    pub config_path: PathBuf,
    /// The loaded and validated server configuration, wrapped in an `Option`
    /// to represent the unloaded state, although the constructor ensures it's
    /// always `Some` on success.
    pub server_config: Option<ServerConfig>,
}

impl ConfigManager {
    /// Creates a new `ConfigManager` and immediately loads the configuration.
    /// This design ensures that a `ConfigManager` instance is always in a
    /// valid, loaded state if successfully created.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        // Accept either a directory containing `server.toml` or a direct
        // path to the file itself.
        let config_path = if config_path.is_dir() {
            config_path.join(SERVER_CONFIG_FILE)
        } else {
            config_path
        };

        if !config_path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file does not exist: {}",
                config_path.display()
            ));
        }

        let mut manager = Self {
            config_path,
            server_config: None,
        };
        manager.load_config()?;
        Ok(manager)
    }

    /// Loads the configuration file from disk, parses, and validates it.
    pub fn load_config(&mut self) -> Result<()> {
        info!(
            "Loading server configuration from {}",
            self.config_path.display()
        );

        let config_content = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;

        let server_config = ServerConfig::from_toml(&config_content).with_context(|| {
            format!(
                "Invalid server configuration in {}",
                self.config_path.display()
            )
        })?;

        debug!("Server configuration parameters (including defaults):");
        debug!("  listen_address: {}", server_config.listen_address);
        debug!(
            "  agent_listen_address: {}",
            server_config.agent_listen_address
        );
        debug!(
            "  api_key: {}",
            if server_config.api_key.is_empty() {
                "<empty>"
            } else {
                "<redacted>"
            }
        );
        debug!("  data_dir: {}", server_config.data_dir);
        debug!(
            "  data_retention_days: {}",
            server_config.data_retention_days
        );
        debug!(
            "  default_command_timeout_seconds: {}",
            server_config.default_command_timeout_seconds
        );
        debug!(
            "  timeout_check_interval_seconds: {}",
            server_config.timeout_check_interval_seconds
        );
        debug!(
            "  scheduler.max_concurrent_tasks: {}",
            server_config.scheduler.max_concurrent_tasks
        );
        debug!(
            "  scheduler.max_tasks_per_host: {}",
            server_config.scheduler.max_tasks_per_host
        );
        debug!(
            "  scheduler.worker_count: {}",
            server_config.scheduler.worker_count
        );
        debug!(
            "  scheduler.load_balance_strategy: {:?}",
            server_config.scheduler.load_balance_strategy
        );
        debug!(
            "  load_monitor.sample_interval_seconds: {}",
            server_config.load_monitor.sample_interval_seconds
        );
        debug!("  batch.batch_size: {}", server_config.batch.batch_size);

        self.server_config = Some(server_config);
        Ok(())
    }

    /// Applies command-line overrides to the loaded configuration and
    /// persists the merged result back to disk when anything changed.
    /// Returns whether the file was rewritten.
    pub fn override_and_persist_config(
        &mut self,
        listen_address: Option<String>,
        agent_listen_address: Option<String>,
        api_key: Option<String>,
        retention_days: Option<u32>,
        data_dir: Option<String>,
    ) -> Result<bool> {
        let config = self
            .server_config
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Server configuration not loaded"))?;

        let mut changed = false;
        if let Some(listen_address) = listen_address {
            if config.listen_address != listen_address {
                config.listen_address = listen_address;
                changed = true;
            }
        }
        if let Some(agent_listen_address) = agent_listen_address {
            if config.agent_listen_address != agent_listen_address {
                config.agent_listen_address = agent_listen_address;
                changed = true;
            }
        }
        if let Some(api_key) = api_key {
            if config.api_key != api_key {
                config.api_key = api_key;
                changed = true;
            }
        }
        if let Some(retention_days) = retention_days {
            if config.data_retention_days != retention_days {
                config.data_retention_days = retention_days;
                changed = true;
            }
        }
        if let Some(data_dir) = data_dir {
            if config.data_dir != data_dir {
                config.data_dir = data_dir;
                changed = true;
            }
        }

        if changed {
            config
                .validate()
                .context("Configuration invalid after applying overrides")?;
            let serialized =
                toml::to_string_pretty(config).context("Failed to serialize configuration")?;
            std::fs::write(&self.config_path, serialized).with_context(|| {
                format!("Failed to persist {}", self.config_path.display())
            })?;
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = write_config(
            r#"
listen_address = "127.0.0.1:8080"
agent_listen_address = "127.0.0.1:8081"
"#,
        );
        let manager = ConfigManager::new(file.path().to_path_buf()).unwrap();
        let config = manager.server_config.unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:8080");
        assert_eq!(config.scheduler.worker_count, 4);
    }

    #[test]
    fn test_missing_file_rejected() {
        let result = ConfigManager::new(PathBuf::from("/nonexistent/server.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_override_persists_changes() {
        let file = write_config(
            r#"
listen_address = "127.0.0.1:8080"
agent_listen_address = "127.0.0.1:8081"
"#,
        );
        let mut manager = ConfigManager::new(file.path().to_path_buf()).unwrap();

        let changed = manager
            .override_and_persist_config(
                Some("0.0.0.0:9090".to_string()),
                None,
                None,
                Some(7),
                None,
            )
            .unwrap();
        assert!(changed);

        // A fresh load sees the overridden values.
        let reloaded = ConfigManager::new(file.path().to_path_buf()).unwrap();
        let config = reloaded.server_config.unwrap();
        assert_eq!(config.listen_address, "0.0.0.0:9090");
        assert_eq!(config.data_retention_days, 7);
    }

    #[test]
    fn test_override_with_same_values_is_noop() {
        let file = write_config(
            r#"
listen_address = "127.0.0.1:8080"
agent_listen_address = "127.0.0.1:8081"
"#,
        );
        let mut manager = ConfigManager::new(file.path().to_path_buf()).unwrap();
        let changed = manager
            .override_and_persist_config(Some("127.0.0.1:8080".to_string()), None, None, None, None)
            .unwrap();
        assert!(!changed);
    }
}
