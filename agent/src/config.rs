//! Configuration management for the fleet agent
//!
//! This module handles loading, validation, and management of agent
//! configuration from an `agent.toml` file.

use anyhow::{Context, Result};
use shared::config::AgentConfig;
use std::path::PathBuf;
use tracing::{debug, info};

/// The expected name of the configuration file.
const AGENT_CONFIG_FILE: &str = "agent.toml";

/// Manages the agent's configuration.
pub struct ConfigManager {
    /// The full path to the configuration file.
    pub config_path: PathBuf,
    /// The loaded and validated agent configuration.
    pub agent_config: Option<AgentConfig>,
}

impl ConfigManager {
    /// Creates a new `ConfigManager` and immediately loads the
    /// configuration, so an instance is always in a valid state if
    /// successfully created.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        // Accept either a directory containing `agent.toml` or a direct
        // path to the file itself.
        let config_path = if config_path.is_dir() {
            config_path.join(AGENT_CONFIG_FILE)
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
            agent_config: None,
        };
        manager.load_config()?;
        Ok(manager)
    }

    /// Loads the configuration file from disk, parses, and validates it.
    pub fn load_config(&mut self) -> Result<()> {
        info!(
            "Loading agent configuration from {}",
            self.config_path.display()
        );

        let config_content = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;

        let agent_config = AgentConfig::from_toml(&config_content).with_context(|| {
            format!(
                "Invalid agent configuration in {}",
                self.config_path.display()
            )
        })?;

        debug!("Agent configuration parameters (including defaults):");
        debug!("  host_id: {}", agent_config.host_id);
        debug!("  server_url: {}", agent_config.server_url);
        debug!(
            "  api_key: {}",
            if agent_config.api_key.is_empty() {
                "<empty>"
            } else {
                "<redacted>"
            }
        );
        debug!(
            "  report_interval_seconds: {}",
            agent_config.report_interval_seconds
        );
        debug!(
            "  retry_interval_seconds: {}",
            agent_config.retry_interval_seconds
        );
        debug!(
            "  default_command_timeout_seconds: {}",
            agent_config.default_command_timeout_seconds
        );
        debug!("  max_output_bytes: {}", agent_config.max_output_bytes);

        self.agent_config = Some(agent_config);
        Ok(())
    }

    /// Applies command-line overrides and persists the merged configuration
    /// back to disk when anything changed. Returns whether the file was
    /// rewritten.
    pub fn override_and_persist_config(
        &mut self,
        host_id: Option<String>,
        server_url: Option<String>,
        api_key: Option<String>,
    ) -> Result<bool> {
        let config = self
            .agent_config
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Agent configuration not loaded"))?;

        let mut changed = false;
        if let Some(host_id) = host_id {
            if config.host_id != host_id {
                config.host_id = host_id;
                changed = true;
            }
        }
        if let Some(server_url) = server_url {
            if config.server_url != server_url {
                config.server_url = server_url;
                changed = true;
            }
        }
        if let Some(api_key) = api_key {
            if config.api_key != api_key {
                config.api_key = api_key;
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

    #[test]
    fn test_load_valid_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
host_id = "web-01"
server_url = "http://127.0.0.1:8081"
"#
        )
        .unwrap();

        let manager = ConfigManager::new(file.path().to_path_buf()).unwrap();
        let config = manager.agent_config.unwrap();
        assert_eq!(config.host_id, "web-01");
        assert_eq!(config.report_interval_seconds, 30);
    }

    #[test]
    fn test_missing_file_rejected() {
        assert!(ConfigManager::new(PathBuf::from("/nonexistent/agent.toml")).is_err());
    }

    #[test]
    fn test_override_rejects_invalid_result() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
host_id = "web-01"
server_url = "http://127.0.0.1:8081"
"#
        )
        .unwrap();

        let mut manager = ConfigManager::new(file.path().to_path_buf()).unwrap();
        // An override that fails validation must not be persisted.
        let result =
            manager.override_and_persist_config(Some("bad id".to_string()), None, None);
        assert!(result.is_err());
    }

    #[test]
    fn test_override_persists() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
host_id = "web-01"
server_url = "http://127.0.0.1:8081"
"#
        )
        .unwrap();

        let mut manager = ConfigManager::new(file.path().to_path_buf()).unwrap();
        let changed = manager
            .override_and_persist_config(Some("web-02".to_string()), None, None)
            .unwrap();
        assert!(changed);

        let reloaded = ConfigManager::new(file.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.agent_config.unwrap().host_id, "web-02");
    }
}
