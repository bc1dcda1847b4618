// Configuration management for the SoftMesh CLI
//
// Cross-platform config stored in:
// - macOS: ~/.config/softmesh/config.json
// - Linux: ~/.config/softmesh/config.json
// - Windows: %APPDATA%\softmesh\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use softmesh_core::EngineConfig;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity this node advertises to nearby devices
    pub identity: String,

    /// Engine tunables (timeouts, retry budget, transport priority)
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: format!("softmesh-{}", &short_suffix()),
            engine: EngineConfig::default().with_correlation(true),
        }
    }
}

fn short_suffix() -> String {
    // Time-derived suffix so two fresh nodes on one network stay distinct
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{:x}", millis % 0x100000)
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("softmesh");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value by dotted key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "identity" => self.identity = value.to_string(),
            "engine.correlate_across_transports" => {
                self.engine.correlate_across_transports =
                    value.parse().context("Expected true or false")?
            }
            "engine.silence_timeout_ms" => {
                self.engine.silence_timeout_ms = value.parse().context("Expected a number")?
            }
            "engine.handshake_timeout_ms" => {
                self.engine.handshake_timeout_ms = value.parse().context("Expected a number")?
            }
            "engine.max_retries" => {
                self.engine.max_retries = value.parse().context("Expected a number")?
            }
            "engine.heartbeat_timeout_ms" => {
                self.engine.heartbeat_timeout_ms = value.parse().context("Expected a number")?
            }
            "engine.tick_interval_ms" => {
                self.engine.tick_interval_ms = value.parse().context("Expected a number")?
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value by dotted key
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "identity" => self.identity.clone(),
            "engine.correlate_across_transports" => {
                self.engine.correlate_across_transports.to_string()
            }
            "engine.silence_timeout_ms" => self.engine.silence_timeout_ms.to_string(),
            "engine.handshake_timeout_ms" => self.engine.handshake_timeout_ms.to_string(),
            "engine.max_retries" => self.engine.max_retries.to_string(),
            "engine.heartbeat_timeout_ms" => self.engine.heartbeat_timeout_ms.to_string(),
            "engine.tick_interval_ms" => self.engine.tick_interval_ms.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        };
        Ok(value)
    }

    /// All keys understood by set/get
    pub fn keys() -> &'static [&'static str] {
        &[
            "identity",
            "engine.correlate_across_transports",
            "engine.silence_timeout_ms",
            "engine.handshake_timeout_ms",
            "engine.max_retries",
            "engine.heartbeat_timeout_ms",
            "engine.tick_interval_ms",
        ]
    }
}
