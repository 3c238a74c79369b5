//! querystate configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Main querystate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Module-wide toggles consulted by snapshot producers
    pub module: ModuleConfig,

    /// Channel transport sizing and timeouts
    pub transport: TransportConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .querystate.yml
        let local_config = PathBuf::from(".querystate.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/querystate/querystate.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("querystate").join("querystate.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed: a broken config file is reported later by [`Config::load`].
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".querystate.yml")];
                if let Some(config_dir) = dirs::config_dir() {
                    paths.push(config_dir.join("querystate").join("querystate.yml"));
                }
                paths
            }
        };
        candidates
            .iter()
            .find(|p| p.exists())
            .and_then(|p| Self::load_from_file(p).ok())
            .and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Module-wide toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Enable the whole mechanism
    pub enable: bool,

    /// Collect timing data, not just row counts
    #[serde(rename = "enable-timing")]
    pub enable_timing: bool,

    /// Collect buffer usage
    #[serde(rename = "enable-buffers")]
    pub enable_buffers: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            enable: true,
            enable_timing: false,
            enable_buffers: false,
        }
    }
}

/// Channel transport sizing and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of the shared channel in bytes
    #[serde(rename = "queue-size")]
    pub queue_size: usize,

    /// Largest piece a message is split into
    #[serde(rename = "chunk-size")]
    pub chunk_size: usize,

    /// Attempts per piece before the channel is declared detached
    #[serde(rename = "send-attempts")]
    pub send_attempts: u32,

    /// Backoff between send attempts in milliseconds
    #[serde(rename = "write-delay-ms")]
    pub write_delay_ms: u64,

    /// Bound on receiving one helper reply; must exceed the send timeout
    #[serde(rename = "receive-timeout-ms")]
    pub receive_timeout_ms: u64,

    /// Bound on a producer waiting to be bound as sender
    #[serde(rename = "send-timeout-ms")]
    pub send_timeout_ms: u64,

    /// Wait slice while reassembling a partially received message
    #[serde(rename = "part-receive-delay-ms")]
    pub part_receive_delay_ms: u64,

    /// Bound on the identity round trip
    #[serde(rename = "identity-timeout-ms")]
    pub identity_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        debug!("TransportConfig::default: called");
        Self {
            queue_size: 16 * 1024,
            chunk_size: 1024,
            send_attempts: 6,
            write_delay_ms: 100,
            receive_timeout_ms: 6000,
            send_timeout_ms: 3000,
            part_receive_delay_ms: 1000,
            identity_timeout_ms: 6000,
        }
    }
}

impl TransportConfig {
    /// Check the ordering constraints between the timeouts and sizes
    pub fn validate(&self) -> Result<()> {
        if self.receive_timeout_ms <= self.send_timeout_ms {
            return Err(eyre::eyre!(
                "receive-timeout-ms ({}) must be larger than send-timeout-ms ({})",
                self.receive_timeout_ms,
                self.send_timeout_ms
            ));
        }
        if self.part_receive_delay_ms == 0 || self.part_receive_delay_ms >= self.receive_timeout_ms {
            return Err(eyre::eyre!(
                "part-receive-delay-ms ({}) must be positive and less than receive-timeout-ms ({})",
                self.part_receive_delay_ms,
                self.receive_timeout_ms
            ));
        }
        if self.chunk_size == 0 || self.chunk_size > self.queue_size {
            return Err(eyre::eyre!(
                "chunk-size ({}) must be positive and fit in queue-size ({})",
                self.chunk_size,
                self.queue_size
            ));
        }
        if self.send_attempts == 0 {
            return Err(eyre::eyre!("send-attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn part_receive_delay(&self) -> Duration {
        Duration::from_millis(self.part_receive_delay_ms)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }

    /// Short timeouts for tests and demos
    pub fn fast() -> Self {
        Self {
            queue_size: 16 * 1024,
            chunk_size: 1024,
            send_attempts: 6,
            write_delay_ms: 10,
            receive_timeout_ms: 600,
            send_timeout_ms: 300,
            part_receive_delay_ms: 100,
            identity_timeout_ms: 600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.module.enable);
        assert!(!config.module.enable_timing);
        assert!(!config.module.enable_buffers);
        assert_eq!(config.transport.queue_size, 16 * 1024);
        assert_eq!(config.transport.chunk_size, 1024);
        assert_eq!(config.transport.send_attempts, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fast_config_is_valid() {
        assert!(TransportConfig::fast().validate().is_ok());
    }

    #[test]
    fn test_receive_must_exceed_send_timeout() {
        let transport = TransportConfig {
            receive_timeout_ms: 1000,
            send_timeout_ms: 1000,
            ..Default::default()
        };
        let err = transport.validate().unwrap_err();
        assert!(err.to_string().contains("receive-timeout-ms"));
    }

    #[test]
    fn test_chunk_must_fit_queue() {
        let transport = TransportConfig {
            chunk_size: 32 * 1024,
            ..Default::default()
        };
        assert!(transport.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("querystate.yml");
        fs::write(
            &path,
            "module:\n  enable-timing: true\ntransport:\n  chunk-size: 512\nlog-level: debug\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.module.enable);
        assert!(config.module.enable_timing);
        assert_eq!(config.transport.chunk_size, 512);
        assert_eq!(config.transport.queue_size, 16 * 1024);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("debug"));
    }

    #[test]
    fn test_load_rejects_invalid_transport() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("querystate.yml");
        fs::write(&path, "transport:\n  send-timeout-ms: 9000\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
