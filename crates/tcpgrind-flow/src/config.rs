//! Flow engine configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Default ceiling on concurrently registered flows.
pub const DEFAULT_MAX_FLOWS: usize = 2048;

/// Configuration for the flow registry and admission controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowEngineConfig {
    /// Maximum number of live flows.
    pub max_flows: usize,
    /// Upper bound on the eager connect issued during admission.
    pub connect_timeout_ms: u64,
    /// Switch sockets to non-blocking mode before handing them to the transfer loop.
    pub nonblocking_handoff: bool,
    /// Probe platform socket capabilities at startup.
    pub probe_capabilities: bool,
    /// Fallback log filter for the daemon binary.
    pub log_level: String,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self {
            max_flows: DEFAULT_MAX_FLOWS,
            connect_timeout_ms: 5000,
            nonblocking_handoff: true,
            probe_capabilities: true,
            log_level: "info".to_string(),
        }
    }
}

impl FlowEngineConfig {
    /// Eager connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Checks that the configuration can drive a registry.
    pub fn validate(&self) -> Result<()> {
        if self.max_flows == 0 {
            return Err(FlowError::InvalidSettings {
                reason: "max_flows must be at least 1".to_string(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(FlowError::InvalidSettings {
                reason: "connect_timeout_ms must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Loads configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: FlowEngineConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = FlowEngineConfig::default();
        assert_eq!(config.max_flows, DEFAULT_MAX_FLOWS);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.nonblocking_handoff);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_flows() {
        let config = FlowEngineConfig {
            max_flows: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FlowError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = FlowEngineConfig {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{ "max_flows": 16, "connect_timeout_ms": 250 }}"#).unwrap();

        let config = FlowEngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_flows, 16);
        assert_eq!(config.connect_timeout_ms, 250);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
max_flows = 4
nonblocking_handoff = false
log_level = "debug"
"#
        )
        .unwrap();

        let config = FlowEngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_flows, 4);
        assert!(!config.nonblocking_handoff);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{ "max_flows": 0 }}"#).unwrap();
        assert!(FlowEngineConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(FlowEngineConfig::from_file(file.path()).is_err());
    }
}
