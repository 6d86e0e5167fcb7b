//! Configuration file types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::forwarding::RuleSpec;

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

/// Default interval between stats publish ticks
pub const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 1000;

/// Default relay buffer size per pipe direction
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Runtime settings shared by every forwarder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardSettings {
    /// Address listeners bind to ("0.0.0.0" = all interfaces)
    pub bind_address: String,
    /// Period at which hot-path counters are copied into the rule
    pub publish_interval_ms: u64,
    /// Relay buffer size per direction
    pub buffer_size: usize,
    /// Force-close in-flight connections when a forwarder stops
    pub sever_on_stop: bool,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            publish_interval_ms: DEFAULT_PUBLISH_INTERVAL_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sever_on_stop: false,
        }
    }
}

impl ForwardSettings {
    pub fn publish_interval(&self) -> Duration {
        // A zero period would make tokio's interval panic
        Duration::from_millis(self.publish_interval_ms.max(1))
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.max(1)
    }
}

/// On-disk configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub version: u32,
    #[serde(default)]
    pub settings: ForwardSettings,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            settings: ForwardSettings::default(),
            rules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_fill_missing_fields() {
        let config: ConfigFile = serde_json::from_str(
            r#"{"version":1,"settings":{"bind_address":"127.0.0.1"},"rules":[]}"#,
        )
        .unwrap();
        assert_eq!(config.settings.bind_address, "127.0.0.1");
        assert_eq!(config.settings.publish_interval_ms, DEFAULT_PUBLISH_INTERVAL_MS);
        assert_eq!(config.settings.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(!config.settings.sever_on_stop);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let settings = ForwardSettings {
            publish_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(settings.publish_interval(), Duration::from_millis(1));
    }
}
