use std::{io, path::Path};

use blackbox_protocol::DISCOVERY_PORT;
use blackbox_timing::Duration;
use serde::{Deserialize, Serialize};

fn default_max_recordings() -> u32 {
    10
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

impl AddressFamily {
    pub fn wants_v4(self) -> bool {
        matches!(self, Self::Any | Self::V4)
    }

    pub fn wants_v6(self) -> bool {
        matches!(self, Self::Any | Self::V6)
    }
}

/// One configured whitelist line: `"10.0.0.0/8"` or a hostname, an optional
/// application filter, the verdict, and an optional response delay for
/// deterministic multi-server staggering.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WhitelistEntryConfig {
    pub address_plus_mask: String,
    #[serde(default)]
    pub application_name: String,
    pub allow: bool,
    #[serde(default)]
    pub delay: Duration,
}

impl WhitelistEntryConfig {
    pub fn allow<S: Into<String>>(address_plus_mask: S) -> Self {
        Self { address_plus_mask: address_plus_mask.into(), allow: true, ..Self::default() }
    }

    pub fn deny<S: Into<String>>(address_plus_mask: S) -> Self {
        Self { address_plus_mask: address_plus_mask.into(), allow: false, ..Self::default() }
    }

    pub fn with_application<S: Into<String>>(mut self, application_name: S) -> Self {
        self.application_name = application_name.into();
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub whitelist: Vec<WhitelistEntryConfig>,
    /// Retention policy consumed by the recording catalog.
    #[serde(default = "default_max_recordings")]
    pub max_recordings: u32,
    #[serde(default)]
    pub address_family: AddressFamily,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            max_recordings: default_max_recordings(),
            address_family: AddressFamily::default(),
            discovery_port: DISCOVERY_PORT,
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(io::Error::other)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let contents = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrips_through_json() {
        let config = ServerConfig {
            whitelist: vec![
                WhitelistEntryConfig::allow("10.0.0.0/8").with_application("foo"),
                WhitelistEntryConfig::deny("192.168.0.0/16"),
            ],
            max_recordings: 25,
            address_family: AddressFamily::V4,
            discovery_port: 1492,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.whitelist.len(), 2);
        assert_eq!(back.whitelist[0].application_name, "foo");
        assert!(back.whitelist[0].allow);
        assert!(!back.whitelist[1].allow);
        assert_eq!(back.max_recordings, 25);
        assert_eq!(back.address_family, AddressFamily::V4);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert!(config.whitelist.is_empty());
        assert_eq!(config.max_recordings, 10);
        assert_eq!(config.discovery_port, DISCOVERY_PORT);
        assert_eq!(config.address_family, AddressFamily::Any);
    }

    #[test]
    fn delay_accepts_millis_and_strings() {
        let entry: WhitelistEntryConfig = serde_json::from_str(
            r#"{"address_plus_mask": "10.0.0.0/8", "allow": true, "delay": 100}"#,
        )
        .unwrap();
        assert_eq!(entry.delay, Duration::from_millis(100));
        let entry: WhitelistEntryConfig = serde_json::from_str(
            r#"{"address_plus_mask": "10.0.0.0/8", "allow": true, "delay": "250ms"}"#,
        )
        .unwrap();
        assert_eq!(entry.delay, Duration::from_millis(250));
    }
}
