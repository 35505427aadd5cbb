//! Static configuration, read once at startup from a TOML file.

use std::path::Path;
use std::time::Duration;

use derivative::Derivative;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::gnss::Position;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    pub base_station: Position,
    #[serde(default)]
    pub ntrip: NtripConfig,
    #[serde(default)]
    pub rtcm: RtcmConfig,
    #[serde(default)]
    pub station: StationInfo,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
    /// Send base-mode setup commands after every successful open.
    pub configure_receiver: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_owned(),
            baudrate: 115_200,
            configure_receiver: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NtripConfig {
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    pub identifier: String,
    pub format: String,
    pub format_details: Option<String>,
    pub handshake_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Frames buffered per client before the client is dropped.
    pub client_queue: usize,
    pub authentication: AuthConfig,
}

impl Default for NtripConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 2101,
            mountpoint: "BASE".to_owned(),
            identifier: String::new(),
            format: "RTCM 3.3".to_owned(),
            format_details: None,
            handshake_timeout_secs: 10,
            write_timeout_secs: 5,
            client_queue: 256,
            authentication: AuthConfig::default(),
        }
    }
}

impl NtripConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[derive(Derivative, Clone, Default, Deserialize)]
#[derivative(Debug)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: String,
    #[derivative(Debug = "ignore")]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtcmConfig {
    pub messages: Vec<u16>,
}

impl Default for RtcmConfig {
    fn default() -> Self {
        Self {
            messages: vec![1005, 1074, 1084, 1094, 1124, 1230],
        }
    }
}

/// Descriptive fields published in the source table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StationInfo {
    pub carrier: String,
    pub nav_system: String,
    pub network: String,
    pub country: String,
    pub generator: String,
}

impl Default for StationInfo {
    fn default() -> Self {
        Self {
            carrier: "2".to_owned(),
            nav_system: "GPS+GLO+GAL+BDS".to_owned(),
            network: "NONE".to_owned(),
            country: "USA".to_owned(),
            generator: "LC29H".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_owned(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySource {
    /// NMEA sentences interleaved on the receiver's serial link.
    #[default]
    Nmea,
    Gpsd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub source: TelemetrySource,
    pub gpsd_address: String,
    pub freshness_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            source: TelemetrySource::Nmea,
            gpsd_address: "127.0.0.1:2947".to_owned(),
            freshness_secs: 5,
        }
    }
}

impl TelemetryConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml_edit::de::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let base = &self.base_station;
        if !(-90.0..=90.0).contains(&base.latitude) {
            return Err(ConfigError::Invalid(format!(
                "base_station.latitude {} out of range",
                base.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&base.longitude) {
            return Err(ConfigError::Invalid(format!(
                "base_station.longitude {} out of range",
                base.longitude
            )));
        }
        let mountpoint = &self.ntrip.mountpoint;
        if mountpoint.is_empty() || mountpoint.contains(|c: char| c == '/' || c.is_whitespace()) {
            return Err(ConfigError::Invalid(format!(
                "ntrip.mountpoint {mountpoint:?} is not a valid name"
            )));
        }
        if self.ntrip.authentication.enabled && self.ntrip.authentication.username.is_empty() {
            return Err(ConfigError::Invalid(
                "ntrip.authentication enabled without a username".to_owned(),
            ));
        }
        if self.ntrip.client_queue == 0 {
            return Err(ConfigError::Invalid("ntrip.client_queue must be positive".to_owned()));
        }
        Ok(())
    }

    pub fn identifier(&self) -> &str {
        if self.ntrip.identifier.is_empty() {
            &self.ntrip.mountpoint
        } else {
            &self.ntrip.identifier
        }
    }

    /// `1005,1074,...` unless overridden.
    pub fn format_details(&self) -> String {
        match &self.ntrip.format_details {
            Some(details) => details.clone(),
            None => self
                .rtcm
                .messages
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Whether a frame with this message number is relayed.
    pub fn relays(&self, message_number: u16) -> bool {
        self.rtcm.messages.is_empty() || self.rtcm.messages.contains(&message_number)
    }
}
