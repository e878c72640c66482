//! Station configuration
//!
//! Configuration is read from TOML. Every field has a default matching the
//! station's usual wiring (PCAN adapter, 500 kbit/s, tester 0x7F0, ECU 0x7F1),
//! so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{AddressInfo, MAX_STANDARD_ID};

/// Classic CAN bitrates accepted by the supported adapters
const SUPPORTED_BITRATES: &[u32] = &[
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("CAN channel is required")]
    MissingChannel,

    #[error("Unsupported bitrate: {0} bit/s")]
    InvalidBitrate(u32),

    #[error("Invalid CAN ID '{value}': {reason}")]
    InvalidCanId { value: String, reason: String },

    #[error("Unsupported CAN backend: {0}")]
    UnsupportedBackend(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Complete station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    /// ECUs probed by the active check
    #[serde(default = "default_ecus")]
    pub ecus: Vec<EcuConfig>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            can: CanConfig::default(),
            timing: TimingConfig::default(),
            retry: RetryConfig::default(),
            stream: StreamConfig::default(),
            ecus: default_ecus(),
        }
    }
}

impl StationConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.can.validate()?;
        self.timing.validate()?;

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.stream.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "stream.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.stream.interval_ms == 0 || self.stream.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream intervals must be non-zero".to_string(),
            ));
        }
        for ecu in &self.ecus {
            ecu.address_info()?;
        }
        Ok(())
    }
}

// =============================================================================
// CAN bus
// =============================================================================

/// CAN adapter backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanBackend {
    /// Infer the backend from the channel name
    #[default]
    Auto,
    /// Linux SocketCAN (`can0`, `vcan0`, ...)
    SocketCan,
    /// PEAK PCAN-USB (`PCAN_USBBUS1`, ...)
    Pcan,
    /// In-process simulated ECU
    Virtual,
}

impl CanBackend {
    /// Backend implied by a channel name
    pub fn infer(channel: &str) -> Option<Self> {
        let lower = channel.trim().to_ascii_lowercase();
        if lower.starts_with("pcan") {
            Some(Self::Pcan)
        } else if lower.starts_with("can") || lower.starts_with("vcan") || lower.starts_with("slcan")
        {
            Some(Self::SocketCan)
        } else if lower.starts_with("virtual") || lower.starts_with("sim") {
            Some(Self::Virtual)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::SocketCan => "socketcan",
            Self::Pcan => "pcan",
            Self::Virtual => "virtual",
        }
    }
}

/// CAN adapter and addressing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanConfig {
    #[serde(default)]
    pub backend: CanBackend,
    /// Adapter channel (e.g. "PCAN_USBBUS1", "can0", "virtual")
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Tester request CAN ID (tester -> ECU)
    #[serde(default = "default_request_id")]
    pub request_id: String,
    /// ECU response CAN ID (ECU -> tester)
    #[serde(default = "default_response_id")]
    pub response_id: String,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            backend: CanBackend::Auto,
            channel: default_channel(),
            bitrate: default_bitrate(),
            request_id: default_request_id(),
            response_id: default_response_id(),
        }
    }
}

fn default_channel() -> String {
    "PCAN_USBBUS1".to_string()
}

fn default_bitrate() -> u32 {
    500_000
}

fn default_request_id() -> String {
    "0x7F0".to_string()
}

fn default_response_id() -> String {
    "0x7F1".to_string()
}

impl CanConfig {
    /// Concrete backend, resolving `auto` from the channel name
    pub fn resolved_backend(&self) -> Result<CanBackend, ConfigError> {
        match self.backend {
            CanBackend::Auto => CanBackend::infer(&self.channel)
                .ok_or_else(|| ConfigError::UnsupportedBackend(format!("channel '{}'", self.channel))),
            other => Ok(other),
        }
    }

    pub fn address_info(&self) -> Result<AddressInfo, ConfigError> {
        let tx_id = parse_can_id(&self.request_id)?;
        let rx_id = parse_can_id(&self.response_id)?;
        if tx_id == rx_id {
            return Err(ConfigError::Invalid(format!(
                "request and response IDs must differ (both 0x{:03X})",
                tx_id
            )));
        }
        Ok(AddressInfo { tx_id, rx_id })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.trim().is_empty() {
            return Err(ConfigError::MissingChannel);
        }
        if !SUPPORTED_BITRATES.contains(&self.bitrate) {
            return Err(ConfigError::InvalidBitrate(self.bitrate));
        }
        self.resolved_backend()?;
        self.address_info()?;
        Ok(())
    }
}

// =============================================================================
// Timing
// =============================================================================

/// ISO-TP and response timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Overall deadline for a complete response
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Sub-timeout for a single frame wait; cancellation is checked between polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Deadline for the ECU's Flow Control after a First Frame
    #[serde(default = "default_flow_control_timeout")]
    pub flow_control_timeout_ms: u64,
    /// Minimum gap between our Consecutive Frames
    #[serde(default = "default_separation_time")]
    pub separation_time_ms: u64,
    /// Block size advertised in our Flow Control (0 = no further flow control)
    #[serde(default)]
    pub fc_block_size: u8,
    /// STmin advertised in our Flow Control
    #[serde(default = "default_fc_separation_time")]
    pub fc_separation_time_ms: u8,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            poll_interval_ms: default_poll_interval(),
            flow_control_timeout_ms: default_flow_control_timeout(),
            separation_time_ms: default_separation_time(),
            fc_block_size: 0,
            fc_separation_time_ms: default_fc_separation_time(),
        }
    }
}

fn default_response_timeout() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    300
}

fn default_flow_control_timeout() -> u64 {
    1000
}

fn default_separation_time() -> u64 {
    10
}

fn default_fc_separation_time() -> u8 {
    10
}

impl TimingConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn flow_control_timeout(&self) -> Duration {
        Duration::from_millis(self.flow_control_timeout_ms)
    }

    pub fn separation_time(&self) -> Duration {
        Duration::from_millis(self.separation_time_ms)
    }

    /// Same timing with a different overall response deadline
    pub fn with_response_timeout(&self, timeout: Duration) -> Self {
        Self {
            response_timeout_ms: timeout.as_millis() as u64,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout_ms == 0
            || self.poll_interval_ms == 0
            || self.flow_control_timeout_ms == 0
        {
            return Err(ConfigError::Invalid(
                "timing values must be non-zero".to_string(),
            ));
        }
        // STmin values above 0x7F are reserved or sub-millisecond codes
        if self.fc_separation_time_ms > 0x7F {
            return Err(ConfigError::Invalid(format!(
                "fc_separation_time_ms {} exceeds 127",
                self.fc_separation_time_ms
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Retry and streaming
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `base_delay_ms * n`
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Pause between ticks, independent of how long the read took
    #[serde(default = "default_stream_interval")]
    pub interval_ms: u64,
    /// Consecutive failed ticks before the stream gives up
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_stream_interval(),
            failure_threshold: default_failure_threshold(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

fn default_stream_interval() -> u64 {
    400
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_heartbeat_interval() -> u64 {
    5000
}

impl StreamConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

// =============================================================================
// ECU addressing
// =============================================================================

/// One ECU on the bus, addressed by its own request/response ID pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuConfig {
    pub name: String,
    pub request_id: String,
    pub response_id: String,
    /// Response deadline for the active check
    #[serde(default = "default_ecu_timeout")]
    pub timeout_ms: u64,
}

fn default_ecu_timeout() -> u64 {
    1000
}

fn default_ecus() -> Vec<EcuConfig> {
    vec![EcuConfig {
        name: "BMS".to_string(),
        request_id: default_request_id(),
        response_id: default_response_id(),
        timeout_ms: default_ecu_timeout(),
    }]
}

impl EcuConfig {
    pub fn address_info(&self) -> Result<AddressInfo, ConfigError> {
        Ok(AddressInfo {
            tx_id: parse_can_id(&self.request_id)?,
            rx_id: parse_can_id(&self.response_id)?,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Parse an 11-bit CAN ID (hex with `0x` prefix, otherwise decimal)
pub fn parse_can_id(s: &str) -> Result<u16, ConfigError> {
    let trimmed = s.trim();
    let (digits, radix) = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (trimmed, 10),
    };

    let id = u16::from_str_radix(digits, radix).map_err(|e| ConfigError::InvalidCanId {
        value: s.to_string(),
        reason: e.to_string(),
    })?;
    if id > MAX_STANDARD_ID {
        return Err(ConfigError::InvalidCanId {
            value: s.to_string(),
            reason: "exceeds 11-bit range".to_string(),
        });
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_empty_config_uses_station_defaults() {
        let config = StationConfig::from_toml_str("").unwrap();
        assert_eq!(config.can.channel, "PCAN_USBBUS1");
        assert_eq!(config.can.bitrate, 500_000);
        assert_eq!(
            config.can.address_info().unwrap(),
            AddressInfo {
                tx_id: 0x7F0,
                rx_id: 0x7F1
            }
        );
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.stream.interval_ms, 400);
        assert_eq!(config.stream.failure_threshold, 5);
        assert_eq!(config.ecus.len(), 1);
        assert_eq!(config.ecus[0].name, "BMS");
    }

    #[test]
    fn test_backend_inference() {
        assert_eq!(CanBackend::infer("PCAN_USBBUS1"), Some(CanBackend::Pcan));
        assert_eq!(CanBackend::infer("can0"), Some(CanBackend::SocketCan));
        assert_eq!(CanBackend::infer("vcan0"), Some(CanBackend::SocketCan));
        assert_eq!(CanBackend::infer("virtual"), Some(CanBackend::Virtual));
        assert_eq!(CanBackend::infer("eth0"), None);
    }

    #[test]
    fn test_invalid_bitrate_rejected() {
        let err = StationConfig::from_toml_str("[can]\nbitrate = 123456\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBitrate(123456)));
    }

    #[test]
    fn test_empty_channel_rejected() {
        let err = StationConfig::from_toml_str("[can]\nchannel = \"  \"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingChannel));
    }

    #[test]
    fn test_parse_can_id() {
        assert_eq!(parse_can_id("0x7F0").unwrap(), 0x7F0);
        assert_eq!(parse_can_id("2033").unwrap(), 0x7F1);
        assert!(parse_can_id("0x18DA00F1").is_err());
        assert!(parse_can_id("zz").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[can]
channel = "vcan0"
bitrate = 250000

[retry]
max_attempts = 2

[[ecus]]
name = "VCU"
request_id = "0x7E0"
response_id = "0x7E8"
"#
        )
        .unwrap();

        let config = StationConfig::load(file.path()).unwrap();
        assert_eq!(config.can.resolved_backend().unwrap(), CanBackend::SocketCan);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.ecus[0].name, "VCU");
        assert_eq!(config.ecus[0].address_info().unwrap().rx_id, 0x7E8);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = StationConfig::load("/nonexistent/station.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
