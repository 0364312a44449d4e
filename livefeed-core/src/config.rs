use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub control: ControlConfig,
    pub output: OutputConfig,
    pub failover: FailoverConfig,
    pub hot_swap: HotSwapConfig,
    pub metadata: MetadataConfig,
    pub webrtc: WebRtcConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Control channel limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Longest accepted inbound line in bytes
    pub max_line_length: usize,
    /// Capacity of the outbound KLV queue; control replies are never dropped
    pub outbound_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_line_length: 1024 * 1024,
            outbound_capacity: 1024,
        }
    }
}

/// Fixed output contract every source is normalized to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "I420".to_string(),
            width: 640,
            height: 480,
            framerate: 25,
        }
    }
}

impl OutputConfig {
    /// Caps string describing the raw output contract
    #[must_use]
    pub fn caps(&self) -> String {
        format!(
            "video/x-raw,format={},width={},height={},framerate={}/1",
            self.format, self.width, self.height, self.framerate
        )
    }
}

/// Watchdog and resume thresholds of the input-failover controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Silence on the ingest branch longer than this forces fallback
    pub watchdog_timeout_ms: u64,
    /// Continuous ingest arrival needed before switching back
    pub resume_threshold_ms: u64,
    /// Period of the watchdog check
    pub watchdog_interval_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: 2000,
            resume_threshold_ms: 100,
            watchdog_interval_ms: 500,
        }
    }
}

impl FailoverConfig {
    #[must_use]
    pub const fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotSwapConfig {
    /// Delay between a hot-swap and the forced resync request
    pub settle_delay_ms: u64,
}

impl Default for HotSwapConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 1000,
        }
    }
}

impl HotSwapConfig {
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Transport-stream PIDs scanned for KLV telemetry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub pids: Vec<u16>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            pids: vec![0x0042, 0x0044, 0x0100, 0x0101, 0x0102, 0x01f1, 0x1000],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs handed to every peer connection
    pub stun_servers: Vec<String>,
    /// Per-viewer delivery queue capacity (packets); overflow is dropped
    pub delivery_queue_capacity: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            delivery_queue_capacity: 10,
        }
    }
}

/// UDP relay backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_host: String,
    /// Port the placeholder generator sends its RTP to
    pub fallback_port: u16,
    /// Optional port carrying the raw transport stream for KLV extraction
    pub ts_port: Option<u16>,
    /// RTP payload type of the encoded VP8 stream
    pub payload_type: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            fallback_port: 5002,
            ts_port: None,
            payload_type: 96,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LIVEFEED__FAILOVER__WATCHDOG_TIMEOUT_MS=3000, etc.
        builder = builder.add_source(
            Environment::with_prefix("LIVEFEED")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("metadata.pids")
                .with_list_parse_key("webrtc.stun_servers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Collect every configuration problem instead of stopping at the first one
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if self.output.width == 0 || self.output.height == 0 {
            errors.push("output.width and output.height must be non-zero".to_string());
        }
        if self.output.framerate == 0 {
            errors.push("output.framerate must be non-zero".to_string());
        }
        if self.failover.watchdog_interval_ms == 0 {
            errors.push("failover.watchdog_interval_ms must be non-zero".to_string());
        }
        if self.failover.resume_threshold_ms == 0 {
            errors.push("failover.resume_threshold_ms must be non-zero".to_string());
        }
        if self.failover.watchdog_timeout_ms <= self.failover.resume_threshold_ms {
            errors.push(format!(
                "failover.watchdog_timeout_ms ({}) must exceed failover.resume_threshold_ms ({})",
                self.failover.watchdog_timeout_ms, self.failover.resume_threshold_ms
            ));
        }
        if let Some(pid) = self.metadata.pids.iter().find(|pid| **pid > 0x1fff) {
            errors.push(format!("metadata.pids contains {pid:#06x}, above the 13-bit PID range"));
        }
        if self.webrtc.delivery_queue_capacity == 0 {
            errors.push("webrtc.delivery_queue_capacity must be non-zero".to_string());
        }
        if self.control.max_line_length == 0 || self.control.outbound_capacity == 0 {
            errors.push("control limits must be non-zero".to_string());
        }
        if self.relay.payload_type > 127 {
            errors.push(format!(
                "relay.payload_type must be a 7-bit RTP payload type, got {}",
                self.relay.payload_type
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.failover.watchdog_timeout_ms, 2000);
        assert_eq!(config.failover.resume_threshold_ms, 100);
        assert_eq!(config.failover.watchdog_interval(), Duration::from_millis(500));
        assert_eq!(config.hot_swap.settle_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_output_caps() {
        let output = OutputConfig::default();
        assert_eq!(
            output.caps(),
            "video/x-raw,format=I420,width=640,height=480,framerate=25/1"
        );
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        config.output.framerate = 0;
        config.metadata.pids.push(0x2000);

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.failover.watchdog_timeout_ms = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "failover:\n  watchdog_timeout_ms: 3000\nmetadata:\n  pids: [66, 256]\nrelay:\n  ts_port: 5010"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.failover.watchdog_timeout_ms, 3000);
        assert_eq!(config.failover.resume_threshold_ms, 100);
        assert_eq!(config.metadata.pids, vec![66, 256]);
        assert_eq!(config.relay.ts_port, Some(5010));
    }
}
