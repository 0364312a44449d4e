//! Common types used throughout the control path

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a viewer session, chosen by the control process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(String);

impl ViewerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ViewerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ViewerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One of the two upstream sources feeding the routing point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBranch {
    /// Untrusted live source; may appear, vanish or change format at any time
    Ingest,
    /// Always-available placeholder content
    Fallback,
}

impl fmt::Display for SourceBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingest => f.write_str("ingest"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// Ingest source description as received on the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(default = "default_source_type")]
    pub source_type: String,
    #[serde(default)]
    pub source_config: SourceConfig,
}

fn default_source_type() -> String {
    "udp".to_string()
}

impl SourceSpec {
    pub fn udp(port: u16) -> Self {
        Self {
            source_type: default_source_type(),
            source_config: SourceConfig {
                port,
                ..SourceConfig::default()
            },
        }
    }
}

/// Backend-facing source settings; keys the core does not know are kept in `extra`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub port: u16,
    pub codec: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            codec: "h264".to_string(),
            extra: serde_json::Map::new(),
        }
    }
}
