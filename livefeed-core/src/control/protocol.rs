//! Control channel message types
//!
//! One JSON object per line; the `type` field selects the variant.

use serde::{Deserialize, Serialize};

use crate::types::{SourceSpec, ViewerId};

/// Command received from the control process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Start {
        #[serde(flatten)]
        spec: SourceSpec,
    },
    AddClient {
        client_id: ViewerId,
    },
    RemoveClient {
        client_id: ViewerId,
    },
    SetAnswer {
        client_id: ViewerId,
        sdp: String,
    },
    AddIceCandidate {
        client_id: ViewerId,
        candidate: String,
        #[serde(default)]
        sdp_mline_index: u32,
    },
    HotSwap {
        #[serde(flatten)]
        spec: SourceSpec,
    },
    Stop {},
}

impl InboundMessage {
    /// Wire name of the message type, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::AddClient { .. } => "add_client",
            Self::RemoveClient { .. } => "remove_client",
            Self::SetAnswer { .. } => "set_answer",
            Self::AddIceCandidate { .. } => "add_ice_candidate",
            Self::HotSwap { .. } => "hot_swap",
            Self::Stop {} => "stop",
        }
    }
}

/// Event reported to the control process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    PipelineStarted {},
    Offer {
        client_id: ViewerId,
        sdp: String,
    },
    IceCandidate {
        client_id: ViewerId,
        candidate: String,
        sdp_mline_index: u32,
    },
    ClientConnected {
        client_id: ViewerId,
    },
    ClientFailed {
        client_id: ViewerId,
    },
    Error {
        message: String,
    },
    Eos {},
    HotSwapComplete {},
    Klv {
        /// Base64 of the raw KLV payload
        data: String,
    },
    Stopped {},
}

impl OutboundMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Bulk data that may be dropped when the control process reads slowly
    #[must_use]
    pub const fn is_bulk(&self) -> bool {
        matches!(self, Self::Klv { .. })
    }
}
