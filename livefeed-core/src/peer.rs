//! Peer connection contract
//!
//! A peer connection is the per-viewer transport endpoint. The control loop
//! only talks to it through [`PeerConnection`]; everything the peer reports
//! spontaneously comes back as a [`PeerEvent`] tagged with the session
//! generation it belongs to.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::ViewerId;

/// Transport connection state as reported by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mline_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEventKind {
    /// Candidate gathered locally, to be relayed to the remote side
    LocalCandidate(IceCandidate),
    ConnectionState(PeerConnectionState),
    NegotiationNeeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub id: ViewerId,
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Per-session handle a peer uses to report events
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    id: ViewerId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSender {
    pub fn new(id: ViewerId, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { id, generation, tx }
    }

    pub fn id(&self) -> &ViewerId {
        &self.id
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the control loop is gone
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(PeerEvent {
                id: self.id.clone(),
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Add a send-only video input fed from the delivery queue
    async fn add_video_input(&self, caps: &str, queue: mpsc::Receiver<Bytes>) -> Result<()>;

    /// Create an SDP offer
    async fn create_offer(&self) -> Result<String>;

    /// Commit a previously created offer as the local description
    async fn set_local_description(&self, sdp: &str) -> Result<()>;

    /// Apply the remote side's SDP answer
    async fn set_remote_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>>;
}
