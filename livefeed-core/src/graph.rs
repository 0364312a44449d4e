//! Media graph capability contract
//!
//! The control loop drives the media graph exclusively through [`MediaGraph`];
//! the graph reports back through a [`GraphEventSender`]. Implementations run
//! their own media threads or tasks and must never block the caller.
//!
//! Events travel on two lanes. Control events (discovery, errors, state) are
//! rare and always delivered; raw transport-stream chunks share a bounded lane
//! and are dropped when the control loop falls behind.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::OutputConfig;
use crate::error::Result;
use crate::probe::IngestProbe;
use crate::types::{SourceBranch, SourceSpec, ViewerId};

/// Capacity of the transport-stream chunk lane
pub const TRANSPORT_CHUNK_CAPACITY: usize = 4096;

/// Processing stage an error or notification originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphStage {
    Source,
    Demux,
    Decoder,
    Convert,
    Router,
    Encoder,
    FanOut,
    Metadata,
}

impl GraphStage {
    /// Stages upstream of the routing point on the live branch
    #[must_use]
    pub const fn is_ingest(self) -> bool {
        matches!(
            self,
            Self::Source | Self::Demux | Self::Decoder | Self::Convert
        )
    }
}

impl fmt::Display for GraphStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Source => "source",
            Self::Demux => "demux",
            Self::Decoder => "decoder",
            Self::Convert => "ingest-convert",
            Self::Router => "router",
            Self::Encoder => "encoder",
            Self::FanOut => "fanout",
            Self::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Running,
    Stopped,
}

/// Notification from the media graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    /// A new elementary stream appeared on the ingest demuxer
    StreamDiscovered { caps: String },
    /// The attached decode stage produced its first output
    DecoderOutput { caps: String },
    Error { stage: GraphStage, message: String },
    Eos,
    StateChanged(GraphState),
    /// Raw transport-stream bytes from the metadata side-branch
    TransportChunk(Bytes),
}

/// Event tagged with the graph instance that produced it
#[derive(Debug, Clone)]
pub struct GraphEnvelope {
    pub epoch: u64,
    pub event: GraphEvent,
}

/// Create the event lanes shared by every graph the control loop builds
pub fn graph_event_channel(chunk_capacity: usize) -> (GraphEventSender, GraphEventReceiver) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (chunk_tx, chunk_rx) = mpsc::channel(chunk_capacity);
    (
        GraphEventSender {
            epoch: 0,
            control: control_tx,
            chunks: chunk_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        GraphEventReceiver {
            control: control_rx,
            chunks: chunk_rx,
        },
    )
}

/// Cloneable handle graph implementations use to report events.
///
/// Sending never blocks. Only [`GraphEvent::TransportChunk`]s can be dropped.
#[derive(Debug, Clone)]
pub struct GraphEventSender {
    epoch: u64,
    control: mpsc::UnboundedSender<GraphEnvelope>,
    chunks: mpsc::Sender<GraphEnvelope>,
    dropped: Arc<AtomicU64>,
}

impl GraphEventSender {
    /// Handle on the same lanes tagging events with `epoch`
    #[must_use]
    pub fn with_epoch(&self, epoch: u64) -> Self {
        Self {
            epoch,
            control: self.control.clone(),
            chunks: self.chunks.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false if the event was dropped
    pub fn emit(&self, event: GraphEvent) -> bool {
        let envelope = GraphEnvelope {
            epoch: self.epoch,
            event,
        };
        if !matches!(envelope.event, GraphEvent::TransportChunk(_)) {
            return self.control.send(envelope).is_ok();
        }

        match self.chunks.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(epoch = self.epoch, dropped, "Chunk lane full, dropping transport chunk");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Transport chunks dropped by this handle
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Control-loop end of the event lanes; control events are served first
#[derive(Debug)]
pub struct GraphEventReceiver {
    control: mpsc::UnboundedReceiver<GraphEnvelope>,
    chunks: mpsc::Receiver<GraphEnvelope>,
}

impl GraphEventReceiver {
    /// Next event, or `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<GraphEnvelope> {
        tokio::select! {
            biased;
            Some(envelope) = self.control.recv() => Some(envelope),
            Some(envelope) = self.chunks.recv() => Some(envelope),
            else => None,
        }
    }
}

/// Operations the control loop needs from a running media graph.
///
/// Every method is called from the control loop only.
pub trait MediaGraph: Send {
    /// Select the active input of the routing point (single atomic write)
    fn set_active_input(&mut self, branch: SourceBranch) -> Result<()>;

    /// Attach a decode stage behind the discovered ingest stream
    fn attach_decoder(&mut self, caps: &str) -> Result<()>;

    /// Drop any half-linked decode stage and report the ingest stream again
    /// on its next buffer
    fn rediscover_ingest(&mut self);

    /// Attach the normalize stage enforcing the output contract
    fn attach_normalizer(&mut self, output: &OutputConfig) -> Result<()>;

    /// Register the ingest input at the routing point and start feeding `probe`
    fn register_ingest(&mut self, probe: Arc<IngestProbe>) -> Result<()>;

    /// Add a fan-out output delivering encoded packets into `queue`
    fn attach_branch(&mut self, id: &ViewerId, queue: mpsc::Sender<Bytes>) -> Result<()>;

    /// Remove a fan-out output; unknown ids are ignored
    fn detach_branch(&mut self, id: &ViewerId);

    /// Caps of the encoded stream fed to every branch
    fn encoded_caps(&self) -> String;

    /// Apply a new ingest configuration in place
    fn reconfigure_ingest(&mut self, spec: &SourceSpec) -> Result<()>;

    /// Ask the encoder for a fresh keyframe
    fn force_resync(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Stop all media processing; idempotent
    fn shutdown(&mut self);
}

/// Builds a media graph for a source description
#[async_trait]
pub trait GraphBackend: Send + Sync {
    async fn build(
        &self,
        spec: &SourceSpec,
        events: GraphEventSender,
    ) -> Result<Box<dyn MediaGraph>>;
}

/// True for caps describing a video stream
pub fn is_video_caps(caps: &str) -> bool {
    caps.starts_with("video/") || caps.split(',').any(|field| field.trim() == "media=video")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_stages() {
        assert!(GraphStage::Source.is_ingest());
        assert!(GraphStage::Demux.is_ingest());
        assert!(GraphStage::Decoder.is_ingest());
        assert!(GraphStage::Convert.is_ingest());
        assert!(!GraphStage::Router.is_ingest());
        assert!(!GraphStage::Encoder.is_ingest());
        assert!(!GraphStage::FanOut.is_ingest());
    }

    #[test]
    fn test_is_video_caps() {
        assert!(is_video_caps("video/x-h264,stream-format=byte-stream"));
        assert!(is_video_caps("application/x-rtp,media=video,encoding-name=VP8"));
        assert!(!is_video_caps("audio/mpeg"));
        assert!(!is_video_caps("meta/x-klv"));
        assert!(!is_video_caps("application/x-rtp"));
    }

    #[tokio::test]
    async fn test_chunks_dropped_when_lane_full() {
        let (events, mut rx) = graph_event_channel(1);
        let sender = events.with_epoch(7);

        assert!(sender.emit(GraphEvent::TransportChunk(Bytes::from_static(b"a"))));
        assert!(!sender.emit(GraphEvent::TransportChunk(Bytes::from_static(b"b"))));
        assert_eq!(sender.dropped_count(), 1);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.epoch, 7);
        assert_eq!(envelope.event, GraphEvent::TransportChunk(Bytes::from_static(b"a")));
    }

    #[tokio::test]
    async fn test_control_events_survive_chunk_flood() {
        let (events, mut rx) = graph_event_channel(4);
        let sender = events.with_epoch(1);
        for _ in 0..16 {
            sender.emit(GraphEvent::TransportChunk(Bytes::from_static(&[0x47; 188])));
        }

        assert!(sender.emit(GraphEvent::Error {
            stage: GraphStage::Encoder,
            message: "encoder died".to_string(),
        }));
        assert!(sender.emit(GraphEvent::StreamDiscovered {
            caps: "video/x-vp8".to_string(),
        }));
        assert_eq!(sender.dropped_count(), 12);

        // control events overtake queued chunks
        assert!(matches!(
            rx.recv().await.unwrap().event,
            GraphEvent::Error {
                stage: GraphStage::Encoder,
                ..
            }
        ));
        assert!(matches!(
            rx.recv().await.unwrap().event,
            GraphEvent::StreamDiscovered { .. }
        ));
        for _ in 0..4 {
            assert!(matches!(
                rx.recv().await.unwrap().event,
                GraphEvent::TransportChunk(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_receiver_ends_when_senders_dropped() {
        let (events, mut rx) = graph_event_channel(1);
        events.with_epoch(2).emit(GraphEvent::Eos);
        drop(events);

        assert_eq!(rx.recv().await.unwrap().event, GraphEvent::Eos);
        assert!(rx.recv().await.is_none());
    }
}
