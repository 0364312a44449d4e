//! Runtime wiring of the ingest branch
//!
//! The ingest format is unknown until the demuxer reports it, so the decode
//! and normalize stages are attached lazily as discovery events arrive.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::graph::{is_video_caps, MediaGraph};
use crate::probe::IngestProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Undiscovered,
    /// Decode stage attached, waiting for its first output
    Linking,
    /// Ingest input registered at the routing point
    Linked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Ignored,
    DecoderAttached,
    Linked,
    /// An attach step failed; the linker is back to `Undiscovered`
    Failed(String),
}

#[derive(Debug)]
pub struct IngestLinker {
    state: LinkState,
    epoch: u64,
}

impl Default for IngestLinker {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestLinker {
    pub const fn new() -> Self {
        Self {
            state: LinkState::Undiscovered,
            epoch: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Begin a new linking epoch for a freshly built graph
    pub fn new_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.state = LinkState::Undiscovered;
        self.epoch
    }

    pub fn reset(&mut self) {
        self.state = LinkState::Undiscovered;
    }

    pub fn on_stream_discovered(&mut self, graph: &mut dyn MediaGraph, caps: &str) -> LinkOutcome {
        if self.state != LinkState::Undiscovered {
            debug!(epoch = self.epoch, state = ?self.state, caps, "Ingest already linking, ignoring discovery");
            return LinkOutcome::Ignored;
        }
        if !is_video_caps(caps) {
            debug!(epoch = self.epoch, caps, "Ignoring non-video ingest stream");
            return LinkOutcome::Ignored;
        }

        match graph.attach_decoder(caps) {
            Ok(()) => {
                info!(epoch = self.epoch, caps, "Ingest stream discovered, decoder attached");
                self.state = LinkState::Linking;
                LinkOutcome::DecoderAttached
            }
            Err(e) => self.fail(graph, format!("failed to attach decoder: {e}")),
        }
    }

    pub fn on_decoder_output(
        &mut self,
        graph: &mut dyn MediaGraph,
        caps: &str,
        output: &OutputConfig,
        probe: &Arc<IngestProbe>,
    ) -> LinkOutcome {
        if self.state != LinkState::Linking {
            debug!(epoch = self.epoch, state = ?self.state, "Ignoring decoder output");
            return LinkOutcome::Ignored;
        }
        if !is_video_caps(caps) {
            debug!(epoch = self.epoch, caps, "Ignoring non-video decoder output");
            return LinkOutcome::Ignored;
        }

        if let Err(e) = graph.attach_normalizer(output) {
            return self.fail(graph, format!("failed to attach normalizer: {e}"));
        }
        if let Err(e) = graph.register_ingest(Arc::clone(probe)) {
            return self.fail(graph, format!("failed to register ingest input: {e}"));
        }
        probe.arm();

        info!(epoch = self.epoch, caps, output = %output.caps(), "Ingest branch linked");
        self.state = LinkState::Linked;
        LinkOutcome::Linked
    }

    /// Back to `Undiscovered`; the graph re-reports the stream so linking can retry
    fn fail(&mut self, graph: &mut dyn MediaGraph, message: String) -> LinkOutcome {
        warn!(epoch = self.epoch, %message, "Ingest linking failed");
        self.state = LinkState::Undiscovered;
        graph.rediscover_ingest();
        LinkOutcome::Failed(message)
    }
}
