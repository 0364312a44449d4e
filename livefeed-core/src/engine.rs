//! The control loop
//!
//! One task owns every piece of control-path state: the media graph handle,
//! the failover and linking state machines, the session table and the KLV
//! reassembly buffers. Everything else (media threads, peer callbacks,
//! negotiation workers, timers) talks to it through channels. Nothing in a
//! handler waits on the control process or the peer stack, so the watchdog
//! keeps firing however slow either of them is.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::control::{InboundMessage, OutboundMessage, OutboundSender};
use crate::error::{Error, Result};
use crate::failover::FailoverController;
use crate::graph::{
    graph_event_channel, GraphBackend, GraphEnvelope, GraphEvent, GraphEventSender, GraphStage,
    MediaGraph, TRANSPORT_CHUNK_CAPACITY,
};
use crate::hotswap::{HotSwapController, ResyncOutcome, ResyncTicket};
use crate::klv::KlvExtractor;
use crate::linker::{IngestLinker, LinkOutcome};
use crate::peer::{IceCandidate, PeerEvent, PeerFactory};
use crate::probe::IngestProbe;
use crate::session::{NegotiationCompletion, SessionManager};
use crate::types::{SourceBranch, SourceSpec};

pub struct Engine {
    config: Config,
    backend: Arc<dyn GraphBackend>,
    peers: Arc<dyn PeerFactory>,
}

impl Engine {
    pub fn new(config: Config, backend: Arc<dyn GraphBackend>, peers: Arc<dyn PeerFactory>) -> Self {
        Self {
            config,
            backend,
            peers,
        }
    }

    /// Run until the control channel closes (`Ok`) or the shared path fails (`Err`)
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        outbound: OutboundSender,
    ) -> Result<()> {
        let (graph_events, mut graph_rx) = graph_event_channel(TRANSPORT_CHUNK_CAPACITY);
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let (resync_tx, mut resync_rx) = mpsc::unbounded_channel();

        let probe = IngestProbe::new(self.config.failover.resume_threshold_ms);
        let mut watchdog = tokio::time::interval(self.config.failover.watchdog_interval());
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut control = ControlLoop {
            failover: FailoverController::new(&self.config.failover),
            hotswap: HotSwapController::new(&self.config.hot_swap),
            linker: IngestLinker::new(),
            sessions: SessionManager::new(
                self.peers,
                self.config.webrtc.delivery_queue_capacity,
                peer_tx,
                done_tx,
            ),
            klv: KlvExtractor::new(self.config.metadata.pids.iter().copied()),
            probe: Arc::clone(&probe),
            graph: None,
            backend: self.backend,
            graph_events,
            resync_tx,
            outbound,
            config: self.config,
        };

        info!("Control loop started");
        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some(message) = message else {
                        info!("Control channel closed, shutting down");
                        control.teardown();
                        return Ok(());
                    };
                    control.handle_command(message).await;
                }
                Some(envelope) = graph_rx.recv() => control.handle_graph_event(envelope)?,
                Some(event) = peer_rx.recv() => control.handle_peer_event(event),
                Some(completion) = done_rx.recv() => control.handle_completion(completion),
                Some(ticket) = resync_rx.recv() => control.handle_resync(ticket),
                _ = watchdog.tick() => control.on_watchdog_tick()?,
                () = probe.notified() => control.on_ingest_arrival()?,
            }
        }
    }
}

struct ControlLoop {
    config: Config,
    backend: Arc<dyn GraphBackend>,
    graph: Option<Box<dyn MediaGraph>>,
    probe: Arc<IngestProbe>,
    failover: FailoverController,
    linker: IngestLinker,
    hotswap: HotSwapController,
    sessions: SessionManager,
    klv: KlvExtractor,
    graph_events: GraphEventSender,
    resync_tx: mpsc::UnboundedSender<ResyncTicket>,
    outbound: OutboundSender,
}

impl ControlLoop {
    /// Queue a message for the control process; never waits
    fn emit(&self, message: OutboundMessage) {
        if !self.outbound.send(message) {
            debug!("Outbound message not queued");
        }
    }

    fn emit_all(&self, messages: Vec<OutboundMessage>) {
        for message in messages {
            self.emit(message);
        }
    }

    async fn handle_command(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Start { spec } => self.start(spec).await,
            InboundMessage::AddClient { client_id } => {
                let out = self.sessions.add(client_id, self.graph.as_deref_mut());
                self.emit_all(out);
            }
            InboundMessage::RemoveClient { client_id } => {
                self.sessions.remove(&client_id, self.graph.as_deref_mut());
            }
            InboundMessage::SetAnswer { client_id, sdp } => {
                self.sessions.set_remote(&client_id, sdp);
            }
            InboundMessage::AddIceCandidate {
                client_id,
                candidate,
                sdp_mline_index,
            } => {
                self.sessions.add_candidate(
                    &client_id,
                    IceCandidate {
                        candidate,
                        sdp_mline_index,
                    },
                );
            }
            InboundMessage::HotSwap { spec } => self.hot_swap(spec),
            InboundMessage::Stop {} => {
                info!("Stop requested");
                self.teardown();
                self.emit(OutboundMessage::Stopped {});
            }
        }
    }

    async fn start(&mut self, spec: SourceSpec) {
        if self.graph.is_some() {
            info!("Pipeline already running, rebuilding");
            self.teardown();
        }

        let epoch = self.linker.new_epoch();
        let events = self.graph_events.with_epoch(epoch);
        let mut graph = match self.backend.build(&spec, events).await {
            Ok(graph) => graph,
            Err(e) => {
                error!(error = %e, "Failed to build pipeline");
                self.emit(OutboundMessage::error(format!("failed to start pipeline: {e}")));
                return;
            }
        };

        if let Err(e) = graph.set_active_input(SourceBranch::Fallback) {
            error!(error = %e, "Failed to select fallback input");
            graph.shutdown();
            self.emit(OutboundMessage::error(format!("failed to start pipeline: {e}")));
            return;
        }

        self.graph = Some(graph);
        info!(
            epoch,
            source_type = %spec.source_type,
            port = spec.source_config.port,
            output = %self.config.output.caps(),
            "Pipeline started"
        );
        self.emit(OutboundMessage::PipelineStarted {});
    }

    fn hot_swap(&mut self, spec: SourceSpec) {
        let Some(graph) = self.graph.as_deref_mut() else {
            warn!("Hot-swap requested with no pipeline running");
            self.emit(OutboundMessage::error("hot_swap: no pipeline running"));
            return;
        };

        match self.hotswap.begin(graph, &spec) {
            Ok(ticket) => {
                self.schedule_resync(ticket);
                self.emit(OutboundMessage::HotSwapComplete {});
            }
            Err(e) => {
                warn!(error = %e, "Hot-swap failed");
                self.emit(OutboundMessage::error(format!("hot_swap failed: {e}")));
            }
        }
    }

    fn schedule_resync(&self, ticket: ResyncTicket) {
        let tx = self.resync_tx.clone();
        let delay = self.hotswap.settle_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ticket);
        });
    }

    fn handle_resync(&mut self, ticket: ResyncTicket) {
        if let ResyncOutcome::Retry(next) = self
            .hotswap
            .on_resync_due(self.graph.as_deref_mut(), ticket)
        {
            self.schedule_resync(next);
        }
    }

    fn handle_graph_event(&mut self, envelope: GraphEnvelope) -> Result<()> {
        let GraphEnvelope { epoch, event } = envelope;
        if epoch != self.linker.epoch() || self.graph.is_none() {
            debug!(epoch, current = self.linker.epoch(), ?event, "Ignoring event from retired graph");
            return Ok(());
        }

        match event {
            GraphEvent::StreamDiscovered { caps } => {
                let Some(graph) = self.graph.as_deref_mut() else {
                    return Ok(());
                };
                if let LinkOutcome::Failed(message) = self.linker.on_stream_discovered(graph, &caps) {
                    self.on_ingest_failure(GraphStage::Decoder, &message)?;
                }
            }
            GraphEvent::DecoderOutput { caps } => {
                let Some(graph) = self.graph.as_deref_mut() else {
                    return Ok(());
                };
                match self
                    .linker
                    .on_decoder_output(graph, &caps, &self.config.output, &self.probe)
                {
                    LinkOutcome::Linked => self.failover.mark_ingest_registered(),
                    LinkOutcome::Failed(message) => {
                        self.on_ingest_failure(GraphStage::Convert, &message)?;
                    }
                    LinkOutcome::Ignored | LinkOutcome::DecoderAttached => {}
                }
            }
            GraphEvent::Error { stage, message } if stage.is_ingest() => {
                self.on_ingest_failure(stage, &message)?;
            }
            GraphEvent::Error { stage, message } => {
                error!(%stage, %message, "Pipeline error on shared path");
                self.emit(OutboundMessage::error(message.clone()));
                self.teardown();
                return Err(Error::Fatal(format!("{stage}: {message}")));
            }
            GraphEvent::Eos => {
                info!("End of stream");
                self.emit(OutboundMessage::Eos {});
            }
            GraphEvent::StateChanged(state) => {
                debug!(?state, "Pipeline state changed");
            }
            GraphEvent::TransportChunk(chunk) => {
                for record in self.klv.push(&chunk) {
                    self.emit(OutboundMessage::Klv {
                        data: record.to_base64(),
                    });
                }
            }
        }
        Ok(())
    }

    fn on_ingest_failure(&mut self, stage: GraphStage, message: &str) -> Result<()> {
        warn!(%stage, %message, "Ingest error, falling back");
        if let Some(branch) = self.failover.on_ingest_error() {
            self.apply_switch(branch)?;
        }
        Ok(())
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let out = self.sessions.on_peer_event(event);
        self.emit_all(out);
    }

    fn handle_completion(&mut self, completion: NegotiationCompletion) {
        let out = self
            .sessions
            .on_completion(completion, self.graph.as_deref_mut());
        self.emit_all(out);
    }

    fn on_ingest_arrival(&mut self) -> Result<()> {
        if let Some(branch) = self.failover.on_arrival(self.probe.snapshot()) {
            self.apply_switch(branch)?;
        }
        Ok(())
    }

    fn on_watchdog_tick(&mut self) -> Result<()> {
        let now = self.probe.now_ms();
        if let Some(branch) = self.failover.on_tick(self.probe.snapshot(), now) {
            self.apply_switch(branch)?;
        }
        Ok(())
    }

    /// Flip the routing point; failure here leaves no usable output
    fn apply_switch(&mut self, branch: SourceBranch) -> Result<()> {
        let Some(graph) = self.graph.as_deref_mut() else {
            return Ok(());
        };
        if let Err(e) = graph.set_active_input(branch) {
            error!(%branch, error = %e, "Failed to switch active input");
            self.emit(OutboundMessage::error(format!("failed to switch input: {e}")));
            self.teardown();
            return Err(Error::Fatal(e.to_string()));
        }
        self.probe.set_on_ingest(branch == SourceBranch::Ingest);
        Ok(())
    }

    /// Release every session and the graph; safe to call repeatedly
    fn teardown(&mut self) {
        let sessions = self.sessions.len();
        self.sessions.clear(self.graph.as_deref_mut());
        if let Some(mut graph) = self.graph.take() {
            graph.shutdown();
            info!(sessions, klv_dropped = self.outbound.dropped_count(), "Pipeline stopped");
        }
        self.probe.disarm();
        self.probe.set_on_ingest(false);
        self.failover.reset();
        self.linker.reset();
        self.hotswap.cancel();
        self.klv.reset();
    }
}
