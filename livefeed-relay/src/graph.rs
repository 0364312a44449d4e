use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use livefeed_core::config::{OutputConfig, RelayConfig};
use livefeed_core::graph::{GraphEvent, GraphEventSender, GraphStage, GraphState, MediaGraph};
use livefeed_core::probe::IngestProbe;
use livefeed_core::{Error, Result, SourceBranch, SourceSpec, ViewerId};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::fanout::FanOut;
use crate::router::Router;
use crate::rtp::RtpHeader;
use crate::vp8;

/// Caps of the encoded stream the relay forwards
pub const VP8_CAPS: &str = "video/x-vp8";
/// Caps reported for ingest RTP with an unexpected payload type
pub const RTP_CAPS: &str = "application/x-rtp";

const MAX_DATAGRAM_SIZE: usize = 65_536;

#[derive(Debug, Default)]
struct IngestLink {
    /// Set once VP8 has been reported; other payload types never latch it
    discovered: bool,
    foreign_reported: bool,
    decoder_attached: bool,
    decoder_ready: bool,
    probe: Option<Arc<IngestProbe>>,
}

impl IngestLink {
    /// Report the next stream again; the registered probe survives
    fn rediscover(&mut self) {
        self.discovered = false;
        self.foreign_reported = false;
    }
}

/// State shared between the control-side handle and the socket tasks
struct RelayShared {
    router: Mutex<Router>,
    fanout: FanOut,
    ingest: Mutex<IngestLink>,
    events: GraphEventSender,
    payload_type: u8,
    running: AtomicBool,
}

impl RelayShared {
    fn on_ingest_packet(&self, packet: &[u8]) {
        let Some(header) = RtpHeader::parse(packet) else {
            trace!(len = packet.len(), "Dropping non-RTP datagram on ingest");
            return;
        };
        let is_vp8 = header.payload_type == self.payload_type;
        let keyframe = is_vp8 && vp8::is_keyframe_start(header.payload(packet));

        let probe = {
            let mut link = self.ingest.lock();
            if is_vp8 && !link.discovered {
                link.discovered = true;
                info!(caps = VP8_CAPS, payload_type = header.payload_type, "Ingest stream discovered");
                self.events.emit(GraphEvent::StreamDiscovered {
                    caps: VP8_CAPS.to_string(),
                });
            } else if !is_vp8 && !link.foreign_reported {
                link.foreign_reported = true;
                info!(caps = RTP_CAPS, payload_type = header.payload_type, "Unexpected payload type on ingest");
                self.events.emit(GraphEvent::StreamDiscovered {
                    caps: RTP_CAPS.to_string(),
                });
            }
            if link.decoder_attached && !link.decoder_ready && keyframe {
                link.decoder_ready = true;
                self.events.emit(GraphEvent::DecoderOutput {
                    caps: VP8_CAPS.to_string(),
                });
            }
            link.probe.clone()
        };

        if let Some(probe) = probe {
            probe.record();
            self.forward(SourceBranch::Ingest, packet, &header, keyframe);
        }
    }

    fn on_fallback_packet(&self, packet: &[u8]) {
        let Some(header) = RtpHeader::parse(packet) else {
            trace!(len = packet.len(), "Dropping non-RTP datagram on fallback");
            return;
        };
        let keyframe = vp8::is_keyframe_start(header.payload(packet));
        self.forward(SourceBranch::Fallback, packet, &header, keyframe);
    }

    fn forward(&self, source: SourceBranch, packet: &[u8], header: &RtpHeader, keyframe: bool) {
        let routed = self.router.lock().route(source, packet, header, keyframe);
        if let Some(out) = routed {
            self.fanout.deliver(&out);
        }
    }
}

/// Passthrough media graph for already-encoded VP8 RTP.
///
/// Ingest and fallback arrive on UDP sockets; the routing point picks one and
/// the fan-out copies it to every viewer queue. An optional third socket taps
/// the raw transport stream for metadata extraction.
pub struct RelayGraph {
    shared: Arc<RelayShared>,
    bind_host: String,
    ingest_addr: SocketAddr,
    fallback_addr: SocketAddr,
    ts_addr: Option<SocketAddr>,
    ingest_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    output: Option<OutputConfig>,
}

impl RelayGraph {
    /// Bind every socket and start forwarding; must run inside a tokio runtime
    pub fn bind(config: &RelayConfig, spec: &SourceSpec, events: GraphEventSender) -> Result<Self> {
        check_source_type(spec)?;

        let ingest = bind_udp(&config.bind_host, spec.source_config.port, GraphStage::Source)?;
        let fallback = bind_udp(&config.bind_host, config.fallback_port, GraphStage::Router)?;
        let ts_tap = config
            .ts_port
            .map(|port| bind_udp(&config.bind_host, port, GraphStage::Metadata))
            .transpose()?;

        let ingest_addr = ingest.local_addr()?;
        let fallback_addr = fallback.local_addr()?;
        let ts_addr = ts_tap.as_ref().map(UdpSocket::local_addr).transpose()?;

        let shared = Arc::new(RelayShared {
            router: Mutex::new(Router::new(SourceBranch::Fallback)),
            fanout: FanOut::new(),
            ingest: Mutex::new(IngestLink::default()),
            events: events.clone(),
            payload_type: config.payload_type,
            running: AtomicBool::new(true),
        });

        let ingest_task = tokio::spawn(ingest_loop(ingest, Arc::clone(&shared)));
        let mut tasks = vec![tokio::spawn(fallback_loop(fallback, Arc::clone(&shared)))];
        if let Some(socket) = ts_tap {
            tasks.push(tokio::spawn(ts_tap_loop(socket, events.clone())));
        }

        info!(
            epoch = events.epoch(),
            %ingest_addr,
            %fallback_addr,
            ts_addr = ?ts_addr,
            "Relay graph running"
        );
        events.emit(GraphEvent::StateChanged(GraphState::Running));

        Ok(Self {
            shared,
            bind_host: config.bind_host.clone(),
            ingest_addr,
            fallback_addr,
            ts_addr,
            ingest_task,
            tasks,
            output: None,
        })
    }

    pub fn ingest_addr(&self) -> SocketAddr {
        self.ingest_addr
    }

    pub fn fallback_addr(&self) -> SocketAddr {
        self.fallback_addr
    }

    pub fn ts_addr(&self) -> Option<SocketAddr> {
        self.ts_addr
    }

    pub fn active_input(&self) -> SourceBranch {
        self.shared.router.lock().active()
    }

    /// Number of attached viewer branches
    pub fn branch_count(&self) -> usize {
        self.shared.fanout.len()
    }

    /// Output contract recorded by the normalize stage
    pub fn output(&self) -> Option<&OutputConfig> {
        self.output.as_ref()
    }
}

impl MediaGraph for RelayGraph {
    fn set_active_input(&mut self, branch: SourceBranch) -> Result<()> {
        if branch == SourceBranch::Ingest && self.shared.ingest.lock().probe.is_none() {
            return Err(Error::Graph("ingest input is not registered".to_string()));
        }
        if self.shared.router.lock().select(branch) {
            info!(%branch, "Routing point switched");
        }
        Ok(())
    }

    fn attach_decoder(&mut self, caps: &str) -> Result<()> {
        if !caps.starts_with(VP8_CAPS) {
            return Err(Error::Graph(format!("relay cannot decode {caps}")));
        }
        let mut link = self.shared.ingest.lock();
        link.decoder_attached = true;
        link.decoder_ready = false;
        debug!(caps, "Keyframe detector attached to ingest");
        Ok(())
    }

    fn rediscover_ingest(&mut self) {
        let mut link = self.shared.ingest.lock();
        link.rediscover();
        link.decoder_attached = false;
        link.decoder_ready = false;
        debug!("Ingest discovery re-armed");
    }

    fn attach_normalizer(&mut self, output: &OutputConfig) -> Result<()> {
        self.shared.router.lock().set_framerate(output.framerate);
        info!(output = %output.caps(), "Passthrough output, ingest forwarded as {}", VP8_CAPS);
        self.output = Some(output.clone());
        Ok(())
    }

    fn register_ingest(&mut self, probe: Arc<IngestProbe>) -> Result<()> {
        let mut link = self.shared.ingest.lock();
        if link.probe.is_some() {
            return Err(Error::Graph("ingest input already registered".to_string()));
        }
        link.probe = Some(probe);
        Ok(())
    }

    fn attach_branch(&mut self, id: &ViewerId, queue: mpsc::Sender<Bytes>) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::Graph("relay is shut down".to_string()));
        }
        if self.shared.fanout.attach(id.clone(), queue) {
            warn!(client_id = %id, "Replaced existing fan-out branch");
        }
        Ok(())
    }

    fn detach_branch(&mut self, id: &ViewerId) {
        if self.shared.fanout.detach(id) {
            debug!(client_id = %id, "Fan-out branch detached");
        }
    }

    fn encoded_caps(&self) -> String {
        VP8_CAPS.to_string()
    }

    fn reconfigure_ingest(&mut self, spec: &SourceSpec) -> Result<()> {
        check_source_type(spec)?;
        let port = spec.source_config.port;
        if port == self.ingest_addr.port() {
            debug!(port, "Ingest already bound to requested port");
            return Ok(());
        }

        let socket = bind_udp(&self.bind_host, port, GraphStage::Source)?;
        let addr = socket.local_addr()?;
        self.ingest_task.abort();
        // the decode stage stays attached across the rebind
        self.shared.ingest.lock().rediscover();
        self.ingest_task = tokio::spawn(ingest_loop(socket, Arc::clone(&self.shared)));
        info!(old = %self.ingest_addr, new = %addr, "Ingest rebound");
        self.ingest_addr = addr;
        Ok(())
    }

    fn force_resync(&mut self) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::Graph("relay is shut down".to_string()));
        }
        self.shared.router.lock().resync();
        debug!("Routing point waiting for next keyframe");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.ingest_task.abort();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared.fanout.clear();
        self.shared.events.emit(GraphEvent::StateChanged(GraphState::Stopped));
        info!(
            epoch = self.shared.events.epoch(),
            chunks_dropped = self.shared.events.dropped_count(),
            "Relay graph stopped"
        );
    }
}

impl Drop for RelayGraph {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_source_type(spec: &SourceSpec) -> Result<()> {
    if spec.source_type.eq_ignore_ascii_case("udp") {
        Ok(())
    } else {
        Err(Error::Graph(format!(
            "unsupported source type: {}",
            spec.source_type
        )))
    }
}

fn bind_udp(host: &str, port: u16, stage: GraphStage) -> Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind((host, port))
        .map_err(|e| Error::Graph(format!("{stage}: cannot bind {host}:{port}: {e}")))?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

async fn ingest_loop(socket: UdpSocket, shared: Arc<RelayShared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => shared.on_ingest_packet(&buf[..len]),
            Err(e) => {
                warn!(error = %e, "Ingest socket failed");
                shared.events.emit(GraphEvent::Error {
                    stage: GraphStage::Source,
                    message: format!("ingest receive failed: {e}"),
                });
                return;
            }
        }
    }
}

async fn fallback_loop(socket: UdpSocket, shared: Arc<RelayShared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => shared.on_fallback_packet(&buf[..len]),
            Err(e) => {
                warn!(error = %e, "Fallback socket failed");
                shared.events.emit(GraphEvent::Error {
                    stage: GraphStage::Router,
                    message: format!("fallback receive failed: {e}"),
                });
                return;
            }
        }
    }
}

async fn ts_tap_loop(socket: UdpSocket, events: GraphEventSender) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => {
                events.emit(GraphEvent::TransportChunk(Bytes::copy_from_slice(&buf[..len])));
            }
            Err(e) => {
                warn!(error = %e, "Transport stream tap failed, metadata extraction stopped");
                return;
            }
        }
    }
}
