//! Test fakes for the media graph and peer connection contracts
//!
//! Every fake records what the control path asked of it in a shared state
//! handle, so tests can drive the code under test and inspect the effects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, Semaphore};

use crate::config::OutputConfig;
use crate::error::{Error, Result};
use crate::graph::{GraphBackend, GraphEvent, GraphEventSender, MediaGraph};
use crate::peer::{IceCandidate, PeerConnection, PeerEventKind, PeerEventSender, PeerFactory};
use crate::probe::IngestProbe;
use crate::types::{SourceBranch, SourceSpec, ViewerId};

pub type SharedGraphState = Arc<Mutex<FakeGraphState>>;

#[derive(Debug)]
pub struct FakeGraphState {
    pub spec: Option<SourceSpec>,
    pub active_history: Vec<SourceBranch>,
    pub decoders_attached: usize,
    pub rediscoveries: usize,
    pub normalizer: Option<OutputConfig>,
    pub probe: Option<Arc<IngestProbe>>,
    pub branches: HashMap<String, mpsc::Sender<Bytes>>,
    pub branches_detached: usize,
    pub reconfigured: Vec<SourceSpec>,
    pub resyncs: usize,
    pub running: bool,
    pub shutdown: bool,
    pub fail_normalizer: bool,
    pub fail_register: bool,
    pub fail_attach_branch: bool,
    pub fail_set_active: bool,
}

impl Default for FakeGraphState {
    fn default() -> Self {
        Self {
            spec: None,
            active_history: Vec::new(),
            decoders_attached: 0,
            rediscoveries: 0,
            normalizer: None,
            probe: None,
            branches: HashMap::new(),
            branches_detached: 0,
            reconfigured: Vec::new(),
            resyncs: 0,
            running: true,
            shutdown: false,
            fail_normalizer: false,
            fail_register: false,
            fail_attach_branch: false,
            fail_set_active: false,
        }
    }
}

impl FakeGraphState {
    pub fn active(&self) -> Option<SourceBranch> {
        self.active_history.last().copied()
    }

    /// Switches performed, ignoring the initial selection
    pub fn switches(&self) -> &[SourceBranch] {
        self.active_history.get(1..).unwrap_or_default()
    }
}

pub struct FakeGraph {
    state: SharedGraphState,
}

impl FakeGraph {
    pub fn new() -> (Self, SharedGraphState) {
        let state = Arc::new(Mutex::new(FakeGraphState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl MediaGraph for FakeGraph {
    fn set_active_input(&mut self, branch: SourceBranch) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_set_active {
            return Err(Error::Graph("routing point unavailable".to_string()));
        }
        state.active_history.push(branch);
        Ok(())
    }

    fn attach_decoder(&mut self, _caps: &str) -> Result<()> {
        self.state.lock().decoders_attached += 1;
        Ok(())
    }

    fn rediscover_ingest(&mut self) {
        self.state.lock().rediscoveries += 1;
    }

    fn attach_normalizer(&mut self, output: &OutputConfig) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_normalizer {
            return Err(Error::Graph("no converter for output".to_string()));
        }
        state.normalizer = Some(output.clone());
        Ok(())
    }

    fn register_ingest(&mut self, probe: Arc<IngestProbe>) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_register {
            return Err(Error::Graph("no free routing input".to_string()));
        }
        state.probe = Some(probe);
        Ok(())
    }

    fn attach_branch(&mut self, id: &ViewerId, queue: mpsc::Sender<Bytes>) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_attach_branch {
            return Err(Error::Graph("fan-out refused branch".to_string()));
        }
        state.branches.insert(id.as_str().to_string(), queue);
        Ok(())
    }

    fn detach_branch(&mut self, id: &ViewerId) {
        let mut state = self.state.lock();
        if state.branches.remove(id.as_str()).is_some() {
            state.branches_detached += 1;
        }
    }

    fn encoded_caps(&self) -> String {
        "video/x-vp8".to_string()
    }

    fn reconfigure_ingest(&mut self, spec: &SourceSpec) -> Result<()> {
        self.state.lock().reconfigured.push(spec.clone());
        Ok(())
    }

    fn force_resync(&mut self) -> Result<()> {
        self.state.lock().resyncs += 1;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn shutdown(&mut self) {
        let mut state = self.state.lock();
        state.running = false;
        state.shutdown = true;
    }
}

#[derive(Default)]
struct FakeBackendState {
    graphs: Vec<SharedGraphState>,
    events: Option<GraphEventSender>,
    fail_build: bool,
}

/// Backend handing out [`FakeGraph`]s; remembers the latest event sender
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeBackendState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_builds(&self, fail: bool) {
        self.state.lock().fail_build = fail;
    }

    pub fn builds(&self) -> usize {
        self.state.lock().graphs.len()
    }

    pub fn latest(&self) -> Option<SharedGraphState> {
        self.state.lock().graphs.last().cloned()
    }

    /// Inject an event as if the latest graph produced it
    pub fn emit(&self, event: GraphEvent) -> bool {
        self.state
            .lock()
            .events
            .as_ref()
            .is_some_and(|events| events.emit(event))
    }
}

#[async_trait]
impl GraphBackend for FakeBackend {
    async fn build(&self, spec: &SourceSpec, events: GraphEventSender) -> Result<Box<dyn MediaGraph>> {
        let mut state = self.state.lock();
        if state.fail_build {
            return Err(Error::Graph(format!("cannot bind port {}", spec.source_config.port)));
        }
        let (graph, graph_state) = FakeGraph::new();
        graph_state.lock().spec = Some(spec.clone());
        state.graphs.push(graph_state);
        state.events = Some(events);
        Ok(Box::new(graph))
    }
}

#[derive(Debug, Default)]
struct PeerLog {
    video_caps: Option<String>,
    offers_created: usize,
    local_descriptions: Vec<String>,
    remote_answers: Vec<String>,
    candidates: Vec<IceCandidate>,
}

pub struct FakePeer {
    events: PeerEventSender,
    fail_offer: bool,
    offer_gate: Option<Arc<Semaphore>>,
    log: Mutex<PeerLog>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl FakePeer {
    pub fn id(&self) -> &ViewerId {
        self.events.id()
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Report a spontaneous event to the control loop
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.events.emit(kind)
    }

    pub fn video_caps(&self) -> Option<String> {
        self.log.lock().video_caps.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.log.lock().offers_created
    }

    pub fn local_descriptions(&self) -> Vec<String> {
        self.log.lock().local_descriptions.clone()
    }

    pub fn remote_answers(&self) -> Vec<String> {
        self.log.lock().remote_answers.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.log.lock().candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn wait_closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_video_input(&self, caps: &str, _queue: mpsc::Receiver<Bytes>) -> Result<()> {
        self.log.lock().video_caps = Some(caps.to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        if let Some(gate) = &self.offer_gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Peer(e.to_string()))?
                .forget();
        }
        self.log.lock().offers_created += 1;
        if self.fail_offer {
            return Err(Error::Sdp("offer creation failed".to_string()));
        }
        Ok(format!("offer-{}-{}", self.id(), self.generation()))
    }

    async fn set_local_description(&self, sdp: &str) -> Result<()> {
        self.log.lock().local_descriptions.push(sdp.to_string());
        Ok(())
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        if sdp.is_empty() {
            return Err(Error::Sdp("empty answer".to_string()));
        }
        self.log.lock().remote_answers.push(sdp.to_string());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.log.lock().candidates.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    peers: Vec<Arc<FakePeer>>,
    fail_creates: bool,
    fail_offers: bool,
    create_gate: Option<Arc<Semaphore>>,
    offer_gate: Option<Arc<Semaphore>>,
}

#[derive(Clone, Default)]
pub struct FakePeerFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later `create` call fails
    pub fn fail_creates(&self) {
        self.state.lock().fail_creates = true;
    }

    /// `create` blocks until released, like a slow peer stack
    pub fn hold_creates(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().create_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Peers created from now on fail to create offers
    pub fn fail_offers(&self) {
        self.state.lock().fail_offers = true;
    }

    /// Peers created from now on block in `create_offer` until released
    pub fn hold_offers(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().offer_gate = Some(Arc::clone(&gate));
        gate
    }

    pub fn created(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Most recently created peer for `id`
    pub fn peer(&self, id: &str) -> Option<Arc<FakePeer>> {
        self.state
            .lock()
            .peers
            .iter()
            .rev()
            .find(|peer| peer.id().as_str() == id)
            .cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>> {
        let gate = self.state.lock().create_gate.clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Peer(e.to_string()))?
                .forget();
        }

        let mut state = self.state.lock();
        if state.fail_creates {
            return Err(Error::Peer("peer stack unavailable".to_string()));
        }
        let peer = Arc::new(FakePeer {
            events,
            fail_offer: state.fail_offers,
            offer_gate: state.offer_gate.clone(),
            log: Mutex::new(PeerLog::default()),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });
        state.peers.push(Arc::clone(&peer));
        let peer: Arc<dyn PeerConnection> = peer;
        Ok(peer)
    }
}
