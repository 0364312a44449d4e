//! Viewer session lifecycle
//!
//! Each viewer owns a fan-out branch, a delivery queue and a peer connection.
//! Peer creation and every later peer operation for one session run strictly
//! in order on a per-session worker task; their results come back to the
//! control loop as [`NegotiationCompletion`]s keyed by `(id, generation)`, so
//! results that outlive their session are recognised and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control::OutboundMessage;
use crate::error::{Error, Result};
use crate::graph::MediaGraph;
use crate::peer::{
    IceCandidate, PeerConnection, PeerConnectionState, PeerEvent, PeerEventKind, PeerEventSender,
    PeerFactory,
};
use crate::types::ViewerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    Idle,
    OfferPending,
    OfferSent,
    AnswerReceived,
    Connected,
    Failed,
}

impl NegotiationState {
    /// Remote candidates are only meaningful once our offer is out
    #[must_use]
    pub fn accepts_candidates(self) -> bool {
        self >= Self::OfferSent && self != Self::Failed
    }
}

/// Work queued on a session's peer worker
#[derive(Debug)]
enum PeerOp {
    CreateOffer,
    CommitLocal(String),
    ApplyAnswer(String),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Debug)]
pub enum NegotiationStep {
    /// Peer creation or track setup failed; the worker has stopped
    SetupFailed(Error),
    OfferCreated(Result<String>),
    LocalCommitted { sdp: String, result: Result<()> },
    AnswerApplied(Result<()>),
    CandidateApplied(Result<()>),
}

#[derive(Debug)]
pub struct NegotiationCompletion {
    pub id: ViewerId,
    pub generation: u64,
    pub step: NegotiationStep,
}

struct ViewerSession {
    generation: u64,
    state: NegotiationState,
    offer_triggered: bool,
    ops: mpsc::UnboundedSender<PeerOp>,
}

impl ViewerSession {
    fn submit(&self, id: &ViewerId, op: PeerOp) {
        if self.ops.send(op).is_err() {
            debug!(client_id = %id, "Peer worker already stopped");
        }
    }
}

/// Owner of every viewer session; lives inside the control loop
pub struct SessionManager {
    factory: Arc<dyn PeerFactory>,
    sessions: HashMap<ViewerId, ViewerSession>,
    next_generation: u64,
    queue_capacity: usize,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    completions: mpsc::UnboundedSender<NegotiationCompletion>,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        queue_capacity: usize,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        completions: mpsc::UnboundedSender<NegotiationCompletion>,
    ) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
            next_generation: 0,
            queue_capacity,
            peer_events,
            completions,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn state(&self, id: &ViewerId) -> Option<NegotiationState> {
        self.sessions.get(id).map(|session| session.state)
    }

    pub fn generation(&self, id: &ViewerId) -> Option<u64> {
        self.sessions.get(id).map(|session| session.generation)
    }

    /// Create a session for `id`, replacing any existing one, and start negotiating.
    ///
    /// Only the fan-out branch is attached here; the peer is built on the
    /// session's worker.
    pub fn add(
        &mut self,
        id: ViewerId,
        graph: Option<&mut (dyn MediaGraph + 'static)>,
    ) -> Vec<OutboundMessage> {
        let Some(graph) = graph else {
            info!(client_id = %id, "No pipeline running, ignoring add_client");
            return Vec::new();
        };

        if self.sessions.contains_key(&id) {
            info!(client_id = %id, "Replacing existing session");
            self.remove(&id, Some(&mut *graph));
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        let (queue_tx, queue_rx) = mpsc::channel::<Bytes>(self.queue_capacity);
        if let Err(e) = graph.attach_branch(&id, queue_tx) {
            warn!(client_id = %id, error = %e, "Failed to attach viewer branch");
            return vec![OutboundMessage::ClientFailed { client_id: id }];
        }

        let setup = PeerSetup {
            factory: Arc::clone(&self.factory),
            events: PeerEventSender::new(id.clone(), generation, self.peer_events.clone()),
            caps: graph.encoded_caps(),
            queue: queue_rx,
        };
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        tokio::spawn(peer_worker(
            id.clone(),
            generation,
            setup,
            ops_rx,
            self.completions.clone(),
        ));
        self.sessions.insert(
            id.clone(),
            ViewerSession {
                generation,
                state: NegotiationState::Idle,
                offer_triggered: false,
                ops: ops_tx,
            },
        );
        info!(client_id = %id, generation, sessions = self.sessions.len(), "Viewer session added");

        self.trigger_offer(&id);
        Vec::new()
    }

    /// Tear a session down; unknown ids are a no-op
    pub fn remove(&mut self, id: &ViewerId, graph: Option<&mut (dyn MediaGraph + 'static)>) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            debug!(client_id = %id, "remove for unknown session");
            return false;
        };
        if let Some(graph) = graph {
            graph.detach_branch(id);
        }
        session.submit(id, PeerOp::Close);
        info!(client_id = %id, generation = session.generation, "Viewer session removed");
        true
    }

    /// Tear down every session
    pub fn clear(&mut self, mut graph: Option<&mut (dyn MediaGraph + 'static)>) {
        let ids: Vec<ViewerId> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.remove(&id, graph.as_deref_mut());
        }
    }

    /// Start offer creation unless this session already did
    pub fn trigger_offer(&mut self, id: &ViewerId) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.offer_triggered {
            debug!(client_id = %id, "Offer already triggered");
            return;
        }
        session.offer_triggered = true;
        session.state = NegotiationState::OfferPending;
        session.submit(id, PeerOp::CreateOffer);
    }

    pub fn set_remote(&mut self, id: &ViewerId, sdp: String) {
        let Some(session) = self.sessions.get_mut(id) else {
            debug!(client_id = %id, "Answer for unknown session");
            return;
        };
        if session.state != NegotiationState::OfferSent {
            warn!(client_id = %id, state = ?session.state, "Unexpected answer, ignoring");
            return;
        }
        session.submit(id, PeerOp::ApplyAnswer(sdp));
    }

    pub fn add_candidate(&mut self, id: &ViewerId, candidate: IceCandidate) {
        let Some(session) = self.sessions.get(id) else {
            debug!(client_id = %id, "Candidate for unknown session");
            return;
        };
        if !session.state.accepts_candidates() {
            debug!(client_id = %id, state = ?session.state, "Candidate before offer, dropping");
            return;
        }
        session.submit(id, PeerOp::AddCandidate(candidate));
    }

    pub fn on_completion(
        &mut self,
        completion: NegotiationCompletion,
        graph: Option<&mut (dyn MediaGraph + 'static)>,
    ) -> Vec<OutboundMessage> {
        let NegotiationCompletion {
            id,
            generation,
            step,
        } = completion;
        let Some(session) = self.current(&id, generation) else {
            debug!(client_id = %id, generation, "Discarding completion for stale session");
            return Vec::new();
        };

        match step {
            NegotiationStep::OfferCreated(Ok(sdp)) => {
                session.submit(&id, PeerOp::CommitLocal(sdp));
                Vec::new()
            }
            NegotiationStep::LocalCommitted {
                sdp,
                result: Ok(()),
            } => {
                session.state = NegotiationState::OfferSent;
                info!(client_id = %id, "Offer ready");
                vec![OutboundMessage::Offer { client_id: id, sdp }]
            }
            NegotiationStep::AnswerApplied(Ok(())) => {
                if session.state < NegotiationState::AnswerReceived {
                    session.state = NegotiationState::AnswerReceived;
                }
                debug!(client_id = %id, "Remote answer applied");
                Vec::new()
            }
            NegotiationStep::CandidateApplied(result) => {
                if let Err(e) = result {
                    warn!(client_id = %id, error = %e, "Failed to add remote candidate");
                }
                Vec::new()
            }
            NegotiationStep::SetupFailed(e)
            | NegotiationStep::OfferCreated(Err(e))
            | NegotiationStep::LocalCommitted { result: Err(e), .. }
            | NegotiationStep::AnswerApplied(Err(e)) => {
                session.state = NegotiationState::Failed;
                warn!(client_id = %id, error = %e, "Negotiation failed, closing session");
                self.remove(&id, graph);
                vec![OutboundMessage::ClientFailed { client_id: id }]
            }
        }
    }

    pub fn on_peer_event(&mut self, event: PeerEvent) -> Vec<OutboundMessage> {
        let PeerEvent {
            id,
            generation,
            kind,
        } = event;
        let Some(session) = self.current(&id, generation) else {
            debug!(client_id = %id, generation, "Discarding peer event for stale session");
            return Vec::new();
        };

        match kind {
            PeerEventKind::LocalCandidate(candidate) => vec![OutboundMessage::IceCandidate {
                client_id: id,
                candidate: candidate.candidate,
                sdp_mline_index: candidate.sdp_mline_index,
            }],
            PeerEventKind::ConnectionState(PeerConnectionState::Connected) => {
                session.state = NegotiationState::Connected;
                info!(client_id = %id, "Viewer connected");
                vec![OutboundMessage::ClientConnected { client_id: id }]
            }
            PeerEventKind::ConnectionState(PeerConnectionState::Failed) => {
                session.state = NegotiationState::Failed;
                warn!(client_id = %id, "Viewer connection failed");
                vec![OutboundMessage::ClientFailed { client_id: id }]
            }
            PeerEventKind::ConnectionState(state) => {
                debug!(client_id = %id, %state, "Peer connection state changed");
                Vec::new()
            }
            PeerEventKind::NegotiationNeeded => {
                self.trigger_offer(&id);
                Vec::new()
            }
        }
    }

    fn current(&mut self, id: &ViewerId, generation: u64) -> Option<&mut ViewerSession> {
        self.sessions
            .get_mut(id)
            .filter(|session| session.generation == generation)
    }
}

/// Everything a worker needs to build its session's peer
struct PeerSetup {
    factory: Arc<dyn PeerFactory>,
    events: PeerEventSender,
    caps: String,
    queue: mpsc::Receiver<Bytes>,
}

impl PeerSetup {
    async fn open(self) -> Result<Arc<dyn PeerConnection>> {
        let id = self.events.id().clone();
        let peer = self.factory.create(self.events).await?;
        if let Err(e) = peer.add_video_input(&self.caps, self.queue).await {
            close_quietly(&id, peer.as_ref()).await;
            return Err(e);
        }
        Ok(peer)
    }
}

async fn close_quietly(id: &ViewerId, peer: &dyn PeerConnection) {
    if let Err(e) = peer.close().await {
        debug!(client_id = %id, error = %e, "Peer close failed");
    }
}

/// Builds the session's peer, then runs its operations in submission order
async fn peer_worker(
    id: ViewerId,
    generation: u64,
    setup: PeerSetup,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
    completions: mpsc::UnboundedSender<NegotiationCompletion>,
) {
    let peer = match setup.open().await {
        Ok(peer) => peer,
        Err(e) => {
            let _ = completions.send(NegotiationCompletion {
                id,
                generation,
                step: NegotiationStep::SetupFailed(e),
            });
            return;
        }
    };

    while let Some(op) = ops.recv().await {
        let step = match op {
            PeerOp::CreateOffer => NegotiationStep::OfferCreated(peer.create_offer().await),
            PeerOp::CommitLocal(sdp) => {
                let result = peer.set_local_description(&sdp).await;
                NegotiationStep::LocalCommitted { sdp, result }
            }
            PeerOp::ApplyAnswer(sdp) => {
                NegotiationStep::AnswerApplied(peer.set_remote_answer(&sdp).await)
            }
            PeerOp::AddCandidate(candidate) => {
                NegotiationStep::CandidateApplied(peer.add_ice_candidate(&candidate).await)
            }
            PeerOp::Close => break,
        };
        let completion = NegotiationCompletion {
            id: id.clone(),
            generation,
            step,
        };
        if completions.send(completion).is_err() {
            break;
        }
    }

    close_quietly(&id, peer.as_ref()).await;
    debug!(client_id = %id, generation, "Peer worker stopped");
}
