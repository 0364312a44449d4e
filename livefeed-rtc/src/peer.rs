use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use livefeed_core::peer::{IceCandidate, PeerConnection, PeerEventKind, PeerEventSender};
use livefeed_core::{Error, Result, ViewerId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::codec::{connection_state, local_candidate, remote_candidate, video_capability};

/// Read buffer for incoming RTCP on the video sender
const RTCP_BUFFER_SIZE: usize = 1500;

/// One viewer's WebRTC connection
pub struct RtcPeer {
    id: ViewerId,
    connection: Arc<RTCPeerConnection>,
    /// Delivery writer and RTCP reader
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtcPeer {
    pub(crate) async fn new(
        api: &API,
        configuration: RTCConfiguration,
        events: PeerEventSender,
    ) -> Result<Self> {
        let connection = api
            .new_peer_connection(configuration)
            .await
            .map_err(|e| Error::Peer(format!("Failed to create peer connection: {e}")))?;
        register_callbacks(&connection, &events);

        info!(
            client_id = %events.id(),
            generation = events.generation(),
            "Created peer connection"
        );

        Ok(Self {
            id: events.id().clone(),
            connection: Arc::new(connection),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

fn register_callbacks(connection: &RTCPeerConnection, events: &PeerEventSender) {
    let sender = events.clone();
    connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(client_id = %sender.id(), %state, "Peer connection state changed");
        if let Some(state) = connection_state(state) {
            sender.emit(PeerEventKind::ConnectionState(state));
        }
        Box::pin(async {})
    }));

    let sender = events.clone();
    connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // None marks the end of gathering
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    sender.emit(PeerEventKind::LocalCandidate(local_candidate(init)));
                }
                Err(e) => warn!(client_id = %sender.id(), error = %e, "Failed to serialize ICE candidate"),
            }
        }
        Box::pin(async {})
    }));

    let sender = events.clone();
    connection.on_negotiation_needed(Box::new(move || {
        sender.emit(PeerEventKind::NegotiationNeeded);
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_video_input(&self, caps: &str, mut queue: mpsc::Receiver<Bytes>) -> Result<()> {
        let capability = video_capability(caps)?;
        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            format!("video-{}", self.id),
            format!("livefeed-{}", self.id),
        ));

        let rtp_sender = self
            .connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::Peer(format!("Failed to add video track: {e}")))?;

        // Incoming RTCP must be read for the interceptors to run
        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        let id = self.id.clone();
        let writer = tokio::spawn(async move {
            while let Some(packet) = queue.recv().await {
                match track.write(&packet).await {
                    Ok(_) => {}
                    Err(webrtc::Error::ErrClosedPipe) => break,
                    Err(e) => debug!(client_id = %id, error = %e, "Failed to write video packet"),
                }
            }
            debug!(client_id = %id, "Video delivery finished");
        });

        self.tasks.lock().extend([rtcp, writer]);
        debug!(client_id = %self.id, caps, "Video track added");
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create offer: {e}")))?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| Error::Sdp(format!("Failed to parse offer: {e}")))?;
        self.connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set local description: {e}")))
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| Error::Sdp(format!("Failed to parse answer: {e}")))?;
        self.connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set remote description: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.connection
            .add_ice_candidate(remote_candidate(candidate)?)
            .await
            .map_err(|e| Error::Peer(format!("Failed to add ICE candidate: {e}")))
    }

    async fn close(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(client_id = %self.id, "Closing peer connection");
        self.connection
            .close()
            .await
            .map_err(|e| Error::Peer(format!("Failed to close connection: {e}")))
    }
}
