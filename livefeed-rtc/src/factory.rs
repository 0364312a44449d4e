use std::sync::Arc;

use async_trait::async_trait;
use livefeed_core::config::WebRtcConfig;
use livefeed_core::peer::{PeerConnection, PeerEventSender, PeerFactory};
use livefeed_core::{Error, Result};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::peer::RtcPeer;

/// Creates [`RtcPeer`]s sharing one media engine and ICE server list
pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcPeerFactory {
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Peer(format!("Failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Peer(format!("Failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>> {
        let peer = RtcPeer::new(&self.api, self.configuration(), events).await?;
        Ok(Arc::new(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livefeed_core::ViewerId;
    use tokio::sync::mpsc;

    fn offline_factory() -> RtcPeerFactory {
        RtcPeerFactory::new(&WebRtcConfig {
            stun_servers: Vec::new(),
            ..WebRtcConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_ice_servers_from_config() {
        let factory = RtcPeerFactory::new(&WebRtcConfig::default()).unwrap();
        let configuration = factory.configuration();
        assert_eq!(configuration.ice_servers.len(), 1);
        assert_eq!(
            configuration.ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
    }

    #[tokio::test]
    async fn test_offer_carries_video_track() {
        let factory = offline_factory();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let peer = factory
            .create(PeerEventSender::new(ViewerId::from("viewer-1"), 1, events_tx))
            .await
            .unwrap();

        let (_queue_tx, queue_rx) = mpsc::channel(10);
        peer.add_video_input("video/x-vp8", queue_rx).await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.contains("m=video"));
        assert!(offer.contains("VP8/90000"));

        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_caps_rejected() {
        let factory = offline_factory();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let peer = factory
            .create(PeerEventSender::new(ViewerId::from("viewer-2"), 1, events_tx))
            .await
            .unwrap();

        let (_queue_tx, queue_rx) = mpsc::channel(10);
        assert!(peer.add_video_input("audio/x-opus", queue_rx).await.is_err());
        peer.close().await.unwrap();
    }
}
