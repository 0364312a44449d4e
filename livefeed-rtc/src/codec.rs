//! Conversions between livefeed descriptions and `webrtc` types

use livefeed_core::peer::{IceCandidate, PeerConnectionState};
use livefeed_core::{Error, Result};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

/// RTP clock rate for video payloads
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Codec capability for the encoded stream described by `caps`.
///
/// Accepts plain media types (`video/x-vp8`) and RTP caps carrying an
/// `encoding-name` field.
pub fn video_capability(caps: &str) -> Result<RTCRtpCodecCapability> {
    let mut fields = caps.split(',').map(str::trim);
    let media_type = fields.next().unwrap_or_default();
    let encoding = fields
        .find_map(|field| field.strip_prefix("encoding-name="))
        .map(str::to_ascii_uppercase);

    let mime_type = match (media_type, encoding.as_deref()) {
        ("video/x-vp8", _) | (_, Some("VP8")) => MIME_TYPE_VP8,
        ("video/x-vp9", _) | (_, Some("VP9")) => MIME_TYPE_VP9,
        ("video/x-h264", _) | (_, Some("H264")) => MIME_TYPE_H264,
        _ => return Err(Error::Peer(format!("unsupported video caps: {caps}"))),
    };

    let sdp_fmtp_line = if mime_type == MIME_TYPE_H264 {
        H264_FMTP.to_string()
    } else {
        String::new()
    };

    Ok(RTCRtpCodecCapability {
        mime_type: mime_type.to_string(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line,
        rtcp_feedback: vec![],
    })
}

/// `None` for states the control loop does not track
pub fn connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        _ => None,
    }
}

pub fn local_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mline_index: init.sdp_mline_index.map_or(0, u32::from),
    }
}

pub fn remote_candidate(candidate: &IceCandidate) -> Result<RTCIceCandidateInit> {
    let sdp_mline_index = u16::try_from(candidate.sdp_mline_index).map_err(|_| {
        Error::Peer(format!(
            "media line index out of range: {}",
            candidate.sdp_mline_index
        ))
    })?;
    Ok(RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mline_index: Some(sdp_mline_index),
        ..Default::default()
    })
}
