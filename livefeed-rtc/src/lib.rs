//! WebRTC peer connections for livefeed viewers
//!
//! Implements the [`livefeed_core::peer`] contract on top of `webrtc`. Each
//! viewer gets one send-only VP8 track fed from its delivery queue.

mod codec;
mod factory;
mod peer;

pub use codec::{connection_state, local_candidate, remote_candidate, video_capability};
pub use factory::RtcPeerFactory;
pub use peer::RtcPeer;
