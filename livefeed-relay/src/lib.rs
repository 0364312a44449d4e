//! UDP passthrough media graph for already-encoded VP8 RTP
//!
//! The relay never decodes: the "decode" stage is a keyframe detector, the
//! normalize stage only records the output contract, and switching happens on
//! RTP packets at keyframe boundaries.

mod backend;
mod fanout;
mod graph;
mod router;
pub mod rtp;
pub mod vp8;

pub use backend::RelayBackend;
pub use fanout::FanOut;
pub use graph::{RelayGraph, RTP_CAPS, VP8_CAPS};
pub use router::{Router, OUTPUT_SSRC, VIDEO_CLOCK_RATE};
