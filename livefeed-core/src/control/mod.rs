//! Control channel to the supervising process
//!
//! Newline-delimited JSON over a connected local stream socket.

pub mod codec;
pub mod gateway;
pub mod outbound;
pub mod protocol;

pub use codec::ControlCodec;
pub use gateway::{ControlChannel, GatewayTasks};
pub use outbound::{outbound_channel, OutboundReceiver, OutboundSender};
pub use protocol::{InboundMessage, OutboundMessage};
