//! Minimal RTP fixed-header access (RFC 3550)

use bytes::{Bytes, BytesMut};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    payload_start: usize,
    payload_end: usize,
}

impl RtpHeader {
    /// Parse the header of `packet`; `None` if it is not a well-formed RTP packet
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != RTP_VERSION {
            return None;
        }
        let has_padding = packet[0] & 0x20 != 0;
        let has_extension = packet[0] & 0x10 != 0;
        let csrc_count = usize::from(packet[0] & 0x0F);

        let mut payload_start = RTP_HEADER_LEN + 4 * csrc_count;
        if has_extension {
            let words = packet.get(payload_start + 2..payload_start + 4)?;
            let words = usize::from(u16::from_be_bytes([words[0], words[1]]));
            payload_start += 4 + 4 * words;
        }

        let padding = if has_padding {
            usize::from(*packet.last()?)
        } else {
            0
        };
        let payload_end = packet.len().checked_sub(padding)?;
        if payload_start > payload_end {
            return None;
        }

        Some(Self {
            payload_type: packet[1] & 0x7F,
            marker: packet[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
            payload_start,
            payload_end,
        })
    }

    /// Payload of the packet this header was parsed from
    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        packet.get(self.payload_start..self.payload_end).unwrap_or_default()
    }

    /// Copy of the packet this header was parsed from, with new sequence,
    /// timestamp and SSRC
    pub fn rewrite(&self, packet: &[u8], sequence: u16, timestamp: u32, ssrc: u32) -> Bytes {
        let mut out = BytesMut::from(packet);
        out[2..4].copy_from_slice(&sequence.to_be_bytes());
        out[4..8].copy_from_slice(&timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&ssrc.to_be_bytes());
        out.freeze()
    }
}
