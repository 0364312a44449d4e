//! KLV telemetry extraction from an MPEG transport stream
//!
//! Transport packets arrive in arbitrary chunks. Packets on the configured
//! PIDs are reassembled into PES packets, and any PES payload that starts
//! with the SMPTE 336M UAS local-set key is reported as one record.

use std::collections::{HashMap, HashSet};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Upper bound of one PES reassembly buffer
pub const MAX_PES_SIZE: usize = 64 * 1024;

/// SMPTE 336M Universal Label of the UAS Datalink local set
pub const UAS_LOCAL_SET_KEY: [u8; 16] = [
    0x06, 0x0E, 0x2B, 0x34, 0x02, 0x0B, 0x01, 0x01, 0x0E, 0x01, 0x03, 0x01, 0x01, 0x00, 0x00, 0x00,
];

const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
const PES_FIXED_HEADER_LEN: usize = 9;

/// One extracted KLV payload, key included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlvRecord(Bytes);

impl KlvRecord {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Standard base64 with padding, as sent on the control channel
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }
}

#[derive(Debug)]
pub struct KlvExtractor {
    pids: HashSet<u16>,
    carry: BytesMut,
    pes: HashMap<u16, BytesMut>,
}

impl KlvExtractor {
    pub fn new(pids: impl IntoIterator<Item = u16>) -> Self {
        Self {
            pids: pids.into_iter().collect(),
            carry: BytesMut::with_capacity(TS_PACKET_SIZE * 8),
            pes: HashMap::new(),
        }
    }

    /// Feed a chunk of transport-stream bytes; returns every record completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<KlvRecord> {
        self.carry.extend_from_slice(chunk);
        let mut records = Vec::new();

        while self.carry.len() >= TS_PACKET_SIZE {
            if self.carry[0] != TS_SYNC_BYTE {
                match self.carry.iter().position(|b| *b == TS_SYNC_BYTE) {
                    Some(offset) => {
                        trace!(skipped = offset, "Resynchronizing transport stream");
                        self.carry.advance(offset);
                        continue;
                    }
                    None => {
                        trace!(skipped = self.carry.len(), "No sync byte in buffer");
                        self.carry.clear();
                        break;
                    }
                }
            }

            let packet = self.carry.split_to(TS_PACKET_SIZE).freeze();
            if let Some(record) = self.handle_packet(&packet) {
                records.push(record);
            }
        }

        records
    }

    /// Drop all partial state
    pub fn reset(&mut self) {
        self.carry.clear();
        self.pes.clear();
    }

    fn handle_packet(&mut self, packet: &[u8]) -> Option<KlvRecord> {
        let pid = (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]);
        if !self.pids.contains(&pid) {
            return None;
        }

        let payload_unit_start = packet[1] & 0x40 != 0;
        let adaptation_control = (packet[3] & 0x30) >> 4;
        let payload_offset = match adaptation_control {
            // adaptation field only
            0b10 => return None,
            0b11 => 5 + usize::from(packet[4]),
            _ => 4,
        };
        if payload_offset >= TS_PACKET_SIZE {
            return None;
        }
        let payload = &packet[payload_offset..];

        if payload_unit_start {
            let previous = self.pes.insert(pid, BytesMut::from(payload));
            return previous
                .filter(|pes| !pes.is_empty())
                .and_then(|pes| parse_pes(&pes));
        }

        if let Some(buffer) = self.pes.get_mut(&pid) {
            buffer.extend_from_slice(payload);
            if buffer.len() > MAX_PES_SIZE {
                debug!(pid, size = buffer.len(), "PES reassembly overflow, discarding");
                self.pes.remove(&pid);
            }
        }
        None
    }
}

/// Extract a UAS local-set record from one complete PES packet
pub fn parse_pes(pes: &[u8]) -> Option<KlvRecord> {
    if pes.len() < PES_FIXED_HEADER_LEN || pes[..3] != PES_START_CODE {
        return None;
    }
    let header_len = PES_FIXED_HEADER_LEN + usize::from(pes[8]);
    let payload = pes.get(header_len..).filter(|p| !p.is_empty())?;

    if payload.starts_with(&UAS_LOCAL_SET_KEY) {
        Some(KlvRecord(Bytes::copy_from_slice(payload)))
    } else {
        None
    }
}
