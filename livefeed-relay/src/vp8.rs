//! VP8 RTP payload inspection (RFC 7741)

/// Offset of the VP8 payload header, skipping the payload descriptor
fn payload_header_offset(payload: &[u8]) -> Option<usize> {
    let first = *payload.first()?;
    let mut offset = 1;
    if first & 0x80 != 0 {
        let extension = *payload.get(offset)?;
        offset += 1;
        if extension & 0x80 != 0 {
            // PictureID, 7 or 15 bits
            let picture_id = *payload.get(offset)?;
            offset += if picture_id & 0x80 != 0 { 2 } else { 1 };
        }
        if extension & 0x40 != 0 {
            offset += 1; // TL0PICIDX
        }
        if extension & 0x30 != 0 {
            offset += 1; // TID/Y/KEYIDX
        }
    }
    (offset < payload.len()).then_some(offset)
}

/// True for the first packet of a VP8 keyframe
pub fn is_keyframe_start(payload: &[u8]) -> bool {
    let Some(&descriptor) = payload.first() else {
        return false;
    };
    let start_of_partition = descriptor & 0x10 != 0;
    let partition_index = descriptor & 0x07;
    if !start_of_partition || partition_index != 0 {
        return false;
    }
    // P bit clear marks a keyframe
    payload_header_offset(payload).is_some_and(|offset| payload[offset] & 0x01 == 0)
}
