//! Line-delimited JSON framing for the control channel

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use super::protocol::{InboundMessage, OutboundMessage};
use crate::error::Error;

/// Splits the byte stream into lines and parses each one independently.
///
/// Blank, oversized, non-UTF-8 and malformed lines are logged and skipped;
/// only I/O failures end the stream.
#[derive(Debug)]
pub struct ControlCodec {
    lines: LinesCodec,
}

impl ControlCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_length),
        }
    }

    fn next_message<F>(&mut self, src: &mut BytesMut, mut next_line: F) -> Result<Option<InboundMessage>, Error>
    where
        F: FnMut(&mut LinesCodec, &mut BytesMut) -> Result<Option<String>, LinesCodecError>,
    {
        loop {
            let line = match next_line(&mut self.lines, src) {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        max_length = self.lines.max_length(),
                        "Control line too long, discarding"
                    );
                    continue;
                }
                Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    warn!(error = %e, "Control line is not valid UTF-8, discarding");
                    continue;
                }
                Err(LinesCodecError::Io(e)) => return Err(Error::Io(e)),
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<InboundMessage>(trimmed) {
                Ok(message) => {
                    debug!(kind = message.kind(), "Control message received");
                    return Ok(Some(message));
                }
                Err(e) => {
                    warn!(error = %e, line = %truncate(trimmed, 200), "Malformed control message, skipping");
                }
            }
        }
    }
}

impl Decoder for ControlCodec {
    type Item = InboundMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_message(src, LinesCodec::decode)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_message(src, LinesCodec::decode_eof)
    }
}

impl Encoder<OutboundMessage> for ControlCodec {
    type Error = Error;

    fn encode(&mut self, item: OutboundMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item)?;
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
