//! Transport packet framing.
//!
//! A [`PacketCodec`] turns whole MTProto packets into bytes for the wire and
//! reassembles packets from whatever chunks the byte stream delivers. Two of
//! the [MTProto transports] are provided:
//!
//! * [`IntermediateCodec`]: tag `ee ee ee ee`, every packet is
//!   `[4-byte LE length][payload]`.
//! * [`AbridgedCodec`]: tag `ef`, the length is counted in 4-byte words and
//!   takes 1 byte (`< 0x7f`) or `0x7f` followed by 3 bytes.
//!
//! [MTProto transports]: https://core.telegram.org/mtproto/mtproto-transports

/// Packets larger than this are refused in both directions.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// An in-band transport error: the server sent a bare negative `int32`
/// instead of a packet, e.g. `-404` (unknown auth key) or `-429` (flood).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("transport error {0}")]
pub struct TransportError(pub i32);

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("packet of {0} bytes exceeds the transport limit")]
    PacketTooLarge(usize),
    #[error("abridged packets must be a multiple of 4 bytes, got {0}")]
    Unaligned(usize),
    #[error("obfuscated codec used before its tag was sent")]
    NotReady,
}

/// Output of [`PacketCodec::feed`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecEvent {
    Packet(Vec<u8>),
    TransportError(TransportError),
}

/// A framing mode for a byte-stream transport.
pub trait PacketCodec: Send {
    /// Bytes sent once right after connecting, announcing the framing.
    fn tag(&mut self) -> Vec<u8>;

    /// Frame one packet.
    fn encode(&mut self, packet: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Append bytes read from the stream and return every packet completed
    /// by them. An incomplete tail is kept for the next call.
    fn feed(&mut self, data: &[u8]) -> Result<Vec<CodecEvent>, CodecError>;

    /// Forget any partially received packet.
    fn reset(&mut self);
}

fn classify(packet: Vec<u8>) -> CodecEvent {
    if packet.len() == 4 {
        let code = i32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
        if code < 0 {
            return CodecEvent::TransportError(TransportError(code));
        }
    }
    CodecEvent::Packet(packet)
}

// ─── Intermediate ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct IntermediateCodec {
    buffer: Vec<u8>,
}

impl IntermediateCodec {
    pub fn new() -> Self { Self::default() }
}

impl PacketCodec for IntermediateCodec {
    fn tag(&mut self) -> Vec<u8> { vec![0xee, 0xee, 0xee, 0xee] }

    fn encode(&mut self, packet: &[u8]) -> Result<Vec<u8>, CodecError> {
        if packet.len() > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(packet.len()));
        }
        let mut out = Vec::with_capacity(4 + packet.len());
        out.extend_from_slice(&(packet.len() as u32).to_le_bytes());
        out.extend_from_slice(packet);
        Ok(out)
    }

    fn feed(&mut self, data: &[u8]) -> Result<Vec<CodecEvent>, CodecError> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();
        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len = u32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
            if len > MAX_PACKET_SIZE {
                self.buffer.clear();
                return Err(CodecError::PacketTooLarge(len));
            }
            if self.buffer.len() < 4 + len {
                break;
            }
            let packet = self.buffer[4..4 + len].to_vec();
            self.buffer.drain(..4 + len);
            events.push(classify(packet));
        }
        Ok(events)
    }

    fn reset(&mut self) { self.buffer.clear(); }
}

// ─── Abridged ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct AbridgedCodec {
    buffer: Vec<u8>,
}

impl AbridgedCodec {
    pub fn new() -> Self { Self::default() }
}

impl PacketCodec for AbridgedCodec {
    fn tag(&mut self) -> Vec<u8> { vec![0xef] }

    fn encode(&mut self, packet: &[u8]) -> Result<Vec<u8>, CodecError> {
        if packet.len() % 4 != 0 {
            return Err(CodecError::Unaligned(packet.len()));
        }
        if packet.len() > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(packet.len()));
        }
        let words = packet.len() / 4;
        let mut out = Vec::with_capacity(4 + packet.len());
        if words < 0x7f {
            out.push(words as u8);
        } else {
            out.push(0x7f);
            out.extend_from_slice(&(words as u32).to_le_bytes()[..3]);
        }
        out.extend_from_slice(packet);
        Ok(out)
    }

    fn feed(&mut self, data: &[u8]) -> Result<Vec<CodecEvent>, CodecError> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();
        loop {
            let Some(&first) = self.buffer.first() else { break };
            let (header, words) = if first < 0x7f {
                (1, first as usize)
            } else {
                if self.buffer.len() < 4 {
                    break;
                }
                (4, u32::from_le_bytes([self.buffer[1], self.buffer[2], self.buffer[3], 0]) as usize)
            };
            let len = words * 4;
            if len > MAX_PACKET_SIZE {
                self.buffer.clear();
                return Err(CodecError::PacketTooLarge(len));
            }
            if self.buffer.len() < header + len {
                break;
            }
            let packet = self.buffer[header..header + len].to_vec();
            self.buffer.drain(..header + len);
            events.push(classify(packet));
        }
        Ok(events)
    }

    fn reset(&mut self) { self.buffer.clear(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intermediate_frame_layout() {
        let mut c = IntermediateCodec::new();
        assert_eq!(c.tag(), [0xee; 4]);
        assert_eq!(c.encode(&[1, 2, 3, 4, 5]).unwrap(), [5, 0, 0, 0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn abridged_long_header() {
        let mut c = AbridgedCodec::new();
        let packet = vec![0u8; 0x7f * 4];
        let framed = c.encode(&packet).unwrap();
        assert_eq!(&framed[..4], &[0x7f, 0x7f, 0, 0]);
        let events = c.feed(&framed).unwrap();
        assert_eq!(events, vec![CodecEvent::Packet(packet)]);
    }

    #[test]
    fn abridged_rejects_unaligned() {
        assert!(matches!(AbridgedCodec::new().encode(&[0; 3]), Err(CodecError::Unaligned(3))));
    }

    #[test]
    fn oversized_length_is_an_error() {
        let mut c = IntermediateCodec::new();
        let len = (MAX_PACKET_SIZE as u32 + 1).to_le_bytes();
        assert!(matches!(c.feed(&len), Err(CodecError::PacketTooLarge(_))));
    }
}
