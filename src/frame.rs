//! The wire frame codec: `varint(message_number) || varint(flags) || payload`.
//!
//! Each wire frame is a whole binary transport message carrying one segment
//! of one BLIP message. Decoding a frame never blocks on partial data — a
//! transport delivers whole frames, so `Incomplete` here always indicates a
//! malformed varint, not a short read.

use crate::error::BlipError;
use crate::flags::{InvalidFlags, MessageFlags};
use crate::varint::{self, VarintError};
use bytes::{Bytes, BytesMut};

/// A decoded frame header: the message number and validated flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub number: u32,
    pub flags: MessageFlags,
}

/// A whole decoded wire frame: header plus the payload bytes that follow it
/// (property block + body fragment on frame 1, pure body fragment after).
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl WireFrame {
    /// Decode one whole transport message. A transport delivers complete
    /// binary messages, so any varint error here is a protocol violation
    /// (`BadFrame`), not a sign that more bytes are coming.
    pub fn decode(mut data: Bytes) -> Result<Self, BlipError> {
        let number = varint::get_varint(&mut data).map_err(varint_to_bad_frame)? as u32;
        let flags_raw = varint::get_varint(&mut data).map_err(varint_to_bad_frame)?;
        let flags = MessageFlags::decode(flags_raw).map_err(flags_to_bad_frame)?;
        Ok(WireFrame {
            header: FrameHeader { number, flags },
            payload: data,
        })
    }

    /// Encode this frame to a single transport message.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10 + 10 + self.payload.len());
        varint::put_varint(&mut buf, self.header.number as u64);
        varint::put_varint(&mut buf, self.header.flags.encode());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Size of the encoded header alone, used by the scheduler to budget
    /// how many payload bytes fit within a target frame size.
    pub fn header_len(number: u32, flags: MessageFlags) -> usize {
        varint::varint_len(number as u64) + varint::varint_len(flags.encode())
    }
}

fn varint_to_bad_frame(e: VarintError) -> BlipError {
    match e {
        VarintError::Incomplete => {
            BlipError::BadFrame("truncated varint in frame header".into())
        }
        VarintError::Malformed => BlipError::BadFrame("malformed varint in frame header".into()),
    }
}

fn flags_to_bad_frame(e: InvalidFlags) -> BlipError {
    BlipError::BadFrame(format!("flags value {:#x} exceeds MaxFlag or unknown type", e.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::MessageType;

    #[test]
    fn roundtrip_frame_with_payload() {
        let frame = WireFrame {
            header: FrameHeader {
                number: 42,
                flags: MessageFlags::new(MessageType::Msg),
            },
            payload: Bytes::from_static(b"hello"),
        };
        let encoded = frame.encode();
        let decoded = WireFrame::decode(encoded).unwrap();
        assert_eq!(decoded.header.number, 42);
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn zero_length_payload() {
        let frame = WireFrame {
            header: FrameHeader {
                number: 1,
                flags: MessageFlags::new(MessageType::Rpy),
            },
            payload: Bytes::new(),
        };
        let decoded = WireFrame::decode(frame.encode()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn bad_flags_value_is_fatal() {
        let mut buf = BytesMut::new();
        varint::put_varint(&mut buf, 1); // number
        varint::put_varint(&mut buf, 0x1FF); // flags > MaxFlag
        let err = WireFrame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, BlipError::BadFrame(_)));
    }

    #[test]
    fn truncated_header_is_bad_frame() {
        let data = Bytes::from_static(&[0x80]); // continuation bit set, nothing follows
        let err = WireFrame::decode(data).unwrap_err();
        assert!(matches!(err, BlipError::BadFrame(_)));
    }
}
