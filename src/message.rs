//! Per-message state: the single largest component. Tracks flags,
//! properties, body, the streaming encode/decode cursors, and ack accounting
//! for both directions of a message's lifecycle.

use crate::compression::{Deflator, Inflator};
use crate::error::BlipError;
use crate::flags::{MessageFlags, MessageType};
use crate::frame::FrameHeader;
use crate::properties::{self, Properties};
use bytes::{Bytes, BytesMut};

/// Bytes between acks before the receiver is required to emit another one.
pub const ACK_INTERVAL_BYTES: u64 = 50_000;

/// Default back-pressure window: the most `bytes_written - bytes_acked` an
/// outgoing message may carry before being iceboxed.
pub const DEFAULT_MAX_UNACKED_BYTES: u64 = 128_000;

/// A message this peer created and is sending.
#[derive(Debug)]
pub struct OutgoingMessage {
    pub number: Option<u32>,
    pub message_type: MessageType,
    pub compressed: bool,
    pub urgent: bool,
    pub no_reply: bool,
    pub meta: bool,
    properties: Properties,
    body: Bytes,
    can_write: bool,
    encoded_payload: Option<Bytes>,
    encode_cursor: usize,
    first_frame_sent: bool,
    pub bytes_written: u64,
    pub bytes_acked: u64,
    pub complete: bool,
    pub sent: bool,
}

impl OutgoingMessage {
    pub fn new(message_type: MessageType) -> Self {
        OutgoingMessage {
            number: None,
            message_type,
            compressed: false,
            urgent: false,
            no_reply: false,
            meta: false,
            properties: Properties::new(),
            body: Bytes::new(),
            can_write: true,
            encoded_payload: None,
            encode_cursor: 0,
            first_frame_sent: false,
            bytes_written: 0,
            bytes_acked: 0,
            complete: false,
            sent: false,
        }
    }

    fn check_can_write(&self) -> Result<(), BlipError> {
        if self.can_write {
            Ok(())
        } else {
            Err(BlipError::ProgrammingError(
                "message is frozen: cannot mutate after encode()".into(),
            ))
        }
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) -> Result<(), BlipError> {
        self.check_can_write()?;
        self.body = body.into();
        Ok(())
    }

    pub fn set_properties(&mut self, properties: Properties) -> Result<(), BlipError> {
        self.check_can_write()?;
        self.properties = properties;
        Ok(())
    }

    pub fn set_urgent(&mut self, value: bool) -> Result<(), BlipError> {
        self.check_can_write()?;
        self.urgent = value;
        Ok(())
    }

    pub fn set_no_reply(&mut self, value: bool) -> Result<(), BlipError> {
        self.check_can_write()?;
        self.no_reply = value;
        Ok(())
    }

    pub fn set_compressed(&mut self, value: bool) -> Result<(), BlipError> {
        self.check_can_write()?;
        self.compressed = value;
        Ok(())
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn can_write(&self) -> bool {
        self.can_write
    }

    /// Assign the message number. May only happen once, at send time.
    pub fn assign_number(&mut self, number: u32) -> Result<(), BlipError> {
        if self.number.is_some() {
            return Err(BlipError::ProgrammingError(
                "message number already assigned".into(),
            ));
        }
        self.number = Some(number);
        Ok(())
    }

    fn flags(&self) -> MessageFlags {
        MessageFlags {
            message_type: self.message_type,
            compressed: self.compressed,
            urgent: self.urgent,
            no_reply: self.no_reply,
            more_coming: false, // recomputed per-frame in next_frame
            meta: self.meta,
        }
    }

    /// Freeze the message: concatenate the property block with the (possibly
    /// compressed) body into a single payload stream that `next_frame` reads
    /// from. No further mutation is allowed afterward.
    pub fn encode(&mut self) -> Result<(), BlipError> {
        self.check_can_write()?;
        let props_block = properties::encode_properties(&self.properties);
        let body_payload: Bytes = if self.compressed {
            Deflator::compress_all(&self.body)
        } else {
            self.body.clone()
        };
        let mut payload = BytesMut::with_capacity(props_block.len() + body_payload.len());
        payload.extend_from_slice(&props_block);
        payload.extend_from_slice(&body_payload);
        self.encoded_payload = Some(payload.freeze());
        self.can_write = false;
        Ok(())
    }

    /// Produce the next wire frame, up to `max_size` bytes including the
    /// frame header. Returns the encoded frame and whether more data remains.
    pub fn next_frame(&mut self, max_size: usize) -> Result<(WireFrameParts, bool), BlipError> {
        let number = self
            .number
            .ok_or_else(|| BlipError::ProgrammingError("message has no assigned number".into()))?;
        let payload = self.encoded_payload.as_ref().ok_or_else(|| {
            BlipError::ProgrammingError("next_frame called before encode()".into())
        })?;

        let header_len = FrameHeader::header_len_estimate(number);
        let budget = max_size.saturating_sub(header_len).max(1);
        let remaining = payload.len() - self.encode_cursor;
        let take = remaining.min(budget);
        let chunk = payload.slice(self.encode_cursor..self.encode_cursor + take);
        self.encode_cursor += take;
        self.bytes_written += take as u64;

        let more_coming = self.encode_cursor < payload.len();
        self.first_frame_sent = true;
        if !more_coming {
            self.complete = true;
        }

        let flags = MessageFlags {
            more_coming,
            ..self.flags()
        };
        Ok((
            WireFrameParts {
                header: FrameHeader { number, flags },
                payload: chunk,
            },
            more_coming,
        ))
    }

    pub fn needs_ack(&self, max_unacked_bytes: u64) -> bool {
        !self.complete && self.bytes_written.saturating_sub(self.bytes_acked) >= max_unacked_bytes
    }

    /// Apply an incoming ACK. Ack values must strictly increase and never
    /// exceed what has actually been written.
    pub fn received_ack(&mut self, bytes_acked: u64) -> Result<(), BlipError> {
        if bytes_acked <= self.bytes_acked || bytes_acked > self.bytes_written {
            return Err(BlipError::BadFrame(format!(
                "non-monotonic or out-of-range ack: {bytes_acked} (prev {}, written {})",
                self.bytes_acked, self.bytes_written
            )));
        }
        self.bytes_acked = bytes_acked;
        Ok(())
    }

    pub fn has_started(&self) -> bool {
        self.first_frame_sent
    }
}

/// The header-and-payload pair `next_frame` hands to the connection; kept
/// distinct from `WireFrame` because the header carries `more_coming`
/// computed at send time rather than decoded from the wire.
#[derive(Debug)]
pub struct WireFrameParts {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl FrameHeader {
    /// Conservative estimate of the encoded header size for budgeting frame
    /// payload sizes. The flags varint is at most 2 bytes (its value never
    /// exceeds `MAX_FLAG` = 0xFF), so reserving 2 bytes is always safe even
    /// though most flag combinations fit in 1.
    pub fn header_len_estimate(number: u32) -> usize {
        crate::varint::varint_len(number as u64) + 2
    }
}

/// A message this peer is receiving.
#[derive(Debug)]
pub struct IncomingMessage {
    pub number: u32,
    pub message_type: MessageType,
    pub urgent: bool,
    pub no_reply: bool,
    pub meta: bool,
    pub more_coming: bool,
    pub complete: bool,
    raw_prefix: BytesMut,
    properties: Option<Properties>,
    compressed: bool,
    inflator: Option<Inflator>,
    body: BytesMut,
    pub bytes_received: u64,
    pub last_acked_received: u64,
}

impl IncomingMessage {
    pub fn new(number: u32, flags: MessageFlags) -> Self {
        IncomingMessage {
            number,
            message_type: flags.message_type,
            urgent: flags.urgent,
            no_reply: flags.no_reply,
            meta: flags.meta,
            more_coming: flags.more_coming,
            complete: false,
            raw_prefix: BytesMut::new(),
            properties: None,
            compressed: false,
            inflator: None,
            body: BytesMut::new(),
            bytes_received: 0,
            last_acked_received: 0,
        }
    }

    pub fn properties(&self) -> Option<&Properties> {
        self.properties.as_ref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn take_body(self) -> Bytes {
        self.body.freeze()
    }

    /// Append one arriving frame's payload. Returns `Ok(false)` if the
    /// property block or a compressed stream turned out malformed, in which
    /// case the caller treats the session as fatally broken.
    pub fn received_frame(&mut self, flags: MessageFlags, data: &[u8]) -> Result<bool, BlipError> {
        self.more_coming = self.more_coming || flags.more_coming;

        if self.properties.is_none() {
            self.raw_prefix.extend_from_slice(data);
            match properties::decode_properties(&self.raw_prefix) {
                Ok((props, consumed)) => {
                    let compressed_wire_flag = flags.compressed;
                    self.compressed = compressed_wire_flag;
                    let remainder = self.raw_prefix.split_off(consumed);
                    self.properties = Some(props);
                    self.raw_prefix.clear();
                    self.ingest_body_bytes(&remainder)?;
                }
                Err(properties::PropertyError::Incomplete) => {
                    // Wait for more frames before the block can be parsed.
                }
                Err(properties::PropertyError::BadData(reason)) => {
                    return Err(BlipError::BadData(reason));
                }
            }
        } else {
            self.ingest_body_bytes(data)?;
        }

        if !flags.more_coming {
            self.complete = true;
        }
        Ok(true)
    }

    fn ingest_body_bytes(&mut self, data: &[u8]) -> Result<(), BlipError> {
        self.bytes_received += data.len() as u64;
        if self.compressed {
            let inflator = self.inflator.get_or_insert_with(Inflator::new);
            inflator.feed(data, &mut self.body)?;
        } else {
            self.body.extend_from_slice(data);
        }
        Ok(())
    }

    /// True if the receive-side ack heuristic says another ACK should be
    /// emitted for this message right now, given the configured ack
    /// interval.
    pub fn should_ack(&self, ack_interval_bytes: u64) -> bool {
        !self.complete
            && self.bytes_received > 0
            && self.last_acked_received / ack_interval_bytes < self.bytes_received / ack_interval_bytes
    }

    pub fn mark_acked(&mut self) {
        self.last_acked_received = self.bytes_received;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_message_lifecycle_basic_roundtrip() {
        let mut out = OutgoingMessage::new(MessageType::Msg);
        out.set_body(Bytes::from_static(b"hello")).unwrap();
        let mut props = Properties::new();
        props.insert("Profile", "echo");
        out.set_properties(props).unwrap();
        out.assign_number(1).unwrap();
        out.encode().unwrap();
        assert!(!out.can_write());

        let (frame, more) = out.next_frame(4096).unwrap();
        assert!(!more);
        assert!(out.complete);

        let mut incoming = IncomingMessage::new(1, frame.header.flags);
        let ok = incoming.received_frame(frame.header.flags, &frame.payload).unwrap();
        assert!(ok);
        assert!(incoming.complete);
        assert_eq!(incoming.body(), b"hello");
        assert_eq!(incoming.properties().unwrap().get("Profile"), Some("echo"));
    }

    #[test]
    fn split_across_many_small_frames() {
        let mut out = OutgoingMessage::new(MessageType::Msg);
        let body = vec![b'x'; 10_000];
        out.set_body(Bytes::from(body.clone())).unwrap();
        out.assign_number(7).unwrap();
        out.encode().unwrap();

        let mut incoming: Option<IncomingMessage> = None;
        loop {
            let (frame, more) = out.next_frame(256).unwrap();
            let msg = incoming
                .get_or_insert_with(|| IncomingMessage::new(7, frame.header.flags));
            msg.received_frame(frame.header.flags, &frame.payload).unwrap();
            if !more {
                break;
            }
        }
        let incoming = incoming.unwrap();
        assert!(incoming.complete);
        assert_eq!(incoming.body(), body.as_slice());
    }

    #[test]
    fn compressed_large_body_roundtrips() {
        let mut out = OutgoingMessage::new(MessageType::Msg);
        let body = b"abcdefgh".repeat(200_000); // ~1.6MB, highly compressible
        out.set_body(Bytes::from(body.clone())).unwrap();
        out.set_compressed(true).unwrap();
        out.assign_number(3).unwrap();
        out.encode().unwrap();

        let mut incoming: Option<IncomingMessage> = None;
        loop {
            let (frame, more) = out.next_frame(4096).unwrap();
            let msg = incoming
                .get_or_insert_with(|| IncomingMessage::new(3, frame.header.flags));
            msg.received_frame(frame.header.flags, &frame.payload).unwrap();
            if !more {
                break;
            }
        }
        assert_eq!(incoming.unwrap().body(), body.as_slice());
    }

    #[test]
    fn ack_monotonicity_enforced() {
        let mut out = OutgoingMessage::new(MessageType::Msg);
        out.set_body(Bytes::from(vec![0u8; 1000])).unwrap();
        out.assign_number(1).unwrap();
        out.encode().unwrap();
        out.bytes_written = 1000;

        out.received_ack(500).unwrap();
        assert!(out.received_ack(500).is_err()); // non-increasing
        assert!(out.received_ack(400).is_err()); // decreasing
        assert!(out.received_ack(2000).is_err()); // exceeds bytes_written
        out.received_ack(900).unwrap();
        assert_eq!(out.bytes_acked, 900);
    }

    #[test]
    fn ack_heuristic_fires_every_interval() {
        let mut incoming = IncomingMessage::new(1, MessageFlags::new(MessageType::Msg));
        incoming.bytes_received = 49_999;
        assert!(!incoming.should_ack(ACK_INTERVAL_BYTES));
        incoming.bytes_received = 50_000;
        assert!(incoming.should_ack(ACK_INTERVAL_BYTES));
        incoming.mark_acked();
        assert!(!incoming.should_ack(ACK_INTERVAL_BYTES));
        incoming.bytes_received = 99_999;
        assert!(!incoming.should_ack(ACK_INTERVAL_BYTES));
        incoming.bytes_received = 100_000;
        assert!(incoming.should_ack(ACK_INTERVAL_BYTES));
    }

    #[test]
    fn zero_length_body_final_frame_has_no_payload() {
        let mut out = OutgoingMessage::new(MessageType::Msg);
        out.assign_number(1).unwrap();
        out.encode().unwrap();
        let (frame, more) = out.next_frame(4096).unwrap();
        assert!(!more);
        // Only the (empty) property block length byte, no body bytes.
        assert_eq!(frame.payload.len(), 1);
    }

    #[test]
    fn mutation_after_encode_is_programming_error() {
        let mut out = OutgoingMessage::new(MessageType::Msg);
        out.encode().unwrap();
        assert!(out.set_body(Bytes::from_static(b"x")).is_err());
        assert!(out.set_urgent(true).is_err());
    }
}
