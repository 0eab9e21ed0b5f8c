// ABOUTME: The one-byte message flag word and the message type it encodes
// ABOUTME: Flags are decoded from a varint but validated against MaxFlag before use

/// Highest flag value the wire format defines; the varint that carries flags
/// is decoded as up to 64 bits but any value above this is a `BadFrame`.
pub const MAX_FLAG: u64 = 0xFF;

const TYPE_MASK: u8 = 0x07;
const COMPRESSED_BIT: u8 = 1 << 3;
const URGENT_BIT: u8 = 1 << 4;
const NO_REPLY_BIT: u8 = 1 << 5;
const MORE_COMING_BIT: u8 = 1 << 6;
const META_BIT: u8 = 1 << 7;

/// The message type carried in bits 0-2 of the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Msg,
    Rpy,
    Err,
    AckMsg,
    AckRpy,
}

impl MessageType {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(MessageType::Msg),
            1 => Some(MessageType::Rpy),
            2 => Some(MessageType::Err),
            4 => Some(MessageType::AckMsg),
            5 => Some(MessageType::AckRpy),
            _ => None,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            MessageType::Msg => 0,
            MessageType::Rpy => 1,
            MessageType::Err => 2,
            MessageType::AckMsg => 4,
            MessageType::AckRpy => 5,
        }
    }

    /// True for RPY/ERR — the two reply types of a request.
    pub fn is_reply(self) -> bool {
        matches!(self, MessageType::Rpy | MessageType::Err)
    }

    /// True for the two ACK types.
    pub fn is_ack(self) -> bool {
        matches!(self, MessageType::AckMsg | MessageType::AckRpy)
    }
}

/// The decoded, validated flag byte for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFlags {
    pub message_type: MessageType,
    pub compressed: bool,
    pub urgent: bool,
    pub no_reply: bool,
    pub more_coming: bool,
    pub meta: bool,
}

/// A flags varint whose value exceeded `MAX_FLAG`, or whose low three bits
/// don't correspond to a known message type.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidFlags(pub u64);

impl MessageFlags {
    pub fn new(message_type: MessageType) -> Self {
        MessageFlags {
            message_type,
            compressed: false,
            urgent: false,
            no_reply: false,
            more_coming: false,
            meta: false,
        }
    }

    /// Decode from the raw varint value read off the wire.
    pub fn decode(raw: u64) -> Result<Self, InvalidFlags> {
        if raw > MAX_FLAG {
            return Err(InvalidFlags(raw));
        }
        let byte = raw as u8;
        let message_type =
            MessageType::from_bits(byte & TYPE_MASK).ok_or(InvalidFlags(raw))?;
        Ok(MessageFlags {
            message_type,
            compressed: byte & COMPRESSED_BIT != 0,
            urgent: byte & URGENT_BIT != 0,
            no_reply: byte & NO_REPLY_BIT != 0,
            more_coming: byte & MORE_COMING_BIT != 0,
            meta: byte & META_BIT != 0,
        })
    }

    pub fn encode(self) -> u64 {
        let mut byte = self.message_type.to_bits();
        if self.compressed {
            byte |= COMPRESSED_BIT;
        }
        if self.urgent {
            byte |= URGENT_BIT;
        }
        if self.no_reply {
            byte |= NO_REPLY_BIT;
        }
        if self.more_coming {
            byte |= MORE_COMING_BIT;
        }
        if self.meta {
            byte |= META_BIT;
        }
        byte as u64
    }
}
