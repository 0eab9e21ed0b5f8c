//! Request specialization: always type MSG on the wire.

use crate::error::BlipError;
use crate::flags::MessageType;
use crate::message::{IncomingMessage, OutgoingMessage};
use crate::properties::Properties;
use bytes::Bytes;

/// An outgoing request, configured by the caller before being handed to
/// `Connection::send`.
#[derive(Debug)]
pub struct Request {
    pub(crate) message: OutgoingMessage,
}

impl Request {
    pub fn new(body: impl Into<Bytes>, properties: Properties) -> Self {
        let mut message = OutgoingMessage::new(MessageType::Msg);
        message
            .set_body(body.into())
            .expect("fresh message is always writable");
        message
            .set_properties(properties)
            .expect("fresh message is always writable");
        Request { message }
    }

    pub fn set_urgent(&mut self, urgent: bool) -> Result<(), BlipError> {
        self.message.set_urgent(urgent)
    }

    pub fn set_no_reply(&mut self, no_reply: bool) -> Result<(), BlipError> {
        self.message.set_no_reply(no_reply)
    }

    pub fn set_compressed(&mut self, compressed: bool) -> Result<(), BlipError> {
        self.message.set_compressed(compressed)
    }

    pub fn is_urgent(&self) -> bool {
        self.message.urgent
    }

    pub fn is_no_reply(&self) -> bool {
        self.message.no_reply
    }

    pub fn body(&self) -> &Bytes {
        self.message.body()
    }

    pub fn properties(&self) -> &Properties {
        self.message.properties()
    }

    pub fn profile(&self) -> Option<&str> {
        self.properties().get("Profile")
    }

    /// Clone a complete request so it can be resent on another connection.
    /// Preserves body/properties/compressed/urgent/no_reply; the clone is
    /// fresh (`can_write = true`, no number) and must be encoded again.
    pub fn clone_for_resend(&self) -> Request {
        let mut message = OutgoingMessage::new(MessageType::Msg);
        message
            .set_body(self.message.body().clone())
            .expect("fresh message is always writable");
        message
            .set_properties(self.message.properties().clone())
            .expect("fresh message is always writable");
        message
            .set_compressed(self.message.compressed)
            .expect("fresh message is always writable");
        message
            .set_urgent(self.message.urgent)
            .expect("fresh message is always writable");
        message
            .set_no_reply(self.message.no_reply)
            .expect("fresh message is always writable");
        Request { message }
    }
}

/// A request received from the peer, handed to a registered handler.
///
/// `respond`/`respond_error` may be called at most once; if the handler
/// returns without calling either (and the request did not set `NoReply`),
/// the connection automatically sends an empty RPY.
pub struct IncomingRequest {
    pub number: u32,
    pub urgent: bool,
    pub no_reply: bool,
    properties: Properties,
    body: Bytes,
    handled: bool,
}

impl IncomingRequest {
    pub fn from_message(message: IncomingMessage) -> Self {
        let number = message.number;
        let urgent = message.urgent;
        let no_reply = message.no_reply;
        let properties = message.properties().cloned().unwrap_or_default();
        let body = message.take_body();
        IncomingRequest {
            number,
            urgent,
            no_reply,
            properties,
            body,
            handled: false,
        }
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn profile(&self) -> Option<&str> {
        self.properties.get("Profile")
    }

    pub fn handled(&self) -> bool {
        self.handled
    }

    /// Build a successful reply. Urgent is inherited from the request.
    pub fn build_response(&mut self, body: impl Into<Bytes>, content_type: Option<&str>) -> OutgoingMessage {
        self.handled = true;
        let mut message = OutgoingMessage::new(MessageType::Rpy);
        message.assign_number(self.number).ok();
        message
            .set_urgent(self.urgent)
            .expect("fresh message is always writable");
        message.set_body(body.into()).expect("fresh message");
        let mut props = Properties::new();
        if let Some(content_type) = content_type {
            props.insert("Content-Type", content_type);
        }
        message.set_properties(props).expect("fresh message");
        message
    }

    /// Build an ERR reply.
    pub fn build_error_response(&mut self, code: crate::error::ErrorCode, message_text: impl Into<String>) -> OutgoingMessage {
        self.handled = true;
        let mut message = OutgoingMessage::new(MessageType::Err);
        message.assign_number(self.number).ok();
        message
            .set_urgent(self.urgent)
            .expect("fresh message is always writable");
        let mut props = Properties::new();
        props.insert("Error-Code", code.as_u32().to_string());
        message
            .set_properties(props)
            .expect("fresh message is always writable");
        message
            .set_body(Bytes::from(message_text.into()))
            .expect("fresh message is always writable");
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_for_resend_is_fresh_and_faithful() {
        let mut req = Request::new(Bytes::from_static(b"hi"), Properties::new());
        req.set_urgent(true).unwrap();
        req.set_no_reply(true).unwrap();
        req.set_compressed(true).unwrap();

        let clone = req.clone_for_resend();
        assert!(clone.is_urgent());
        assert!(clone.is_no_reply());
        assert_eq!(clone.body(), req.body());
        assert!(clone.message.can_write());
        assert!(clone.message.number.is_none());
    }
}
