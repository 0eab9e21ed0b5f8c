//! Response specialization: RPY or ERR on the wire, sharing the
//! request's message number.

use crate::error::ErrorCode;
use crate::message::IncomingMessage;
use crate::properties::Properties;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// The resolved contents of a reply, once it has fully arrived (or been
/// synthesized on disconnect).
#[derive(Debug, Clone)]
pub struct ResponseOutcome {
    pub properties: Properties,
    pub body: Bytes,
    pub is_error: bool,
}

impl ResponseOutcome {
    pub fn from_incoming(message: IncomingMessage) -> Self {
        let is_error = matches!(message.message_type, crate::flags::MessageType::Err);
        let properties = message.properties().cloned().unwrap_or_default();
        let body = message.take_body();
        ResponseOutcome {
            properties,
            body,
            is_error,
        }
    }

    pub fn disconnected() -> Self {
        let mut properties = Properties::new();
        properties.insert("Error-Domain", "BLIP");
        properties.insert("Error-Code", ErrorCode::Unspecified.as_u32().to_string());
        ResponseOutcome {
            properties,
            body: Bytes::from_static(b"Disconnected"),
            is_error: true,
        }
    }

    /// `None` if this was a successful reply; `Some((code, message))` for an
    /// ERR reply. An unparseable or missing `Error-Code` yields the
    /// `Unspecified` (599) sentinel.
    pub fn error(&self) -> Option<(ErrorCode, String)> {
        if !self.is_error {
            return None;
        }
        let code = self
            .properties
            .get("Error-Code")
            .and_then(|s| s.parse::<u32>().ok())
            .map(ErrorCode::from_u32)
            .unwrap_or(ErrorCode::Unspecified);
        let message = String::from_utf8_lossy(&self.body).into_owned();
        Some((code, message))
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// A handle to an outgoing request's eventual reply. Resolves once the RPY
/// or ERR has been fully received, or once the connection synthesizes a
/// `Disconnected` error because the transport closed first.
pub struct Response {
    receiver: oneshot::Receiver<ResponseOutcome>,
}

impl Response {
    pub(crate) fn new(receiver: oneshot::Receiver<ResponseOutcome>) -> Self {
        Response { receiver }
    }

    /// Register a callback to run once the response completes, without
    /// blocking the caller.
    pub fn on_complete<F>(self, f: F)
    where
        F: FnOnce(ResponseOutcome) + Send + 'static,
    {
        tokio::spawn(async move {
            if let Ok(outcome) = self.receiver.await {
                f(outcome);
            }
        });
    }
}

impl Future for Response {
    type Output = ResponseOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(ResponseOutcome::disconnected()),
            Poll::Pending => Poll::Pending,
        }
    }
}
