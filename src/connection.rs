//! The connection multiplexer: the scheduler that owns the outbox,
//! icebox, pending tables, and sequence counters, and the dispatcher that
//! routes inbound frames to the right message or handler.
//!
//! The dual-executor model is realized as one tokio task (the
//! "transport context") that owns all scheduler state exclusively, plus a
//! freshly spawned task per inbound request (the "delegate context") that
//! runs the registered handler. The two talk only by posting messages
//! through channels — `ActorCommand` from the public handle inward,
//! `DelegateEvent` from a handler task back to the scheduler — so no lock
//! ever guards the scheduler state.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, warn};

use crate::config::ConnectionConfig;
use crate::error::{BlipError, ErrorCode};
use crate::flags::{MessageFlags, MessageType};
use crate::frame::{FrameHeader, WireFrame};
use crate::message::{IncomingMessage, OutgoingMessage};
use crate::properties::Properties;
use crate::request::{IncomingRequest, Request};
use crate::response::{Response, ResponseOutcome};
use crate::transport::Transport;
use crate::varint;

/// A registered profile handler: consumes the completed request and
/// produces the reply to send, if any. Returning `None` leaves the
/// connection to auto-reply with an empty RPY (unless `NoReply` was set).
pub type Handler =
    Arc<dyn Fn(IncomingRequest) -> BoxFuture<'static, Option<OutgoingMessage>> + Send + Sync>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&BlipError) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(Option<&BlipError>) + Send + Sync>;
pub type ResponseCallback = Arc<dyn Fn(&ResponseOutcome) + Send + Sync>;

/// Builds a `Connection` before it starts running its actor task.
pub struct ConnectionBuilder {
    transport: Box<dyn Transport>,
    config: ConnectionConfig,
    registered_actions: HashMap<String, Handler>,
    on_request_fallback: Option<Handler>,
    on_connect: Option<ConnectCallback>,
    on_response: Option<ResponseCallback>,
    on_error: Option<ErrorCallback>,
    on_close: Option<CloseCallback>,
}

impl ConnectionBuilder {
    pub fn new(transport: impl Transport + 'static, config: ConnectionConfig) -> Self {
        ConnectionBuilder {
            transport: Box::new(transport),
            config,
            registered_actions: HashMap::new(),
            on_request_fallback: None,
            on_connect: None,
            on_response: None,
            on_error: None,
            on_close: None,
        }
    }

    /// Register a handler for a specific `Profile` value.
    pub fn register_action(mut self, profile: impl Into<String>, handler: Handler) -> Self {
        self.registered_actions.insert(profile.into(), handler);
        self
    }

    /// Catch-all handler invoked when no profile-specific action matched.
    /// If unset, an unmatched request gets an automatic `NotFound` ERR.
    pub fn on_request(mut self, handler: Handler) -> Self {
        self.on_request_fallback = Some(handler);
        self
    }

    pub fn on_connect(mut self, cb: ConnectCallback) -> Self {
        self.on_connect = Some(cb);
        self
    }

    pub fn on_response(mut self, cb: ResponseCallback) -> Self {
        self.on_response = Some(cb);
        self
    }

    pub fn on_error(mut self, cb: ErrorCallback) -> Self {
        self.on_error = Some(cb);
        self
    }

    pub fn on_close(mut self, cb: CloseCallback) -> Self {
        self.on_close = Some(cb);
        self
    }

    /// Connect the transport and spawn the scheduler task, returning a
    /// cheap, cloneable handle.
    pub async fn connect(mut self) -> std::io::Result<Connection> {
        self.transport.connect().await?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (delegate_tx, delegate_rx) = mpsc::unbounded_channel();

        if let Some(cb) = &self.on_connect {
            cb();
        }

        let actor = ConnectionActor {
            transport: self.transport,
            config: self.config,
            outbox: VecDeque::new(),
            icebox: Vec::new(),
            pending_requests: HashMap::new(),
            pending_responses: HashMap::new(),
            next_request_number: 1,
            next_expected_incoming_request: 1,
            transport_open: true,
            error: None,
            registered_actions: self.registered_actions,
            on_request_fallback: self.on_request_fallback,
            on_response: self.on_response,
            on_error: self.on_error,
            on_close: self.on_close,
            delegate_tx,
            command_rx,
            delegate_rx,
            pending_close: None,
        };
        tokio::spawn(actor.run());
        Ok(Connection { command_tx })
    }
}

/// A cheap handle to a running connection. Cloning shares the same
/// underlying scheduler task.
#[derive(Clone)]
pub struct Connection {
    command_tx: mpsc::UnboundedSender<ActorCommand>,
}

impl Connection {
    pub fn builder(transport: impl Transport + 'static, config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder::new(transport, config)
    }

    /// Build a fresh, unsent request. Pure local construction; no
    /// interaction with the scheduler happens until `send`.
    pub fn create_request(&self, body: impl Into<Bytes>, properties: Properties) -> Request {
        Request::new(body, properties)
    }

    /// Hand a request to the scheduler. Returns `None` if `NoReply` was
    /// set, since no response is ever allocated for such a request.
    pub async fn send(&self, request: Request) -> Option<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(ActorCommand::Send {
                request,
                reply: reply_tx,
            })
            .is_err()
        {
            return Some(Response::new(immediately_disconnected()));
        }
        reply_rx.await.unwrap_or_else(|_| Some(Response::new(immediately_disconnected())))
    }

    /// Close the connection: flushes the outbox, fails pending responses
    /// with `Disconnected`, and shuts the transport down.
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(ActorCommand::Close { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

fn immediately_disconnected() -> oneshot::Receiver<ResponseOutcome> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(ResponseOutcome::disconnected());
    rx
}

enum ActorCommand {
    Send {
        request: Request,
        reply: oneshot::Sender<Option<Response>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Posted from a spawned handler task (the delegate context) back to the
/// scheduler once a registered action has produced its reply.
enum DelegateEvent {
    Reply {
        number: u32,
        urgent: bool,
        no_reply: bool,
        message: Option<OutgoingMessage>,
    },
}

struct PendingResponse {
    message: Option<IncomingMessage>,
    completion: oneshot::Sender<ResponseOutcome>,
}

/// Owns every piece of scheduler state. Runs as a single
/// tokio task; nothing outside this task ever touches these fields.
struct ConnectionActor {
    transport: Box<dyn Transport>,
    config: ConnectionConfig,
    outbox: VecDeque<OutgoingMessage>,
    icebox: Vec<OutgoingMessage>,
    pending_requests: HashMap<u32, IncomingMessage>,
    pending_responses: HashMap<u32, PendingResponse>,
    next_request_number: u32,
    next_expected_incoming_request: u32,
    transport_open: bool,
    error: Option<BlipError>,
    registered_actions: HashMap<String, Handler>,
    on_request_fallback: Option<Handler>,
    on_response: Option<ResponseCallback>,
    on_error: Option<ErrorCallback>,
    on_close: Option<CloseCallback>,
    delegate_tx: mpsc::UnboundedSender<DelegateEvent>,
    command_rx: mpsc::UnboundedReceiver<ActorCommand>,
    delegate_rx: mpsc::UnboundedReceiver<DelegateEvent>,
    pending_close: Option<oneshot::Sender<()>>,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            if !self.transport_open {
                break;
            }
            tokio::select! {
                frame = self.transport.recv_frame() => {
                    match frame {
                        Ok(Some(bytes)) => {
                            if let Err(e) = self.handle_wire_frame(bytes).await {
                                self.fail(e).await;
                                break;
                            }
                        }
                        Ok(None) => {
                            self.fail(BlipError::Disconnected("transport closed".into())).await;
                            break;
                        }
                        Err(io_err) => {
                            self.fail(BlipError::Io(io_err)).await;
                            break;
                        }
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ActorCommand::Send { request, reply }) => {
                            self.handle_send(request, reply).await;
                        }
                        Some(ActorCommand::Close { reply }) => {
                            self.shutdown(None).await;
                            let _ = reply.send(());
                            break;
                        }
                        None => break,
                    }
                }
                event = self.delegate_rx.recv() => {
                    if let Some(DelegateEvent::Reply { number, urgent, no_reply, message }) = event {
                        self.handle_delegate_reply(number, urgent, no_reply, message).await;
                    }
                }
            }
        }
    }

    async fn fail(&mut self, err: BlipError) {
        error!(error = %err, "connection failing fatally");
        self.error = Some(err);
        if let Some(cb) = &self.on_error {
            cb(self.error.as_ref().unwrap());
        }
        self.shutdown(None).await;
    }

    /// Flush and close. `reply` is handled by
    /// the caller; this only performs the teardown itself.
    async fn shutdown(&mut self, _reply: Option<()>) {
        self.transport_open = false;
        let _ = self.transport.close().await;
        self.outbox.clear();
        self.icebox.clear();
        self.pending_requests.clear();
        for (_, pending) in self.pending_responses.drain() {
            let _ = pending.completion.send(ResponseOutcome::disconnected());
        }
        if let Some(cb) = &self.on_close {
            cb(self.error.as_ref());
        }
    }

    async fn handle_send(&mut self, request: Request, reply: oneshot::Sender<Option<Response>>) {
        self.register_and_enqueue_send(request, reply);
        self.pump().await;
    }

    /// Assign a number, freeze, register the response waiter (if any), and
    /// queue the message. Synchronous so it can also run from inside the
    /// pump loop's command drain, between two frame sends.
    fn register_and_enqueue_send(&mut self, mut request: Request, reply: oneshot::Sender<Option<Response>>) {
        let number = self.next_request_number;
        self.next_request_number += 1;
        if request.message.assign_number(number).is_err() {
            let _ = reply.send(Some(Response::new(immediately_disconnected())));
            return;
        }
        if let Err(e) = request.message.encode() {
            warn!(error = %e, "failed to encode outgoing request");
            let _ = reply.send(Some(Response::new(immediately_disconnected())));
            return;
        }

        let response = if request.message.no_reply {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.pending_responses.insert(
                number,
                PendingResponse {
                    message: None,
                    completion: tx,
                },
            );
            Some(Response::new(rx))
        };

        self.enqueue_outgoing(request.message);
        let _ = reply.send(response);
    }

    /// Pick up any `Send`/`Close` commands and delegate replies that have
    /// arrived without blocking, so a message queued urgently while the
    /// pump is mid-flight through a long message gets interleaved instead
    /// of waiting for the whole outbox to drain first.
    fn drain_ready_commands(&mut self) {
        while let Ok(cmd) = self.command_rx.try_recv() {
            match cmd {
                ActorCommand::Send { request, reply } => self.register_and_enqueue_send(request, reply),
                ActorCommand::Close { reply } => {
                    self.pending_close = Some(reply);
                    return;
                }
            }
        }
        while let Ok(DelegateEvent::Reply { number, urgent, no_reply, message }) = self.delegate_rx.try_recv() {
            if no_reply {
                continue;
            }
            let outgoing = message.unwrap_or_else(|| auto_empty_reply(number, urgent));
            self.enqueue_outgoing(outgoing);
        }
    }

    async fn handle_delegate_reply(
        &mut self,
        number: u32,
        urgent: bool,
        no_reply: bool,
        message: Option<OutgoingMessage>,
    ) {
        if no_reply {
            return;
        }
        let outgoing = match message {
            Some(m) => m,
            None => auto_empty_reply(number, urgent),
        };
        self.enqueue_outgoing(outgoing);
        self.pump().await;
    }

    fn enqueue_outgoing(&mut self, mut message: OutgoingMessage) {
        if message.can_write() {
            if let Err(e) = message.encode() {
                warn!(error = %e, "failed to encode outgoing message, dropping it");
                return;
            }
        }
        insert_into_outbox(&mut self.outbox, message, false);
    }

    /// The frame pump: drains the outbox one frame at a time while a send
    /// slot is free.
    #[instrument(skip(self))]
    async fn pump(&mut self) {
        while self.transport_open && self.transport.can_send() {
            let Some(mut message) = self.outbox.pop_front() else {
                break;
            };

            let next_is_urgent_or_missing = self.outbox.front().map(|m| m.urgent).unwrap_or(true);
            let frame_size = if message.urgent || next_is_urgent_or_missing {
                self.config.frame_size * self.config.urgent_frame_multiplier
            } else {
                self.config.frame_size
            };

            let (frame, more_coming) = match message.next_frame(frame_size) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(error = %e, "dropping message that failed to frame");
                    continue;
                }
            };

            let wire = WireFrame {
                header: frame.header,
                payload: frame.payload,
            };
            if let Err(e) = self.transport.send_frame(wire.encode()).await {
                self.fail(BlipError::Io(e)).await;
                return;
            }

            if more_coming {
                if message.needs_ack(self.config.max_unacked_bytes) {
                    debug!(number = frame.header.number, "message iceboxed awaiting ack");
                    self.icebox.push(message);
                } else {
                    insert_into_outbox(&mut self.outbox, message, true);
                }
            }
            // If complete, the message is simply dropped here: its reply
            // (if any) is already tracked in `pending_responses`.

            // Yield once per frame so a message queued concurrently (e.g.
            // an Urgent request racing a long bulk send) gets a chance to
            // land in the command queue before the next iteration, then
            // pick it up via the priority insertion immediately.
            tokio::task::yield_now().await;
            self.drain_ready_commands();
            if self.pending_close.is_some() {
                break;
            }
        }

        if let Some(reply) = self.pending_close.take() {
            self.shutdown(None).await;
            let _ = reply.send(());
        }
    }

    #[instrument(skip(self, data))]
    async fn handle_wire_frame(&mut self, data: Bytes) -> Result<(), BlipError> {
        let WireFrame { header, payload } = WireFrame::decode(data)?;
        let FrameHeader { number, flags } = header;

        match flags.message_type {
            MessageType::Msg => self.handle_incoming_msg(number, flags, &payload).await,
            MessageType::Rpy | MessageType::Err => {
                self.handle_incoming_reply(number, flags, &payload).await
            }
            MessageType::AckMsg | MessageType::AckRpy => {
                self.handle_incoming_ack(number, flags, &payload)
            }
        }
    }

    async fn handle_incoming_msg(
        &mut self,
        number: u32,
        flags: MessageFlags,
        data: &[u8],
    ) -> Result<(), BlipError> {
        let mut message = match self.pending_requests.remove(&number) {
            Some(existing) => existing,
            None if number == self.next_expected_incoming_request => {
                self.next_expected_incoming_request += 1;
                IncomingMessage::new(number, flags)
            }
            None => {
                return Err(BlipError::BadFrame(format!(
                    "unexpected new request number {number}, expected {}",
                    self.next_expected_incoming_request
                )));
            }
        };

        message.received_frame(flags, data)?;
        self.maybe_send_ack(&mut message, MessageType::AckMsg).await?;

        if message.complete {
            self.dispatch_request(message);
        } else {
            self.pending_requests.insert(number, message);
        }
        Ok(())
    }

    async fn handle_incoming_reply(
        &mut self,
        number: u32,
        flags: MessageFlags,
        data: &[u8],
    ) -> Result<(), BlipError> {
        let Some(mut pending) = self.pending_responses.remove(&number) else {
            if number <= self.next_request_number {
                debug!(number, "dropping reply for a response no longer awaited");
                return Ok(());
            }
            return Err(BlipError::BadFrame(format!(
                "reply for unknown request number {number}"
            )));
        };

        let message = pending
            .message
            .get_or_insert_with(|| IncomingMessage::new(number, flags));
        message.received_frame(flags, data)?;
        self.maybe_send_ack(message, MessageType::AckRpy).await?;

        if message.complete {
            let message = pending.message.take().unwrap();
            let outcome = ResponseOutcome::from_incoming(message);
            if let Some(cb) = &self.on_response {
                cb(&outcome);
            }
            let _ = pending.completion.send(outcome);
        } else {
            self.pending_responses.insert(number, pending);
        }
        Ok(())
    }

    fn handle_incoming_ack(
        &mut self,
        number: u32,
        flags: MessageFlags,
        data: &[u8],
    ) -> Result<(), BlipError> {
        let mut cursor = Bytes::copy_from_slice(data);
        let bytes_acked = varint::get_varint(&mut cursor)
            .map_err(|_| BlipError::BadFrame("malformed ack body".into()))?;

        let wants_reply_category = matches!(flags.message_type, MessageType::AckRpy);

        if let Some(icebox_pos) = self.icebox.iter().position(|m| {
            m.number == Some(number) && m.message_type.is_reply() == wants_reply_category
        }) {
            let mut message = self.icebox.remove(icebox_pos);
            message.received_ack(bytes_acked)?;
            insert_into_outbox(&mut self.outbox, message, true);
            return Ok(());
        }

        if let Some(message) = self.outbox.iter_mut().find(|m| {
            m.number == Some(number) && m.message_type.is_reply() == wants_reply_category
        }) {
            message.received_ack(bytes_acked)?;
            return Ok(());
        }

        debug!(number, "ack for a message no longer tracked, ignoring");
        Ok(())
    }

    async fn maybe_send_ack(
        &mut self,
        message: &mut IncomingMessage,
        ack_type: MessageType,
    ) -> Result<(), BlipError> {
        if !message.should_ack(self.config.ack_interval_bytes) {
            return Ok(());
        }
        message.mark_acked();
        let mut body = BytesMut::new();
        varint::put_varint(&mut body, message.bytes_received);
        let wire = WireFrame {
            header: FrameHeader {
                number: message.number,
                flags: MessageFlags::new(ack_type),
            },
            payload: body.freeze(),
        };
        self.transport
            .send_frame(wire.encode())
            .await
            .map_err(BlipError::Io)
    }

    fn dispatch_request(&mut self, message: IncomingMessage) {
        if message.meta {
            let mut request = IncomingRequest::from_message(message);
            if !request.no_reply {
                let response =
                    request.build_error_response(ErrorCode::NotFound, "No meta handler was found");
                self.enqueue_outgoing(response);
            }
            return;
        }

        let request = IncomingRequest::from_message(message);
        let profile = request.profile().map(|s| s.to_string());
        let handler = profile
            .as_deref()
            .and_then(|p| self.registered_actions.get(p).cloned())
            .or_else(|| self.on_request_fallback.clone());

        let number = request.number;
        let urgent = request.urgent;
        let no_reply = request.no_reply;

        match handler {
            Some(handler) => {
                let delegate_tx = self.delegate_tx.clone();
                tokio::spawn(async move {
                    let outcome = match tokio::spawn(handler(request)).await {
                        Ok(reply) => reply,
                        Err(join_err) => {
                            warn!(error = %join_err, number, "request handler panicked");
                            Some(handler_failed_reply(number, urgent, join_err.to_string()))
                        }
                    };
                    let _ = delegate_tx.send(DelegateEvent::Reply {
                        number,
                        urgent,
                        no_reply,
                        message: outcome,
                    });
                });
            }
            None => {
                if !no_reply {
                    let mut request = request;
                    let response =
                        request.build_error_response(ErrorCode::NotFound, "No handler was found");
                    self.enqueue_outgoing(response);
                }
            }
        }
    }
}

fn auto_empty_reply(number: u32, urgent: bool) -> OutgoingMessage {
    let mut message = OutgoingMessage::new(MessageType::Rpy);
    message.assign_number(number).ok();
    message.set_urgent(urgent).ok();
    message
}

fn handler_failed_reply(number: u32, urgent: bool, text: String) -> OutgoingMessage {
    let mut message = OutgoingMessage::new(MessageType::Err);
    message.assign_number(number).ok();
    message.set_urgent(urgent).ok();
    let mut props = Properties::new();
    props.insert("Error-Code", ErrorCode::HandlerFailed.as_u32().to_string());
    message.set_properties(props).ok();
    message.set_body(Bytes::from(text)).ok();
    message
}

/// The priority-interleaved insertion algorithm. `is_requeue`
/// distinguishes a message going back into the outbox (after a partial
/// send or an ack revives it from the icebox) from one being queued for
/// the first time, which must not jump ahead of another not-yet-started
/// message.
fn insert_into_outbox(outbox: &mut VecDeque<OutgoingMessage>, message: OutgoingMessage, is_requeue: bool) {
    let n = outbox.len();
    let mut index = if !message.urgent {
        n
    } else if n > 1 {
        match outbox.iter().enumerate().rev().find(|(_, m)| m.urgent) {
            Some((i, _)) => (i + 2).min(n),
            None => 1.min(n),
        }
    } else {
        1.min(n)
    };

    if !is_requeue {
        if let Some(first_new) = outbox
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, m)| m.bytes_written == 0)
            .map(|(i, _)| i)
        {
            index = index.min(first_new);
        }
    }

    outbox.insert(index, message);
}
