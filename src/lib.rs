// ABOUTME: Crate root for `blip`, a bidirectional message-oriented RPC multiplexer
// ABOUTME: Re-exports the public surface; module layout mirrors the dependency order frame -> properties -> message -> request/response -> connection -> transport

//! BLIP is a bidirectional, message-oriented RPC protocol that multiplexes
//! many concurrent logical request/response exchanges over a single
//! framed byte transport (originally a WebSocket).
//!
//! A [`Connection`] owns a [`Transport`] and schedules outgoing
//! [`OutgoingMessage`](message::OutgoingMessage)s across it while dispatching
//! inbound frames back into the right pending request or response. Two
//! things are deliberately out of scope here: a WebSocket/TLS handshake
//! implementation (bring your own via the [`Transport`] trait, or use
//! [`transport::tcp`] for a bare length-framed TCP adapter) and any
//! interpretation of message bodies (BLIP carries opaque bytes).
//!
//! ```no_run
//! use blip::{Connection, ConnectionConfig, Properties};
//! use blip::transport::loopback;
//!
//! # async fn run() {
//! let (client_io, server_io) = loopback::pair();
//!
//! let server = Connection::builder(server_io, ConnectionConfig::default())
//!     .register_action("echo", std::sync::Arc::new(|mut req| {
//!         Box::pin(async move {
//!             let body = req.body().clone();
//!             Some(req.build_response(body, Some("text/plain; charset=UTF-8")))
//!         })
//!     }))
//!     .connect()
//!     .await
//!     .unwrap();
//!
//! let client = Connection::builder(client_io, ConnectionConfig::default())
//!     .connect()
//!     .await
//!     .unwrap();
//!
//! let mut props = Properties::new();
//! props.insert("Profile", "echo");
//! let request = client.create_request("hello", props);
//! if let Some(response) = client.send(request).await {
//!     let outcome = response.await;
//!     assert_eq!(outcome.body().as_ref(), b"hello");
//! }
//! # let _ = server;
//! # }
//! ```

pub mod compression;
pub mod config;
pub mod connection;
pub mod error;
pub mod flags;
pub mod frame;
pub mod message;
pub mod properties;
pub mod request;
pub mod response;
pub mod transport;
pub mod varint;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionBuilder, Handler};
pub use error::{BlipError, BlipResult, ErrorCode, LocalErrorCode};
pub use flags::{MessageFlags, MessageType};
pub use message::{IncomingMessage, OutgoingMessage};
pub use properties::Properties;
pub use request::{IncomingRequest, Request};
pub use response::{Response, ResponseOutcome};
pub use transport::Transport;
