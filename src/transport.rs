//! The abstract transport contract plus two concrete adapters: an
//! in-process loopback pair for tests/doctests, and a length-prefixed
//! TCP adapter for when a real framed byte stream is wanted and a full
//! WebSocket stack isn't available.
//!
//! BLIP expects a *message*-framed transport: each call to `send_frame`
//! puts one whole BLIP frame on the wire, and each `recv_frame` yields one
//! whole BLIP frame back. A WebSocket already provides that natively; a
//! raw TCP stream does not, so `transport::tcp` adds a 4-byte length
//! prefix of its own.

use async_trait::async_trait;
use bytes::Bytes;

/// A message-framed transport BLIP can multiplex over. Implementations
/// deliver whole binary frames in and accept whole binary frames out; a
/// non-binary message from a WebSocket-backed transport is simply ignored
/// upstream of this trait.
#[async_trait]
pub trait Transport: Send {
    /// Whether a call to `send_frame` would be accepted right now.
    fn can_send(&self) -> bool;

    /// Perform whatever handshake the transport needs before frames can
    /// flow. Most adapters (already-connected sockets, paired channels)
    /// have nothing to do here.
    async fn connect(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    /// Send one whole frame. Does not block beyond handing the bytes to the
    /// underlying queue/socket.
    async fn send_frame(&mut self, frame: Bytes) -> std::io::Result<()>;

    /// Receive the next whole frame, or `None` on a clean close.
    async fn recv_frame(&mut self) -> std::io::Result<Option<Bytes>>;

    /// Close the transport.
    async fn close(&mut self) -> std::io::Result<()>;
}

pub mod loopback {
    //! An in-process paired transport: two halves connected by channels,
    //! used by this crate's own tests and doctests in place of a real
    //! WebSocket.

    use super::Transport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    pub struct LoopbackTransport {
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        closed: bool,
    }

    /// Create a connected pair of loopback transports: frames sent on one
    /// side arrive on the other.
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            LoopbackTransport {
                tx: a_tx,
                rx: b_rx,
                closed: false,
            },
            LoopbackTransport {
                tx: b_tx,
                rx: a_rx,
                closed: false,
            },
        )
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        fn can_send(&self) -> bool {
            !self.closed
        }

        async fn send_frame(&mut self, frame: Bytes) -> std::io::Result<()> {
            if self.closed {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "loopback transport is closed",
                ));
            }
            self.tx.send(frame).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer half dropped")
            })
        }

        async fn recv_frame(&mut self) -> std::io::Result<Option<Bytes>> {
            if self.closed {
                return Ok(None);
            }
            Ok(self.rx.recv().await)
        }

        async fn close(&mut self) -> std::io::Result<()> {
            self.closed = true;
            Ok(())
        }
    }
}

pub mod tcp {
    //! A length-prefixed TCP adapter: `u32` big-endian byte length followed
    //! by that many payload bytes, read through a buffered accumulator that
    //! only parses a frame once enough bytes have arrived.

    use super::Transport;
    use async_trait::async_trait;
    use bytes::{Buf, Bytes, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
    use tokio::net::TcpStream;

    /// Maximum accepted frame length, guarding against a bogus length
    /// prefix causing unbounded buffering.
    pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

    pub struct TcpTransport {
        stream: BufWriter<TcpStream>,
        read_buf: BytesMut,
    }

    impl TcpTransport {
        pub fn new(stream: TcpStream) -> Self {
            TcpTransport {
                stream: BufWriter::new(stream),
                read_buf: BytesMut::with_capacity(4 * 1024),
            }
        }

        fn try_parse_frame(&mut self) -> std::io::Result<Option<Bytes>> {
            if self.read_buf.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes(self.read_buf[..4].try_into().unwrap());
            if len > MAX_FRAME_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("frame length {len} exceeds maximum {MAX_FRAME_LEN}"),
                ));
            }
            let total = 4 + len as usize;
            if self.read_buf.len() < total {
                return Ok(None);
            }
            self.read_buf.advance(4);
            let frame = self.read_buf.split_to(len as usize);
            Ok(Some(frame.freeze()))
        }
    }

    #[async_trait]
    impl Transport for TcpTransport {
        fn can_send(&self) -> bool {
            true
        }

        async fn send_frame(&mut self, frame: Bytes) -> std::io::Result<()> {
            self.stream.write_u32(frame.len() as u32).await?;
            self.stream.write_all(&frame).await?;
            self.stream.flush().await
        }

        async fn recv_frame(&mut self) -> std::io::Result<Option<Bytes>> {
            loop {
                if let Some(frame) = self.try_parse_frame()? {
                    return Ok(Some(frame));
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await?;
                if n == 0 {
                    return if self.read_buf.is_empty() {
                        Ok(None)
                    } else {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection reset mid-frame",
                        ))
                    };
                }
                self.read_buf.extend_from_slice(&chunk[..n]);
            }
        }

        async fn close(&mut self) -> std::io::Result<()> {
            self.stream.shutdown().await
        }
    }
}
