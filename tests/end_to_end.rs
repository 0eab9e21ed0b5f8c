//! End-to-end scenarios run over the in-process loopback transport,
//! covering the behaviors a BLIP connection must exhibit when both peers
//! are live: request/response correlation, NoReply suppression,
//! compression, ack pacing, urgent-message interleaving, unmatched
//! profiles, and disconnect handling (both an explicit local close and a
//! passive disconnect detected on the transport itself).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use blip::transport::loopback;
use blip::transport::Transport;
use blip::{Connection, ConnectionConfig, Properties};

#[tokio::test]
async fn simple_echo() {
    let (client_io, server_io) = loopback::pair();

    let server = Connection::builder(server_io, ConnectionConfig::default())
        .register_action(
            "echo",
            Arc::new(|mut req: blip::IncomingRequest| {
                Box::pin(async move {
                    let body = req.body().clone();
                    Some(req.build_response(body, Some("text/plain; charset=UTF-8")))
                })
            }),
        )
        .connect()
        .await
        .unwrap();

    let client = Connection::builder(client_io, ConnectionConfig::default())
        .connect()
        .await
        .unwrap();

    let mut props = Properties::new();
    props.insert("Profile", "echo");
    let request = client.create_request(Bytes::from_static(b"hello"), props);
    let response = client.send(request).await.expect("echo expects a reply");
    let outcome = response.await;

    assert!(outcome.error().is_none());
    assert_eq!(outcome.body().as_ref(), b"hello");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn no_reply_suppresses_response_allocation() {
    let (client_io, server_io) = loopback::pair();
    let call_count = Arc::new(AtomicUsize::new(0));
    let call_count_clone = call_count.clone();

    let server = Connection::builder(server_io, ConnectionConfig::default())
        .register_action(
            "ping",
            Arc::new(move |req: blip::IncomingRequest| {
                let call_count = call_count_clone.clone();
                Box::pin(async move {
                    call_count.fetch_add(1, Ordering::SeqCst);
                    assert!(req.no_reply);
                    None
                })
            }),
        )
        .connect()
        .await
        .unwrap();

    let client = Connection::builder(client_io, ConnectionConfig::default())
        .connect()
        .await
        .unwrap();

    let mut props = Properties::new();
    props.insert("Profile", "ping");
    let mut request = client.create_request(Bytes::from_static(b""), props);
    request.set_no_reply(true).unwrap();
    let response = client.send(request).await;
    assert!(response.is_none());

    // Give the handler a moment to run, then confirm it was actually invoked.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(call_count.load(Ordering::SeqCst), 1);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn compressed_large_body_round_trips_exactly() {
    let (client_io, server_io) = loopback::pair();

    let server = Connection::builder(server_io, ConnectionConfig::default())
        .register_action(
            "bulk",
            Arc::new(|mut req: blip::IncomingRequest| {
                Box::pin(async move {
                    let body = req.body().clone();
                    Some(req.build_response(body, None))
                })
            }),
        )
        .connect()
        .await
        .unwrap();

    let client = Connection::builder(client_io, ConnectionConfig::default())
        .connect()
        .await
        .unwrap();

    let body = b"the quick brown fox jumps over the lazy dog "
        .iter()
        .cycle()
        .take(1024 * 1024)
        .copied()
        .collect::<Vec<u8>>();

    let mut props = Properties::new();
    props.insert("Profile", "bulk");
    let mut request = client.create_request(Bytes::from(body.clone()), props);
    request.set_compressed(true).unwrap();
    let response = client.send(request).await.unwrap();
    let outcome = response.await;

    assert!(outcome.error().is_none());
    assert_eq!(outcome.body().as_ref(), body.as_slice());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn ack_pacing_stays_within_window() {
    let (client_io, server_io) = loopback::pair();

    // Wrap the server's transport half to count ACK-MSG frames as they fly
    // past on their way back to the client.
    struct CountingTransport<T> {
        inner: T,
        acks: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl<T: Transport> Transport for CountingTransport<T> {
        fn can_send(&self) -> bool {
            self.inner.can_send()
        }
        async fn send_frame(&mut self, frame: Bytes) -> std::io::Result<()> {
            if let Ok(decoded) = blip::frame::WireFrame::decode(frame.clone()) {
                if matches!(decoded.header.flags.message_type, blip::MessageType::AckMsg) {
                    self.acks.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.inner.send_frame(frame).await
        }
        async fn recv_frame(&mut self) -> std::io::Result<Option<Bytes>> {
            self.inner.recv_frame().await
        }
        async fn close(&mut self) -> std::io::Result<()> {
            self.inner.close().await
        }
    }

    let acks = Arc::new(AtomicUsize::new(0));
    let server_io = CountingTransport {
        inner: server_io,
        acks: acks.clone(),
    };

    let server = Connection::builder(server_io, ConnectionConfig::default())
        .register_action(
            "bulk",
            Arc::new(|mut req: blip::IncomingRequest| {
                Box::pin(async move {
                    let body = req.body().clone();
                    Some(req.build_response(body, None))
                })
            }),
        )
        .connect()
        .await
        .unwrap();

    let client = Connection::builder(client_io, ConnectionConfig::default())
        .connect()
        .await
        .unwrap();

    let body = vec![b'x'; 400_000];
    let mut props = Properties::new();
    props.insert("Profile", "bulk");
    let request = client.create_request(Bytes::from(body.clone()), props);
    let response = client.send(request).await.unwrap();
    let outcome = response.await;
    assert_eq!(outcome.body().len(), body.len());

    assert!(acks.load(Ordering::SeqCst) >= 7);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn urgent_message_overtakes_bulk_message() {
    let (client_io, server_io) = loopback::pair();
    let (order_tx, mut order_rx) = mpsc::unbounded_channel();

    let order_tx_a = order_tx.clone();
    let order_tx_b = order_tx.clone();

    let server = Connection::builder(server_io, ConnectionConfig::default())
        .register_action(
            "bulk",
            Arc::new(move |mut req: blip::IncomingRequest| {
                let order_tx = order_tx_a.clone();
                Box::pin(async move {
                    let _ = order_tx.send("bulk");
                    Some(req.build_response(Bytes::from_static(b"done-bulk"), None))
                })
            }),
        )
        .register_action(
            "urgent",
            Arc::new(move |mut req: blip::IncomingRequest| {
                let order_tx = order_tx_b.clone();
                Box::pin(async move {
                    let _ = order_tx.send("urgent");
                    Some(req.build_response(Bytes::from_static(b"done-urgent"), None))
                })
            }),
        )
        .connect()
        .await
        .unwrap();

    let client = Connection::builder(client_io, ConnectionConfig::default())
        .connect()
        .await
        .unwrap();

    let mut bulk_props = Properties::new();
    bulk_props.insert("Profile", "bulk");
    let bulk_request = client.create_request(Bytes::from(vec![b'y'; 1024 * 1024]), bulk_props);

    let mut urgent_props = Properties::new();
    urgent_props.insert("Profile", "urgent");
    let mut urgent_request = client.create_request(Bytes::from_static(b"hi"), urgent_props);
    urgent_request.set_urgent(true).unwrap();

    let bulk_response = client.send(bulk_request).await.unwrap();
    let urgent_response = client.send(urgent_request).await.unwrap();

    let urgent_outcome = urgent_response.await;
    assert_eq!(urgent_outcome.body().as_ref(), b"done-urgent");

    let bulk_outcome = bulk_response.await;
    assert_eq!(bulk_outcome.body().as_ref(), b"done-bulk");

    assert_eq!(order_rx.recv().await, Some("urgent"));
    assert_eq!(order_rx.recv().await, Some("bulk"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn unknown_profile_gets_not_found() {
    let (client_io, server_io) = loopback::pair();

    let server = Connection::builder(server_io, ConnectionConfig::default())
        .connect()
        .await
        .unwrap();

    let client = Connection::builder(client_io, ConnectionConfig::default())
        .connect()
        .await
        .unwrap();

    let mut props = Properties::new();
    props.insert("Profile", "nonesuch");
    let request = client.create_request(Bytes::from_static(b""), props);
    let response = client.send(request).await.unwrap();
    let outcome = response.await;

    let (code, message) = outcome.error().expect("unmatched profile is an error");
    assert_eq!(code.as_u32(), 404);
    assert_eq!(message, "No handler was found");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn explicit_close_resolves_pending_response_with_error() {
    // No peer is ever connected on the other end of this pair, so the
    // request can never be answered; closing the client must still
    // resolve its pending response rather than hang forever. This drives
    // the connection down via `ActorCommand::Close`, i.e. a local,
    // intentional close rather than a passively observed one.
    let (client_io, _server_io) = loopback::pair();

    let client = Connection::builder(client_io, ConnectionConfig::default())
        .connect()
        .await
        .unwrap();

    let mut props = Properties::new();
    props.insert("Profile", "whatever");
    let request = client.create_request(Bytes::from_static(b"hi"), props);
    let response = client.send(request).await.unwrap();

    client.close().await;

    let outcome = response.await;
    let (code, _) = outcome.error().expect("closed connection yields an error outcome");
    assert_eq!(code.as_u32(), blip::ErrorCode::Unspecified.as_u32());
}

#[tokio::test]
async fn peer_dropping_its_transport_resolves_pending_response_with_error() {
    // Nobody calls `close()` here. Instead the peer's half of the pair is
    // simply dropped, so the client's `recv_frame` observes a clean
    // end-of-stream (`Ok(None)`) the next time it polls, exercising the
    // passive-disconnect arm of the connection's read loop rather than the
    // explicit `Close` command path.
    let (client_io, server_io) = loopback::pair();

    let client = Connection::builder(client_io, ConnectionConfig::default())
        .connect()
        .await
        .unwrap();

    let mut props = Properties::new();
    props.insert("Profile", "whatever");
    let request = client.create_request(Bytes::from_static(b"hi"), props);
    let response = client.send(request).await.unwrap();

    drop(server_io);

    let outcome = response.await;
    let (code, _) = outcome.error().expect("a dropped peer yields an error outcome");
    assert_eq!(code.as_u32(), blip::ErrorCode::Unspecified.as_u32());
}

#[tokio::test]
async fn transport_read_error_resolves_pending_response_with_error() {
    // Wrap the client's transport so its `recv_frame` can be made to
    // return an `Err` on demand, exercising the read-error arm of the
    // connection's read loop (distinct from both the explicit `Close`
    // command and a clean `Ok(None)` end-of-stream).
    struct FaultyTransport<T> {
        inner: T,
        fail: Option<oneshot::Receiver<()>>,
    }

    #[async_trait::async_trait]
    impl<T: Transport> Transport for FaultyTransport<T> {
        fn can_send(&self) -> bool {
            self.inner.can_send()
        }
        async fn send_frame(&mut self, frame: Bytes) -> std::io::Result<()> {
            self.inner.send_frame(frame).await
        }
        async fn recv_frame(&mut self) -> std::io::Result<Option<Bytes>> {
            let Some(fail) = self.fail.as_mut() else {
                return self.inner.recv_frame().await;
            };
            tokio::select! {
                result = self.inner.recv_frame() => result,
                _ = fail => {
                    self.fail = None;
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "injected read failure"))
                }
            }
        }
        async fn close(&mut self) -> std::io::Result<()> {
            self.inner.close().await
        }
    }

    let (client_io, _server_io) = loopback::pair();
    let (fail_tx, fail_rx) = oneshot::channel();
    let client_io = FaultyTransport {
        inner: client_io,
        fail: Some(fail_rx),
    };

    let client = Connection::builder(client_io, ConnectionConfig::default())
        .connect()
        .await
        .unwrap();

    let mut props = Properties::new();
    props.insert("Profile", "whatever");
    let request = client.create_request(Bytes::from_static(b"hi"), props);
    let response = client.send(request).await.unwrap();

    let _ = fail_tx.send(());

    let outcome = response.await;
    let (code, _) = outcome.error().expect("a read error yields an error outcome");
    assert_eq!(code.as_u32(), blip::ErrorCode::Unspecified.as_u32());
}
