use std::time::Duration;

use futures::{SinkExt, StreamExt};
use snaprelay_core::{ProtocolMessage, decode_message, encode_message};
use snaprelay_relay::{AppState, build_router};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

struct TestPeer {
    write: WsWrite,
    read: WsRead,
}

#[tokio::test]
async fn first_peer_waits_and_pairing_notifies_both() {
    let (address, shutdown_tx) = start_relay().await;

    let mut peer_a = connect_peer(&address, "123456").await;
    let waiting = recv_message(&mut peer_a, Duration::from_secs(2))
        .await
        .expect("first peer receives a frame");
    assert_eq!(waiting, ProtocolMessage::WaitingForClient);

    let mut peer_b = connect_peer(&address, "123456").await;
    let paired_a = recv_message(&mut peer_a, Duration::from_secs(2))
        .await
        .expect("first peer notified of pairing");
    let paired_b = recv_message(&mut peer_b, Duration::from_secs(2))
        .await
        .expect("second peer notified of pairing");
    assert_eq!(paired_a, ProtocolMessage::PartnerConnected);
    assert_eq!(paired_b, ProtocolMessage::PartnerConnected);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn text_frames_are_forwarded_to_partner_only() {
    let (address, shutdown_tx) = start_relay().await;

    let mut peer_a = connect_peer(&address, "222333").await;
    let mut peer_b = connect_peer(&address, "222333").await;
    drain_presence(&mut peer_a).await;
    drain_presence(&mut peer_b).await;

    let frame = encode_message(&ProtocolMessage::ClearHistory).expect("encode frame");
    peer_a
        .write
        .send(Message::Text(frame.into()))
        .await
        .expect("send frame");

    let received = recv_message(&mut peer_b, Duration::from_secs(2))
        .await
        .expect("partner receives forwarded frame");
    assert_eq!(received, ProtocolMessage::ClearHistory);

    let echoed = recv_message(&mut peer_a, Duration::from_millis(400)).await;
    assert!(
        echoed.is_none(),
        "sender unexpectedly received its own frame back"
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn opaque_payloads_are_forwarded_verbatim() {
    let (address, shutdown_tx) = start_relay().await;

    let mut peer_a = connect_peer(&address, "777000").await;
    let mut peer_b = connect_peer(&address, "777000").await;
    drain_presence(&mut peer_a).await;
    drain_presence(&mut peer_b).await;

    // Not a known protocol frame, but the relay does not care.
    let opaque = r#"{"type":"future_extension","blob":"xyz"}"#;
    peer_a
        .write
        .send(Message::Text(opaque.into()))
        .await
        .expect("send opaque frame");

    let raw = recv_raw_text(&mut peer_b, Duration::from_secs(2))
        .await
        .expect("partner receives opaque frame");
    assert_eq!(raw, opaque);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn third_peer_on_occupied_code_is_turned_away() {
    let (address, shutdown_tx) = start_relay().await;

    let mut peer_a = connect_peer(&address, "999111").await;
    let mut peer_b = connect_peer(&address, "999111").await;
    drain_presence(&mut peer_a).await;
    drain_presence(&mut peer_b).await;

    let mut intruder = connect_peer(&address, "999111").await;
    let rejection = recv_message(&mut intruder, Duration::from_secs(2))
        .await
        .expect("third peer receives rejection");
    match rejection {
        ProtocolMessage::Error { message } => {
            assert!(message.contains("two clients"), "unexpected text: {message}")
        }
        other => panic!("expected error frame, got {other:?}"),
    }

    // The paired session is unaffected.
    let frame = encode_message(&ProtocolMessage::GetHistory).expect("encode frame");
    peer_a
        .write
        .send(Message::Text(frame.into()))
        .await
        .expect("send frame");
    let received = recv_message(&mut peer_b, Duration::from_secs(2)).await;
    assert_eq!(received, Some(ProtocolMessage::GetHistory));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn heartbeat_pings_terminate_at_the_relay() {
    let (address, shutdown_tx) = start_relay().await;

    let mut peer_a = connect_peer(&address, "444555").await;
    let mut peer_b = connect_peer(&address, "444555").await;
    drain_presence(&mut peer_a).await;
    drain_presence(&mut peer_b).await;

    let ping = encode_message(&ProtocolMessage::Ping { ts: 7 }).expect("encode ping");
    peer_a
        .write
        .send(Message::Text(ping.into()))
        .await
        .expect("send ping");

    let leaked = recv_message(&mut peer_b, Duration::from_millis(400)).await;
    assert!(leaked.is_none(), "heartbeat leaked to the partner: {leaked:?}");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn survivor_is_told_when_partner_leaves_and_slot_reopens() {
    let (address, shutdown_tx) = start_relay().await;

    let mut peer_a = connect_peer(&address, "121212").await;
    let peer_b = connect_peer(&address, "121212").await;
    drain_presence(&mut peer_a).await;
    drop(peer_b);

    let notice = recv_message(&mut peer_a, Duration::from_secs(2))
        .await
        .expect("survivor notified");
    assert_eq!(notice, ProtocolMessage::PartnerDisconnected);

    // The freed slot accepts a replacement and re-pairs.
    let mut peer_c = connect_peer(&address, "121212").await;
    let paired = recv_message(&mut peer_c, Duration::from_secs(2))
        .await
        .expect("replacement peer paired");
    assert_eq!(paired, ProtocolMessage::PartnerConnected);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn malformed_code_path_refuses_the_upgrade() {
    let (address, shutdown_tx) = start_relay().await;

    for bad in ["12345", "1234567", "12345a"] {
        let url = format!("{address}/{bad}");
        let result = connect_async(&url).await;
        assert!(result.is_err(), "relay accepted code {bad:?}");
    }

    let _ = shutdown_tx.send(());
}

async fn start_relay() -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let address = listener.local_addr().expect("relay local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = axum::serve(listener, build_router(AppState::new())).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("ws://{}", address), shutdown_tx)
}

async fn connect_peer(address: &str, code: &str) -> TestPeer {
    let url = format!("{address}/{code}");
    let (ws_stream, _) = connect_async(&url).await.expect("connect websocket");
    let (write, read) = ws_stream.split();
    TestPeer { write, read }
}

/// Swallows the presence frames emitted during pairing.
async fn drain_presence(peer: &mut TestPeer) {
    loop {
        match recv_message(peer, Duration::from_millis(60)).await {
            Some(ProtocolMessage::WaitingForClient | ProtocolMessage::PartnerConnected) => continue,
            Some(_) | None => break,
        }
    }
}

async fn recv_message(peer: &mut TestPeer, wait: Duration) -> Option<ProtocolMessage> {
    let raw = recv_raw_text(peer, wait).await?;
    decode_message(&raw).ok()
}

async fn recv_raw_text(peer: &mut TestPeer, wait: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        let next = timeout(remaining, peer.read.next()).await.ok()?;
        let message = next?.ok()?;
        match message {
            Message::Text(text) => return Some(text.to_string()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}
