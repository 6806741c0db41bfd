//! Client transport against a real relay and against a server that keeps dropping us.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use meshtalk_lib::config::TransportConfig;
use meshtalk_lib::relay::spawn_relay;
use meshtalk_lib::signaling::{Signal, SignalMessage, SignalTransport, TransportState, WebSocketTransport};
use meshtalk_lib::Error;

fn transport(url: String, room: &str, delay_ms: u64) -> WebSocketTransport {
    let mut config = TransportConfig::new(url, room);
    config.reconnect_delay_ms = delay_ms;
    WebSocketTransport::new(config)
}

async fn wait_state(transport: &WebSocketTransport, want: TransportState) {
    let mut rx = transport.state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("transport never reached {:?}", want))
        .unwrap();
}

/// Accepts WebSocket upgrades and hangs up on each one immediately.
async fn flaky_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(ws);
            }
        }
    });

    (format!("ws://{}", addr), accepted)
}

#[tokio::test]
async fn test_messages_are_stamped_and_delivered() {
    let (addr, _relay) = spawn_relay("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let url = format!("ws://{}", addr);

    let a = transport(url.clone(), "standup", 100);
    let b = transport(url, "standup", 100);
    let mut inbox = b.subscribe();

    a.connect().unwrap();
    b.connect().unwrap();
    wait_state(&a, TransportState::Connected).await;
    wait_state(&b, TransportState::Connected).await;

    // b has to be a room member before anything reaches it
    b.send(SignalMessage::new("b", Signal::Leave)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.send(SignalMessage::new("a", Signal::Leave)).unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.sender_id, "a");
    assert_eq!(got.room_id.as_deref(), Some("standup"));
    assert!(matches!(got.body, Signal::Leave));

    a.close();
    b.close();
}

#[tokio::test]
async fn test_reconnects_after_server_drops() {
    let (url, accepted) = flaky_server().await;
    let client = transport(url, "standup", 50);
    client.connect().unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while accepted.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transport should keep redialing");
    assert!(client.attempts() >= 3);

    client.close();
    assert_eq!(*client.state().borrow(), TransportState::Closed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = client.attempts();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.attempts(), settled, "no dialing after close");
}

#[tokio::test]
async fn test_send_fails_while_relay_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let client = transport(url, "standup", 50);
    client.connect().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.attempts() >= 2);
    assert_ne!(*client.state().borrow(), TransportState::Connected);

    let err = client.send(SignalMessage::new("a", Signal::Leave)).unwrap_err();
    assert!(matches!(err, Error::NotConnected));

    client.close();
}

#[tokio::test]
async fn test_connect_twice_starts_one_driver() {
    let (url, accepted) = flaky_server().await;
    let client = transport(url, "standup", 10_000);
    client.connect().unwrap();
    client.connect().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.attempts(), 1);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(*client.state().borrow(), TransportState::Backoff);

    client.close();
}
