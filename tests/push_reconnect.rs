use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use vigil::metrics::Normalizer;
use vigil::transport::{ChannelEvent, ChannelState, PushChannel, PushConfig};
use vigil::{Session, SessionStore};

const TOPIC: &str = "/topic/metrics";

type Socket = WebSocketStream<TcpStream>;

/// Next non-heartbeat STOMP frame from the client.
async fn read_frame(ws: &mut Socket) -> Option<String> {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            if !text.trim().is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn header(frame: &str, name: &str) -> Option<String> {
    let prefix = format!("{name}:");
    frame
        .lines()
        .find_map(|l| l.strip_prefix(prefix.as_str()))
        .map(|v| v.trim_end_matches('\0').to_string())
}

async fn send(ws: &mut Socket, frame: String) {
    ws.send(Message::Text(frame)).await.unwrap();
}

/// Accept CONNECT, then wait for the SUBSCRIBE and return its id.
async fn handshake(ws: &mut Socket, heart_beat: &str) -> (String, String) {
    let connect = read_frame(ws).await.unwrap();
    assert!(connect.starts_with("CONNECT\n"), "{connect:?}");
    send(ws, format!("CONNECTED\nversion:1.2\nheart-beat:{heart_beat}\n\n\0")).await;

    loop {
        let frame = read_frame(ws).await.unwrap();
        if frame.starts_with("SUBSCRIBE\n") {
            assert_eq!(header(&frame, "destination").as_deref(), Some(TOPIC));
            return (connect, header(&frame, "id").unwrap());
        }
    }
}

async fn publish(ws: &mut Socket, subscription: &str, seq: usize) {
    let body = json!({ "cpu": { "system": 10 + seq, "process": 1 }, "timestamp": 1000 + seq }).to_string();
    send(
        ws,
        format!(
            "MESSAGE\ndestination:{TOPIC}\nsubscription:{subscription}\nmessage-id:{seq}\ncontent-type:application/json\n\n{body}\0"
        ),
    )
    .await;
}

async fn next_event(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap()
}

async fn wait_connected(events: &mut broadcast::Receiver<ChannelEvent>) {
    loop {
        if next_event(events).await == ChannelEvent::Connected {
            return;
        }
    }
}

fn channel(addr: std::net::SocketAddr, attempts: u32, delay: Duration) -> PushChannel {
    let config = PushConfig::new(format!("ws://{addr}/ws-monitoring"))
        .with_reconnect(attempts, delay)
        .with_heartbeat(Duration::ZERO);
    PushChannel::new(config, SessionStore::in_memory().unwrap())
}

// Runs on a paused clock so the default 3000 ms policy takes no wall time.
// Nothing below may wrap socket waits in a timeout: the clock jumps to the
// next timer whenever the runtime is idle.
#[tokio::test(start_paused = true)]
async fn test_drop_after_two_messages_exhausts_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        // Every later attempt is refused
        drop(listener);
        let mut ws = accept_async(tcp).await.unwrap();
        let (_, id) = handshake(&mut ws, "0,0").await;
        publish(&mut ws, &id, 0).await;
        publish(&mut ws, &id, 1).await;
        let _ = ws.close(None).await;
    });

    let config = PushConfig::new(format!("ws://{addr}/ws-monitoring")).with_heartbeat(Duration::ZERO);
    assert_eq!(config.max_reconnect_attempts, 5);
    assert_eq!(config.reconnect_delay, Duration::from_millis(3000));
    let ch = PushChannel::new(config, SessionStore::in_memory().unwrap());
    let mut events = ch.events();
    ch.connect().unwrap();
    loop {
        if events.recv().await.unwrap() == ChannelEvent::Connected {
            break;
        }
    }
    assert!(ch.is_connected());

    let mut sub = ch.subscribe(TOPIC).unwrap();
    let normalizer = Normalizer::new();
    for expected in [10.0, 11.0] {
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.topic, TOPIC);
        let frame = normalizer.parse_frame(&delivery.body).unwrap().into_value();
        assert_eq!(frame.cpu.unwrap().system_pct, expected);
    }

    let mut attempts = Vec::new();
    let mut stamps = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            ChannelEvent::Reconnecting { attempt, max, delay } => {
                assert_eq!(max, 5);
                assert_eq!(delay, Duration::from_millis(3000));
                attempts.push(attempt);
                stamps.push(Instant::now());
            }
            ChannelEvent::Failed { .. } => {
                stamps.push(Instant::now());
                break;
            }
            ChannelEvent::Connected => panic!("listener is gone, nothing should connect"),
            _ => {}
        }
    }
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
    // Each attempt, and the final give-up, waits out the full delay
    for pair in stamps.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(3000), "{:?}", pair[1] - pair[0]);
    }
    assert!(!ch.is_connected());
    assert_eq!(ch.state(), ChannelState::Disconnected);

    // Nothing else happens on its own, however long we wait
    assert!(timeout(Duration::from_secs(60), events.recv()).await.is_err());
    assert!(!ch.is_connected());

    // A manual connect starts a fresh round
    ch.connect().unwrap();
    loop {
        if let ChannelEvent::Reconnecting { attempt, .. } = events.recv().await.unwrap() {
            assert_eq!(attempt, 1);
            break;
        }
    }
    ch.disconnect();
}

#[tokio::test]
async fn test_reconnect_right_after_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ids_tx, mut ids_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut held = Vec::new();
        for seq in 0..2 {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let (_, id) = handshake(&mut ws, "0,0").await;
            ids_tx.send(id.clone()).unwrap();
            if seq == 1 {
                publish(&mut ws, &id, seq).await;
            }
            // Keep both sockets open so the first close lingers
            held.push(ws);
        }
        std::future::pending::<()>().await;
    });

    let ch = channel(addr, 3, Duration::from_millis(50));
    let mut events = ch.events();
    ch.connect().unwrap();
    wait_connected(&mut events).await;
    let first = ch.subscribe(TOPIC).unwrap();
    ids_rx.recv().await.unwrap();

    ch.disconnect();
    assert_eq!(ch.state(), ChannelState::Disconnected);
    ch.connect().unwrap();
    wait_connected(&mut events).await;
    let mut second = ch.subscribe(TOPIC).unwrap();
    drop(first);

    let delivery = timeout(Duration::from_secs(5), second.recv()).await.unwrap().unwrap();
    assert!(delivery.body.contains("\"system\":11"));

    // Let the first connection task finish winding down
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(ch.is_connected());
    assert_eq!(ch.state(), ChannelState::Connected);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ChannelEvent::Disconnected { .. }), "{event:?}");
    }
    assert!(ch.subscribe(TOPIC).is_ok());
    ch.disconnect();
}

#[tokio::test]
async fn test_subscription_survives_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ids_tx, mut ids_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        for seq in 0..2 {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let (_, id) = handshake(&mut ws, "0,0").await;
            ids_tx.send(id.clone()).unwrap();
            publish(&mut ws, &id, seq).await;
            if seq == 0 {
                let _ = ws.close(None).await;
            } else {
                // Hold the second connection open until the client leaves
                while read_frame(&mut ws).await.is_some() {}
            }
        }
    });

    let ch = channel(addr, 3, Duration::from_millis(50));
    let mut events = ch.events();
    ch.connect().unwrap();
    wait_connected(&mut events).await;
    let mut sub = ch.subscribe(TOPIC).unwrap();

    let first = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
    assert!(first.body.contains("\"system\":10"));
    assert!(second.body.contains("\"system\":11"));

    let a = ids_rx.recv().await.unwrap();
    let b = ids_rx.recv().await.unwrap();
    assert_eq!(a, b);
    ch.disconnect();
}

#[tokio::test]
async fn test_silent_broker_trips_heartbeat_watchdog() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        drop(listener);
        let mut ws = accept_async(tcp).await.unwrap();
        let connect = read_frame(&mut ws).await.unwrap();
        assert!(connect.starts_with("CONNECT\n"));
        // Promise a beat every 100 ms, then never send one
        send(&mut ws, "CONNECTED\nversion:1.2\nheart-beat:100,0\n\n\0".into()).await;
        while read_frame(&mut ws).await.is_some() {}
    });

    let config = PushConfig::new(format!("ws://{addr}/ws-monitoring"))
        .with_reconnect(0, Duration::from_millis(100))
        .with_heartbeat(Duration::from_millis(100));
    let ch = PushChannel::new(config, SessionStore::in_memory().unwrap());
    let mut events = ch.events();
    ch.connect().unwrap();
    wait_connected(&mut events).await;

    let started = Instant::now();
    loop {
        match next_event(&mut events).await {
            ChannelEvent::Disconnected { reason } => {
                assert_eq!(reason, "heartbeat timeout");
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(next_event(&mut events).await, ChannelEvent::Failed { .. }));
}

#[tokio::test]
async fn test_bearer_on_connect_and_unsubscribe_on_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        let (connect, id) = handshake(&mut ws, "0,0").await;
        seen_tx.send(header(&connect, "Authorization")).unwrap();
        while let Some(frame) = read_frame(&mut ws).await {
            if frame.starts_with("UNSUBSCRIBE\n") {
                assert_eq!(header(&frame, "id"), Some(id.clone()));
                seen_tx.send(Some("unsubscribed".into())).unwrap();
            }
        }
    });

    let store = SessionStore::in_memory().unwrap();
    store
        .save(&Session { access_token: "tok".into(), ..Default::default() })
        .unwrap();
    let config = PushConfig::new(format!("ws://{addr}/ws-monitoring")).with_heartbeat(Duration::ZERO);
    let ch = PushChannel::new(config, store);
    let mut events = ch.events();
    ch.connect().unwrap();
    wait_connected(&mut events).await;

    let sub = ch.subscribe(TOPIC).unwrap();
    assert_eq!(seen_rx.recv().await.unwrap().as_deref(), Some("Bearer tok"));

    drop(sub);
    let got = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(got.as_deref(), Some("unsubscribed"));
    ch.disconnect();
}
