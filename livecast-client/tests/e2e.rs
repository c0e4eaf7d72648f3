use livecast_api::{create_router, AppState, SIGNALING_PATH};
use livecast_client::{ClientEvent, DriverState, LocalTrack, LoopbackDevice, SignalingDriver};
use livecast_proto::{MediaKind, RoomId};
use livecast_sfu::{LoopbackEngine, MemoryMessageStore, RoomRegistry, SfuConfig, WorkerPool, WorkerSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

async fn serve() -> (String, Arc<RoomRegistry>) {
    let engine = LoopbackEngine::new();
    let pool = WorkerPool::start(&engine, 2, &WorkerSettings::default())
        .await
        .unwrap();
    let registry = RoomRegistry::new(
        SfuConfig::default(),
        Arc::new(pool),
        Arc::new(MemoryMessageStore::new()),
    );
    let app = create_router(AppState::new(Arc::clone(&registry)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}{SIGNALING_PATH}"), registry)
}

async fn connected(url: &str) -> (SignalingDriver, UnboundedReceiver<ClientEvent>) {
    let (mut driver, events) = SignalingDriver::new(Arc::new(LoopbackDevice::new()));
    driver.connect(url).await.unwrap();
    assert_eq!(driver.state(), DriverState::Connected);
    (driver, events)
}

/// Process server frames until an event matching `matches` shows up
async fn pump_until(
    driver: &mut SignalingDriver,
    events: &mut UnboundedReceiver<ClientEvent>,
    mut matches: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            while let Ok(event) = events.try_recv() {
                if matches(&event) {
                    return event;
                }
            }
            assert!(driver.process_next().await.unwrap(), "connection closed");
        }
    })
    .await
    .expect("event not received in time")
}

#[tokio::test]
async fn test_two_clients_over_websocket() {
    let (url, registry) = serve().await;
    let room_id = RoomId::from("e2e");

    let (mut alice, mut alice_events) = connected(&url).await;
    alice.join(room_id.clone(), "Alice", true).await.unwrap();
    assert_eq!(alice.state(), DriverState::Ready);
    assert_eq!(alice.peers().count(), 0);
    let mic = alice
        .produce(LocalTrack::new("mic", MediaKind::Audio))
        .await
        .unwrap();

    let (mut bob, mut bob_events) = connected(&url).await;
    bob.join(room_id.clone(), "Bob", false).await.unwrap();
    assert_eq!(bob.peers().map(|p| p.name.as_str()).collect::<Vec<_>>(), ["Alice"]);
    let consumers: Vec<_> = bob.consumers().collect();
    assert_eq!(consumers.len(), 1);
    assert_eq!(consumers[0].producer_id, mic);
    assert_eq!(&consumers[0].peer_id, alice.peer_id());

    let joined = pump_until(&mut alice, &mut alice_events, |e| {
        matches!(e, ClientEvent::PeerJoined(_))
    })
    .await;
    assert!(matches!(joined, ClientEvent::PeerJoined(ref p) if p.name == "Bob" && !p.is_host));

    let echo = bob.send_chat("  hello  ").await.unwrap();
    assert_eq!(echo.content, "hello");
    assert_eq!(echo.sender_name, "Bob");
    let chat = pump_until(&mut alice, &mut alice_events, |e| matches!(e, ClientEvent::Chat(_))).await;
    assert_eq!(chat, ClientEvent::Chat(echo));

    bob.set_muted(MediaKind::Audio, true).await.unwrap();
    let camera = bob
        .produce(LocalTrack::new("cam", MediaKind::Video))
        .await
        .unwrap();
    pump_until(&mut alice, &mut alice_events, |e| {
        matches!(e, ClientEvent::MuteChanged { muted: true, .. })
    })
    .await;
    let ready = pump_until(&mut alice, &mut alice_events, |e| {
        matches!(e, ClientEvent::ConsumerReady(_))
    })
    .await;
    assert!(matches!(ready, ClientEvent::ConsumerReady(ref c) if c.producer_id == camera));
    assert!(alice.peer(bob.peer_id()).unwrap().status.audio_muted);

    let stats = registry.stats().await;
    assert_eq!(stats.active_rooms, 1);
    assert_eq!(stats.total_peers, 2);
    assert_eq!(stats.total_transports, 4);
    assert_eq!(stats.total_producers, 2);
    assert_eq!(stats.total_consumers, 2);

    let bob_id = bob.peer_id().clone();
    bob.leave().await.unwrap();
    assert_eq!(bob.state(), DriverState::Disconnected);
    while bob_events.try_recv().is_ok() {}

    let closed = pump_until(&mut alice, &mut alice_events, |e| {
        matches!(e, ClientEvent::ConsumerClosed { .. })
    })
    .await;
    assert!(matches!(closed, ClientEvent::ConsumerClosed { ref producer_id, .. } if *producer_id == camera));
    let left = pump_until(&mut alice, &mut alice_events, |e| matches!(e, ClientEvent::PeerLeft(_))).await;
    assert_eq!(left, ClientEvent::PeerLeft(bob_id));
    assert_eq!(alice.consumers().count(), 0);
    assert_eq!(alice.peers().count(), 0);

    alice.leave().await.unwrap();
    timeout(Duration::from_secs(5), async {
        while registry.room_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room not destroyed");
    assert!(!registry.contains(&room_id));
}

#[tokio::test]
async fn test_dropped_socket_releases_peer() {
    let (url, registry) = serve().await;
    let room_id = RoomId::from("drop");

    let (mut host, _events) = connected(&url).await;
    host.join(room_id.clone(), "Host", true).await.unwrap();
    assert_eq!(registry.stats().await.total_peers, 1);

    host.disconnect().await;
    timeout(Duration::from_secs(5), async {
        while registry.contains(&room_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room not destroyed after disconnect");
}

#[tokio::test]
async fn test_server_errors_surface_on_request() {
    let (url, _registry) = serve().await;
    let (mut driver, _events) = connected(&url).await;
    driver.join(RoomId::from("errs"), "Solo", false).await.unwrap();

    let err = driver.send_chat("   ").await.unwrap_err();
    assert!(err.to_string().contains("Server error"));
    assert_eq!(driver.state(), DriverState::Ready);

    let echo = driver.send_chat("still here").await.unwrap();
    assert_eq!(echo.content, "still here");
    assert_eq!(driver.messages().len(), 1);
}
