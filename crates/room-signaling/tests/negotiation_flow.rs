use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use room_signaling::mock::MockConnectionFactory;
use room_signaling::telemetry::{init_tracing, init_tracing_from};
use room_signaling::{
    ConnectError, Identity, MessageKind, NegotiationMessage, NegotiationState, SignalingClient,
    SignalingConfig,
};
use test_timeout::tokio_timeout_test;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};
use transport_bus::{Bus, BusMessage, JoinBehavior, LocalBus};

fn make_client(
    id: &str,
    transport: &Arc<LocalBus>,
    config: SignalingConfig,
) -> (SignalingClient, Arc<MockConnectionFactory>) {
    let factory = Arc::new(MockConnectionFactory::new());
    let client = SignalingClient::new(
        Arc::new(Identity::new(id)),
        transport.clone(),
        factory.clone(),
        config,
    );
    (client, factory)
}

fn quiet_config() -> SignalingConfig {
    SignalingConfig {
        announce_presence: false,
        offer_on_peer_joined: false,
        ..SignalingConfig::default()
    }
}

async fn settle(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn drain(tap: &mut broadcast::Receiver<BusMessage>) -> Vec<NegotiationMessage> {
    let mut seen = Vec::new();
    while let Ok(raw) = tap.try_recv() {
        if let Ok(message) = NegotiationMessage::decode(&raw.payload) {
            seen.push(message);
        }
    }
    seen
}

#[tokio_timeout_test(30, paused)]
async fn two_participants_settle_after_one_offer_and_one_answer() {
    init_tracing("warn");
    let transport = Arc::new(LocalBus::new());
    let mut tap = transport
        .subscribe("room_R1_signaling")
        .expect("tap subscribe")
        .messages;
    let (alice, _) = make_client("A", &transport, quiet_config());
    let (bob, _) = make_client("B", &transport, quiet_config());

    let engine_a = alice.join_room("R1").await.expect("A joins");
    let engine_b = bob.join_room("R1").await.expect("B joins");

    engine_a.create_offer("B").await.expect("offer");
    assert_eq!(engine_a.state("B"), Some(NegotiationState::HaveLocalOffer));

    let settled = settle(|| {
        engine_a.state("B") == Some(NegotiationState::Stable)
            && engine_b.state("A") == Some(NegotiationState::Stable)
    })
    .await;
    assert!(settled, "both sides should return to stable");

    let exchanged = drain(&mut tap);
    let kinds: Vec<MessageKind> = exchanged.iter().map(|m| m.kind().clone()).collect();
    assert_eq!(kinds, vec![MessageKind::Offer, MessageKind::Answer]);
    assert_eq!(exchanged[0].from(), "A");
    assert_eq!(exchanged[0].to(), Some("B"));
    assert_eq!(exchanged[1].from(), "B");
    assert_eq!(exchanged[1].to(), Some("A"));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio_timeout_test(30, paused)]
async fn join_without_signal_times_out_and_leaves_no_channel() {
    let transport = Arc::new(LocalBus::new());
    transport.set_join_behavior("room_R2_signaling", JoinBehavior::Never);
    let (client, _) = make_client("A", &transport, quiet_config());

    let started = Instant::now();
    let err = client.join_room("R2").await.expect_err("never joins");
    assert_eq!(err, ConnectError::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_millis(10_500));

    assert_eq!(client.supervisor().state("R2"), None);
    assert!(client.supervisor().can_reconnect("R2"));
    assert!(client.engine("R2").is_none());
    assert_eq!(transport.active_subscriptions("room_R2_signaling"), 0);
}

#[tokio_timeout_test(30, paused)]
async fn newcomer_is_offered_by_existing_member() {
    let transport = Arc::new(LocalBus::new());
    let (alice, _) = make_client("A", &transport, SignalingConfig::default());
    let (bob, bob_factory) = make_client("B", &transport, SignalingConfig::default());

    let engine_a = alice.join_room("lobby").await.expect("A joins");
    let engine_b = bob.join_room("lobby").await.expect("B joins");

    let settled = settle(|| {
        engine_a.state("B") == Some(NegotiationState::Stable)
            && engine_b.state("A") == Some(NegotiationState::Stable)
    })
    .await;
    assert!(settled, "presence should drive a full handshake");
    let bob_link = bob_factory.connection_for("A").expect("bob built a link");
    assert_eq!(bob_link.create_offer_calls(), 0);
    assert_eq!(bob_link.create_answer_calls(), 1);

    bob.leave_room("lobby").await;
    let removed = settle(|| engine_a.state("B").is_none()).await;
    assert!(removed, "departure should tear down the link");

    alice.shutdown().await;
}

#[tokio_timeout_test(30, paused)]
async fn concurrent_joins_share_one_engine_and_announce_once() {
    let transport = Arc::new(LocalBus::new());
    let mut tap = transport
        .subscribe("room_lobby_signaling")
        .expect("tap subscribe")
        .messages;
    let (alice, _) = make_client("A", &transport, SignalingConfig::default());

    let (first, second) = tokio::join!(alice.join_room("lobby"), alice.join_room("lobby"));
    let first = first.expect("first join");
    let second = second.expect("second join");

    first.create_offer("B").await.expect("offer");
    assert_eq!(second.state("B"), Some(NegotiationState::HaveLocalOffer));
    let routed = alice.engine("lobby").expect("registered engine");
    assert_eq!(routed.state("B"), Some(NegotiationState::HaveLocalOffer));

    let announced = drain(&mut tap)
        .iter()
        .filter(|m| m.kind() == &MessageKind::PeerJoined)
        .count();
    assert_eq!(announced, 1);

    alice.shutdown().await;
}

#[tokio_timeout_test(30, paused)]
async fn repeated_notice_is_delivered_once() {
    let transport = Arc::new(LocalBus::new());
    let (alice, _) = make_client("A", &transport, quiet_config());
    let (bob, _) = make_client("B", &transport, quiet_config());
    alice.join_room("lobby").await.expect("A joins");
    bob.join_room("lobby").await.expect("B joins");

    let notices = Arc::new(AtomicUsize::new(0));
    let counter = notices.clone();
    let _handle = alice.on_message(move |inbound| {
        if inbound.message.notice().is_some() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    bob.send_notice("lobby", "room closes in five minutes")
        .await
        .expect("first notice");
    bob.send_notice("lobby", "room closes in five minutes")
        .await
        .expect("retried notice");

    assert!(settle(|| notices.load(Ordering::SeqCst) >= 1).await);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(notices.load(Ordering::SeqCst), 1);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio_timeout_test(10)]
async fn tracing_installs_once() {
    init_tracing_from(&SignalingConfig::default());
    assert!(!init_tracing("info"));
}
