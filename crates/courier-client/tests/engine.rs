//! Engine behaviour against the in-memory relay network.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier_client::{ClientConfig, ClientContext, FetchError, SendError};
use courier_net::mock::MockNetwork;
use courier_net::RelayStatus;
use courier_shared::constants::{
    DECRYPTION_PLACEHOLDER, KIND_DIRECT_MESSAGE, MAX_PLAINTEXT_SIZE, TAG_PUBKEY,
};
use courier_shared::event::unix_now;
use courier_shared::{crypto, DirectMessage, Identity, PublicKey, SignedEvent, Signer, UnsignedEvent};
use courier_store::MemoryCache;

const RELAY_A: &str = "wss://a.example.com";
const RELAY_B: &str = "wss://b.example.com";

fn network(relays: &[&str]) -> MockNetwork {
    let mock = MockNetwork::new();
    for url in relays {
        mock.add_relay(url);
    }
    mock
}

async fn client(mock: &MockNetwork, relays: &[&str]) -> ClientContext {
    let config = ClientConfig {
        relays: relays.iter().map(|r| r.to_string()).collect(),
        auto_reconnect: false,
        publish_timeout: Duration::from_millis(500),
        fetch_timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    };
    let context = ClientContext::new(config, Arc::new(mock.clone()), Arc::new(MemoryCache::new()));
    context.start().await;
    wait_connected(&context, relays.len()).await;
    context
}

async fn wait_connected(context: &ClientContext, count: usize) {
    for _ in 0..200 {
        if context.network.manager.connected_sessions().await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("relays did not connect");
}

async fn logged_in(mock: &MockNetwork, relays: &[&str], identity: &Identity) -> ClientContext {
    let context = client(mock, relays).await;
    context.engine.login(Arc::new(identity.clone())).await;
    context
}

/// A direct message with an explicit timestamp.
fn dm_at(from: &Identity, to: &PublicKey, text: &str, created_at: u64) -> SignedEvent {
    let content = crypto::encrypt(from, to, text).unwrap();
    UnsignedEvent {
        pubkey: from.public_key(),
        created_at,
        kind: KIND_DIRECT_MESSAGE,
        tags: vec![vec![TAG_PUBKEY.to_string(), to.to_hex()]],
        content,
    }
    .sign(from)
    .unwrap()
}

fn collector() -> (Arc<Mutex<Vec<DirectMessage>>>, impl Fn(DirectMessage) + Send + Sync + 'static) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    (received, move |message| sink.lock().unwrap().push(message))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn send_without_identity_does_no_io() {
    let mock = network(&[RELAY_A]);
    let context = client(&mock, &[RELAY_A]).await;
    let bob = Identity::generate();

    let result = context.engine.send(&bob.public_key(), "hello").await;

    assert_eq!(result, Err(SendError::NoIdentity));
    assert!(mock.stored_events(RELAY_A).is_empty());
    assert_eq!(mock.total_req_count(), 0);
}

#[tokio::test]
async fn send_rejects_empty_content() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A], &alice).await;

    let result = context.engine.send(&Identity::generate().public_key(), "  ").await;
    assert_eq!(result, Err(SendError::EmptyContent));
    assert!(mock.stored_events(RELAY_A).is_empty());
}

#[tokio::test]
async fn send_publishes_and_indexes() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A], &alice).await;

    let message = context.engine.send(&bob.public_key(), "hi bob").await.unwrap();

    assert_eq!(message.sender, alice.public_key());
    assert_eq!(message.recipient, bob.public_key());
    assert_eq!(message.plaintext, "hi bob");
    assert!(message.decrypted);

    let stored = mock.stored_events(RELAY_A);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, message.id);
    assert_eq!(DirectMessage::open(&stored[0], &bob).unwrap().plaintext, "hi bob");

    assert_eq!(context.engine.messages(&bob.public_key()), vec![message]);
}

#[tokio::test]
async fn concurrent_sends_are_both_kept() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A], &alice).await;
    let engine = &context.engine;

    let recipient = bob.public_key();

    let (first, second) = tokio::join!(
        engine.send(&recipient, "one"),
        engine.send(&recipient, "two"),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(engine.messages(&bob.public_key()).len(), 2);
}

#[tokio::test]
async fn send_tolerates_partial_rejection() {
    let mock = network(&[RELAY_A, RELAY_B]);
    mock.set_reject_events(RELAY_B, true);
    let alice = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A, RELAY_B], &alice).await;

    let result = context
        .engine
        .send(&Identity::generate().public_key(), "partial")
        .await;
    assert!(result.is_ok());
    assert_eq!(mock.stored_events(RELAY_A).len(), 1);
}

#[tokio::test]
async fn send_fails_when_every_relay_rejects() {
    let mock = network(&[RELAY_A, RELAY_B]);
    mock.set_reject_events(RELAY_A, true);
    mock.set_reject_events(RELAY_B, true);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A, RELAY_B], &alice).await;

    let result = context.engine.send(&bob.public_key(), "nope").await;

    assert_eq!(result, Err(SendError::NotAccepted { attempted: 2 }));
    assert!(context.engine.messages(&bob.public_key()).is_empty());
}

#[tokio::test]
async fn send_rejects_oversized_content() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A], &alice).await;

    let content = "a".repeat(MAX_PLAINTEXT_SIZE + 1);
    let result = context
        .engine
        .send(&Identity::generate().public_key(), &content)
        .await;

    assert!(matches!(result, Err(SendError::Event(_))));
    assert!(mock.stored_events(RELAY_A).is_empty());
}

#[tokio::test]
async fn send_without_relays_fails() {
    let mock = network(&[]);
    let alice = Identity::generate();
    let context = logged_in(&mock, &[], &alice).await;

    let result = context
        .engine
        .send(&Identity::generate().public_key(), "anyone?")
        .await;
    assert_eq!(result, Err(SendError::NoRelay));
}

#[tokio::test]
async fn send_settles_silent_relay_as_timeout() {
    let mock = network(&[RELAY_A, RELAY_B]);
    mock.set_silent(RELAY_B, true);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A, RELAY_B], &alice).await;

    // accepted by one relay is enough
    let message = context.engine.send(&bob.public_key(), "one of two").await.unwrap();
    assert_eq!(context.engine.messages(&bob.public_key()), vec![message]);

    mock.set_reachable(RELAY_A, false);
    settle().await;
    let started = Instant::now();
    let result = context.engine.send(&bob.public_key(), "nobody answers").await;
    assert_eq!(result, Err(SendError::NotAccepted { attempted: 1 }));
    assert!(started.elapsed() >= Duration::from_millis(500));
}

#[tokio::test]
async fn fetch_returns_partial_results_after_timeout() {
    let mock = network(&[RELAY_A, RELAY_B]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let now = unix_now();
    mock.inject_event(RELAY_A, &dm_at(&bob, &alice.public_key(), "from a", now - 2));
    mock.set_silent(RELAY_B, true);

    let context = logged_in(&mock, &[RELAY_A, RELAY_B], &alice).await;
    let started = Instant::now();
    let messages = context.engine.fetch(&bob.public_key()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].plaintext, "from a");
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn fetch_is_cache_first() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A], &alice).await;

    let sent = context.engine.send(&bob.public_key(), "cached").await.unwrap();
    let fetched = context.engine.fetch(&bob.public_key()).await.unwrap();

    assert_eq!(fetched, vec![sent]);
    assert_eq!(mock.total_req_count(), 0);
}

#[tokio::test]
async fn fetch_collects_both_directions_from_relays() {
    let mock = network(&[RELAY_A, RELAY_B]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let carol = Identity::generate();

    let now = unix_now();
    let incoming = dm_at(&bob, &alice.public_key(), "hello alice", now - 20);
    let outgoing = dm_at(&alice, &bob.public_key(), "hello bob", now - 10);
    let unrelated = dm_at(&carol, &alice.public_key(), "not in this chat", now - 5);
    mock.inject_event(RELAY_A, &incoming);
    mock.inject_event(RELAY_B, &incoming);
    mock.inject_event(RELAY_B, &outgoing);
    mock.inject_event(RELAY_A, &unrelated);

    let context = logged_in(&mock, &[RELAY_A, RELAY_B], &alice).await;
    let messages = context.engine.fetch(&bob.public_key()).await.unwrap();

    let texts: Vec<&str> = messages.iter().map(|m| m.plaintext.as_str()).collect();
    assert_eq!(texts, vec!["hello alice", "hello bob"]);
    assert!(messages.iter().all(|m| m.decrypted));

    // the second fetch is answered by the cache
    let requests = mock.total_req_count();
    let again = context.engine.fetch(&bob.public_key()).await.unwrap();
    assert_eq!(again, messages);
    assert_eq!(mock.total_req_count(), requests);
}

#[tokio::test]
async fn fetch_keeps_undecryptable_messages() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let carol = Identity::generate();

    // encrypted for carol but addressed to alice
    let content = crypto::encrypt(&bob, &carol.public_key(), "wrong key").unwrap();
    let event = UnsignedEvent::new(
        bob.public_key(),
        KIND_DIRECT_MESSAGE,
        vec![vec![TAG_PUBKEY.to_string(), alice.public_key().to_hex()]],
        content,
    )
    .sign(&bob)
    .unwrap();
    mock.inject_event(RELAY_A, &event);

    let context = logged_in(&mock, &[RELAY_A], &alice).await;
    let messages = context.engine.fetch(&bob.public_key()).await.unwrap();

    assert_eq!(messages.len(), 1);
    assert!(!messages[0].decrypted);
    assert_eq!(messages[0].plaintext, DECRYPTION_PLACEHOLDER);
}

#[tokio::test]
async fn fetch_requires_identity_and_relay() {
    let mock = network(&[]);
    let context = client(&mock, &[]).await;
    let bob = Identity::generate();

    assert_eq!(
        context.engine.fetch(&bob.public_key()).await,
        Err(FetchError::NoIdentity)
    );

    context.engine.login(Arc::new(Identity::generate())).await;
    assert_eq!(
        context.engine.fetch(&bob.public_key()).await,
        Err(FetchError::NoRelay)
    );
}

#[tokio::test]
async fn live_messages_are_delivered_once() {
    let mock = network(&[RELAY_A, RELAY_B]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A, RELAY_B], &alice).await;

    let (received, on_message) = collector();
    let live = context.engine.subscribe_live(on_message).await.unwrap();
    settle().await;

    let event = dm_at(&bob, &alice.public_key(), "ping", unix_now());
    mock.inject_event(RELAY_A, &event);
    mock.inject_event(RELAY_B, &event);
    settle().await;

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].plaintext, "ping");
    assert_eq!(context.engine.messages(&bob.public_key()).len(), 1);
    live.stop().await;
}

#[tokio::test]
async fn live_skips_self_authored_events() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A], &alice).await;

    let (received, on_message) = collector();
    let _live = context.engine.subscribe_live(on_message).await.unwrap();
    settle().await;

    mock.inject_event(RELAY_A, &dm_at(&alice, &alice.public_key(), "note", unix_now()));
    settle().await;

    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stopped_live_subscription_is_silent() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A], &alice).await;

    let (received, on_message) = collector();
    let live = context.engine.subscribe_live(on_message).await.unwrap();
    settle().await;

    live.stop().await;
    live.stop().await;
    assert!(live.is_stopped());

    mock.inject_event(RELAY_A, &dm_at(&bob, &alice.public_key(), "late", unix_now()));
    settle().await;

    assert!(received.lock().unwrap().is_empty());
    assert_eq!(mock.open_subscriptions(RELAY_A), 0);
}

#[tokio::test]
async fn logout_cancels_live_subscriptions() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A], &alice).await;

    context.engine.send(&bob.public_key(), "before").await.unwrap();
    let (received, on_message) = collector();
    let live = context.engine.subscribe_live(on_message).await.unwrap();
    settle().await;

    context.engine.logout().await;
    assert!(live.is_stopped());
    assert!(context.engine.public_key().is_none());
    assert!(context.engine.messages(&bob.public_key()).is_empty());

    mock.inject_event(RELAY_A, &dm_at(&bob, &alice.public_key(), "after", unix_now()));
    settle().await;
    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn conversations_scan_then_cache() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let carol = Identity::generate();
    let now = unix_now();
    mock.inject_event(RELAY_A, &dm_at(&bob, &alice.public_key(), "from bob", now - 2));
    mock.inject_event(RELAY_A, &dm_at(&alice, &carol.public_key(), "to carol", now - 1));

    let context = logged_in(&mock, &[RELAY_A], &alice).await;
    let conversations = context.engine.list_conversations().await.unwrap();
    assert_eq!(
        conversations,
        BTreeSet::from([bob.public_key(), carol.public_key()])
    );

    let requests = mock.total_req_count();
    assert_eq!(context.engine.list_conversations().await.unwrap(), conversations);
    assert_eq!(mock.total_req_count(), requests);
}

#[tokio::test]
async fn send_before_first_scan_keeps_older_conversations() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let carol = Identity::generate();
    let dave = Identity::generate();
    let erin = Identity::generate();
    let now = unix_now();
    mock.inject_event(RELAY_A, &dm_at(&bob, &alice.public_key(), "from bob", now - 2));
    mock.inject_event(RELAY_A, &dm_at(&alice, &carol.public_key(), "to carol", now - 1));

    let context = logged_in(&mock, &[RELAY_A], &alice).await;
    context.engine.send(&dave.public_key(), "hi dave").await.unwrap();

    assert_eq!(
        context.engine.list_conversations().await.unwrap(),
        BTreeSet::from([bob.public_key(), carol.public_key(), dave.public_key()])
    );

    // after the scan, new counterparties merge into the cached set
    context.engine.send(&erin.public_key(), "hi erin").await.unwrap();
    let requests = mock.total_req_count();
    assert_eq!(
        context.engine.list_conversations().await.unwrap(),
        BTreeSet::from([
            bob.public_key(),
            carol.public_key(),
            dave.public_key(),
            erin.public_key()
        ])
    );
    assert_eq!(mock.total_req_count(), requests);
}

#[tokio::test]
async fn conversations_include_indexed_counterparties() {
    let mock = network(&[RELAY_A, RELAY_B]);
    mock.set_reject_events(RELAY_B, true);
    let alice = Identity::generate();
    let dave = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A, RELAY_B], &alice).await;

    context.engine.send(&dave.public_key(), "only on a").await.unwrap();
    mock.set_reachable(RELAY_A, false);
    settle().await;

    assert_eq!(
        context.engine.list_conversations().await.unwrap(),
        BTreeSet::from([dave.public_key()])
    );
}

#[tokio::test]
async fn clear_cache_forces_network_fetch() {
    let mock = network(&[RELAY_A]);
    let alice = Identity::generate();
    let bob = Identity::generate();
    let context = logged_in(&mock, &[RELAY_A], &alice).await;

    context.engine.send(&bob.public_key(), "kept on relay").await.unwrap();
    context.engine.clear_cache().unwrap();
    assert!(context.engine.messages(&bob.public_key()).is_empty());

    let messages = context.engine.fetch(&bob.public_key()).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].plaintext, "kept on relay");
    assert!(mock.total_req_count() > 0);
}

#[tokio::test]
async fn add_relay_registers_before_connecting() {
    let mock = network(&["wss://relay.example.com"]);
    let context = client(&mock, &[]).await;

    context
        .network
        .manager
        .add_relay("wss://relay.example.com")
        .await
        .unwrap();

    let relays = context.network.manager.list_relays().await;
    assert_eq!(relays.len(), 1);
    assert!(matches!(
        relays[0].status,
        RelayStatus::Disconnected | RelayStatus::Connecting
    ));
    assert!(context
        .network
        .manager
        .remove_relay("wss://unknown.example.com")
        .await
        .is_ok());
}

#[tokio::test]
async fn relays_converge_after_outage() {
    let urls = [RELAY_A, RELAY_B, "wss://c.example.com"];
    let mock = network(&urls);
    for url in urls {
        mock.set_reachable(url, false);
    }
    let context = client(&mock, &[]).await;
    for url in urls {
        context.network.manager.add_relay(url).await.unwrap();
    }
    settle().await;

    for url in urls {
        mock.set_reachable(url, true);
    }
    for _ in 0..urls.len() {
        context.network.manager.reconnect_now().await;
    }

    let relays = context.network.manager.list_relays().await;
    assert!(relays.iter().all(|r| r.status == RelayStatus::Connected));
}
