use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::time::{sleep, timeout, Instant};

use tidemark_feed::{
    fatal_channel, Credentials, FatalKind, FeedError, SnapshotPolicy, Subscription,
};
use tidemark_session::{start_session, ControllerState, ReconnectPolicy, SessionConfig};
use tidemark_test_utils::{MockVenueConfig, MockVenueServer, ReferenceVenue};

fn dec(value: i64) -> Decimal {
    Decimal::from(value)
}

fn fast_session(ws_url: String) -> SessionConfig {
    let mut config = SessionConfig::new(ws_url);
    config.reconnect = ReconnectPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        jitter: false,
    };
    config
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + deadline;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_replays_subscriptions_in_first_accepted_order() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig::default()).await?;
    let venue = Arc::new(ReferenceVenue::default());
    let (fatal, _monitor) = fatal_channel();
    let (handle, _task) = start_session(venue, fast_session(server.ws_url()), fatal)?;

    handle.connect().await?;
    let order = [
        Subscription::order_book("book.BTCUSDT", "BTCUSDT"),
        Subscription::trades("trades.BTCUSDT", "BTCUSDT"),
        Subscription::order_book("book.ETHUSDT", "ETHUSDT"),
    ];
    for subscription in &order {
        handle.subscribe(subscription.clone()).await?;
    }
    assert_eq!(
        server.subscribed_topics(),
        vec!["book.BTCUSDT", "trades.BTCUSDT", "book.ETHUSDT"]
    );
    assert_eq!(handle.state(), ControllerState::Live);

    // Sever the connection; the controller must resubscribe everything, in
    // the order the subscriptions were first accepted, before going live.
    server.clear_subscriptions();
    server.disconnect_clients();

    let replayed = wait_until(Duration::from_secs(5), || {
        server.subscribed_topics()
            == vec![
                "book.BTCUSDT".to_string(),
                "trades.BTCUSDT".to_string(),
                "book.ETHUSDT".to_string(),
            ]
    })
    .await;
    assert!(replayed, "subscriptions must replay in order");
    handle.wait_for_state(ControllerState::Live).await;
    assert!(server.connection_count() >= 2);

    handle.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_subscriptions_are_tracked_once() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig::default()).await?;
    let venue = Arc::new(ReferenceVenue::default());
    let (fatal, _monitor) = fatal_channel();
    let (handle, _task) = start_session(venue, fast_session(server.ws_url()), fatal)?;

    handle.connect().await?;
    let subscription = Subscription::trades("trades.BTCUSDT", "BTCUSDT");
    handle.subscribe(subscription.clone()).await?;
    handle.subscribe(subscription).await?;
    // Both calls run the wire handshake...
    assert_eq!(server.subscribed_topics().len(), 2);

    // ...but replay happens exactly once.
    server.clear_subscriptions();
    server.disconnect_clients();
    let replayed = wait_until(Duration::from_secs(5), || {
        !server.subscribed_topics().is_empty()
    })
    .await;
    assert!(replayed);
    handle.wait_for_state(ControllerState::Live).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.subscribed_topics(), vec!["trades.BTCUSDT"]);

    handle.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn login_exchange_gates_the_feed() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig::default()).await?;
    let venue = Arc::new(ReferenceVenue::default());
    let (fatal, _monitor) = fatal_channel();
    let config = fast_session(server.ws_url()).with_credentials(Credentials {
        api_key: "key".into(),
        api_secret: "secret".into(),
    });
    let (handle, _task) = start_session(venue, config, fatal)?;
    handle.connect().await?;
    assert_eq!(handle.state(), ControllerState::Live);
    handle.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_login_surfaces_an_authentication_error() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig {
        reject_auth: true,
        ..MockVenueConfig::default()
    })
    .await?;
    let venue = Arc::new(ReferenceVenue::default());
    let (fatal, _monitor) = fatal_channel();
    let config = fast_session(server.ws_url()).with_credentials(Credentials {
        api_key: "key".into(),
        api_secret: "secret".into(),
    });
    let (handle, _task) = start_session(venue, config, fatal)?;
    match handle.connect().await {
        Err(FeedError::Authentication(_)) => {}
        other => panic!("expected authentication failure, got {other:?}"),
    }
    handle.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn withheld_ack_escalates_subscribe_timeout() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig {
        withhold_acks: true,
        ..MockVenueConfig::default()
    })
    .await?;
    let venue = Arc::new(ReferenceVenue::default());
    let (fatal, mut monitor) = fatal_channel();
    let mut config = fast_session(server.ws_url());
    config.handshake_timeout = Duration::from_millis(200);
    let (handle, _task) = start_session(venue, config, fatal)?;

    handle.connect().await?;
    let result = handle
        .subscribe(Subscription::trades("trades.BTCUSDT", "BTCUSDT"))
        .await;
    match result {
        Err(FeedError::Fatal(fatal)) => {
            assert_eq!(fatal.kind, FatalKind::SubscribeTimeout);
        }
        other => panic!("expected fatal timeout, got {other:?}"),
    }
    let escalated = timeout(Duration::from_millis(500), monitor.next())
        .await
        .expect("fatal escalated")
        .expect("fatal present");
    assert_eq!(escalated.kind, FatalKind::SubscribeTimeout);

    handle.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ws_managed_book_flows_into_the_replica() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig::default()).await?;
    let venue = Arc::new(ReferenceVenue::new(SnapshotPolicy::WsManaged));
    let (fatal, _monitor) = fatal_channel();
    let (handle, _task) = start_session(venue, fast_session(server.ws_url()), fatal)?;

    handle.connect().await?;
    handle
        .subscribe(Subscription::order_book("book.BTCUSDT", "BTCUSDT"))
        .await?;
    let replica = handle.replica("BTCUSDT").expect("replica created");

    server.push_frame(json!({
        "topic": "book.BTCUSDT",
        "type": "snapshot",
        "data": {"b": [["99", "1"], ["98", "2"]], "a": [["101", "1"]]}
    }));
    let snapshotted = wait_until(Duration::from_secs(2), || {
        replica.best_bid().map(|order| order.price) == Some(dec(99))
    })
    .await;
    assert!(snapshotted, "snapshot must replace the replica");

    server.push_frame(json!({
        "topic": "book.BTCUSDT",
        "type": "delta",
        "data": {"b": [["99", "0"]], "a": [["100", "3"]]}
    }));
    let updated = wait_until(Duration::from_secs(2), || {
        replica.best_bid().map(|order| order.price) == Some(dec(98))
            && replica.best_ask().map(|order| order.price) == Some(dec(100))
    })
    .await;
    assert!(updated, "delta must mutate the replica");

    handle.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn replicas_are_cleared_on_closure_and_rebuilt_after_replay() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig::default()).await?;
    let venue = Arc::new(ReferenceVenue::default());
    let (fatal, _monitor) = fatal_channel();
    let (handle, _task) = start_session(venue, fast_session(server.ws_url()), fatal)?;

    handle.connect().await?;
    handle
        .subscribe(Subscription::order_book("book.BTCUSDT", "BTCUSDT"))
        .await?;
    let replica = handle.replica("BTCUSDT").expect("replica created");
    server.push_frame(json!({
        "topic": "book.BTCUSDT",
        "type": "snapshot",
        "data": {"b": [["99", "1"]], "a": [["101", "1"]]}
    }));
    assert!(wait_until(Duration::from_secs(2), || !replica.is_empty()).await);

    server.disconnect_clients();
    assert!(
        wait_until(Duration::from_secs(2), || replica.is_empty()).await,
        "closure must clear the replica"
    );

    // Same replica instance is rebuilt once the feed resubscribes.
    handle.wait_for_state(ControllerState::Live).await;
    server.push_frame(json!({
        "topic": "book.BTCUSDT",
        "type": "snapshot",
        "data": {"b": [["97", "5"]], "a": [["103", "5"]]}
    }));
    let rebuilt = wait_until(Duration::from_secs(2), || {
        replica.best_bid().map(|order| order.price) == Some(dec(97))
    })
    .await;
    assert!(rebuilt, "replica must be rebuilt on resubscription");

    handle.shutdown();
    Ok(())
}
