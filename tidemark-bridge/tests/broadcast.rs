use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::time::{sleep, Instant};

use tidemark_bridge::{BridgeClient, BridgeConfig, DistributionBridge};
use tidemark_core::{BookOrder, LevelChange, Side};
use tidemark_replica::BookReplica;

fn dec(value: i64) -> Decimal {
    Decimal::from(value)
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
async fn client_mirror_follows_the_broadcast() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let replica = Arc::new(BookReplica::new("BTCUSDT"));
    replica.insert_snapshot(
        vec![
            BookOrder::price_keyed(dec(99), dec(1)),
            BookOrder::price_keyed(dec(98), dec(2)),
        ],
        vec![BookOrder::price_keyed(dec(101), dec(3))],
    );

    let config = BridgeConfig {
        broadcast_interval: Duration::from_millis(50),
        ..BridgeConfig::default()
    };
    let mut bridge = DistributionBridge::spawn(config, vec![replica.clone()]).await?;
    let client = BridgeClient::connect(&bridge.url()).await?;

    let mirrored = wait_until(Duration::from_secs(3), || {
        client
            .mirror("BTCUSDT")
            .and_then(|mirror| mirror.best_bid())
            .map(|order| order.price)
            == Some(dec(99))
    })
    .await;
    assert!(mirrored, "mirror must hydrate from the broadcast");
    let mirror = client.mirror("BTCUSDT").expect("mirror exists");
    assert_eq!(mirror.best_ask().map(|order| order.price), Some(dec(101)));
    assert_eq!(mirror.depth(Side::Buy), 2);
    assert_eq!(mirror.fingerprint(10), replica.fingerprint(10));

    // Source mutations propagate on the next broadcast tick.
    replica.apply(&LevelChange::at_price(Side::Buy, dec(100), Some(dec(4))));
    let followed = wait_until(Duration::from_secs(3), || {
        client
            .mirror("BTCUSDT")
            .and_then(|mirror| mirror.best_bid())
            .map(|order| order.price)
            == Some(dec(100))
    })
    .await;
    assert!(followed, "mirror must follow source mutations");

    client.shutdown();
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_books_join_the_broadcast() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let config = BridgeConfig {
        broadcast_interval: Duration::from_millis(50),
        ..BridgeConfig::default()
    };
    let mut bridge = DistributionBridge::spawn(config, Vec::new()).await?;
    let client = BridgeClient::connect(&bridge.url()).await?;

    let late = Arc::new(BookReplica::new("ETHUSDT"));
    late.insert_snapshot(
        vec![BookOrder::price_keyed(dec(2000), dec(1))],
        vec![BookOrder::price_keyed(dec(2001), dec(1))],
    );
    bridge.register(late);

    let mirrored = wait_until(Duration::from_secs(3), || {
        client.symbols().contains(&"ETHUSDT".to_string())
    })
    .await;
    assert!(mirrored, "late-registered books must broadcast");

    client.shutdown();
    bridge.shutdown().await;
    Ok(())
}
