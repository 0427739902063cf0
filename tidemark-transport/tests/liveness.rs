use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::time::{sleep, timeout, Instant};

use tidemark_feed::fatal_channel;
use tidemark_feed::FatalKind;
use tidemark_test_utils::{MockVenueConfig, MockVenueServer};
use tidemark_transport::{CloseReason, ConnectionState, Transport, TransportOptions};

fn fast_options() -> TransportOptions {
    TransportOptions {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(100),
        ..TransportOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_probe_forces_close_exactly_once() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig {
        silent: true,
        ..MockVenueConfig::default()
    })
    .await?;

    let mut transport = Transport::new(fast_options());
    let closes = Arc::new(AtomicUsize::new(0));
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let close_count = closes.clone();
    let close_reasons = reasons.clone();
    transport.on_close(move |reason| {
        close_count.fetch_add(1, Ordering::SeqCst);
        close_reasons.lock().unwrap().push(*reason);
    });

    let started = Instant::now();
    transport.connect(&server.ws_url()).await?;

    // Probe at t=0 goes unanswered; the timeout must close the socket.
    let deadline = Instant::now() + Duration::from_millis(1_000);
    while closes.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    let elapsed = started.elapsed();
    assert_eq!(closes.load(Ordering::SeqCst), 1, "one close delivery");
    assert!(
        elapsed >= Duration::from_millis(80),
        "close must wait for the probe timeout, took {elapsed:?}"
    );
    assert_eq!(
        reasons.lock().unwrap().as_slice(),
        &[CloseReason::HeartbeatTimeout]
    );
    assert_eq!(transport.state(), ConnectionState::Closed);

    // No second close may arrive later.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn answered_probes_keep_the_connection_open() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig::default()).await?;

    let mut transport = Transport::new(fast_options());
    let closes = Arc::new(AtomicUsize::new(0));
    let close_count = closes.clone();
    transport.on_close(move |_| {
        close_count.fetch_add(1, Ordering::SeqCst);
    });
    transport.connect(&server.ws_url()).await?;

    sleep(Duration::from_millis(600)).await;
    assert_eq!(transport.state(), ConnectionState::Open);
    assert_eq!(closes.load(Ordering::SeqCst), 0);

    transport.disconnect().await;
    assert_eq!(transport.state(), ConnectionState::Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn listeners_fire_in_order_and_removal_is_selective() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig::default()).await?;

    let mut transport = Transport::new(fast_options());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let first_seen = seen.clone();
    let first = transport.on_message(move |raw: &String| {
        first_seen.lock().unwrap().push(format!("first:{raw}"));
    });
    let second_seen = seen.clone();
    let _second = transport.on_message(move |raw: &String| {
        second_seen.lock().unwrap().push(format!("second:{raw}"));
    });

    transport.connect(&server.ws_url()).await?;
    server.push_frame(json!({"hello": 1}));

    let deadline = Instant::now() + Duration::from_millis(1_000);
    while seen.lock().unwrap().len() < 2 && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("first:"));
        assert!(seen[1].starts_with("second:"));
    }

    assert!(transport.remove_message_listener(first));
    seen.lock().unwrap().clear();
    server.push_frame(json!({"hello": 2}));
    let deadline = Instant::now() + Duration::from_millis(1_000);
    while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("second:"));

    transport.disconnect().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn send_when_closed_is_a_no_op() {
    let transport = Transport::new(TransportOptions::default());
    assert_eq!(transport.state(), ConnectionState::Closed);
    transport.send("{\"op\":\"ping\"}");
}

#[tokio::test(flavor = "multi_thread")]
async fn fault_storm_escalates_to_the_fatal_channel() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockVenueServer::spawn(MockVenueConfig {
        silent: true,
        ..MockVenueConfig::default()
    })
    .await?;

    let (fatal, mut monitor) = fatal_channel();
    let options = TransportOptions {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(50),
        fault_limit: 0,
        fatal: Some(fatal),
        ..TransportOptions::default()
    };
    let mut transport = Transport::new(options);
    transport.connect(&server.ws_url()).await?;

    let fatal = timeout(Duration::from_millis(1_000), monitor.next())
        .await
        .expect("fatal within the window")
        .expect("fatal present");
    assert_eq!(fatal.kind, FatalKind::FaultStorm);
    Ok(())
}
