use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use slotwise::clock::ManualClock;
use slotwise::config::Policy;
use slotwise::engine::{Engine, LotSpec};
use slotwise::ingest;
use slotwise::model::*;
use slotwise::notify::{BusEvent, NotifyHub, StatusView, Topic};

// ── Test infrastructure ──────────────────────────────────────

struct Harness {
    engine: Arc<Engine>,
    addr: std::net::SocketAddr,
    lot: Ulid,
    space: Ulid,
    feed: JoinHandle<()>,
    ingest: JoinHandle<()>,
}

async fn start_feed() -> Harness {
    let dir = std::env::temp_dir().join(format!("slotwise_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let clock = Arc::new(ManualClock::new(1_750_000_000_000));
    let engine = Engine::new(
        dir.join("slotwise.wal"),
        Arc::new(NotifyHub::new()),
        clock,
        Policy::default(),
    )
    .unwrap();
    let engine = Arc::new(engine);

    let lot = Ulid::new();
    engine
        .create_lot(
            lot,
            LotSpec {
                name: "Station".into(),
                pricing: Pricing {
                    hourly: 250,
                    reservation_fee: 0,
                },
                hours: OperatingHours::AlwaysOpen,
            },
        )
        .await
        .unwrap();
    let space = Ulid::new();
    engine
        .provision_space(
            space,
            lot,
            "S-1".into(),
            "st-1".into(),
            SensorKind::Ultrasonic,
            SpaceFeatures::default(),
        )
        .await
        .unwrap();

    let (tx, rx) = mpsc::channel(64);
    let ingest = tokio::spawn(ingest::run_ingest(engine.clone(), rx));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let feed = tokio::spawn(ingest::serve_sensor_feed(listener, tx));

    Harness {
        engine,
        addr,
        lot,
        space,
        feed,
        ingest,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<BusEvent>) -> BusEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for bus event")
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn sensor_lines_reach_subscribers() {
    let h = start_feed().await;
    let mut space_rx = h.engine.notify.subscribe(Topic::Space(h.space));
    let mut lot_rx = h.engine.notify.subscribe(Topic::Lot(h.lot));

    let mut conn = TcpStream::connect(h.addr).await.unwrap();
    conn.write_all(b"{\"sensorId\":\"st-1\",\"occupancy\":true,\"batteryLevel\":77}\n")
        .await
        .unwrap();

    let event = next_event(&mut space_rx).await;
    match &event {
        BusEvent::SpaceStatus { space_id, status, .. } => {
            assert_eq!(*space_id, h.space);
            assert_eq!(*status, SpaceStatus::Occupied);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(next_event(&mut lot_rx).await, event);

    let doc = assert_ok!(h.engine.space_by_sensor("st-1").await);
    assert_eq!(doc.sensor.battery, Some(77));
}

#[tokio::test]
async fn bad_lines_do_not_block_the_feed() {
    let h = start_feed().await;
    let mut rx = h.engine.notify.subscribe(Topic::Space(h.space));

    // An oversized line costs its own connection only
    let mut noisy = TcpStream::connect(h.addr).await.unwrap();
    let oversized = format!("{{\"sensorId\":\"{}\"}}\n", "x".repeat(8192));
    let _ = noisy.write_all(oversized.as_bytes()).await;

    let mut conn = TcpStream::connect(h.addr).await.unwrap();
    conn.write_all(b"this is not json\n").await.unwrap();
    conn.write_all(b"{\"sensorId\":\"ghost\",\"occupancy\":true}\n").await.unwrap();
    conn.write_all(b"{\"sensorId\":\"st-1\",\"batteryLevel\":150}\n").await.unwrap();
    conn.write_all(b"\n{\"sensorId\":\"st-1\",\"occupancy\":true}\n").await.unwrap();

    match next_event(&mut rx).await {
        BusEvent::SpaceStatus { status, .. } => assert_eq!(status, SpaceStatus::Occupied),
        other => panic!("unexpected event {other:?}"),
    }
    assert_err!(h.engine.space_by_sensor("ghost").await);
    assert_eq!(h.engine.space(h.space).await.unwrap().sensor.battery, None);
}

#[tokio::test]
async fn redelivered_events_are_idempotent_for_subscribers() {
    let h = start_feed().await;
    let mut rx = h.engine.notify.subscribe(Topic::Lot(h.lot));

    let mut conn = TcpStream::connect(h.addr).await.unwrap();
    conn.write_all(b"{\"sensorId\":\"st-1\",\"occupancy\":true}\n").await.unwrap();
    let occupied = next_event(&mut rx).await;
    conn.write_all(b"{\"sensorId\":\"st-1\",\"occupancy\":false}\n").await.unwrap();
    let freed = next_event(&mut rx).await;

    let mut view = StatusView::new();
    assert!(view.apply(&occupied));
    assert!(!view.apply(&occupied));
    assert!(view.apply(&freed));
    assert_eq!(view.status(&h.space), Some(SpaceStatus::Available));

    // A late redelivery of the older event does not roll the view back,
    // even when both changes landed in the same millisecond
    assert!(!view.apply(&occupied));
    assert_eq!(view.status(&h.space), Some(SpaceStatus::Available));
    match (&occupied, &freed) {
        (
            BusEvent::SpaceStatus {
                timestamp: t1,
                version: v1,
                ..
            },
            BusEvent::SpaceStatus {
                timestamp: t2,
                version: v2,
                ..
            },
        ) => {
            assert_eq!(t1, t2);
            assert!(v1 < v2);
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn many_connections_feed_one_consumer() {
    let h = start_feed().await;
    let mut rx = h.engine.notify.subscribe(Topic::Space(h.space));

    let mut conns = Vec::new();
    for _ in 0..8 {
        conns.push(TcpStream::connect(h.addr).await.unwrap());
    }
    for conn in &mut conns {
        conn.write_all(b"{\"sensorId\":\"st-1\",\"signalStrength\":-45}\n").await.unwrap();
    }
    conns[3].write_all(b"{\"sensorId\":\"st-1\",\"occupancy\":true}\n").await.unwrap();

    // Signal-only reports never change status, so the first event is the occupancy change
    match next_event(&mut rx).await {
        BusEvent::SpaceStatus { status, .. } => assert_eq!(status, SpaceStatus::Occupied),
        other => panic!("unexpected event {other:?}"),
    }
    // Connections are read concurrently; wait for the stragglers
    let signal = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let doc = h.engine.space(h.space).await.unwrap();
            if doc.sensor.signal.is_some() {
                return doc.sensor.signal;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(signal, Some(-45));
}

#[tokio::test]
async fn stopping_the_feed_lets_ingest_drain_with_sensors_connected() {
    let h = start_feed().await;
    let mut rx = h.engine.notify.subscribe(Topic::Space(h.space));

    let mut conn = TcpStream::connect(h.addr).await.unwrap();
    conn.write_all(b"{\"sensorId\":\"st-1\",\"occupancy\":true}\n").await.unwrap();
    next_event(&mut rx).await;

    // The sensor stays connected while the feed is stopped
    h.feed.abort();
    assert!(h.feed.await.unwrap_err().is_cancelled());
    assert_ok!(tokio::time::timeout(Duration::from_secs(2), h.ingest).await);
    drop(conn);
}
