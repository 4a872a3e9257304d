//! Sensor feed ingestion.
//!
//! Sensors (or a gateway in front of them) connect over TCP and write one JSON
//! object per line. Every parsed message goes through one channel to a single
//! consumer task that applies it to the engine. Bad input is logged and dropped;
//! it never stalls the feed.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_SENSOR_LINE_LEN;
use crate::observability::{SENSOR_FEED_CONNECTIONS, SENSOR_REPORTS_DROPPED_TOTAL, error_label};

/// One report from a sensor. Absent fields leave the matching state unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorMessage {
    pub sensor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupancy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i16>,
}

pub fn parse_line(line: &str) -> Result<SensorMessage, serde_json::Error> {
    serde_json::from_str(line.trim())
}

fn dropped(reason: &'static str) {
    metrics::counter!(SENSOR_REPORTS_DROPPED_TOTAL, "reason" => reason).increment(1);
}

/// Apply queued sensor messages until every sender is gone.
pub async fn run_ingest(engine: Arc<Engine>, mut rx: mpsc::Receiver<SensorMessage>) {
    while let Some(msg) = rx.recv().await {
        let result = engine
            .on_sensor_report(&msg.sensor_id, msg.occupancy, msg.battery_level, msg.signal_strength)
            .await;
        match result {
            Ok(status) => debug!(sensor = %msg.sensor_id, status = status.as_str(), "sensor report applied"),
            Err(e @ EngineError::SensorUnknown(_)) => {
                dropped("unknown_sensor");
                warn!("sensor report dropped: {e}");
            }
            Err(e) => {
                dropped(error_label(&e));
                warn!(sensor = %msg.sensor_id, "sensor report rejected: {e}");
            }
        }
    }
    info!("sensor ingest stopped");
}

/// Keeps the open-connections gauge right even when a connection task is aborted.
struct ConnectionGauge;

impl ConnectionGauge {
    fn open() -> Self {
        metrics::gauge!(SENSOR_FEED_CONNECTIONS).increment(1.0);
        Self
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        metrics::gauge!(SENSOR_FEED_CONNECTIONS).decrement(1.0);
    }
}

/// Accept sensor connections until the listener fails. Connection tasks live in
/// a `JoinSet` owned by this future: aborting the feed closes every connection
/// and with them every sender, so the ingest consumer drains and stops.
pub async fn serve_sensor_feed(listener: TcpListener, tx: mpsc::Sender<SensorMessage>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    connections.spawn(async move {
                        let _gauge = ConnectionGauge::open();
                        handle_connection(stream, addr, tx).await;
                    });
                }
                Err(e) => {
                    warn!("sensor feed accept failed: {e}");
                    return;
                }
            },
            Some(done) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = done
                    && e.is_panic()
                {
                    warn!("sensor connection task panicked: {e}");
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, tx: mpsc::Sender<SensorMessage>) {
    debug!("sensor feed connection from {addr}");
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_SENSOR_LINE_LEN));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            // The framed stream ends after a decode error; the peer has to reconnect.
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                dropped("line_too_long");
                warn!(%addr, "sensor line over {MAX_SENSOR_LINE_LEN} bytes, closing connection");
                break;
            }
            Err(LinesCodecError::Io(e)) => {
                debug!(%addr, "sensor feed read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(msg) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                dropped("malformed");
                warn!(%addr, "malformed sensor message: {e}");
            }
        }
    }
    debug!("sensor feed connection from {addr} closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;
    use tracing::instrument::WithSubscriber;

    use crate::clock::ManualClock;
    use crate::config::Policy;
    use crate::notify::NotifyHub;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unknown_sensor_is_dropped_with_a_warning() {
        let dir = std::env::temp_dir().join("slotwise_test_ingest");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("unknown_sensor.wal");
        let _ = std::fs::remove_file(&path);
        let engine = Engine::new(
            path,
            Arc::new(NotifyHub::new()),
            Arc::new(ManualClock::new(0)),
            Policy::default(),
        )
        .unwrap();

        let logs = Capture::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();

        let (tx, rx) = mpsc::channel(4);
        tx.send(parse_line(r#"{"sensorId":"ghost","occupancy":true}"#).unwrap())
            .await
            .unwrap();
        drop(tx);
        run_ingest(Arc::new(engine), rx).with_subscriber(subscriber).await;

        let out = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("WARN"), "{out}");
        assert!(out.contains("no space mapped to sensor ghost"), "{out}");
    }

    #[test]
    fn parses_full_message() {
        let msg = parse_line(r#"{"sensorId":"s-1","occupancy":true,"batteryLevel":80,"signalStrength":-55}"#).unwrap();
        assert_eq!(
            msg,
            SensorMessage {
                sensor_id: "s-1".into(),
                occupancy: Some(true),
                battery_level: Some(80),
                signal_strength: Some(-55),
            }
        );
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let msg = parse_line(" {\"sensorId\":\"s-2\"}\r").unwrap();
        assert_eq!(msg.sensor_id, "s-2");
        assert_eq!(msg.occupancy, None);
        assert_eq!(msg.battery_level, None);
        assert_eq!(msg.signal_strength, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_line("not json").is_err());
        assert!(parse_line(r#"{"occupancy":true}"#).is_err());
        // Out of range for u8
        assert!(parse_line(r#"{"sensorId":"s","batteryLevel":300}"#).is_err());
    }

    #[test]
    fn serializes_camel_case_without_absent_fields() {
        let msg = SensorMessage {
            sensor_id: "s-3".into(),
            occupancy: Some(false),
            battery_level: None,
            signal_strength: None,
        };
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"sensorId":"s-3","occupancy":false}"#);
    }
}
