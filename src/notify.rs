use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{LotAggregate, Ms, SpaceStatus};

const CHANNEL_CAPACITY: usize = 256;

/// Subscription key. Renders as `lot:<id>` / `space:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Lot(Ulid),
    Space(Ulid),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Lot(id) => write!(f, "lot:{id}"),
            Topic::Space(id) => write!(f, "space:{id}"),
        }
    }
}

impl std::str::FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').ok_or_else(|| format!("bad topic: {s}"))?;
        let id = Ulid::from_string(id).map_err(|e| format!("bad topic id {id}: {e}"))?;
        match kind {
            "lot" => Ok(Topic::Lot(id)),
            "space" => Ok(Topic::Space(id)),
            other => Err(format!("unknown topic kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSnapshot {
    pub battery_level: Option<u8>,
    pub signal_strength: Option<i16>,
    pub last_seen: Ms,
}

/// Payloads carry the new state, never a delta, so redelivery is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BusEvent {
    SpaceStatus {
        space_id: Ulid,
        lot_id: Ulid,
        status: SpaceStatus,
        /// Per-space counter, strictly increasing across status changes.
        version: u64,
        timestamp: Ms,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        sensor_snapshot: Option<SensorSnapshot>,
    },
    SensorLowBattery {
        space_id: Ulid,
        lot_id: Ulid,
        sensor_id: String,
        battery_level: u8,
        timestamp: Ms,
    },
    LotSummary {
        lot_id: Ulid,
        summary: LotAggregate,
        timestamp: Ms,
    },
}

/// External delivery target (push gateway, socket layer) fed by the hub.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, topic: &Topic, event: &BusEvent);
}

/// In-process fan-out: one broadcast channel per topic, plus any external sinks.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<BusEvent>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Subscribe to a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<BusEvent> {
        self.channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to local subscribers and sinks. No-op for a topic nobody listens on.
    pub fn publish(&self, topic: Topic, event: &BusEvent) {
        if let Some(sender) = self.channels.get(&topic) {
            let _ = sender.send(event.clone());
        }
        for sink in &self.sinks {
            sink.publish(&topic, event);
        }
        metrics::counter!(crate::observability::BUS_EVENTS_TOTAL).increment(1);
    }

    /// Drop a topic's channel (e.g. when a space is retired).
    pub fn remove(&self, topic: &Topic) {
        self.channels.remove(topic);
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.channels
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

/// Forwards every bus event to the log as JSON.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn publish(&self, topic: &Topic, event: &BusEvent) {
        match serde_json::to_string(event) {
            Ok(json) => tracing::debug!(%topic, "{json}"),
            Err(e) => tracing::warn!(%topic, "unserializable bus event: {e}"),
        }
    }
}

/// Subscriber-side view of space status. Applying the same event twice is a no-op.
#[derive(Debug, Default)]
pub struct StatusView {
    spaces: HashMap<Ulid, (SpaceStatus, u64)>,
}

impl StatusView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the view changed. Events at or below the seen version are ignored.
    pub fn apply(&mut self, event: &BusEvent) -> bool {
        let BusEvent::SpaceStatus {
            space_id,
            status,
            version,
            ..
        } = event
        else {
            return false;
        };
        match self.spaces.get(space_id) {
            Some((_, seen)) if *seen >= *version => false,
            _ => {
                self.spaces.insert(*space_id, (*status, *version));
                true
            }
        }
    }

    pub fn status(&self, space_id: &Ulid) -> Option<SpaceStatus> {
        self.spaces.get(space_id).map(|(s, _)| *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn status_event(space_id: Ulid, status: SpaceStatus, version: u64) -> BusEvent {
        BusEvent::SpaceStatus {
            space_id,
            lot_id: Ulid::new(),
            status,
            version,
            timestamp: 5,
            sensor_snapshot: None,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        let mut rx = hub.subscribe(Topic::Space(sid));

        let event = status_event(sid, SpaceStatus::Occupied, 10);
        hub.publish(Topic::Space(sid), &event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(Topic::Space(a));
        hub.publish(Topic::Space(b), &status_event(b, SpaceStatus::Reserved, 1));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        hub.publish(Topic::Lot(sid), &status_event(sid, SpaceStatus::Available, 1));
        assert_eq!(hub.subscriber_count(&Topic::Lot(sid)), 0);
    }

    #[test]
    fn sinks_see_every_publish() {
        struct Recorder(Mutex<Vec<String>>);
        impl NotificationSink for Recorder {
            fn publish(&self, topic: &Topic, _event: &BusEvent) {
                self.0.lock().unwrap().push(topic.to_string());
            }
        }
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let hub = NotifyHub::new().with_sink(recorder.clone());
        let sid = Ulid::new();
        hub.publish(Topic::Space(sid), &status_event(sid, SpaceStatus::Occupied, 1));
        assert_eq!(*recorder.0.lock().unwrap(), vec![format!("space:{sid}")]);
    }

    #[test]
    fn topic_display_and_parse() {
        let id = Ulid::new();
        let t: Topic = format!("lot:{id}").parse().unwrap();
        assert_eq!(t, Topic::Lot(id));
        assert_eq!(Topic::Space(id).to_string(), format!("space:{id}"));
        assert!("garage:123".parse::<Topic>().is_err());
        assert!("space".parse::<Topic>().is_err());
    }

    #[test]
    fn status_event_json_shape() {
        let sid = Ulid::new();
        let event = BusEvent::SpaceStatus {
            space_id: sid,
            lot_id: Ulid::new(),
            status: SpaceStatus::Reserved,
            version: 3,
            timestamp: 42,
            sensor_snapshot: Some(SensorSnapshot {
                battery_level: Some(55),
                signal_strength: Some(-61),
                last_seen: 40,
            }),
        };
        let v: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "space_status");
        assert_eq!(v["spaceId"], sid.to_string());
        assert_eq!(v["status"], "reserved");
        assert_eq!(v["version"], 3);
        assert_eq!(v["timestamp"], 42);
        assert_eq!(v["sensorSnapshot"]["batteryLevel"], 55);

        let back: BusEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn status_view_ignores_duplicates_and_stale() {
        let mut view = StatusView::new();
        let sid = Ulid::new();
        let e1 = status_event(sid, SpaceStatus::Reserved, 100);
        assert!(view.apply(&e1));
        assert!(!view.apply(&e1));
        assert!(!view.apply(&status_event(sid, SpaceStatus::Available, 50)));
        assert!(view.apply(&status_event(sid, SpaceStatus::Occupied, 200)));
        assert_eq!(view.status(&sid), Some(SpaceStatus::Occupied));
    }

    #[test]
    fn status_view_orders_same_millisecond_changes_by_version() {
        let mut view = StatusView::new();
        let sid = Ulid::new();
        // Both carry the same timestamp
        let reserved = status_event(sid, SpaceStatus::Reserved, 1);
        let occupied = status_event(sid, SpaceStatus::Occupied, 2);
        assert!(view.apply(&reserved));
        assert!(view.apply(&occupied));
        assert!(!view.apply(&reserved));
        assert_eq!(view.status(&sid), Some(SpaceStatus::Occupied));
    }
}
