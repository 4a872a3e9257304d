mod availability;
mod error;
mod index;
mod lifecycle;
mod provisioning;
mod queries;
mod reconciler;
mod refund;
mod reservations;
mod sweeps;

pub use availability::{compute_saturated_spans, free_windows, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use index::{IndexKey, Slot, SlotIndex};
pub use lifecycle::{Action, booking_amount, checkout_amount, transition_allowed};
pub use provisioning::LotSpec;
pub use queries::{SpaceFilter, SpaceReport};
pub use reconciler::{SensorHealth, derive_status};
pub use refund::{cancelling_party, refund_amount};
pub use reservations::BookingRequest;
pub use sweeps::HealthSweepReport;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::Policy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLot = Arc<RwLock<LotRecord>>;
pub type SharedSpace = Arc<RwLock<SpaceRecord>>;
pub type SharedReservation = Arc<RwLock<Reservation>>;
pub type SharedSlots = Arc<RwLock<SlotIndex>>;

// ── Group-commit journal channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Start recording committed appends so the snapshot that follows can be
    /// topped up with anything journaled while it was being taken.
    BeginCompact {
        response: oneshot::Sender<()>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the journal and batches appends for group commit:
/// block for the first append, drain whatever else is queued, one fsync, answer all.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    // Appends committed since BeginCompact, while a compaction is in progress.
    let mut tail: Option<Vec<Event>> = None;
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, &mut tail, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut tail, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, &mut tail, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, tail: &mut Option<Vec<Event>>, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Always flush, even after an append error, so half-written bytes do not leak
    // into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let (Ok(()), Some(tail)) = (&result, tail.as_mut()) {
        tail.extend(batch.iter().map(|(event, _)| event.clone()));
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, tail: &mut Option<Vec<Event>>, cmd: WalCommand) {
    match cmd {
        WalCommand::BeginCompact { response } => {
            *tail = Some(Vec::new());
            let _ = response.send(());
        }
        WalCommand::Compact { mut events, response } => {
            events.extend(tail.take().unwrap_or_default());
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The reservation and occupancy engine.
///
/// Every document lives behind its own lock; there is no global lock. Lock order
/// when more than one is held: reservation, then slot index, then space.
pub struct Engine {
    pub(super) lots: DashMap<Ulid, SharedLot>,
    pub(super) spaces: DashMap<Ulid, SharedSpace>,
    pub(super) reservations: DashMap<Ulid, SharedReservation>,
    pub(super) slots: DashMap<IndexKey, SharedSlots>,
    /// sensor id → space id, in-service spaces only.
    pub(super) sensor_to_space: DashMap<String, Ulid>,
    /// lot id → space ids, in provisioning order.
    pub(super) lot_spaces: DashMap<Ulid, Vec<Ulid>>,
    /// lot id → number of in-service spaces (capacity of the lot's unassigned pool).
    pub(super) in_service: DashMap<Ulid, u32>,
    /// Single-flight guards for the per-lot aggregate sync.
    pub(super) aggregate_flights: DashMap<Ulid, Arc<Mutex<()>>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: Policy,
}

impl Engine {
    /// Replay the journal at `wal_path` and start the group-commit writer.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        policy: Policy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            lots: DashMap::new(),
            spaces: DashMap::new(),
            reservations: DashMap::new(),
            slots: DashMap::new(),
            sensor_to_space: DashMap::new(),
            lot_spaces: DashMap::new(),
            in_service: DashMap::new(),
            aggregate_flights: DashMap::new(),
            wal_tx,
            notify,
            clock,
            policy,
        };
        engine.restore(events);
        Ok(engine)
    }

    /// Rebuild in-memory state from journal records (last write per document wins).
    fn restore(&self, events: Vec<Event>) {
        let mut lots = HashMap::new();
        let mut spaces = HashMap::new();
        let mut reservations = HashMap::new();
        for event in events {
            match event {
                Event::LotSaved(lot) => {
                    lots.insert(lot.id, lot);
                }
                Event::SpaceSaved(space) => {
                    spaces.insert(space.id, space);
                }
                Event::ReservationSaved(r) => {
                    reservations.insert(r.id, r);
                }
            }
        }

        for (id, lot) in lots {
            self.lots.insert(id, Arc::new(RwLock::new(lot)));
        }

        let mut spaces: Vec<SpaceRecord> = spaces.into_values().collect();
        spaces.sort_by_key(|s| s.id);
        for space in spaces {
            self.index_space(&space);
            self.spaces.insert(space.id, Arc::new(RwLock::new(space)));
        }

        let mut indexes: HashMap<IndexKey, SlotIndex> = HashMap::new();
        for (id, r) in reservations {
            if r.status.is_live() {
                let key = Self::key_for(&r);
                indexes
                    .entry(key)
                    .or_insert_with(|| SlotIndex::new(key, self.capacity_for(&key)))
                    .insert(Slot {
                        reservation_id: id,
                        window: r.window,
                    });
            }
            self.reservations.insert(id, Arc::new(RwLock::new(r)));
        }
        for (key, index) in indexes {
            self.slots.insert(key, Arc::new(RwLock::new(index)));
        }
    }

    /// Register a space in the lookup maps.
    pub(super) fn index_space(&self, space: &SpaceRecord) {
        let mut ids = self.lot_spaces.entry(space.lot_id).or_default();
        if !ids.contains(&space.id) {
            ids.push(space.id);
        }
        drop(ids);
        if !space.retired {
            self.sensor_to_space.insert(space.sensor.id.clone(), space.id);
            *self.in_service.entry(space.lot_id).or_insert(0) += 1;
        }
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Journal a record via the group-commit writer. Nothing is applied in memory
    /// until this returns Ok.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Internal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(format!("journal append failed: {e}")))
    }

    // ── Handles ──────────────────────────────────────────────

    pub(super) fn lot_handle(&self, id: &Ulid) -> Result<SharedLot, EngineError> {
        self.lots
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn space_handle(&self, id: &Ulid) -> Result<SharedSpace, EngineError> {
        self.spaces
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn reservation_handle(&self, id: &Ulid) -> Result<SharedReservation, EngineError> {
        self.reservations
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn key_for(r: &Reservation) -> IndexKey {
        IndexKey {
            lot_id: r.lot_id,
            space_id: r.space_id,
        }
    }

    pub(super) fn capacity_for(&self, key: &IndexKey) -> u32 {
        match key.space_id {
            Some(_) => 1,
            None => self.in_service.get(&key.lot_id).map(|c| *c).unwrap_or(0),
        }
    }

    /// Slot index for `key`, created on first use.
    pub(super) fn slots_handle(&self, key: IndexKey) -> SharedSlots {
        if let Some(existing) = self.slots.get(&key) {
            return existing.value().clone();
        }
        let capacity = self.capacity_for(&key);
        self.slots
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(SlotIndex::new(key, capacity))))
            .value()
            .clone()
    }

    /// Snapshot of every handle in a map, so no shard lock is held across an await.
    pub(super) fn all<K: Copy + Eq + std::hash::Hash, V: Clone>(map: &DashMap<K, V>) -> Vec<(K, V)> {
        map.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the journal as one record per current document, followed by
    /// whatever was journaled while the snapshot was being taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::BeginCompact { response: tx })
            .await
            .map_err(|_| EngineError::Internal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("journal writer dropped response".into()))?;

        let mut events = Vec::new();
        for (_, lot) in Self::all(&self.lots) {
            events.push(Event::LotSaved(lot.read().await.clone()));
        }
        for (_, space) in Self::all(&self.spaces) {
            events.push(Event::SpaceSaved(space.read().await.clone()));
        }
        for (_, r) in Self::all(&self.reservations) {
            events.push(Event::ReservationSaved(r.read().await.clone()));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Internal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(format!("journal compaction failed: {e}")))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
