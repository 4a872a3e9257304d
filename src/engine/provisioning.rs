use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Topic;

use super::index::IndexKey;
use super::{Engine, EngineError};

#[derive(Debug, Clone)]
pub struct LotSpec {
    pub name: String,
    pub pricing: Pricing,
    pub hours: OperatingHours,
}

impl Engine {
    pub async fn create_lot(&self, id: Ulid, def: LotSpec) -> Result<LotRecord, EngineError> {
        if self.lots.len() >= MAX_LOTS {
            return Err(EngineError::LimitExceeded("too many lots"));
        }
        if def.name.is_empty() || def.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("lot name must be 1..=256 bytes"));
        }
        if let OperatingHours::Daily { open_min, close_min, .. } = def.hours
            && (open_min >= 24 * 60 || close_min >= 24 * 60)
        {
            return Err(EngineError::InvalidWindow("opening minutes must be below 1440"));
        }
        if self.lots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id.to_string()));
        }

        let lot = LotRecord {
            id,
            name: def.name,
            pricing: def.pricing,
            hours: def.hours,
            status: LotStatus::Active,
            summary: LotAggregate {
                computed_at: self.now_ms(),
                ..LotAggregate::default()
            },
        };
        self.wal_append(&Event::LotSaved(lot.clone())).await?;
        self.lots.insert(id, Arc::new(RwLock::new(lot.clone())));
        tracing::info!(lot = %id, name = %lot.name, "lot created");
        Ok(lot)
    }

    /// A lot that is not `active` refuses new reservations.
    pub async fn set_lot_status(&self, id: Ulid, status: LotStatus) -> Result<LotRecord, EngineError> {
        let handle = self.lot_handle(&id)?;
        let mut guard = handle.write().await;
        if guard.status == status {
            return Ok(guard.clone());
        }
        let mut next = guard.clone();
        next.status = status;
        self.wal_append(&Event::LotSaved(next.clone())).await?;
        *guard = next;
        tracing::info!(lot = %id, ?status, "lot status changed");
        Ok(guard.clone())
    }

    /// Add a space to a lot. Space ids, sensor ids and space numbers within a
    /// lot are unique.
    pub async fn provision_space(
        &self,
        id: Ulid,
        lot_id: Ulid,
        number: String,
        sensor_id: String,
        sensor_kind: SensorKind,
        features: SpaceFeatures,
    ) -> Result<SpaceRecord, EngineError> {
        if number.is_empty() || number.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("space number must be 1..=256 bytes"));
        }
        if sensor_id.is_empty() || sensor_id.len() > MAX_SENSOR_ID_LEN {
            return Err(EngineError::LimitExceeded("sensor id must be 1..=128 bytes"));
        }
        self.lot_handle(&lot_id)?;
        if self.spaces.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id.to_string()));
        }
        // Claim the sensor id up front so a concurrent provision cannot take it too.
        match self.sensor_to_space.entry(sensor_id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(format!("sensor {sensor_id}"))),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let result = self
            .provision_claimed(id, lot_id, number, sensor_id.clone(), sensor_kind, features)
            .await;
        if result.is_err() {
            self.sensor_to_space.remove_if(&sensor_id, |_, owner| *owner == id);
        }
        result
    }

    async fn provision_claimed(
        &self,
        id: Ulid,
        lot_id: Ulid,
        number: String,
        sensor_id: String,
        sensor_kind: SensorKind,
        features: SpaceFeatures,
    ) -> Result<SpaceRecord, EngineError> {
        let siblings = self.lot_space_ids(&lot_id);
        if siblings.len() >= MAX_SPACES_PER_LOT {
            return Err(EngineError::LimitExceeded("too many spaces in lot"));
        }
        for sibling in siblings {
            if self.space_handle(&sibling)?.read().await.number == number {
                return Err(EngineError::AlreadyExists(format!("space number {number}")));
            }
        }

        let now = self.now_ms();
        let sensor = Sensor {
            id: sensor_id,
            kind: sensor_kind,
            last_seen: now,
            battery: None,
            signal: None,
        };
        let mut space = SpaceRecord::new(id, lot_id, number, sensor, now);
        space.features = features;
        space.history.push_back(HistoryEntry {
            at: now,
            status: space.status(),
        });
        self.wal_append(&Event::SpaceSaved(space.clone())).await?;
        self.index_space(&space);
        self.spaces.insert(id, Arc::new(RwLock::new(space.clone())));
        self.refresh_pool_capacity(lot_id).await;
        tracing::info!(space = %id, lot = %lot_id, number = %space.number, "space provisioned");
        Ok(space)
    }

    /// Take a space out of service for good. Refused while it still has live
    /// reservations. Retiring twice is a no-op.
    pub async fn retire_space(&self, id: Ulid) -> Result<SpaceRecord, EngineError> {
        let lot_id = self.space_handle(&id)?.read().await.lot_id;
        let slots = self.slots_handle(IndexKey::space(lot_id, id));
        let index = slots.write().await;
        if !index.is_empty() {
            return Err(EngineError::SpaceInUse(id));
        }

        let mut newly_retired = false;
        let space = self
            .mutate_space(id, |s, _| {
                if s.active_by.is_some() || !s.held_by.is_empty() {
                    return Err(EngineError::SpaceInUse(s.id));
                }
                newly_retired = !s.retired;
                s.retired = true;
                Ok(())
            })
            .await?;
        drop(index);
        if !newly_retired {
            return Ok(space);
        }

        self.sensor_to_space.remove(&space.sensor.id);
        if let Some(mut count) = self.in_service.get_mut(&lot_id) {
            *count = count.saturating_sub(1);
        }
        self.refresh_pool_capacity(lot_id).await;
        self.notify.remove(&Topic::Space(id));
        tracing::info!(space = %id, lot = %lot_id, "space retired");
        Ok(space)
    }

    /// Keep the lot pool's capacity equal to its in-service space count.
    async fn refresh_pool_capacity(&self, lot_id: Ulid) {
        let capacity = self.capacity_for(&IndexKey::pool(lot_id));
        let pool = self.slots.get(&IndexKey::pool(lot_id)).map(|e| e.value().clone());
        if let Some(pool) = pool {
            pool.write().await.capacity = capacity;
        }
    }
}
