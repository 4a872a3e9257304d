use ulid::Ulid;

use crate::model::*;

use super::availability;
use super::index::IndexKey;
use super::lifecycle::ensure_access;
use super::reconciler::SensorHealth;
use super::{Engine, EngineError};
use crate::limits::MAX_BATCH_SPACES;

/// Narrows `lot_spaces`. The default matches every space.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpaceFilter {
    pub status: Option<SpaceStatus>,
    /// Features a space must have. Unset flags are not checked.
    pub features: SpaceFeatures,
}

impl SpaceFilter {
    fn matches(&self, space: &SpaceRecord) -> bool {
        self.status.is_none_or(|s| space.status == s) && space.features.satisfies(&self.features)
    }
}

/// Live status of one space, as returned by `space_reports`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceReport {
    pub space_id: Ulid,
    pub number: String,
    pub status: SpaceStatus,
    pub health: SensorHealth,
    pub last_seen: Ms,
    pub features: SpaceFeatures,
}

impl Engine {
    /// One reservation, visible to its owner and to admins.
    pub async fn reservation(&self, id: Ulid, caller: &Caller) -> Result<Reservation, EngineError> {
        let r = self.reservation_handle(&id)?.read().await.clone();
        ensure_access(&r, caller)?;
        Ok(r)
    }

    /// Newest first.
    pub async fn reservations_for_owner(
        &self,
        owner: Ulid,
        status: Option<ReservationStatus>,
    ) -> Vec<Reservation> {
        self.collect_reservations(|r| r.owner == owner && status.is_none_or(|s| r.status == s))
            .await
    }

    pub async fn reservations_for_lot(
        &self,
        lot_id: Ulid,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.lot_handle(&lot_id)?;
        Ok(self
            .collect_reservations(|r| r.lot_id == lot_id && status.is_none_or(|s| r.status == s))
            .await)
    }

    async fn collect_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out = Vec::new();
        for (_, handle) in Self::all(&self.reservations) {
            let r = handle.read().await;
            if keep(&r) {
                out.push(r.clone());
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    pub async fn space(&self, id: Ulid) -> Result<SpaceRecord, EngineError> {
        Ok(self.space_handle(&id)?.read().await.clone())
    }

    pub async fn space_by_sensor(&self, sensor_id: &str) -> Result<SpaceRecord, EngineError> {
        let id = self
            .sensor_to_space
            .get(sensor_id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::SensorUnknown(sensor_id.to_string()))?;
        self.space(id).await
    }

    pub async fn lot(&self, id: Ulid) -> Result<LotRecord, EngineError> {
        Ok(self.lot_handle(&id)?.read().await.clone())
    }

    /// Every lot, ordered by id.
    pub async fn list_lots(&self) -> Vec<LotRecord> {
        let mut out = Vec::with_capacity(self.lots.len());
        for (_, lot) in Self::all(&self.lots) {
            out.push(lot.read().await.clone());
        }
        out.sort_by_key(|l| l.id);
        out
    }

    /// Spaces of a lot in provisioning order that pass `filter`.
    pub async fn lot_spaces(&self, lot_id: Ulid, filter: SpaceFilter) -> Result<Vec<SpaceRecord>, EngineError> {
        self.lot_handle(&lot_id)?;
        let ids = self.lot_space_ids(&lot_id);
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let space = self.space_handle(&id)?.read().await.clone();
            if filter.matches(&space) {
                out.push(space);
            }
        }
        Ok(out)
    }

    /// Status, sensor health and features for many spaces at once, in request
    /// order. Unknown ids are skipped.
    pub async fn space_reports(&self, ids: &[Ulid]) -> Result<Vec<SpaceReport>, EngineError> {
        if ids.len() > MAX_BATCH_SPACES {
            return Err(EngineError::LimitExceeded("too many spaces in one batch"));
        }
        let now = self.now_ms();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(handle) = self.space_handle(id) else {
                continue;
            };
            let space = handle.read().await;
            out.push(SpaceReport {
                space_id: space.id,
                number: space.number.clone(),
                status: space.status,
                health: SensorHealth::assess(&space.sensor, now, &self.policy),
                last_seen: space.sensor.last_seen,
                features: space.features,
            });
        }
        Ok(out)
    }

    pub(super) fn lot_space_ids(&self, lot_id: &Ulid) -> Vec<Ulid> {
        self.lot_spaces
            .get(lot_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Counts computed now from each space's status. The cached `summary` on the
    /// lot is what the aggregate sync last pushed.
    pub async fn lot_availability(&self, lot_id: Ulid) -> Result<LotAggregate, EngineError> {
        self.lot_handle(&lot_id)?;
        let mut agg = LotAggregate {
            computed_at: self.now_ms(),
            ..LotAggregate::default()
        };
        for id in self.lot_space_ids(&lot_id) {
            agg.count(self.space_handle(&id)?.read().await.status);
        }
        Ok(agg)
    }

    pub async fn sensor_health(&self, space_id: Ulid) -> Result<SensorHealth, EngineError> {
        let sensor = self.space_handle(&space_id)?.read().await.sensor.clone();
        Ok(SensorHealth::assess(&sensor, self.now_ms(), &self.policy))
    }

    /// Status transitions, newest first, optionally restricted to `range`.
    pub async fn space_history(
        &self,
        space_id: Ulid,
        range: Option<Span>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        let space = self.space_handle(&space_id)?;
        let space = space.read().await;
        Ok(space
            .history
            .iter()
            .rev()
            .filter(|h| range.is_none_or(|r| r.contains_instant(h.at)))
            .take(limit)
            .copied()
            .collect())
    }

    pub async fn maintenance_issues(&self, space_id: Ulid, open_only: bool) -> Result<Vec<MaintenanceIssue>, EngineError> {
        let space = self.space_handle(&space_id)?;
        let space = space.read().await;
        Ok(space
            .issues
            .iter()
            .filter(|i| !open_only || i.is_open())
            .cloned()
            .collect())
    }

    /// Sub-windows of `query` where one more reservation would be admitted, for a
    /// space or (with `space_id: None`) the lot's unassigned pool.
    pub async fn free_windows(&self, lot_id: Ulid, space_id: Option<Ulid>, query: Span) -> Result<Vec<Span>, EngineError> {
        self.lot_handle(&lot_id)?;
        let key = match space_id {
            Some(id) => {
                let space = self.space_handle(&id)?;
                let space = space.read().await;
                if space.lot_id != lot_id {
                    return Err(EngineError::NotFound(id));
                }
                if space.retired {
                    return Ok(Vec::new());
                }
                IndexKey::space(lot_id, id)
            }
            None => IndexKey::pool(lot_id),
        };
        let slots = self.slots_handle(key);
        let index = slots.read().await;
        Ok(availability::free_windows(&index, &query))
    }
}
