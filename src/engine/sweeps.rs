use std::collections::BTreeSet;
use std::time::Instant;

use ulid::Ulid;

use crate::model::*;
use crate::notify::{BusEvent, Topic};
use crate::observability::{LOT_SPACES, SENSOR_FAULTS_OPENED_TOTAL, SWEEP_DURATION_SECONDS, SWEEP_SKIPPED_TOTAL};

use super::index::IndexKey;
use super::lifecycle;
use super::reconciler::SensorHealth;
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSweepReport {
    pub checked: usize,
    pub faults_opened: usize,
    pub low_battery: usize,
}

impl Engine {
    /// Recompute one lot's counts from its spaces and push them to the lot summary
    /// and the lot topic. Returns None if a sync for this lot is already running.
    pub async fn sync_lot_aggregate(&self, lot_id: Ulid) -> Result<Option<LotAggregate>, EngineError> {
        let flight = self.aggregate_flights.entry(lot_id).or_default().value().clone();
        let Ok(_running) = flight.try_lock() else {
            metrics::counter!(SWEEP_SKIPPED_TOTAL, "sweep" => "aggregate").increment(1);
            tracing::debug!(lot = %lot_id, "aggregate sync already in flight, skipping");
            return Ok(None);
        };

        for space_id in self.lot_space_ids(&lot_id) {
            if let Err(e) = self.heal_space_logical(space_id).await {
                tracing::warn!(space = %space_id, "heal failed: {e}");
            }
        }
        let agg = self.lot_availability(lot_id).await?;

        let lot = self.lot_handle(&lot_id)?;
        lot.write().await.summary = agg;
        for status in [
            SpaceStatus::Available,
            SpaceStatus::Reserved,
            SpaceStatus::Occupied,
            SpaceStatus::Maintenance,
            SpaceStatus::OutOfService,
        ] {
            let count = match status {
                SpaceStatus::Available => agg.available,
                SpaceStatus::Reserved => agg.reserved,
                SpaceStatus::Occupied => agg.occupied,
                SpaceStatus::Maintenance => agg.maintenance,
                SpaceStatus::OutOfService => agg.out_of_service,
            };
            metrics::gauge!(LOT_SPACES, "lot" => lot_id.to_string(), "status" => status.as_str()).set(count as f64);
        }
        self.notify.publish(
            Topic::Lot(lot_id),
            &BusEvent::LotSummary {
                lot_id,
                summary: agg,
                timestamp: agg.computed_at,
            },
        );
        Ok(Some(agg))
    }

    /// Sync every lot. Per-lot failures are logged and do not stop the pass.
    pub async fn sync_aggregates(&self) -> usize {
        let started = Instant::now();
        let mut synced = 0;
        for (lot_id, _) in Self::all(&self.lots) {
            match self.sync_lot_aggregate(lot_id).await {
                Ok(Some(_)) => synced += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(lot = %lot_id, "aggregate sync failed: {e}"),
            }
        }
        metrics::histogram!(SWEEP_DURATION_SECONDS, "sweep" => "aggregate").record(started.elapsed().as_secs_f64());
        synced
    }

    /// Bring a space's held/active sets back in line with the reservations that
    /// point at it, then re-derive its status. Covers reconciler notifications
    /// lost after a reservation commit.
    ///
    /// Every candidate reservation is read-locked first (lock order), so none can
    /// transition while the space is rewritten.
    pub(super) async fn heal_space_logical(&self, space_id: Ulid) -> Result<SpaceStatus, EngineError> {
        let (lot_id, mut candidates) = {
            let space = self.space_handle(&space_id)?;
            let space = space.read().await;
            let mut ids: BTreeSet<Ulid> = space.held_by.clone();
            ids.extend(space.active_by);
            (space.lot_id, ids)
        };
        if let Some(slots) = self.slots.get(&IndexKey::space(lot_id, space_id)).map(|e| e.value().clone()) {
            candidates.extend(slots.read().await.slots().iter().map(|s| s.reservation_id));
        }

        let mut handles = Vec::with_capacity(candidates.len());
        for id in &candidates {
            if let Ok(h) = self.reservation_handle(id) {
                handles.push(h);
            }
        }
        let mut guards = Vec::with_capacity(handles.len());
        for h in &handles {
            guards.push(h.read().await);
        }

        let space = self
            .mutate_space(space_id, |s, _| {
                for id in &candidates {
                    let current = guards.iter().find(|g| g.id == *id);
                    let here = current.filter(|r| r.space_id == Some(space_id));
                    match here.map(|r| r.status) {
                        Some(ReservationStatus::Pending | ReservationStatus::Confirmed) => {
                            s.held_by.insert(*id);
                        }
                        Some(ReservationStatus::Active) => {
                            s.held_by.remove(id);
                            s.active_by = Some(*id);
                        }
                        Some(ReservationStatus::Completed | ReservationStatus::Cancelled | ReservationStatus::Expired)
                        | None => {
                            s.held_by.remove(id);
                            if s.active_by == Some(*id) {
                                s.active_by = None;
                            }
                        }
                    }
                }
                Ok(())
            })
            .await?;
        Ok(space.status)
    }

    /// Open a `high` sensor_fault on every in-service space whose sensor has been
    /// silent past the staleness threshold (at most one open at a time), and emit a
    /// low-battery event for weak batteries.
    pub async fn sweep_sensor_health(&self) -> HealthSweepReport {
        let started = Instant::now();
        let mut report = HealthSweepReport::default();
        for (space_id, handle) in Self::all(&self.spaces) {
            let (retired, lot_id, sensor) = {
                let s = handle.read().await;
                (s.retired, s.lot_id, s.sensor.clone())
            };
            if retired {
                continue;
            }
            report.checked += 1;
            let now = self.now_ms();
            let health = SensorHealth::assess(&sensor, now, &self.policy);
            let stale = health.silent_for_ms > self.policy.stale_sensor_ms;

            let mut opened = false;
            let result = self
                .mutate_space(space_id, |s, now| {
                    if stale && !s.has_open_issue_of(IssueKind::SensorFault) {
                        s.issues.push(MaintenanceIssue {
                            id: Ulid::new(),
                            kind: IssueKind::SensorFault,
                            description: Some(format!(
                                "sensor {} silent for {} minutes",
                                s.sensor.id,
                                (now - s.sensor.last_seen) / MINUTE
                            )),
                            severity: Severity::High,
                            opened_at: now,
                            resolved_at: None,
                        });
                        opened = true;
                    }
                    Ok(())
                })
                .await;
            match result {
                Ok(_) if opened => {
                    report.faults_opened += 1;
                    metrics::counter!(SENSOR_FAULTS_OPENED_TOTAL).increment(1);
                    tracing::warn!(space = %space_id, sensor = %sensor.id, "sensor stale, fault opened");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(space = %space_id, "health sweep failed: {e}"),
            }

            if let Some(level) = sensor.battery
                && level < self.policy.low_battery
            {
                report.low_battery += 1;
                tracing::warn!(space = %space_id, sensor = %sensor.id, level, "sensor battery low");
                self.notify.publish(
                    Topic::Lot(lot_id),
                    &BusEvent::SensorLowBattery {
                        space_id,
                        lot_id,
                        sensor_id: sensor.id.clone(),
                        battery_level: level,
                        timestamp: now,
                    },
                );
            }
        }
        metrics::histogram!(SWEEP_DURATION_SECONDS, "sweep" => "health").record(started.elapsed().as_secs_f64());
        report
    }

    /// Expire every pending/confirmed reservation past `start + check-in lead`.
    /// Returns the ids expired in this pass.
    pub async fn expire_overdue(&self) -> Vec<Ulid> {
        let started = Instant::now();
        let now = self.now_ms();
        let lead = self.policy.check_in_lead_ms;
        let mut overdue = Vec::new();
        for (id, handle) in Self::all(&self.reservations) {
            if lifecycle::is_overdue(&*handle.read().await, now, lead) {
                overdue.push(id);
            }
        }

        let mut expired = Vec::with_capacity(overdue.len());
        for id in overdue {
            match self.expire(id).await {
                Ok(true) => expired.push(id),
                // Checked in or cancelled since the scan
                Ok(false) => {}
                Err(e) => tracing::error!(reservation = %id, "expiry failed: {e}"),
            }
        }
        metrics::histogram!(SWEEP_DURATION_SECONDS, "sweep" => "expiry").record(started.elapsed().as_secs_f64());
        expired
    }
}
