use ulid::Ulid;

use crate::config::Policy;
use crate::limits::*;
use crate::model::*;
use crate::notify::{BusEvent, SensorSnapshot, Topic};

use super::{Engine, EngineError};

/// Merge rule for a space's status. Exhaustive over every input so a new state
/// cannot be silently mapped.
///
/// An unhealthy sensor is ignored: only the reservation side is trusted until it recovers.
pub fn derive_status(space: &SpaceRecord, sensor_healthy: bool) -> SpaceStatus {
    if space.has_open_critical_issue() {
        return SpaceStatus::Maintenance;
    }
    if space.retired {
        return SpaceStatus::OutOfService;
    }
    match space.logical() {
        LogicalState::Active => SpaceStatus::Occupied,
        LogicalState::Held => SpaceStatus::Reserved,
        LogicalState::Idle => match (sensor_healthy, space.physical) {
            (true, PhysicalState::Occupied) => SpaceStatus::Occupied,
            (true, PhysicalState::Free | PhysicalState::Unknown) => SpaceStatus::Available,
            (false, _) => SpaceStatus::Available,
        },
    }
}

/// Sensor liveness, recomputed from the sensor sub-record on every use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorHealth {
    pub healthy: bool,
    pub silent_for_ms: Ms,
    pub battery: Option<u8>,
    pub signal: Option<i16>,
}

impl SensorHealth {
    /// A reading that was never reported does not count against health.
    pub fn assess(sensor: &Sensor, now: Ms, policy: &Policy) -> Self {
        let silent_for_ms = (now - sensor.last_seen).max(0);
        let fresh = silent_for_ms < policy.sensor_silence_ms;
        let battery_ok = sensor.battery.is_none_or(|b| b > policy.min_battery);
        let signal_ok = sensor.signal.is_none_or(|s| s > policy.min_signal);
        Self {
            healthy: fresh && battery_ok && signal_ok,
            silent_for_ms,
            battery: sensor.battery,
            signal: sensor.signal,
        }
    }
}

/// Usage recorded against a space when a checked-in reservation leaves.
#[derive(Debug, Clone, Copy)]
pub(super) struct Usage {
    pub minutes: i64,
    pub amount: u64,
}

impl Engine {
    /// Read-modify-write of one space under its write lock. `change` edits a copy;
    /// status is then re-derived from the edited copy, journaled, and only then
    /// made visible. Returns the committed document.
    pub(super) async fn mutate_space<F>(&self, space_id: Ulid, change: F) -> Result<SpaceRecord, EngineError>
    where
        F: FnOnce(&mut SpaceRecord, Ms) -> Result<(), EngineError>,
    {
        let handle = self.space_handle(&space_id)?;
        let mut guard = handle.write().await;
        let now = self.now_ms();

        let mut next = guard.clone();
        change(&mut next, now)?;
        let health = SensorHealth::assess(&next.sensor, now, &self.policy);
        let status = derive_status(&next, health.healthy);
        let changed = status != next.status;
        if changed {
            next.status = status;
            next.status_since = now;
            next.status_version += 1;
            next.history.push_back(HistoryEntry { at: now, status });
            while next.history.len() > HISTORY_LEN {
                next.history.pop_front();
            }
        }
        if next == *guard {
            return Ok(next);
        }

        self.wal_append(&Event::SpaceSaved(next.clone())).await?;
        *guard = next;

        if changed {
            tracing::debug!(space = %space_id, status = status.as_str(), "space status changed");
            metrics::counter!(crate::observability::STATUS_CHANGES_TOTAL, "status" => status.as_str())
                .increment(1);
            // Published under the lock so subscribers see transitions in commit order.
            self.publish_status(&guard, now);
        }
        Ok(guard.clone())
    }

    fn publish_status(&self, space: &SpaceRecord, now: Ms) {
        let event = BusEvent::SpaceStatus {
            space_id: space.id,
            lot_id: space.lot_id,
            status: space.status,
            version: space.status_version,
            timestamp: now,
            sensor_snapshot: Some(SensorSnapshot {
                battery_level: space.sensor.battery,
                signal_strength: space.sensor.signal,
                last_seen: space.sensor.last_seen,
            }),
        };
        self.notify.publish(Topic::Space(space.id), &event);
        self.notify.publish(Topic::Lot(space.lot_id), &event);
    }

    /// Apply a sensor message. Absent fields leave the matching state untouched.
    pub async fn on_sensor_report(
        &self,
        sensor_id: &str,
        occupied: Option<bool>,
        battery: Option<u8>,
        signal: Option<i16>,
    ) -> Result<SpaceStatus, EngineError> {
        if battery.is_some_and(|b| b > 100) {
            return Err(EngineError::LimitExceeded("battery level above 100"));
        }
        if signal.is_some_and(|s| !(-100..=0).contains(&s)) {
            return Err(EngineError::LimitExceeded("signal strength outside -100..=0 dBm"));
        }
        let space_id = self
            .sensor_to_space
            .get(sensor_id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::SensorUnknown(sensor_id.to_string()))?;

        let space = self
            .mutate_space(space_id, |s, now| {
                s.sensor.last_seen = now;
                if let Some(b) = battery {
                    s.sensor.battery = Some(b);
                }
                if let Some(sig) = signal {
                    s.sensor.signal = Some(sig);
                }
                if let Some(occ) = occupied {
                    s.physical = if occ {
                        PhysicalState::Occupied
                    } else {
                        PhysicalState::Free
                    };
                }
                Ok(())
            })
            .await?;
        metrics::counter!(crate::observability::SENSOR_REPORTS_TOTAL).increment(1);
        Ok(space.status)
    }

    /// A reservation was admitted for this space.
    pub async fn on_reservation_held(&self, space_id: Ulid, reservation_id: Ulid) -> Result<SpaceStatus, EngineError> {
        let space = self
            .mutate_space(space_id, |s, _| {
                if s.active_by != Some(reservation_id) {
                    s.held_by.insert(reservation_id);
                }
                Ok(())
            })
            .await?;
        Ok(space.status)
    }

    /// A reservation on this space checked in.
    pub async fn on_reservation_activated(
        &self,
        space_id: Ulid,
        reservation_id: Ulid,
    ) -> Result<SpaceStatus, EngineError> {
        let space = self
            .mutate_space(space_id, |s, _| {
                s.held_by.remove(&reservation_id);
                s.active_by = Some(reservation_id);
                Ok(())
            })
            .await?;
        Ok(space.status)
    }

    /// A reservation on this space ended. `usage` is set only on check-out.
    pub(super) async fn on_reservation_released(
        &self,
        space_id: Ulid,
        reservation_id: Ulid,
        usage: Option<Usage>,
    ) -> Result<SpaceStatus, EngineError> {
        let space = self
            .mutate_space(space_id, |s, _| {
                s.held_by.remove(&reservation_id);
                if s.active_by == Some(reservation_id) {
                    s.active_by = None;
                }
                if let Some(u) = usage {
                    let stats = &mut s.statistics;
                    let prior = stats.total_usage as f64;
                    stats.total_usage += 1;
                    stats.average_occupancy_minutes =
                        (stats.average_occupancy_minutes * prior + u.minutes as f64) / stats.total_usage as f64;
                    stats.revenue = stats.revenue.saturating_add(u.amount);
                }
                Ok(())
            })
            .await?;
        Ok(space.status)
    }

    /// Open a maintenance issue. A critical one puts the space in maintenance.
    pub async fn add_issue(
        &self,
        space_id: Ulid,
        kind: IssueKind,
        severity: Severity,
        description: Option<String>,
    ) -> Result<Ulid, EngineError> {
        if description.as_ref().is_some_and(|d| d.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("issue description too long"));
        }
        let id = Ulid::new();
        self.mutate_space(space_id, |s, now| {
            if s.issues.len() >= MAX_ISSUES_PER_SPACE {
                return Err(EngineError::LimitExceeded("too many issues on space"));
            }
            s.issues.push(MaintenanceIssue {
                id,
                kind,
                description,
                severity,
                opened_at: now,
                resolved_at: None,
            });
            Ok(())
        })
        .await?;
        tracing::info!(space = %space_id, issue = %id, ?kind, ?severity, "maintenance issue opened");
        Ok(id)
    }

    /// Resolve an issue. Resolving an already-resolved issue is a no-op.
    pub async fn resolve_issue(&self, space_id: Ulid, issue_id: Ulid) -> Result<SpaceStatus, EngineError> {
        let space = self
            .mutate_space(space_id, |s, now| {
                let issue = s
                    .issues
                    .iter_mut()
                    .find(|i| i.id == issue_id)
                    .ok_or(EngineError::NotFound(issue_id))?;
                if issue.is_open() {
                    issue.resolved_at = Some(now);
                }
                Ok(())
            })
            .await?;
        tracing::info!(space = %space_id, issue = %issue_id, "maintenance issue resolved");
        Ok(space.status)
    }
}
