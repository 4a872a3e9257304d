use std::net::SocketAddr;

// ── Foreground ───────────────────────────────────────────────────

/// Counter: reservation operations. Labels: op, outcome.
pub const RESERVATION_OPS_TOTAL: &str = "slotwise_reservation_ops_total";

/// Histogram: admission (check + journal + index insert) latency in seconds.
pub const ADMISSION_DURATION_SECONDS: &str = "slotwise_admission_duration_seconds";

// ── Ingestion ────────────────────────────────────────────────────

/// Counter: sensor reports applied.
pub const SENSOR_REPORTS_TOTAL: &str = "slotwise_sensor_reports_total";

/// Counter: sensor messages dropped. Labels: reason.
pub const SENSOR_REPORTS_DROPPED_TOTAL: &str = "slotwise_sensor_reports_dropped_total";

/// Gauge: open sensor feed connections.
pub const SENSOR_FEED_CONNECTIONS: &str = "slotwise_sensor_feed_connections";

// ── Reconciler / bus ─────────────────────────────────────────────

/// Counter: derived status transitions. Labels: status.
pub const STATUS_CHANGES_TOTAL: &str = "slotwise_status_changes_total";

/// Counter: events published on the fan-out bus.
pub const BUS_EVENTS_TOTAL: &str = "slotwise_bus_events_total";

// ── Sweeps ───────────────────────────────────────────────────────

/// Histogram: sweep duration in seconds. Labels: sweep.
pub const SWEEP_DURATION_SECONDS: &str = "slotwise_sweep_duration_seconds";

/// Counter: sweep runs skipped because a previous run was still in flight. Labels: sweep.
pub const SWEEP_SKIPPED_TOTAL: &str = "slotwise_sweep_skipped_total";

/// Counter: reservations moved to expired by the sweep.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "slotwise_reservations_expired_total";

/// Counter: sensor_fault issues opened by the health sweep.
pub const SENSOR_FAULTS_OPENED_TOTAL: &str = "slotwise_sensor_faults_opened_total";

/// Gauge: spaces per derived status for a lot. Labels: lot, status.
pub const LOT_SPACES: &str = "slotwise_lot_spaces";

// ── Journal ──────────────────────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for an error, for the `outcome` metric label.
pub fn error_label(err: &crate::engine::EngineError) -> &'static str {
    use crate::engine::EngineError::*;
    match err {
        InvalidWindow(_) => "invalid_window",
        LotClosed(_) => "lot_closed",
        Conflict(_) => "conflict",
        CapacityExceeded(_) => "capacity_exceeded",
        NotFound(_) => "not_found",
        AlreadyExists(_) => "already_exists",
        InvalidTransition { .. } => "invalid_transition",
        TooEarly { .. } => "too_early",
        TooLate { .. } => "too_late",
        AlreadyCheckedIn(_) => "already_checked_in",
        Forbidden(_) => "forbidden",
        SensorUnknown(_) => "sensor_unknown",
        SpaceInUse(_) => "space_in_use",
        LimitExceeded(_) => "limit_exceeded",
        Internal(_) => "internal",
    }
}
