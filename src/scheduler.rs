use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::engine::Engine;

fn ticker(every: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(every);
    // A slow pass must not trigger a burst of catch-up passes.
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Periodically recompute every lot's availability counts.
pub async fn run_aggregate_sync(engine: Arc<Engine>, every: Duration) {
    let mut interval = ticker(every);
    loop {
        interval.tick().await;
        let synced = engine.sync_aggregates().await;
        tracing::debug!(synced, "aggregate sync pass");
    }
}

/// Periodically flag stale sensors and weak batteries.
pub async fn run_health_sweep(engine: Arc<Engine>, every: Duration) {
    let mut interval = ticker(every);
    loop {
        interval.tick().await;
        let report = engine.sweep_sensor_health().await;
        if report.faults_opened > 0 || report.low_battery > 0 {
            info!(
                checked = report.checked,
                faults = report.faults_opened,
                low_battery = report.low_battery,
                "sensor health sweep"
            );
        }
    }
}

/// Periodically expire no-shows.
pub async fn run_expiry_sweep(engine: Arc<Engine>, every: Duration) {
    let mut interval = ticker(every);
    loop {
        interval.tick().await;
        for id in engine.expire_overdue().await {
            info!("expired no-show reservation {id}");
        }
    }
}

/// Compact the journal once enough appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = ticker(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if compact_if_needed(&engine, threshold).await {
            info!("journal compacted");
        }
    }
}

async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    if engine.wal_appends_since_compact().await < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("journal compaction failed: {e}");
            false
        }
    }
}

/// Start every periodic job.
pub fn spawn_all(engine: Arc<Engine>, config: &SchedulerConfig) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_aggregate_sync(engine.clone(), config.aggregate_every)),
        tokio::spawn(run_health_sweep(engine.clone(), config.health_every)),
        tokio::spawn(run_expiry_sweep(engine.clone(), config.expiry_every)),
        tokio::spawn(run_compactor(engine, config.compact_threshold)),
    ]
}
