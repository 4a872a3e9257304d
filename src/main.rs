use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use ulid::Ulid;

use slotwise::clock::SystemClock;
use slotwise::config::{Config, Seed};
use slotwise::engine::{Engine, LotSpec};
use slotwise::notify::{NotifyHub, TracingSink};
use slotwise::{ingest, scheduler};

/// Provision the seed file's lots and spaces into an empty engine.
async fn apply_seed(engine: &Engine, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let seed = Seed::load(path)?;
    for lot in seed.lots {
        let lot_id = Ulid::new();
        engine
            .create_lot(
                lot_id,
                LotSpec {
                    name: lot.name,
                    pricing: lot.pricing,
                    hours: lot.hours,
                },
            )
            .await?;
        for space in lot.spaces {
            engine
                .provision_space(
                    Ulid::new(),
                    lot_id,
                    space.number,
                    space.sensor_id,
                    space.sensor_kind,
                    space.features,
                )
                .await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotwise::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new().with_sink(Arc::new(TracingSink)));
    let engine = Engine::new(
        config.data_dir.join("slotwise.wal"),
        notify,
        Arc::new(SystemClock),
        config.policy.clone(),
    )?;
    let engine = Arc::new(engine);

    if let Some(seed) = &config.seed {
        if engine.list_lots().await.is_empty() {
            apply_seed(&engine, seed).await?;
            info!("seeded from {}", seed.display());
        } else {
            info!("lots already present, seed file ignored");
        }
    }

    let jobs = scheduler::spawn_all(engine.clone(), &config.scheduler);

    let (sensor_tx, sensor_rx) = mpsc::channel(4096);
    let ingest_task = tokio::spawn(ingest::run_ingest(engine.clone(), sensor_rx));

    let addr = format!("{}:{}", config.bind, config.sensor_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotwise sensor feed listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );
    let feed = tokio::spawn(ingest::serve_sensor_feed(listener, sensor_tx));

    // Graceful shutdown on SIGTERM/ctrl-c
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;
    info!("shutdown signal received");

    // Stopping the feed closes every sensor connection; the consumer then drains what is queued.
    feed.abort();
    let _ = feed.await;
    for job in jobs {
        job.abort();
    }
    match tokio::time::timeout(std::time::Duration::from_secs(10), ingest_task).await {
        Ok(_) => info!("sensor queue drained"),
        Err(_) => tracing::warn!("sensor queue drain timed out"),
    }

    if let Err(e) = engine.compact_wal().await {
        tracing::error!("final journal compaction failed: {e}");
    }
    info!("slotwise stopped");
    Ok(())
}
