//! Process configuration, read from `SLOTWISE_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::limits::*;
use crate::model::{MINUTE, Ms, OperatingHours, Pricing, SensorKind, SpaceFeatures};

/// Engine-wide thresholds. Injected, never read from the environment by the engine.
#[derive(Debug, Clone)]
pub struct Policy {
    /// How long before `start` check-in opens; also the no-show grace after `start`.
    pub check_in_lead_ms: Ms,
    /// Treat payment authorization as synchronous: new reservations start `confirmed`.
    pub confirm_on_create: bool,
    /// A sensor silent for this long is unhealthy.
    pub sensor_silence_ms: Ms,
    /// A sensor silent for this long gets a `sensor_fault` issue from the health sweep.
    pub stale_sensor_ms: Ms,
    /// Healthy sensors report battery strictly above this.
    pub min_battery: u8,
    /// Healthy sensors report signal strictly above this (dBm).
    pub min_signal: i16,
    /// Battery below this triggers a low-battery event.
    pub low_battery: u8,
    pub currency: String,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            check_in_lead_ms: DEFAULT_CHECK_IN_LEAD_MS,
            confirm_on_create: false,
            sensor_silence_ms: DEFAULT_SENSOR_SILENCE_MS,
            stale_sensor_ms: DEFAULT_STALE_SENSOR_MS,
            min_battery: DEFAULT_MIN_BATTERY,
            min_signal: DEFAULT_MIN_SIGNAL,
            low_battery: DEFAULT_LOW_BATTERY,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub aggregate_every: Duration,
    pub health_every: Duration,
    pub expiry_every: Duration,
    pub compact_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            aggregate_every: Duration::from_secs(300),
            health_every: Duration::from_secs(600),
            expiry_every: Duration::from_secs(300),
            compact_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub sensor_port: u16,
    pub metrics_port: Option<u16>,
    pub data_dir: PathBuf,
    pub seed: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub policy: Policy,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = var(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparsable {name}={raw}");
            None
        }
    }
}

fn secs(name: &str, default: Duration) -> Duration {
    parsed::<u64>(name).map(Duration::from_secs).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let sched = SchedulerConfig::default();
        let policy = Policy::default();
        Self {
            bind: var("SLOTWISE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            sensor_port: parsed("SLOTWISE_SENSOR_PORT").unwrap_or(1884),
            metrics_port: parsed("SLOTWISE_METRICS_PORT"),
            data_dir: var("SLOTWISE_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            seed: var("SLOTWISE_SEED").map(PathBuf::from),
            scheduler: SchedulerConfig {
                aggregate_every: secs("SLOTWISE_AGGREGATE_INTERVAL_SECS", sched.aggregate_every),
                health_every: secs("SLOTWISE_HEALTH_INTERVAL_SECS", sched.health_every),
                expiry_every: secs("SLOTWISE_EXPIRY_INTERVAL_SECS", sched.expiry_every),
                compact_threshold: parsed("SLOTWISE_COMPACT_THRESHOLD")
                    .unwrap_or(sched.compact_threshold),
            },
            policy: Policy {
                check_in_lead_ms: parsed::<i64>("SLOTWISE_CHECK_IN_LEAD_MINS")
                    .map(|m| m * MINUTE)
                    .unwrap_or(policy.check_in_lead_ms),
                confirm_on_create: parsed("SLOTWISE_CONFIRM_ON_CREATE")
                    .unwrap_or(policy.confirm_on_create),
                ..policy
            },
        }
    }
}

// ── Seed file ────────────────────────────────────────────────────

/// Lots and spaces provisioned on first start, e.g.
/// `{"lots":[{"name":"Central","pricing":{"hourly":300,"reservation_fee":100},
///   "hours":"always_open","spaces":[{"number":"A-1","sensor_id":"s-1","sensor_kind":"magnetic",
///   "features":{"ev_charging":true}}]}]}`
#[derive(Debug, Deserialize)]
pub struct Seed {
    pub lots: Vec<SeedLot>,
}

#[derive(Debug, Deserialize)]
pub struct SeedLot {
    pub name: String,
    pub pricing: Pricing,
    pub hours: OperatingHours,
    #[serde(default)]
    pub spaces: Vec<SeedSpace>,
}

#[derive(Debug, Deserialize)]
pub struct SeedSpace {
    pub number: String,
    pub sensor_id: String,
    pub sensor_kind: SensorKind,
    #[serde(default)]
    pub features: SpaceFeatures,
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults_match_limits() {
        let p = Policy::default();
        assert_eq!(p.check_in_lead_ms, 15 * MINUTE);
        assert_eq!(p.sensor_silence_ms, 10 * MINUTE);
        assert_eq!(p.stale_sensor_ms, 15 * MINUTE);
        assert_eq!((p.min_battery, p.min_signal, p.low_battery), (10, -80, 20));
        assert!(!p.confirm_on_create);
    }

    #[test]
    fn seed_parses() {
        let raw = r#"{"lots":[{"name":"Central","pricing":{"hourly":300,"reservation_fee":100},
            "hours":{"daily":{"open_min":480,"close_min":1320,"utc_offset_min":540}},
            "spaces":[{"number":"A-1","sensor_id":"s-1","sensor_kind":"magnetic"},
                {"number":"A-2","sensor_id":"s-2","sensor_kind":"camera","features":{"ev_charging":true}}]},
            {"name":"Annex","pricing":{"hourly":200,"reservation_fee":0},"hours":"always_open"}]}"#;
        let seed: Seed = serde_json::from_str(raw).unwrap();
        assert_eq!(seed.lots.len(), 2);
        assert_eq!(seed.lots[0].spaces[0].sensor_kind, SensorKind::Magnetic);
        assert_eq!(seed.lots[0].spaces[0].features, SpaceFeatures::default());
        assert!(seed.lots[0].spaces[1].features.ev_charging);
        assert!(!seed.lots[0].spaces[1].features.covered);
        assert!(matches!(seed.lots[0].hours, OperatingHours::Daily { open_min: 480, .. }));
        assert!(seed.lots[1].spaces.is_empty());
    }
}
