use crate::model::{HOUR, MINUTE, Ms, DAY};

// ── Hard limits ──────────────────────────────────────────────────

pub const MAX_LOTS: usize = 10_000;
pub const MAX_SPACES_PER_LOT: usize = 5_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SENSOR_ID_LEN: usize = 128;
pub const MAX_PLATE_LEN: usize = 32;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_ISSUES_PER_SPACE: usize = 256;
pub const MAX_SLOTS_PER_KEY: usize = 10_000;
pub const MAX_BATCH_SPACES: usize = 500;

/// Longest reservation window accepted.
pub const MAX_WINDOW_MS: Ms = 31 * DAY;

/// Occupancy history entries kept per space.
pub const HISTORY_LEN: usize = 100;

/// Longest sensor feed line accepted by the TCP adapter.
pub const MAX_SENSOR_LINE_LEN: usize = 4096;

// ── Policy defaults ──────────────────────────────────────────────

pub const DEFAULT_CHECK_IN_LEAD_MS: Ms = 15 * MINUTE;
pub const DEFAULT_SENSOR_SILENCE_MS: Ms = 10 * MINUTE;
pub const DEFAULT_STALE_SENSOR_MS: Ms = 15 * MINUTE;
pub const DEFAULT_MIN_BATTERY: u8 = 10;
pub const DEFAULT_MIN_SIGNAL: i16 = -80;
pub const DEFAULT_LOW_BATTERY: u8 = 20;

pub const FULL_REFUND_BEFORE_MS: Ms = 24 * HOUR;
pub const HALF_REFUND_BEFORE_MS: Ms = HOUR;

pub const DEFAULT_CURRENCY: &str = "JPY";
