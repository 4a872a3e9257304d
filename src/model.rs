use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied windows.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Whole hours, rounded up.
pub fn ceil_hours(ms: Ms) -> i64 {
    (ms + HOUR - 1).div_euclid(HOUR)
}

/// Whole minutes, rounded up.
pub fn ceil_minutes(ms: Ms) -> i64 {
    (ms + MINUTE - 1).div_euclid(MINUTE)
}

// ── Space-side enumerations ──────────────────────────────────────

/// Sensor-reported occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalState {
    #[default]
    Unknown,
    Free,
    Occupied,
}

/// Reservation-reported occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalState {
    #[serde(rename = "none")]
    Idle,
    Held,
    Active,
}

/// The single authoritative per-space availability value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceStatus {
    Available,
    Occupied,
    Reserved,
    Maintenance,
    OutOfService,
}

impl SpaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceStatus::Available => "available",
            SpaceStatus::Occupied => "occupied",
            SpaceStatus::Reserved => "reserved",
            SpaceStatus::Maintenance => "maintenance",
            SpaceStatus::OutOfService => "out_of_service",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    SensorFault,
    PhysicalDamage,
    ElectricalIssue,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Open while `resolved_at` is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceIssue {
    pub id: Ulid,
    pub kind: IssueKind,
    pub description: Option<String>,
    pub severity: Severity,
    pub opened_at: Ms,
    pub resolved_at: Option<Ms>,
}

impl MaintenanceIssue {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Ultrasonic,
    Infrared,
    Magnetic,
    Camera,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub kind: SensorKind,
    pub last_seen: Ms,
    /// Percent, 0..=100.
    pub battery: Option<u8>,
    /// dBm, -100..=0.
    pub signal: Option<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: Ms,
    pub status: SpaceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceStatistics {
    pub total_usage: u64,
    pub average_occupancy_minutes: f64,
    pub revenue: u64,
}

/// Fixed amenities of a space, set at provisioning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceFeatures {
    #[serde(default)]
    pub ev_charging: bool,
    #[serde(default)]
    pub wheelchair_accessible: bool,
    #[serde(default)]
    pub covered: bool,
    #[serde(default)]
    pub large_vehicle: bool,
}

impl SpaceFeatures {
    /// True if every feature set in `required` is present here.
    pub fn satisfies(&self, required: &SpaceFeatures) -> bool {
        (!required.ev_charging || self.ev_charging)
            && (!required.wheelchair_accessible || self.wheelchair_accessible)
            && (!required.covered || self.covered)
            && (!required.large_vehicle || self.large_vehicle)
    }
}

/// A parking space document. `status` is written by the reconciler only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceRecord {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub number: String,
    pub features: SpaceFeatures,
    pub sensor: Sensor,
    pub physical: PhysicalState,
    /// Reservations admitted for this space and not yet checked in.
    pub held_by: BTreeSet<Ulid>,
    /// The checked-in reservation, if any.
    pub active_by: Option<Ulid>,
    pub issues: Vec<MaintenanceIssue>,
    pub retired: bool,
    pub(crate) status: SpaceStatus,
    pub(crate) status_since: Ms,
    /// Bumped on every status change; subscribers order transitions by it.
    pub(crate) status_version: u64,
    pub history: VecDeque<HistoryEntry>,
    pub statistics: SpaceStatistics,
}

impl SpaceRecord {
    pub fn new(id: Ulid, lot_id: Ulid, number: String, sensor: Sensor, now: Ms) -> Self {
        Self {
            id,
            lot_id,
            number,
            features: SpaceFeatures::default(),
            sensor,
            physical: PhysicalState::Unknown,
            held_by: BTreeSet::new(),
            active_by: None,
            issues: Vec::new(),
            retired: false,
            status: SpaceStatus::Available,
            status_since: now,
            status_version: 0,
            history: VecDeque::new(),
            statistics: SpaceStatistics::default(),
        }
    }

    pub fn status(&self) -> SpaceStatus {
        self.status
    }

    pub fn status_since(&self) -> Ms {
        self.status_since
    }

    pub fn status_version(&self) -> u64 {
        self.status_version
    }

    pub fn logical(&self) -> LogicalState {
        if self.active_by.is_some() {
            LogicalState::Active
        } else if !self.held_by.is_empty() {
            LogicalState::Held
        } else {
            LogicalState::Idle
        }
    }

    pub fn has_open_critical_issue(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.is_open() && i.severity == Severity::Critical)
    }

    pub fn has_open_issue_of(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.is_open() && i.kind == kind)
    }
}

// ── Lots ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub hourly: u64,
    pub reservation_fee: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingHours {
    AlwaysOpen,
    /// Local minute-of-day bounds, inclusive of `close`. `close < open` wraps past midnight.
    Daily {
        open_min: u16,
        close_min: u16,
        utc_offset_min: i32,
    },
}

impl OperatingHours {
    /// True if every instant of `window` falls inside one opening period.
    pub fn covers(&self, window: &Span) -> bool {
        match *self {
            OperatingHours::AlwaysOpen => true,
            OperatingHours::Daily {
                open_min,
                close_min,
                utc_offset_min,
            } => {
                let offset = utc_offset_min as Ms * MINUTE;
                let open = open_min as Ms * MINUTE;
                let mut close = close_min as Ms * MINUTE;
                if close <= open {
                    close += DAY;
                }
                let local_start = window.start + offset;
                let local_end = window.end + offset;
                let day = local_start.div_euclid(DAY) * DAY;
                // An overnight period that began the previous day may still be open.
                [day - DAY, day].iter().any(|d| {
                    let period = Span::new(d + open, d + close);
                    period.start <= local_start && local_end <= period.end
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    Active,
    Maintenance,
    Closed,
}

/// Per-lot counts recomputed from space status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotAggregate {
    pub available: u32,
    pub reserved: u32,
    pub occupied: u32,
    pub maintenance: u32,
    pub out_of_service: u32,
    pub total: u32,
    pub computed_at: Ms,
}

impl LotAggregate {
    pub fn count(&mut self, status: SpaceStatus) {
        match status {
            SpaceStatus::Available => self.available += 1,
            SpaceStatus::Reserved => self.reserved += 1,
            SpaceStatus::Occupied => self.occupied += 1,
            SpaceStatus::Maintenance => self.maintenance += 1,
            SpaceStatus::OutOfService => self.out_of_service += 1,
        }
        self.total += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotRecord {
    pub id: Ulid,
    pub name: String,
    pub pricing: Pricing,
    pub hours: OperatingHours,
    pub status: LotStatus,
    /// Last value pushed by the aggregate sync. A cache, never incremented in place.
    pub summary: LotAggregate,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    /// Statuses that hold a slot in the interval index.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Confirmed | ReservationStatus::Active
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Active => "active",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    User,
    System,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    MobilePayment,
    Cash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub method: PaymentMethod,
    pub amount: u64,
    pub currency: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub paid_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub license_plate: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub color: Option<String>,
}

impl Vehicle {
    pub fn plate(license_plate: impl Into<String>) -> Self {
        Self {
            license_plate: license_plate.into(),
            make: None,
            model: None,
            color: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub owner: Ulid,
    pub lot_id: Ulid,
    pub space_id: Option<Ulid>,
    pub window: Span,
    pub status: ReservationStatus,
    pub payment: Payment,
    pub vehicle: Vehicle,
    pub created_at: Ms,
    pub check_in_at: Option<Ms>,
    pub check_out_at: Option<Ms>,
    /// Minutes, rounded up.
    pub actual_duration: Option<i64>,
    pub actual_amount: Option<u64>,
    pub cancelled_by: Option<CancelledBy>,
    pub cancellation_reason: Option<String>,
    pub refund_amount: u64,
}

// ── Callers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Operator,
    Admin,
}

/// Pre-authenticated identity supplied by the outer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Ulid,
    pub role: Role,
}

impl Caller {
    pub fn user(user_id: Ulid) -> Self {
        Self { user_id, role: Role::User }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Who is driving a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Caller(Caller),
    System,
}

// ── Journal ──────────────────────────────────────────────────────

/// Journal record: one whole document per record, last write wins on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    LotSaved(LotRecord),
    SpaceSaved(SpaceRecord),
    ReservationSaved(Reservation),
}
