use ulid::Ulid;

use crate::model::{Ms, ReservationStatus};

#[derive(Debug)]
pub enum EngineError {
    InvalidWindow(&'static str),
    LotClosed(Ulid),
    /// Overlaps the given live reservation on the same space.
    Conflict(Ulid),
    /// Every space in the lot's unassigned pool is taken for part of the window.
    CapacityExceeded(u32),
    NotFound(Ulid),
    AlreadyExists(String),
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        action: &'static str,
    },
    TooEarly {
        opens_at: Ms,
    },
    TooLate {
        closed_at: Ms,
    },
    AlreadyCheckedIn(Ulid),
    Forbidden(Ulid),
    SensorUnknown(String),
    SpaceInUse(Ulid),
    LimitExceeded(&'static str),
    Internal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow(why) => write!(f, "invalid window: {why}"),
            EngineError::LotClosed(id) => {
                write!(f, "parking lot {id} is closed for the requested window")
            }
            EngineError::Conflict(id) => write!(f, "time slot conflicts with reservation {id}"),
            EngineError::CapacityExceeded(cap) => {
                write!(f, "all {cap} spaces are reserved for part of the window")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(key) => write!(f, "already exists: {key}"),
            EngineError::InvalidTransition { id, from, action } => {
                write!(f, "cannot {action} reservation {id} in status {from}")
            }
            EngineError::TooEarly { opens_at } => {
                write!(f, "too early: check-in opens at {opens_at}")
            }
            EngineError::TooLate { closed_at } => {
                write!(f, "too late: reservation window ended at {closed_at}")
            }
            EngineError::AlreadyCheckedIn(id) => write!(f, "reservation {id} already checked in"),
            EngineError::Forbidden(id) => write!(f, "access denied to {id}"),
            EngineError::SensorUnknown(sensor) => write!(f, "no space mapped to sensor {sensor}"),
            EngineError::SpaceInUse(id) => {
                write!(f, "space {id} still has live reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
