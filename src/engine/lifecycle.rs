use crate::model::*;

use super::EngineError;

/// Operations that move a reservation between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ConfirmPayment,
    AssignSpace,
    CheckIn,
    CheckOut,
    Cancel,
    Expire,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ConfirmPayment => "confirm payment for",
            Action::AssignSpace => "assign a space to",
            Action::CheckIn => "check in",
            Action::CheckOut => "check out",
            Action::Cancel => "cancel",
            Action::Expire => "expire",
        }
    }
}

/// Transition table. `None` means the action is not allowed from `from`.
pub fn transition_allowed(from: ReservationStatus, action: Action) -> Option<ReservationStatus> {
    use ReservationStatus::*;
    match (from, action) {
        (Pending, Action::ConfirmPayment) => Some(Confirmed),
        (Pending | Confirmed, Action::AssignSpace) => Some(from),
        (Confirmed, Action::CheckIn) => Some(Active),
        (Active, Action::CheckOut) => Some(Completed),
        (Pending | Confirmed, Action::Cancel) => Some(Cancelled),
        (Pending | Confirmed, Action::Expire) => Some(Expired),
        (Pending | Confirmed | Active | Completed | Cancelled | Expired, _) => None,
    }
}

pub(super) fn next_status(r: &Reservation, action: Action) -> Result<ReservationStatus, EngineError> {
    transition_allowed(r.status, action).ok_or(EngineError::InvalidTransition {
        id: r.id,
        from: r.status,
        action: action.as_str(),
    })
}

/// Owner or admin only. Operators read through the per-lot listing instead.
pub(super) fn ensure_access(r: &Reservation, caller: &Caller) -> Result<(), EngineError> {
    if r.owner == caller.user_id || caller.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(r.id))
    }
}

pub(super) fn ensure_can_check_in(r: &Reservation, now: Ms, lead: Ms) -> Result<(), EngineError> {
    if r.status == ReservationStatus::Active || r.check_in_at.is_some() {
        return Err(EngineError::AlreadyCheckedIn(r.id));
    }
    next_status(r, Action::CheckIn)?;
    let opens_at = r.window.start - lead;
    if now < opens_at {
        return Err(EngineError::TooEarly { opens_at });
    }
    if now > r.window.end {
        return Err(EngineError::TooLate {
            closed_at: r.window.end,
        });
    }
    Ok(())
}

pub(super) fn ensure_can_check_out(r: &Reservation) -> Result<Ms, EngineError> {
    next_status(r, Action::CheckOut)?;
    match (r.check_in_at, r.check_out_at) {
        (Some(at), None) => Ok(at),
        _ => Err(EngineError::InvalidTransition {
            id: r.id,
            from: r.status,
            action: Action::CheckOut.as_str(),
        }),
    }
}

/// Pending or confirmed, never checked in, and past `start + lead`.
pub(super) fn is_overdue(r: &Reservation, now: Ms, lead: Ms) -> bool {
    matches!(r.status, ReservationStatus::Pending | ReservationStatus::Confirmed)
        && r.check_in_at.is_none()
        && now > r.window.start + lead
}

/// Whole hours of the window, rounded up, plus the flat reservation fee.
pub fn booking_amount(pricing: &Pricing, window: &Span) -> u64 {
    let hours = ceil_hours(window.duration_ms()).max(0) as u64;
    hours
        .saturating_mul(pricing.hourly)
        .saturating_add(pricing.reservation_fee)
}

/// Pro-rated by the minute, rounded up to the currency unit.
pub fn checkout_amount(pricing: &Pricing, minutes: i64) -> u64 {
    let minutes = minutes.max(0) as u64;
    minutes.saturating_mul(pricing.hourly).div_ceil(60)
}
