use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{RwLock, RwLockWriteGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ADMISSION_DURATION_SECONDS, RESERVATIONS_EXPIRED_TOTAL, RESERVATION_OPS_TOTAL, error_label};

use super::index::{IndexKey, Slot};
use super::lifecycle::{self, Action};
use super::reconciler::Usage;
use super::refund::{cancelling_party, refund_amount};
use super::{Engine, EngineError};

/// Everything a caller supplies to book. `space_id: None` books against the lot's pool.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub caller: Caller,
    pub lot_id: Ulid,
    pub space_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub vehicle: Vehicle,
    pub payment_method: PaymentMethod,
}

fn tally<T>(op: &'static str, result: Result<T, EngineError>) -> Result<T, EngineError> {
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => error_label(e),
    };
    metrics::counter!(RESERVATION_OPS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
    result
}

impl Engine {
    pub async fn create_reservation(&self, req: BookingRequest) -> Result<Reservation, EngineError> {
        tally("create", self.create_reservation_inner(req).await)
    }

    async fn create_reservation_inner(&self, req: BookingRequest) -> Result<Reservation, EngineError> {
        let window = Span::try_new(req.start, req.end)
            .ok_or(EngineError::InvalidWindow("end must be after start"))?;
        let now = self.now_ms();
        if window.start <= now {
            return Err(EngineError::InvalidWindow("start must be in the future"));
        }
        if window.duration_ms() > MAX_WINDOW_MS {
            return Err(EngineError::InvalidWindow("window longer than 31 days"));
        }
        if req.vehicle.license_plate.trim().is_empty() {
            return Err(EngineError::InvalidWindow("license plate is required"));
        }
        if req.vehicle.license_plate.len() > MAX_PLATE_LEN {
            return Err(EngineError::LimitExceeded("license plate too long"));
        }

        let pricing = {
            let lot = self.lot_handle(&req.lot_id)?;
            let lot = lot.read().await;
            if lot.status != LotStatus::Active || !lot.hours.covers(&window) {
                return Err(EngineError::LotClosed(lot.id));
            }
            lot.pricing
        };
        if let Some(space_id) = req.space_id {
            self.ensure_bookable_space(req.lot_id, space_id).await?;
        }

        let (status, payment_status, paid_at) = if self.policy.confirm_on_create {
            (ReservationStatus::Confirmed, PaymentStatus::Paid, Some(now))
        } else {
            (ReservationStatus::Pending, PaymentStatus::Pending, None)
        };
        let reservation = Reservation {
            id: Ulid::new(),
            owner: req.caller.user_id,
            lot_id: req.lot_id,
            space_id: req.space_id,
            window,
            status,
            payment: Payment {
                method: req.payment_method,
                amount: lifecycle::booking_amount(&pricing, &window),
                currency: self.policy.currency.clone(),
                status: payment_status,
                transaction_id: None,
                paid_at,
            },
            vehicle: req.vehicle,
            created_at: now,
            check_in_at: None,
            check_out_at: None,
            actual_duration: None,
            actual_amount: None,
            cancelled_by: None,
            cancellation_reason: None,
            refund_amount: 0,
        };

        // Held across the reconciler notification, like every other transition.
        let handle = Arc::new(RwLock::new(reservation.clone()));
        let guard = handle.clone().write_owned().await;
        self.try_reserve(&reservation, handle).await?;
        tracing::info!(
            reservation = %reservation.id,
            lot = %reservation.lot_id,
            space = ?reservation.space_id,
            "reservation created"
        );
        if let Some(space_id) = reservation.space_id {
            self.notify_reconciler(space_id, reservation.id, Action::AssignSpace, None).await;
        }
        drop(guard);
        Ok(reservation)
    }

    /// Admit `reservation` under its key: overlap check, journal, index insert, all
    /// inside the key's critical section. Returns the reservation id.
    pub(super) async fn try_reserve(
        &self,
        reservation: &Reservation,
        handle: super::SharedReservation,
    ) -> Result<Ulid, EngineError> {
        let started = Instant::now();
        let key = Self::key_for(reservation);
        let slots = self.slots_handle(key);
        let mut index = slots.write().await;
        if index.len() >= MAX_SLOTS_PER_KEY {
            return Err(EngineError::LimitExceeded("too many live reservations on space"));
        }
        if let Some(space_id) = key.space_id {
            // Retirement takes this index lock too; re-check under it.
            let space = self.space_handle(&space_id)?;
            if space.read().await.retired {
                return Err(EngineError::NotFound(space_id));
            }
        }
        index.admit(&reservation.window)?;

        self.wal_append(&Event::ReservationSaved(reservation.clone())).await?;
        self.reservations.insert(reservation.id, handle);
        index.insert(Slot {
            reservation_id: reservation.id,
            window: reservation.window,
        });
        drop(index);
        metrics::histogram!(ADMISSION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(reservation.id)
    }

    async fn ensure_bookable_space(&self, lot_id: Ulid, space_id: Ulid) -> Result<(), EngineError> {
        let space = self.space_handle(&space_id)?;
        let space = space.read().await;
        if space.lot_id != lot_id || space.retired {
            return Err(EngineError::NotFound(space_id));
        }
        Ok(())
    }

    /// Payment collaborator reports capture: `pending → confirmed`, payment `paid`.
    pub async fn confirm_payment(&self, id: Ulid, transaction_id: Option<String>) -> Result<Reservation, EngineError> {
        tally("confirm_payment", self.confirm_payment_inner(id, transaction_id).await)
    }

    async fn confirm_payment_inner(&self, id: Ulid, transaction_id: Option<String>) -> Result<Reservation, EngineError> {
        let handle = self.reservation_handle(&id)?;
        let mut guard = handle.write().await;
        let status = lifecycle::next_status(&guard, Action::ConfirmPayment)?;
        let mut next = guard.clone();
        next.status = status;
        next.payment.status = PaymentStatus::Paid;
        next.payment.transaction_id = transaction_id;
        next.payment.paid_at = Some(self.now_ms());
        self.commit(&mut guard, next).await?;
        tracing::info!(reservation = %id, "payment confirmed");
        Ok(guard.clone())
    }

    /// Give a lot-level reservation a concrete space, re-running the overlap check
    /// against that space.
    pub async fn assign_space(&self, id: Ulid, space_id: Ulid, caller: &Caller) -> Result<Reservation, EngineError> {
        tally("assign_space", self.assign_space_inner(id, space_id, caller).await)
    }

    async fn assign_space_inner(&self, id: Ulid, space_id: Ulid, caller: &Caller) -> Result<Reservation, EngineError> {
        let handle = self.reservation_handle(&id)?;
        let mut guard = handle.write().await;
        lifecycle::ensure_access(&guard, caller)?;
        lifecycle::next_status(&guard, Action::AssignSpace)?;
        match guard.space_id {
            Some(current) if current == space_id => return Ok(guard.clone()),
            Some(_) => {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: guard.status,
                    action: "reassign the space of",
                });
            }
            None => {}
        }
        self.ensure_bookable_space(guard.lot_id, space_id).await?;

        let space_slots = self.slots_handle(IndexKey::space(guard.lot_id, space_id));
        let pool_slots = self.slots_handle(IndexKey::pool(guard.lot_id));
        let mut space_index = space_slots.write().await;
        let mut pool_index = pool_slots.write().await;
        if space_index.len() >= MAX_SLOTS_PER_KEY {
            return Err(EngineError::LimitExceeded("too many live reservations on space"));
        }
        if self.space_handle(&space_id)?.read().await.retired {
            return Err(EngineError::NotFound(space_id));
        }
        space_index.admit(&guard.window)?;

        let mut next = guard.clone();
        next.space_id = Some(space_id);
        self.commit(&mut guard, next).await?;
        pool_index.remove(id);
        space_index.insert(Slot {
            reservation_id: id,
            window: guard.window,
        });
        drop(pool_index);
        drop(space_index);

        tracing::info!(reservation = %id, space = %space_id, "space assigned");
        self.notify_reconciler(space_id, id, Action::AssignSpace, None).await;
        Ok(guard.clone())
    }

    pub async fn check_in(&self, id: Ulid, caller: &Caller) -> Result<Reservation, EngineError> {
        tally("check_in", self.check_in_inner(id, caller).await)
    }

    async fn check_in_inner(&self, id: Ulid, caller: &Caller) -> Result<Reservation, EngineError> {
        let handle = self.reservation_handle(&id)?;
        let mut guard = handle.write().await;
        lifecycle::ensure_access(&guard, caller)?;
        let now = self.now_ms();
        lifecycle::ensure_can_check_in(&guard, now, self.policy.check_in_lead_ms)?;

        let mut next = guard.clone();
        next.status = ReservationStatus::Active;
        next.check_in_at = Some(now);
        self.commit(&mut guard, next).await?;
        tracing::info!(reservation = %id, "checked in");
        if let Some(space_id) = guard.space_id {
            self.notify_reconciler(space_id, id, Action::CheckIn, None).await;
        }
        Ok(guard.clone())
    }

    pub async fn check_out(&self, id: Ulid, caller: &Caller) -> Result<Reservation, EngineError> {
        tally("check_out", self.check_out_inner(id, caller).await)
    }

    async fn check_out_inner(&self, id: Ulid, caller: &Caller) -> Result<Reservation, EngineError> {
        let handle = self.reservation_handle(&id)?;
        let mut guard = handle.write().await;
        lifecycle::ensure_access(&guard, caller)?;
        let checked_in_at = lifecycle::ensure_can_check_out(&guard)?;
        let pricing = self.lot_handle(&guard.lot_id)?.read().await.pricing;

        let now = self.now_ms();
        let minutes = ceil_minutes(now - checked_in_at);
        let amount = lifecycle::checkout_amount(&pricing, minutes);
        let mut next = guard.clone();
        next.status = ReservationStatus::Completed;
        next.check_out_at = Some(now);
        next.actual_duration = Some(minutes);
        next.actual_amount = Some(amount);
        self.commit(&mut guard, next).await?;
        self.release_slot(&guard).await;
        tracing::info!(reservation = %id, minutes, amount, "checked out");
        if let Some(space_id) = guard.space_id {
            let usage = Usage { minutes, amount };
            self.notify_reconciler(space_id, id, Action::CheckOut, Some(usage)).await;
        }
        Ok(guard.clone())
    }

    /// Cancel a pending or confirmed reservation. Callers may cancel their own;
    /// admins may cancel any.
    pub async fn cancel(&self, id: Ulid, actor: Actor, reason: Option<String>) -> Result<Reservation, EngineError> {
        tally("cancel", self.cancel_inner(id, actor, reason).await)
    }

    async fn cancel_inner(&self, id: Ulid, actor: Actor, reason: Option<String>) -> Result<Reservation, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let handle = self.reservation_handle(&id)?;
        let mut guard = handle.write().await;
        if let Actor::Caller(caller) = &actor {
            lifecycle::ensure_access(&guard, caller)?;
        }
        let status = lifecycle::next_status(&guard, Action::Cancel)?;

        let now = self.now_ms();
        let mut next = guard.clone();
        next.status = status;
        next.cancelled_by = Some(cancelling_party(&actor));
        next.cancellation_reason = reason;
        next.refund_amount = refund_amount(&guard, now);
        self.commit(&mut guard, next).await?;
        self.release_slot(&guard).await;
        tracing::info!(
            reservation = %id,
            by = ?guard.cancelled_by,
            refund = guard.refund_amount,
            "reservation cancelled"
        );
        if let Some(space_id) = guard.space_id {
            self.notify_reconciler(space_id, id, Action::Cancel, None).await;
        }
        Ok(guard.clone())
    }

    /// Expire a no-show. Returns false if the reservation is not overdue (already
    /// checked in, cancelled, or not yet past its grace period).
    pub async fn expire(&self, id: Ulid) -> Result<bool, EngineError> {
        let handle = self.reservation_handle(&id)?;
        let mut guard = handle.write().await;
        let now = self.now_ms();
        if !lifecycle::is_overdue(&guard, now, self.policy.check_in_lead_ms) {
            return Ok(false);
        }
        let status = lifecycle::next_status(&guard, Action::Expire)?;
        let mut next = guard.clone();
        next.status = status;
        tally("expire", self.commit(&mut guard, next).await)?;
        self.release_slot(&guard).await;
        metrics::counter!(RESERVATIONS_EXPIRED_TOTAL).increment(1);
        tracing::info!(reservation = %id, "reservation expired");
        if let Some(space_id) = guard.space_id {
            self.notify_reconciler(space_id, id, Action::Expire, None).await;
        }
        Ok(true)
    }

    /// Journal `next`, then publish it through the reservation's guard.
    async fn commit(&self, guard: &mut RwLockWriteGuard<'_, Reservation>, next: Reservation) -> Result<(), EngineError> {
        self.wal_append(&Event::ReservationSaved(next.clone())).await?;
        **guard = next;
        Ok(())
    }

    /// Drop the reservation's claim from its index. Visible to the next admission
    /// as soon as this returns.
    pub(super) async fn release_slot(&self, r: &Reservation) {
        let key = Self::key_for(r);
        let Some(slots) = self.slots.get(&key).map(|e| e.value().clone()) else {
            return;
        };
        slots.write().await.remove(r.id);
    }

    /// Tell the reconciler about a committed transition. The reservation is already
    /// durable, so a failure here is logged and left to the aggregate sync to heal.
    async fn notify_reconciler(&self, space_id: Ulid, reservation_id: Ulid, action: Action, usage: Option<Usage>) {
        let result = match action {
            Action::AssignSpace | Action::ConfirmPayment => {
                self.on_reservation_held(space_id, reservation_id).await
            }
            Action::CheckIn => self.on_reservation_activated(space_id, reservation_id).await,
            Action::CheckOut | Action::Cancel | Action::Expire => {
                self.on_reservation_released(space_id, reservation_id, usage).await
            }
        };
        if let Err(e) = result {
            tracing::error!(
                space = %space_id,
                reservation = %reservation_id,
                "reconciler update after {} failed: {e}",
                action.as_str()
            );
        }
    }
}
