use crate::limits::{FULL_REFUND_BEFORE_MS, HALF_REFUND_BEFORE_MS};
use crate::model::*;

/// Refund owed on cancellation at `now`. Nothing is owed unless the payment was captured.
pub fn refund_amount(r: &Reservation, now: Ms) -> u64 {
    if r.payment.status != PaymentStatus::Paid {
        return 0;
    }
    let amount = r.payment.amount;
    if now < r.window.start - FULL_REFUND_BEFORE_MS {
        amount
    } else if now < r.window.start - HALF_REFUND_BEFORE_MS {
        amount / 2
    } else {
        0
    }
}

/// Who is recorded as cancelling. An admin counts as admin even on their own reservation.
pub fn cancelling_party(actor: &Actor) -> CancelledBy {
    match actor {
        Actor::System => CancelledBy::System,
        Actor::Caller(c) if c.is_admin() => CancelledBy::Admin,
        Actor::Caller(_) => CancelledBy::User,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn paid(amount: u64, start: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            owner: Ulid::new(),
            lot_id: Ulid::new(),
            space_id: None,
            window: Span::new(start, start + HOUR),
            status: ReservationStatus::Confirmed,
            payment: Payment {
                method: PaymentMethod::CreditCard,
                amount,
                currency: "JPY".into(),
                status: PaymentStatus::Paid,
                transaction_id: Some("tx-1".into()),
                paid_at: Some(0),
            },
            vehicle: Vehicle::plate("ABC-123"),
            created_at: 0,
            check_in_at: None,
            check_out_at: None,
            actual_duration: None,
            actual_amount: None,
            cancelled_by: None,
            cancellation_reason: None,
            refund_amount: 0,
        }
    }

    #[test]
    fn full_refund_a_day_ahead() {
        let now = 1_000 * DAY;
        assert_eq!(refund_amount(&paid(1001, now + 25 * HOUR), now), 1001);
    }

    #[test]
    fn half_refund_rounds_down() {
        let now = 1_000 * DAY;
        assert_eq!(refund_amount(&paid(1001, now + 2 * HOUR), now), 500);
    }

    #[test]
    fn no_refund_inside_the_last_hour() {
        let now = 1_000 * DAY;
        assert_eq!(refund_amount(&paid(1001, now + 30 * MINUTE), now), 0);
        // Boundaries are exclusive
        assert_eq!(refund_amount(&paid(1000, now + HOUR), now), 0);
        assert_eq!(refund_amount(&paid(1000, now + 24 * HOUR), now), 500);
    }

    #[test]
    fn unpaid_is_never_refunded() {
        let now = 1_000 * DAY;
        let mut r = paid(1000, now + 48 * HOUR);
        r.payment.status = PaymentStatus::Pending;
        assert_eq!(refund_amount(&r, now), 0);
    }

    #[test]
    fn cancelling_party_by_actor() {
        let r = paid(100, 0);
        assert_eq!(cancelling_party(&Actor::System), CancelledBy::System);
        assert_eq!(cancelling_party(&Actor::Caller(Caller::user(r.owner))), CancelledBy::User);
        let admin = Caller {
            user_id: Ulid::new(),
            role: Role::Admin,
        };
        assert_eq!(cancelling_party(&Actor::Caller(admin)), CancelledBy::Admin);
        // Own reservation, still recorded as admin
        let own = Caller {
            user_id: r.owner,
            role: Role::Admin,
        };
        assert_eq!(cancelling_party(&Actor::Caller(own)), CancelledBy::Admin);
    }
}
