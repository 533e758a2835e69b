//! Payment reconciliation: one active payment per booking, amounts that match
//! the booking total, and the settlement outcome driving the booking.

use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::Status;
use super::lifecycle::plan_confirm;
use super::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub id: Ulid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub booking_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Completed,
    Failed,
}

impl SettleOutcome {
    pub fn status(self) -> PaymentStatus {
        match self {
            SettleOutcome::Completed => PaymentStatus::Completed,
            SettleOutcome::Failed => PaymentStatus::Failed,
        }
    }
}

/// What a settlement left behind. `booking` is the linked booking after the
/// transaction, which may be untouched if it was already terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleReceipt {
    pub payment: Payment,
    pub booking: Option<Booking>,
}

pub(super) fn validate_amount(amount: Decimal) -> Result<(), EngineError> {
    if amount <= Decimal::ZERO {
        return Err(EngineError::InvalidAmount(amount));
    }
    if amount > Decimal::from(MAX_AMOUNT) {
        return Err(EngineError::LimitExceeded("amount too large"));
    }
    Ok(())
}

pub(super) fn validate_transaction_id(tx: &str) -> Result<(), EngineError> {
    if tx.is_empty() || tx.len() > MAX_TRANSACTION_ID_LEN {
        return Err(EngineError::LimitExceeded("transaction id length"));
    }
    Ok(())
}

/// Checks shared by create-with-booking and link: ownership, booking still
/// open, no other payment attached, exact amount.
fn check_linkable(
    actor: &Actor,
    payer: Ulid,
    payment_id: Ulid,
    amount: Decimal,
    booking: &Booking,
) -> Result<(), EngineError> {
    if !actor.is_admin() && payer != booking.user_id {
        return Err(EngineError::BookingNotOwned(booking.id));
    }
    if booking.status.is_terminal() {
        return Err(EngineError::AlreadyTerminal {
            id: booking.id,
            status: Status::Booking(booking.status),
        });
    }
    if let Some(existing) = booking.payment_id
        && existing != payment_id
    {
        return Err(EngineError::AlreadyLinked { booking: booking.id, payment: existing });
    }
    if amount != booking.total_price {
        return Err(EngineError::AmountMismatch {
            expected: booking.total_price,
            got: amount,
        });
    }
    Ok(())
}

pub(super) fn plan_create_payment(
    actor: &Actor,
    req: &NewPayment,
    booking: Option<&Booking>,
    now: Ms,
) -> Result<Vec<Event>, EngineError> {
    validate_amount(req.amount)?;
    if let Some(booking) = booking {
        check_linkable(actor, actor.user_id, req.id, req.amount, booking)?;
    }

    let payment = Payment {
        id: req.id,
        user_id: actor.user_id,
        booking_id: booking.map(|b| b.id),
        amount: req.amount,
        method: req.method,
        status: PaymentStatus::Pending,
        transaction_id: None,
        created_at: now,
        updated_at: now,
    };
    let mut events = vec![Event::PaymentCreated { payment }];
    if let Some(booking) = booking {
        events.push(Event::BookingPaymentSet {
            id: booking.id,
            room_id: booking.room_id,
            payment_id: Some(req.id),
            at: now,
        });
    }
    Ok(events)
}

pub(super) fn plan_link(
    actor: &Actor,
    payment: &Payment,
    booking: &Booking,
    now: Ms,
) -> Result<Vec<Event>, EngineError> {
    if !actor.may_act_for(payment.user_id) {
        return Err(EngineError::Forbidden("only the payer or an admin may link a payment"));
    }
    if payment.status != PaymentStatus::Pending {
        return Err(EngineError::AlreadyTerminal {
            id: payment.id,
            status: Status::Payment(payment.status),
        });
    }
    if payment.booking_id == Some(booking.id) && booking.payment_id == Some(payment.id) {
        return Ok(Vec::new());
    }
    if let Some(other) = payment.booking_id
        && other != booking.id
    {
        return Err(EngineError::AlreadyLinked { booking: other, payment: payment.id });
    }
    check_linkable(actor, payment.user_id, payment.id, payment.amount, booking)?;

    Ok(vec![
        Event::PaymentBookingSet {
            id: payment.id,
            booking_id: Some(booking.id),
            at: now,
        },
        Event::BookingPaymentSet {
            id: booking.id,
            room_id: booking.room_id,
            payment_id: Some(payment.id),
            at: now,
        },
    ])
}

/// Record a gateway outcome. Repeating the outcome a payment already has is
/// a no-op; the opposite outcome is refused.
///
/// Completed: confirms a pending booking. A booking that went terminal in
/// the meantime stays as it is.
/// Failed: detaches the payment from the booking so another can be linked.
pub(super) fn plan_settle(
    actor: &Actor,
    payment: &Payment,
    outcome: SettleOutcome,
    transaction_id: Option<String>,
    booking: Option<&Booking>,
    now: Ms,
) -> Result<Vec<Event>, EngineError> {
    if !actor.may_act_for(payment.user_id) {
        return Err(EngineError::Forbidden("only the payer or an admin may settle a payment"));
    }
    let target = outcome.status();
    if payment.status == target {
        return Ok(Vec::new());
    }
    if !payment.status.can_transition_to(target) {
        return Err(EngineError::AlreadyTerminal {
            id: payment.id,
            status: Status::Payment(payment.status),
        });
    }

    let mut events = vec![Event::PaymentStatusChanged {
        id: payment.id,
        status: target,
        transaction_id,
        at: now,
    }];

    let Some(booking) = booking.filter(|b| b.payment_id == Some(payment.id)) else {
        return Ok(events);
    };
    match outcome {
        SettleOutcome::Completed => {
            if !booking.status.is_terminal()
                && let Some(confirm) = plan_confirm(booking, now)?
            {
                events.push(confirm);
            }
        }
        SettleOutcome::Failed => events.push(Event::BookingPaymentSet {
            id: booking.id,
            room_id: booking.room_id,
            payment_id: None,
            at: now,
        }),
    }
    Ok(events)
}

/// Refund a completed payment. The booking it paid for must be cancelled or
/// gone; refunding an already refunded payment is a no-op.
pub(super) fn plan_refund(
    actor: &Actor,
    payment: &Payment,
    booking: Option<&Booking>,
    now: Ms,
) -> Result<Vec<Event>, EngineError> {
    if !actor.may_act_for(payment.user_id) {
        return Err(EngineError::Forbidden("only the payer or an admin may refund a payment"));
    }
    match payment.status {
        PaymentStatus::Refunded => return Ok(Vec::new()),
        PaymentStatus::Completed => {}
        PaymentStatus::Failed => {
            return Err(EngineError::AlreadyTerminal {
                id: payment.id,
                status: Status::Payment(payment.status),
            });
        }
        PaymentStatus::Pending => {
            return Err(EngineError::InvalidTransition {
                id: payment.id,
                from: Status::Payment(payment.status),
                to: Status::Payment(PaymentStatus::Refunded),
            });
        }
    }
    if let Some(booking) = booking
        && booking.status != BookingStatus::Cancelled
    {
        return Err(EngineError::RefundNotAllowed {
            booking: booking.id,
            status: booking.status,
        });
    }
    Ok(vec![Event::PaymentStatusChanged {
        id: payment.id,
        status: PaymentStatus::Refunded,
        transaction_id: None,
        at: now,
    }])
}

/// Admin hard delete of a payment. A booking still pointing at it loses the
/// link in the same transaction; its status is left alone.
pub(super) fn plan_delete_payment(
    actor: &Actor,
    payment: &Payment,
    booking: Option<&Booking>,
    now: Ms,
) -> Result<Vec<Event>, EngineError> {
    if !actor.is_admin() {
        return Err(EngineError::Forbidden("only an admin may delete payments"));
    }
    let mut events = Vec::with_capacity(2);
    if let Some(booking) = booking
        && booking.payment_id == Some(payment.id)
    {
        events.push(Event::BookingPaymentSet {
            id: booking.id,
            room_id: booking.room_id,
            payment_id: None,
            at: now,
        });
    }
    events.push(Event::PaymentDeleted { id: payment.id });
    Ok(events)
}
