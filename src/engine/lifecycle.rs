//! Booking state machine. Every function here validates against a booking
//! snapshot taken under its room lock and returns the events to commit; none
//! of them mutate anything.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{ensure_bookable, ensure_free, price_for, validate_stay};
use super::error::Status;
use super::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub stay: Stay,
    /// Overrides the nightly-rate price. Managers and admins only.
    pub total_price: Option<Decimal>,
}

pub(super) fn validate_price(price: Decimal) -> Result<(), EngineError> {
    if price.is_sign_negative() {
        return Err(EngineError::InvalidAmount(price));
    }
    if price > Decimal::from(MAX_AMOUNT) {
        return Err(EngineError::LimitExceeded("amount too large"));
    }
    Ok(())
}

/// The catalog rate for a stay, held to the same bounds as an explicit
/// price so the booking can always be paid in full.
fn nightly_total(room: &RoomInfo, stay: &Stay) -> Result<Decimal, EngineError> {
    let price = price_for(room, stay)?;
    validate_price(price)?;
    Ok(price)
}

fn transition(booking: &Booking, next: BookingStatus, at: Ms) -> Result<Event, EngineError> {
    if booking.status.can_transition_to(next) {
        return Ok(Event::BookingStatusChanged {
            id: booking.id,
            room_id: booking.room_id,
            status: next,
            at,
        });
    }
    if booking.status.is_terminal() {
        Err(EngineError::AlreadyTerminal {
            id: booking.id,
            status: Status::Booking(booking.status),
        })
    } else {
        Err(EngineError::InvalidTransition {
            id: booking.id,
            from: Status::Booking(booking.status),
            to: Status::Booking(next),
        })
    }
}

pub(super) fn plan_create(
    actor: &Actor,
    req: &NewBooking,
    room: &RoomInfo,
    ledger: &RoomLedger,
    today: NaiveDate,
    now: Ms,
) -> Result<Booking, EngineError> {
    validate_stay(&req.stay, today)?;
    ensure_bookable(room)?;
    let total_price = match req.total_price {
        Some(price) => {
            if !actor.is_staff() {
                return Err(EngineError::Forbidden("explicit price requires manager or admin"));
            }
            validate_price(price)?;
            price
        }
        None => nightly_total(room, &req.stay)?,
    };
    if ledger.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
        return Err(EngineError::LimitExceeded("too many bookings on room"));
    }
    ensure_free(ledger, &req.stay, None)?;

    Ok(Booking {
        id: req.id,
        user_id: actor.user_id,
        room_id: room.id,
        stay: req.stay,
        total_price,
        status: BookingStatus::Pending,
        payment_id: None,
        created_at: now,
        updated_at: now,
    })
}

pub(super) fn plan_cancel(actor: &Actor, booking: &Booking, now: Ms) -> Result<Event, EngineError> {
    if !actor.may_act_for(booking.user_id) {
        return Err(EngineError::Forbidden("only the owner or an admin may cancel"));
    }
    transition(booking, BookingStatus::Cancelled, now)
}

/// `None` when the booking is already confirmed: confirming twice is a no-op.
pub(super) fn plan_confirm(booking: &Booking, now: Ms) -> Result<Option<Event>, EngineError> {
    if booking.status == BookingStatus::Confirmed {
        return Ok(None);
    }
    transition(booking, BookingStatus::Confirmed, now).map(Some)
}

pub(super) fn plan_complete(booking: &Booking, today: NaiveDate, now: Ms) -> Result<Event, EngineError> {
    if booking.status == BookingStatus::Confirmed && booking.stay.check_out > today {
        return Err(EngineError::RangeInvalid("stay has not ended yet"));
    }
    transition(booking, BookingStatus::Completed, now)
}

/// Move a pending, unpaid booking to new dates and possibly another room.
/// `target` is the ledger of the destination room; when the room does not
/// change it still contains the booking itself, which is excluded.
pub(super) fn plan_reschedule(
    actor: &Actor,
    booking: &Booking,
    room: &RoomInfo,
    target: &RoomLedger,
    stay: Stay,
    today: NaiveDate,
    now: Ms,
) -> Result<Booking, EngineError> {
    if !actor.may_act_for(booking.user_id) {
        return Err(EngineError::Forbidden("only the owner or an admin may reschedule"));
    }
    if booking.status.is_terminal() {
        return Err(EngineError::AlreadyTerminal {
            id: booking.id,
            status: Status::Booking(booking.status),
        });
    }
    if let Some(payment) = booking.payment_id {
        return Err(EngineError::AlreadyLinked { booking: booking.id, payment });
    }
    if booking.status != BookingStatus::Pending {
        return Err(EngineError::InvalidTransition {
            id: booking.id,
            from: Status::Booking(booking.status),
            to: Status::Booking(BookingStatus::Pending),
        });
    }
    validate_stay(&stay, today)?;
    ensure_bookable(room)?;
    if room.id != booking.room_id && target.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
        return Err(EngineError::LimitExceeded("too many bookings on room"));
    }
    ensure_free(target, &stay, Some(booking.id))?;
    let total_price = nightly_total(room, &stay)?;

    Ok(Booking {
        room_id: room.id,
        stay,
        total_price,
        updated_at: now,
        ..booking.clone()
    })
}

pub(super) fn plan_delete(actor: &Actor, booking: &Booking) -> Result<Event, EngineError> {
    if !actor.is_admin() {
        return Err(EngineError::Forbidden("only an admin may delete bookings"));
    }
    Ok(Event::BookingDeleted {
        id: booking.id,
        room_id: booking.room_id,
    })
}
