use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// The UTC calendar date right now. Stays carry no timezone, so "today" is
/// always taken in UTC.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Range checks shared by every operation that takes a stay.
pub fn validate_stay(stay: &Stay, today: NaiveDate) -> Result<(), EngineError> {
    if !stay.is_well_formed() {
        return Err(EngineError::RangeInvalid("check_out must be after check_in"));
    }
    if stay.check_in < today {
        return Err(EngineError::RangeInvalid("check_in is in the past"));
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    if (stay.check_in - today).num_days() > MAX_BOOKING_HORIZON_DAYS {
        return Err(EngineError::LimitExceeded("check_in too far ahead"));
    }
    Ok(())
}

/// First active booking on the ledger overlapping `stay`, ignoring `exclude`.
pub fn first_conflict(ledger: &RoomLedger, stay: &Stay, exclude: Option<Ulid>) -> Option<Ulid> {
    ledger
        .active_overlapping(stay)
        .find(|b| Some(b.id) != exclude)
        .map(|b| b.id)
}

/// True when no active booking other than `exclude` overlaps `stay`.
pub fn is_free(ledger: &RoomLedger, stay: &Stay, exclude: Option<Ulid>) -> bool {
    first_conflict(ledger, stay, exclude).is_none()
}

/// Writer-side check, run while the caller holds the room's write lock.
pub(super) fn ensure_free(
    ledger: &RoomLedger,
    stay: &Stay,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match first_conflict(ledger, stay, exclude) {
        None => Ok(()),
        Some(conflicting) => Err(EngineError::RoomUnavailable {
            room_id: ledger.room_id,
            conflicting: Some(conflicting),
        }),
    }
}

/// Catalog flag check: a room switched off in the catalog takes no new stays.
pub(super) fn ensure_bookable(room: &RoomInfo) -> Result<(), EngineError> {
    if room.is_available {
        Ok(())
    } else {
        Err(EngineError::RoomUnavailable {
            room_id: room.id,
            conflicting: None,
        })
    }
}

/// Flat nightly rate times nights. Bounds are checked by the caller.
pub fn price_for(room: &RoomInfo, stay: &Stay) -> Result<Decimal, EngineError> {
    room.price_per_night
        .checked_mul(Decimal::from(stay.nights()))
        .ok_or(EngineError::LimitExceeded("amount too large"))
}
