use std::cmp::Reverse;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{is_free, today, validate_stay};
use super::{Engine, EngineError, SharedLedger, SharedPayment};

impl Engine {
    /// Can `room_id` take `stay`? `exclude` ignores one booking, as a
    /// reschedule of that booking would. A room switched off in the catalog
    /// is never available.
    pub async fn is_available(
        &self,
        room_id: Ulid,
        stay: Stay,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        validate_stay(&stay, today())?;
        let room = self
            .catalog
            .get_room(room_id)
            .await
            .ok_or(EngineError::RoomNotFound(room_id))?;
        if !room.is_available {
            return Ok(false);
        }
        match self.ledger(&room_id) {
            Some(ledger) => Ok(is_free(&*ledger.read().await, &stay, exclude)),
            None => Ok(true),
        }
    }

    /// Bookable rooms free for the whole stay, ordered by `(hotel_id, number)`.
    pub async fn query_available_rooms(&self, query: &RoomQuery) -> Result<Vec<RoomInfo>, EngineError> {
        validate_stay(&query.stay, today())?;
        let mut rooms: Vec<RoomInfo> = self
            .catalog
            .list_rooms()
            .await
            .into_iter()
            .filter(|r| r.is_available)
            .filter(|r| query.hotel_id.is_none_or(|h| r.hotel_id == h))
            .filter(|r| query.min_capacity.is_none_or(|c| r.capacity >= c))
            .collect();

        let mut free = Vec::with_capacity(rooms.len());
        for room in rooms.drain(..) {
            let open = match self.ledger(&room.id) {
                Some(ledger) => is_free(&*ledger.read().await, &query.stay, None),
                None => true,
            };
            if open {
                free.push(room);
            }
        }
        free.sort_by(|a, b| (a.hotel_id, a.number).cmp(&(b.hotel_id, b.number)));
        Ok(free)
    }

    /// Confirmed bookings whose check-out is on or before `today`.
    pub async fn collect_finished_stays(&self, today: chrono::NaiveDate) -> Vec<Ulid> {
        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut finished = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            finished.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Confirmed && b.stay.check_out <= today)
                    .map(|b| b.id),
            );
        }
        finished
    }

    pub async fn get_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self.room_of_booking(&id).ok_or(EngineError::NotFound(id))?;
        let ledger = self.ledger(&room_id).ok_or(EngineError::NotFound(id))?;
        let booking = ledger
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if !actor.is_staff() && booking.user_id != actor.user_id {
            return Err(EngineError::Forbidden("booking belongs to another user"));
        }
        Ok(booking)
    }

    /// Newest first. Customers only ever see their own bookings.
    pub async fn list_bookings(&self, actor: &Actor, filter: &BookingFilter) -> Vec<Booking> {
        if !actor.is_staff() && filter.user_id.is_some_and(|u| u != actor.user_id) {
            return Vec::new();
        }
        let owner = if actor.is_staff() { filter.user_id } else { Some(actor.user_id) };

        let ledgers: Vec<SharedLedger> = match filter.room_id {
            Some(room_id) => self.ledger(&room_id).into_iter().collect(),
            None => self.ledgers.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| owner.is_none_or(|u| b.user_id == u))
                    .filter(|b| filter.status.is_none_or(|s| b.status == s))
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (Reverse(b.created_at), Reverse(b.id)));
        out.truncate(MAX_LIST_ROWS);
        out
    }

    pub async fn get_payment(&self, actor: &Actor, id: Ulid) -> Result<Payment, EngineError> {
        let handle = self.payment_handle(&id).ok_or(EngineError::NotFound(id))?;
        let payment = handle.lock().await.clone();
        if !actor.is_staff() && payment.user_id != actor.user_id {
            return Err(EngineError::Forbidden("payment belongs to another user"));
        }
        Ok(payment)
    }

    /// Newest first. Customers only ever see their own payments.
    pub async fn list_payments(&self, actor: &Actor, filter: &PaymentFilter) -> Vec<Payment> {
        if !actor.is_staff() && filter.user_id.is_some_and(|u| u != actor.user_id) {
            return Vec::new();
        }
        let owner = if actor.is_staff() { filter.user_id } else { Some(actor.user_id) };

        let handles: Vec<SharedPayment> = self.payments.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for handle in handles {
            let payment = handle.lock().await;
            if owner.is_none_or(|u| payment.user_id == u)
                && filter.booking_id.is_none_or(|b| payment.booking_id == Some(b))
                && filter.status.is_none_or(|s| payment.status == s)
            {
                out.push(payment.clone());
            }
        }
        out.sort_by_key(|p| (Reverse(p.created_at), Reverse(p.id)));
        out.truncate(MAX_LIST_ROWS);
        out
    }

    pub fn booking_count(&self) -> usize {
        self.booking_rooms.len()
    }

    pub fn payment_count(&self) -> usize {
        self.payments.len()
    }
}
