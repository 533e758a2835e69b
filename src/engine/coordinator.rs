use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{BOOKING_TRANSITIONS_TOTAL, PAYMENT_TRANSITIONS_TOTAL};

use super::availability::{now_ms, today};
use super::error::TransientKind;
use super::lifecycle::{plan_cancel, plan_complete, plan_create, plan_delete, plan_reschedule, NewBooking};
use super::payments::{
    plan_create_payment, plan_delete_payment, plan_link, plan_refund, plan_settle, validate_transaction_id, NewPayment,
    SettleOutcome, SettleReceipt,
};
use super::retry::retry_transient;
use super::{Claim, ClaimRefused, Engine, EngineError, Txn};

fn count_transitions(events: &[Event]) {
    for event in events {
        match event {
            Event::BookingCreated { .. } => {
                metrics::counter!(BOOKING_TRANSITIONS_TOTAL, "status" => "pending").increment(1)
            }
            Event::BookingStatusChanged { status, .. } => {
                metrics::counter!(BOOKING_TRANSITIONS_TOTAL, "status" => status.as_str()).increment(1)
            }
            Event::BookingDeleted { .. } => {
                metrics::counter!(BOOKING_TRANSITIONS_TOTAL, "status" => "deleted").increment(1)
            }
            Event::PaymentCreated { .. } => {
                metrics::counter!(PAYMENT_TRANSITIONS_TOTAL, "status" => "pending").increment(1)
            }
            Event::PaymentStatusChanged { status, .. } => {
                metrics::counter!(PAYMENT_TRANSITIONS_TOTAL, "status" => status.as_str()).increment(1)
            }
            Event::PaymentDeleted { .. } => {
                metrics::counter!(PAYMENT_TRANSITIONS_TOTAL, "status" => "deleted").increment(1)
            }
            _ => {}
        }
    }
}

impl Engine {
    async fn commit_counted(&self, txn: Txn, events: Vec<Event>) -> Result<Txn, EngineError> {
        count_transitions(&events);
        self.commit(txn, events).await
    }

    /// A racing transaction with the same id is retried; once one of them
    /// commits the others see `AlreadyExists`.
    fn claim_id(&self, id: Ulid) -> Result<Claim<Ulid>, EngineError> {
        Claim::acquire(&self.claimed_ids, id, |id| {
            self.booking_rooms.contains_key(id) || self.payments.contains_key(id)
        })
        .map_err(|refused| match refused {
            ClaimRefused::InFlight => EngineError::Transient(TransientKind::StaleRead),
            ClaimRefused::Committed => EngineError::AlreadyExists(id),
        })
    }

    fn claim_transaction(&self, tx: &str, payment_id: Ulid) -> Result<Claim<String>, EngineError> {
        Claim::acquire(&self.claimed_transactions, tx.to_string(), |tx| {
            self.transaction_ids
                .get(tx)
                .is_some_and(|owner| *owner.value() != payment_id)
        })
        .map_err(|refused| match refused {
            ClaimRefused::InFlight => EngineError::Transient(TransientKind::StaleRead),
            ClaimRefused::Committed => EngineError::DuplicateTransaction(tx.to_string()),
        })
    }

    /// Room lookup for a booking outside any lock. Verified again under the lock.
    fn booking_room(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.room_of_booking(&id).ok_or(EngineError::NotFound(id))
    }

    /// Copy of a payment taken under its lock, used to find the rooms a
    /// payment transaction must lock first.
    async fn peek_payment(&self, id: Ulid) -> Result<Payment, EngineError> {
        let handle = self.payment_handle(&id).ok_or(EngineError::NotFound(id))?;
        let payment = tokio::time::timeout(self.policy.lock_timeout, handle.lock())
            .await
            .map_err(|_| EngineError::Transient(TransientKind::LockTimeout))?;
        Ok(payment.clone())
    }

    // ── Bookings ─────────────────────────────────────────

    /// Lock the room, check availability, create the booking in `pending`.
    pub async fn create_booking(&self, actor: &Actor, req: NewBooking) -> Result<Booking, EngineError> {
        retry_transient(&self.policy, "create_booking", || {
            self.try_create_booking(*actor, req.clone())
        })
        .await
    }

    async fn try_create_booking(&self, actor: Actor, req: NewBooking) -> Result<Booking, EngineError> {
        let room = self
            .catalog
            .get_room(req.room_id)
            .await
            .ok_or(EngineError::RoomNotFound(req.room_id))?;
        let claim = self.claim_id(req.id)?;

        let mut txn = self.begin(&[room.id], &[]).await?;
        txn.hold_id(claim);
        let booking = plan_create(&actor, &req, &room, txn.room(room.id)?, today(), now_ms())?;
        self.commit_counted(txn, vec![Event::BookingCreated { booking: booking.clone() }])
            .await?;
        info!(booking = %booking.id, room = %room.id, stay = %booking.stay, user = %actor.user_id, "booking created");
        Ok(booking)
    }

    pub async fn cancel_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        retry_transient(&self.policy, "cancel_booking", || self.try_cancel_booking(*actor, id)).await
    }

    async fn try_cancel_booking(&self, actor: Actor, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self.booking_room(id)?;
        let txn = self.begin(&[room_id], &[]).await?;
        let event = plan_cancel(&actor, self.locked_booking(&txn, room_id, id)?, now_ms())?;
        let txn = self.commit_counted(txn, vec![event]).await?;
        info!(booking = %id, by = %actor, "booking cancelled");
        Ok(self.locked_booking(&txn, room_id, id)?.clone())
    }

    /// Move a pending, unpaid booking to new dates, optionally to another
    /// room. Both rooms are locked in id order.
    pub async fn reschedule_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        room_id: Option<Ulid>,
        stay: Stay,
    ) -> Result<Booking, EngineError> {
        retry_transient(&self.policy, "reschedule_booking", || {
            self.try_reschedule_booking(*actor, id, room_id, stay)
        })
        .await
    }

    async fn try_reschedule_booking(
        &self,
        actor: Actor,
        id: Ulid,
        room_id: Option<Ulid>,
        stay: Stay,
    ) -> Result<Booking, EngineError> {
        let from = self.booking_room(id)?;
        let to = room_id.unwrap_or(from);
        let room = self
            .catalog
            .get_room(to)
            .await
            .ok_or(EngineError::RoomNotFound(to))?;

        let txn = self.begin(&[from, to], &[]).await?;
        let current = self.locked_booking(&txn, from, id)?;
        let moved = plan_reschedule(&actor, current, &room, txn.room(to)?, stay, today(), now_ms())?;
        self.commit_counted(
            txn,
            vec![Event::BookingRescheduled { from_room: from, booking: moved.clone() }],
        )
        .await?;
        info!(booking = %id, from_room = %from, to_room = %to, stay = %stay, "booking rescheduled");
        Ok(moved)
    }

    /// Admin hard delete. Clears the weak back-reference on the linked payment
    /// in the same transaction.
    pub async fn delete_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only an admin may delete bookings"));
        }
        retry_transient(&self.policy, "delete_booking", || self.try_delete_booking(*actor, id)).await
    }

    async fn try_delete_booking(&self, actor: Actor, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self.booking_room(id)?;
        // Payment locks come after room locks, so read the payment id under a
        // shared lock first and verify it once both are held.
        let payment_id = match self.ledger(&room_id) {
            Some(ledger) => self.timed(ledger.read()).await?.get(id).and_then(|b| b.payment_id),
            None => None,
        };
        let locked_payments: Vec<Ulid> = payment_id
            .filter(|p| self.payments.contains_key(p))
            .into_iter()
            .collect();
        let txn = self.begin(&[room_id], &locked_payments).await?;

        let booking = self.locked_booking(&txn, room_id, id)?.clone();
        if booking.payment_id != payment_id {
            return Err(EngineError::Transient(TransientKind::StaleRead));
        }
        let mut events = vec![plan_delete(&actor, &booking)?];
        if let Some(pid) = payment_id
            && let Ok(payment) = txn.payment(pid)
            && payment.booking_id == Some(id)
        {
            events.push(Event::PaymentBookingSet { id: pid, booking_id: None, at: now_ms() });
        }
        if !booking.status.is_terminal() {
            warn!(booking = %id, status = %booking.status, by = %actor, "deleting active booking");
        }
        self.commit_counted(txn, events).await?;
        info!(booking = %id, by = %actor, "booking deleted");
        Ok(booking)
    }

    /// Sweeper entry point: confirmed stays whose check-out has passed become
    /// `completed`.
    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        retry_transient(&self.policy, "complete_booking", || self.try_complete_booking(id)).await
    }

    async fn try_complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self.booking_room(id)?;
        let txn = self.begin(&[room_id], &[]).await?;
        let event = plan_complete(self.locked_booking(&txn, room_id, id)?, today(), now_ms())?;
        let txn = self.commit_counted(txn, vec![event]).await?;
        debug!(booking = %id, "booking completed");
        Ok(self.locked_booking(&txn, room_id, id)?.clone())
    }

    // ── Payments ─────────────────────────────────────────

    /// Create a pending payment, optionally linked to a booking in the same
    /// transaction.
    pub async fn create_payment(&self, actor: &Actor, req: NewPayment) -> Result<Payment, EngineError> {
        retry_transient(&self.policy, "create_payment", || {
            self.try_create_payment(*actor, req.clone())
        })
        .await
    }

    async fn try_create_payment(&self, actor: Actor, req: NewPayment) -> Result<Payment, EngineError> {
        let claim = self.claim_id(req.id)?;
        let room_id = req.booking_id.map(|b| self.booking_room(b)).transpose()?;
        let mut txn = self.begin(room_id.as_slice(), &[]).await?;
        txn.hold_id(claim);

        let booking = match (req.booking_id, room_id) {
            (Some(b), Some(r)) => Some(self.locked_booking(&txn, r, b)?.clone()),
            _ => None,
        };
        let events = plan_create_payment(&actor, &req, booking.as_ref(), now_ms())?;
        drop(self.commit_counted(txn, events).await?);

        info!(payment = %req.id, amount = %req.amount, booking = ?req.booking_id, "payment created");
        let handle = self.payment_handle(&req.id).ok_or(EngineError::NotFound(req.id))?;
        let payment = handle.lock().await.clone();
        Ok(payment)
    }

    /// Attach an existing pending payment to a booking.
    pub async fn link_payment(
        &self,
        actor: &Actor,
        payment_id: Ulid,
        booking_id: Ulid,
    ) -> Result<Payment, EngineError> {
        retry_transient(&self.policy, "link_payment", || {
            self.try_link_payment(*actor, payment_id, booking_id)
        })
        .await
    }

    async fn try_link_payment(
        &self,
        actor: Actor,
        payment_id: Ulid,
        booking_id: Ulid,
    ) -> Result<Payment, EngineError> {
        let room_id = self.booking_room(booking_id)?;
        let txn = self.begin(&[room_id], &[payment_id]).await?;
        let booking = self.locked_booking(&txn, room_id, booking_id)?;
        let events = plan_link(&actor, txn.payment(payment_id)?, booking, now_ms())?;
        let txn = self.commit_counted(txn, events).await?;
        info!(payment = %payment_id, booking = %booking_id, "payment linked");
        Ok(txn.payment(payment_id)?.clone())
    }

    /// Record the gateway outcome of a payment and drive the linked booking.
    pub async fn settle_payment(
        &self,
        actor: &Actor,
        payment_id: Ulid,
        outcome: SettleOutcome,
        transaction_id: Option<String>,
    ) -> Result<SettleReceipt, EngineError> {
        if let Some(tx) = &transaction_id {
            validate_transaction_id(tx)?;
        }
        retry_transient(&self.policy, "settle_payment", || {
            self.try_settle_payment(*actor, payment_id, outcome, transaction_id.clone())
        })
        .await
    }

    async fn try_settle_payment(
        &self,
        actor: Actor,
        payment_id: Ulid,
        outcome: SettleOutcome,
        transaction_id: Option<String>,
    ) -> Result<SettleReceipt, EngineError> {
        let (mut txn, room) = self.begin_for_payment(payment_id).await?;

        if let Some(tx) = transaction_id.as_deref() {
            let claim = self.claim_transaction(tx, payment_id)?;
            txn.hold_transaction(claim);
        }

        let payment = txn.payment(payment_id)?;
        let booking = match (payment.booking_id, room) {
            (Some(b), Some(r)) => txn.room(r)?.get(b),
            _ => None,
        };
        let events = plan_settle(&actor, payment, outcome, transaction_id, booking, now_ms())?;
        if events.is_empty() {
            debug!(payment = %payment_id, ?outcome, "settlement repeated; nothing to do");
        } else if let Some(b) = booking
            && b.status.is_terminal()
            && outcome == SettleOutcome::Completed
        {
            warn!(payment = %payment_id, booking = %b.id, status = %b.status, "payment completed for a closed booking; booking left as is");
        }
        let changed = !events.is_empty();
        let txn = self.commit_counted(txn, events).await?;

        let payment = txn.payment(payment_id)?.clone();
        let booking = match (payment.booking_id, room) {
            (Some(b), Some(r)) => txn.room(r)?.get(b).cloned(),
            _ => None,
        };
        if changed {
            info!(payment = %payment_id, status = %payment.status, booking = ?booking.as_ref().map(|b| (b.id, b.status)), "payment settled");
        }
        Ok(SettleReceipt { payment, booking })
    }

    /// Refund a completed payment whose booking is cancelled or gone.
    pub async fn refund_payment(&self, actor: &Actor, payment_id: Ulid) -> Result<Payment, EngineError> {
        retry_transient(&self.policy, "refund_payment", || self.try_refund_payment(*actor, payment_id))
            .await
    }

    async fn try_refund_payment(&self, actor: Actor, payment_id: Ulid) -> Result<Payment, EngineError> {
        let (txn, room) = self.begin_for_payment(payment_id).await?;
        let payment = txn.payment(payment_id)?;
        let booking = match (payment.booking_id, room) {
            (Some(b), Some(r)) => txn.room(r)?.get(b),
            _ => None,
        };
        let events = plan_refund(&actor, payment, booking, now_ms())?;
        let txn = self.commit_counted(txn, events).await?;
        info!(payment = %payment_id, by = %actor, "payment refunded");
        Ok(txn.payment(payment_id)?.clone())
    }

    /// Admin hard delete. Clears the linked booking's payment reference in the
    /// same transaction.
    pub async fn delete_payment(&self, actor: &Actor, payment_id: Ulid) -> Result<Payment, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only an admin may delete payments"));
        }
        retry_transient(&self.policy, "delete_payment", || self.try_delete_payment(*actor, payment_id))
            .await
    }

    async fn try_delete_payment(&self, actor: Actor, payment_id: Ulid) -> Result<Payment, EngineError> {
        let (txn, room) = self.begin_for_payment(payment_id).await?;
        let payment = txn.payment(payment_id)?.clone();
        let booking = match (payment.booking_id, room) {
            (Some(b), Some(r)) => txn.room(r)?.get(b),
            _ => None,
        };
        if let Some(b) = booking
            && b.payment_id == Some(payment_id)
            && b.status == BookingStatus::Confirmed
        {
            warn!(payment = %payment_id, booking = %b.id, "deleting the payment behind a confirmed booking");
        }
        let events = plan_delete_payment(&actor, &payment, booking, now_ms())?;
        self.commit_counted(txn, events).await?;
        info!(payment = %payment_id, by = %actor, "payment deleted");
        Ok(payment)
    }

    /// Lock the room of the payment's booking (if any) and then the payment.
    /// Fails with a stale read if the link moved in between.
    async fn begin_for_payment(&self, payment_id: Ulid) -> Result<(Txn, Option<Ulid>), EngineError> {
        let seen = self.peek_payment(payment_id).await?;
        let room = seen.booking_id.and_then(|b| self.room_of_booking(&b));
        let txn = self.begin(room.as_slice(), &[payment_id]).await?;

        let payment = txn.payment(payment_id)?;
        if payment.booking_id != seen.booking_id {
            return Err(EngineError::Transient(TransientKind::StaleRead));
        }
        if let Some(b) = payment.booking_id
            && self.room_of_booking(&b) != room
        {
            return Err(EngineError::Transient(TransientKind::StaleRead));
        }
        Ok((txn, room))
    }
}
