mod availability;
mod coordinator;
mod error;
mod lifecycle;
mod payments;
mod queries;
mod retry;

pub use availability::{first_conflict, is_free, price_for, today, validate_stay};
pub use error::{EngineError, ErrorClass, Status, TransientKind};
pub use lifecycle::NewBooking;
pub use payments::{NewPayment, SettleOutcome, SettleReceipt};
pub use retry::LockPolicy;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{
    mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Record, Wal};

pub type SharedLedger = Arc<RwLock<RoomLedger>>;
pub type SharedPayment = Arc<Mutex<Payment>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Record, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every append already queued behind it.
/// 3. One fsync for the whole batch, then answer every sender.
/// A non-append command ends the batch and runs after it is flushed.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { record, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(record, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes never leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let result = wal.append_buffered(&record).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Transactions ─────────────────────────────────────────

/// Locks held by one write transaction: a shared hold on the commit gate,
/// then room ledgers in ascending id order, then payments in ascending id
/// order, plus the id claims it made. Dropping the transaction releases
/// everything.
pub(super) struct Txn {
    _gate: Option<OwnedRwLockReadGuard<()>>,
    rooms: BTreeMap<Ulid, OwnedRwLockWriteGuard<RoomLedger>>,
    payments: BTreeMap<Ulid, OwnedMutexGuard<Payment>>,
    id_claims: Vec<Claim<Ulid>>,
    transaction_claims: Vec<Claim<String>>,
}

impl Txn {
    fn unlocked() -> Self {
        Self {
            _gate: None,
            rooms: BTreeMap::new(),
            payments: BTreeMap::new(),
            id_claims: Vec::new(),
            transaction_claims: Vec::new(),
        }
    }

    /// Keep a claim until the transaction is applied or abandoned.
    pub(super) fn hold_id(&mut self, claim: Claim<Ulid>) {
        self.id_claims.push(claim);
    }

    pub(super) fn hold_transaction(&mut self, claim: Claim<String>) {
        self.transaction_claims.push(claim);
    }

    pub(super) fn room(&self, id: Ulid) -> Result<&RoomLedger, EngineError> {
        self.rooms
            .get(&id)
            .map(|g| &**g)
            .ok_or_else(|| EngineError::Internal(format!("room {id} not locked by transaction")))
    }

    pub(super) fn payment(&self, id: Ulid) -> Result<&Payment, EngineError> {
        self.payments
            .get(&id)
            .map(|g| &**g)
            .ok_or(EngineError::NotFound(id))
    }
}

/// The indexes `apply` writes besides the locked ledgers and payments.
/// Cloned into each commit task.
#[derive(Clone)]
struct Applier {
    payments: Arc<DashMap<Ulid, SharedPayment>>,
    booking_rooms: Arc<DashMap<Ulid, Ulid>>,
    transaction_ids: Arc<DashMap<String, Ulid>>,
    notify: Arc<NotifyHub>,
}

pub struct Engine {
    pub(super) ledgers: DashMap<Ulid, SharedLedger>,
    pub(super) payments: Arc<DashMap<Ulid, SharedPayment>>,
    /// Booking id → room whose ledger holds it.
    pub(super) booking_rooms: Arc<DashMap<Ulid, Ulid>>,
    /// Settlement transaction id → payment.
    pub(super) transaction_ids: Arc<DashMap<String, Ulid>>,
    /// Ids and transaction ids claimed by transactions still in flight.
    pub(super) claimed_ids: Arc<DashSet<Ulid>>,
    pub(super) claimed_transactions: Arc<DashSet<String>>,
    pub(super) catalog: Arc<dyn Catalog>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) policy: LockPolicy,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must run
    /// inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        catalog: Arc<dyn Catalog>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            ledgers: DashMap::new(),
            payments: Arc::new(DashMap::new()),
            booking_rooms: Arc::new(DashMap::new()),
            transaction_ids: Arc::new(DashMap::new()),
            claimed_ids: Arc::new(DashSet::new()),
            claimed_transactions: Arc::new(DashSet::new()),
            catalog,
            wal_tx,
            notify,
            commit_gate: Arc::new(RwLock::new(())),
            policy: LockPolicy::default(),
        };

        let applier = engine.applier();
        let mut replayed = 0usize;
        for record in &records {
            for event in record {
                let mut txn = engine.replay_txn(event);
                applier.apply(&mut txn, event);
            }
            replayed += 1;
        }
        tracing::info!(
            path = %wal_path.display(),
            records = replayed,
            bookings = engine.booking_rooms.len(),
            payments = engine.payments.len(),
            "WAL replayed"
        );

        Ok(engine)
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    fn applier(&self) -> Applier {
        Applier {
            payments: self.payments.clone(),
            booking_rooms: self.booking_rooms.clone(),
            transaction_ids: self.transaction_ids.clone(),
            notify: self.notify.clone(),
        }
    }

    pub(super) fn ledger(&self, room_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(room_id).map(|e| e.value().clone())
    }

    fn ledger_or_create(&self, room_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(room_id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomLedger::new(room_id))))
            .value()
            .clone()
    }

    pub(super) fn payment_handle(&self, id: &Ulid) -> Option<SharedPayment> {
        self.payments.get(id).map(|e| e.value().clone())
    }

    pub(super) fn room_of_booking(&self, id: &Ulid) -> Option<Ulid> {
        self.booking_rooms.get(id).map(|e| *e.value())
    }

    /// Replay runs before anyone else can see the engine, so every try-lock succeeds.
    fn replay_txn(&self, event: &Event) -> Txn {
        let mut txn = Txn::unlocked();
        for room_id in event.rooms() {
            if let Ok(guard) = self.ledger_or_create(room_id).try_write_owned() {
                txn.rooms.insert(room_id, guard);
            }
        }
        if let Some(payment_id) = event.payment_id()
            && let Some(handle) = self.payment_handle(&payment_id)
            && let Ok(guard) = handle.try_lock_owned()
        {
            txn.payments.insert(payment_id, guard);
        }
        txn
    }

    async fn timed<F, T>(&self, fut: F) -> Result<T, EngineError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.policy.lock_timeout, fut)
            .await
            .map_err(|_| EngineError::Transient(TransientKind::LockTimeout))
    }

    /// Open a write transaction over `rooms` and `payments`. Ledgers are
    /// created on first use; an unknown payment is `NotFound`.
    pub(super) async fn begin(&self, rooms: &[Ulid], payments: &[Ulid]) -> Result<Txn, EngineError> {
        let gate = self.timed(self.commit_gate.clone().read_owned()).await?;
        let mut txn = Txn::unlocked();
        txn._gate = Some(gate);

        let mut room_ids = rooms.to_vec();
        room_ids.sort();
        room_ids.dedup();
        for room_id in room_ids {
            let ledger = self.ledger_or_create(room_id);
            let guard = self.timed(ledger.write_owned()).await?;
            txn.rooms.insert(room_id, guard);
        }

        let mut payment_ids = payments.to_vec();
        payment_ids.sort();
        payment_ids.dedup();
        for payment_id in payment_ids {
            let handle = self
                .payment_handle(&payment_id)
                .ok_or(EngineError::NotFound(payment_id))?;
            let guard = self.timed(handle.clone().lock_owned()).await?;
            // Deleted while we waited: the handle is no longer the live payment.
            if !self
                .payment_handle(&payment_id)
                .is_some_and(|live| Arc::ptr_eq(&live, &handle))
            {
                return Err(EngineError::NotFound(payment_id));
            }
            txn.payments.insert(payment_id, guard);
        }
        Ok(txn)
    }

    /// The booking inside a locked room. If the index says it now lives
    /// elsewhere, the caller read a stale room and should retry.
    pub(super) fn locked_booking<'t>(
        &self,
        txn: &'t Txn,
        room_id: Ulid,
        id: Ulid,
    ) -> Result<&'t Booking, EngineError> {
        match txn.room(room_id)?.get(id) {
            Some(booking) => Ok(booking),
            None if self.booking_rooms.contains_key(&id) => {
                Err(EngineError::Transient(TransientKind::StaleRead))
            }
            None => Err(EngineError::NotFound(id)),
        }
    }

    /// WAL append, then apply, then notify. Nothing is applied unless the
    /// whole record is durable.
    ///
    /// The work runs on its own task that owns the transaction, so a caller
    /// that stops waiting cannot leave a durable record unapplied. Locks and
    /// claims are released only after the apply. The transaction is handed
    /// back for reading the committed state.
    pub(super) async fn commit(&self, txn: Txn, events: Vec<Event>) -> Result<Txn, EngineError> {
        if events.is_empty() {
            return Ok(txn);
        }
        let wal_tx = self.wal_tx.clone();
        let applier = self.applier();
        tokio::spawn(async move {
            let mut txn = txn;
            wal_append(&wal_tx, &events).await?;
            for event in &events {
                applier.apply(&mut txn, event);
            }
            for event in &events {
                applier.notify.publish(event);
            }
            Ok::<_, EngineError>(txn)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("commit task failed: {e}")))?
    }

    /// Rewrite the WAL as one creation record per live booking and payment.
    /// Holds the commit gate exclusively, so the snapshot sits between two
    /// whole transactions.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let payments: Vec<SharedPayment> = self.payments.iter().map(|e| e.value().clone()).collect();

        let mut records: Vec<Record> = Vec::with_capacity(self.booking_rooms.len() + payments.len());
        for handle in payments {
            let payment = handle.lock().await.clone();
            records.push(vec![Event::PaymentCreated { payment }]);
        }
        for ledger in ledgers {
            let guard = ledger.read().await;
            for booking in &guard.bookings {
                records.push(vec![Event::BookingCreated { booking: booking.clone() }]);
            }
        }

        let count = records.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(records = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Send one record to the group-commit writer and wait until it is durable.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, record: &[Event]) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            record: record.to_vec(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

impl Applier {
    /// Apply one event to locked state. The caller holds every lock the
    /// event needs.
    fn apply(&self, txn: &mut Txn, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                if let Some(ledger) = txn.rooms.get_mut(&booking.room_id) {
                    ledger.insert_booking(booking.clone());
                }
                self.booking_rooms.insert(booking.id, booking.room_id);
            }
            Event::BookingRescheduled { from_room, booking } => {
                if let Some(ledger) = txn.rooms.get_mut(from_room) {
                    ledger.remove_booking(booking.id);
                }
                if let Some(ledger) = txn.rooms.get_mut(&booking.room_id) {
                    ledger.insert_booking(booking.clone());
                }
                self.booking_rooms.insert(booking.id, booking.room_id);
            }
            Event::BookingStatusChanged { id, room_id, status, at } => {
                if let Some(booking) = txn.rooms.get_mut(room_id).and_then(|l| l.get_mut(*id)) {
                    booking.status = *status;
                    booking.updated_at = *at;
                }
            }
            Event::BookingPaymentSet { id, room_id, payment_id, at } => {
                if let Some(booking) = txn.rooms.get_mut(room_id).and_then(|l| l.get_mut(*id)) {
                    booking.payment_id = *payment_id;
                    booking.updated_at = *at;
                }
            }
            Event::BookingDeleted { id, room_id } => {
                if let Some(ledger) = txn.rooms.get_mut(room_id) {
                    ledger.remove_booking(*id);
                }
                self.booking_rooms.remove(id);
            }
            Event::PaymentCreated { payment } => {
                if let Some(tx) = &payment.transaction_id {
                    self.transaction_ids.insert(tx.clone(), payment.id);
                }
                self.payments
                    .insert(payment.id, Arc::new(Mutex::new(payment.clone())));
            }
            Event::PaymentBookingSet { id, booking_id, at } => {
                if let Some(payment) = txn.payments.get_mut(id) {
                    payment.booking_id = *booking_id;
                    payment.updated_at = *at;
                }
            }
            Event::PaymentStatusChanged { id, status, transaction_id, at } => {
                if let Some(payment) = txn.payments.get_mut(id) {
                    payment.status = *status;
                    payment.updated_at = *at;
                    if let Some(tx) = transaction_id {
                        payment.transaction_id = Some(tx.clone());
                        self.transaction_ids.insert(tx.clone(), *id);
                    }
                }
            }
            Event::PaymentDeleted { id } => {
                if let Some(tx) = txn.payments.get(id).and_then(|p| p.transaction_id.clone()) {
                    self.transaction_ids.remove(&tx);
                }
                self.payments.remove(id);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ClaimRefused {
    /// Another transaction holds the claim right now.
    InFlight,
    /// The key is already committed.
    Committed,
}

/// Releases an in-flight claim on an id when the transaction ends, whether
/// it committed or not. After a commit the id lives in the real indexes.
pub(super) struct Claim<K: std::hash::Hash + Eq> {
    set: Arc<DashSet<K>>,
    key: K,
}

impl<K: std::hash::Hash + Eq + Clone> Claim<K> {
    /// Claim first, then look at the index: a key can never be claimed
    /// twice, nor claimed after it was committed.
    pub(super) fn acquire(
        set: &Arc<DashSet<K>>,
        key: K,
        committed: impl FnOnce(&K) -> bool,
    ) -> Result<Self, ClaimRefused> {
        if !set.insert(key.clone()) {
            return Err(ClaimRefused::InFlight);
        }
        let claim = Claim { set: set.clone(), key };
        if committed(&claim.key) {
            return Err(ClaimRefused::Committed);
        }
        Ok(claim)
    }
}

impl<K: std::hash::Hash + Eq> Drop for Claim<K> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}
