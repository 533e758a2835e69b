use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, audit timestamps only. Stays are calendar dates.
pub type Ms = i64;

/// Half-open stay `[check_in, check_out)`: the guest occupies the room on the
/// nights starting at `check_in` up to, but not including, `check_out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl Stay {
    /// No ordering check here: malformed stays arrive from callers and are
    /// rejected by the availability checker with a proper error.
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        Self { check_in, check_out }
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn is_well_formed(&self) -> bool {
        self.check_in < self.check_out
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }
}

impl fmt::Display for Stay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// ── Booking status ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

/// Every permitted booking transition. Anything not listed is rejected.
const BOOKING_TRANSITIONS: &[(BookingStatus, BookingStatus)] = &[
    (BookingStatus::Pending, BookingStatus::Confirmed),
    (BookingStatus::Pending, BookingStatus::Cancelled),
    (BookingStatus::Confirmed, BookingStatus::Cancelled),
    (BookingStatus::Confirmed, BookingStatus::Completed),
];

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    /// Pending and confirmed bookings occupy the room.
    pub fn holds_room(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        BOOKING_TRANSITIONS.contains(&(self, next))
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            _ => Err(UnknownVariant { kind: "booking status", value: s.to_string() }),
        }
    }
}

// ── Payment status / method ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

const PAYMENT_TRANSITIONS: &[(PaymentStatus, PaymentStatus)] = &[
    (PaymentStatus::Pending, PaymentStatus::Completed),
    (PaymentStatus::Pending, PaymentStatus::Failed),
    (PaymentStatus::Completed, PaymentStatus::Refunded),
];

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Refunded)
    }

    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        PAYMENT_TRANSITIONS.contains(&(self, next))
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            _ => Err(UnknownVariant { kind: "payment status", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    CreditCard,
    Paypal,
    Cash,
    BankTransfer,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::Cash => "cash",
            PaymentMethod::BankTransfer => "bank_transfer",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "credit_card" => Ok(PaymentMethod::CreditCard),
            "paypal" => Ok(PaymentMethod::Paypal),
            "cash" => Ok(PaymentMethod::Cash),
            "bank_transfer" => Ok(PaymentMethod::BankTransfer),
            _ => Err(UnknownVariant { kind: "payment method", value: s.to_string() }),
        }
    }
}

// ── Callers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Customer,
    Manager,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            _ => Err(UnknownVariant { kind: "role", value: s.to_string() }),
        }
    }
}

/// The caller of an engine operation, as issued by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Ulid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn customer(user_id: Ulid) -> Self {
        Self::new(user_id, Role::Customer)
    }

    pub fn manager(user_id: Ulid) -> Self {
        Self::new(user_id, Role::Manager)
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self::new(user_id, Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Managers and admins may read everything.
    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Manager | Role::Admin)
    }

    /// Ownership check: admins bypass it, everyone else must be the owner.
    pub fn may_act_for(&self, owner: Ulid) -> bool {
        self.is_admin() || self.user_id == owner
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role.as_str(), self.user_id)
    }
}

/// Parses the `<role>:<user ulid>` login name used on the wire.
impl FromStr for Actor {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || UnknownVariant { kind: "actor", value: s.to_string() };
        let (role, user) = s.split_once(':').ok_or_else(bad)?;
        let role = role.parse::<Role>().map_err(|_| bad())?;
        let user_id = Ulid::from_string(user).map_err(|_| bad())?;
        Ok(Actor::new(user_id, role))
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub room_id: Ulid,
    pub stay: Stay,
    pub total_price: Decimal,
    pub status: BookingStatus,
    /// The booking's current payment. Authoritative side of the link.
    pub payment_id: Option<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub user_id: Ulid,
    /// Weak back-reference to the booking this payment was made for.
    pub booking_id: Option<Ulid>,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// A room as the catalog describes it. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub hotel_id: Ulid,
    pub number: u32,
    pub price_per_night: Decimal,
    pub capacity: u32,
    pub is_available: bool,
}

/// All bookings of one room. The write lock around a ledger is the room's
/// advisory lock: check-then-insert happens entirely under it.
#[derive(Debug, Clone)]
pub struct RoomLedger {
    pub room_id: Ulid,
    /// Every booking on the room, terminal ones included, sorted by `stay.check_in`.
    pub bookings: Vec<Booking>,
}

impl RoomLedger {
    pub fn new(room_id: Ulid) -> Self {
        Self {
            room_id,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by check-in.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.stay.check_in, |b| b.stay.check_in)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings (any status) whose stay overlaps `query`.
    /// Binary search skips everything checking in on or after `query.check_out`.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.stay.check_in < query.check_out);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.check_out > query.check_in)
    }

    /// Overlapping bookings that still hold the room.
    pub fn active_overlapping(&self, query: &Stay) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.holds_room())
    }
}

/// The event types. A WAL record is the list of events one transaction committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    /// `booking` carries the new room, stay and price.
    BookingRescheduled {
        from_room: Ulid,
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
    BookingPaymentSet {
        id: Ulid,
        room_id: Ulid,
        payment_id: Option<Ulid>,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        room_id: Ulid,
    },
    PaymentCreated {
        payment: Payment,
    },
    PaymentBookingSet {
        id: Ulid,
        booking_id: Option<Ulid>,
        at: Ms,
    },
    PaymentStatusChanged {
        id: Ulid,
        status: PaymentStatus,
        transaction_id: Option<String>,
        at: Ms,
    },
    /// Admin removal. New variants go last: bincode tags by position.
    PaymentDeleted {
        id: Ulid,
    },
}

impl Event {
    /// Rooms whose ledger this event mutates.
    pub fn rooms(&self) -> Vec<Ulid> {
        match self {
            Event::BookingCreated { booking } => vec![booking.room_id],
            Event::BookingRescheduled { from_room, booking } => {
                if *from_room == booking.room_id {
                    vec![booking.room_id]
                } else {
                    vec![*from_room, booking.room_id]
                }
            }
            Event::BookingStatusChanged { room_id, .. }
            | Event::BookingPaymentSet { room_id, .. }
            | Event::BookingDeleted { room_id, .. } => vec![*room_id],
            Event::PaymentCreated { .. }
            | Event::PaymentBookingSet { .. }
            | Event::PaymentStatusChanged { .. }
            | Event::PaymentDeleted { .. } => Vec::new(),
        }
    }

    /// Payment this event mutates, if any.
    pub fn payment_id(&self) -> Option<Ulid> {
        match self {
            Event::PaymentCreated { payment } => Some(payment.id),
            Event::PaymentBookingSet { id, .. }
            | Event::PaymentStatusChanged { id, .. }
            | Event::PaymentDeleted { id } => Some(*id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingRescheduled { .. } => "booking_rescheduled",
            Event::BookingStatusChanged { .. } => "booking_status_changed",
            Event::BookingPaymentSet { .. } => "booking_payment_set",
            Event::BookingDeleted { .. } => "booking_deleted",
            Event::PaymentCreated { .. } => "payment_created",
            Event::PaymentBookingSet { .. } => "payment_booking_set",
            Event::PaymentStatusChanged { .. } => "payment_status_changed",
            Event::PaymentDeleted { .. } => "payment_deleted",
        }
    }
}

// ── Query inputs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub user_id: Option<Ulid>,
    pub room_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentFilter {
    pub user_id: Option<Ulid>,
    pub booking_id: Option<Ulid>,
    pub status: Option<PaymentStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomQuery {
    pub hotel_id: Option<Ulid>,
    pub stay: Stay,
    pub min_capacity: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 6, day).unwrap()
    }

    fn booking(check_in: u32, check_out: u32, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            room_id: Ulid::new(),
            stay: Stay::new(d(check_in), d(check_out)),
            total_price: Decimal::ZERO,
            status,
            payment_id: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn stay_basics() {
        let s = Stay::new(d(1), d(4));
        assert_eq!(s.nights(), 3);
        assert!(s.is_well_formed());
        assert!(!Stay::new(d(4), d(4)).is_well_formed());
        assert!(!Stay::new(d(5), d(4)).is_well_formed());
    }

    #[test]
    fn stay_overlap_is_half_open() {
        let a = Stay::new(d(1), d(3));
        let b = Stay::new(d(2), d(5));
        let c = Stay::new(d(3), d(6));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // checkout day is the next guest's check-in day
    }

    #[test]
    fn booking_transition_table() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        for next in [Pending, Confirmed, Cancelled, Completed] {
            assert!(!Cancelled.can_transition_to(next));
            assert!(!Completed.can_transition_to(next));
        }
    }

    #[test]
    fn payment_transition_table() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Refunded));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Refunded.can_transition_to(Pending));
    }

    #[test]
    fn status_parse() {
        assert_eq!("Confirmed".parse::<BookingStatus>().unwrap(), BookingStatus::Confirmed);
        assert_eq!("canceled".parse::<BookingStatus>().unwrap(), BookingStatus::Cancelled);
        assert!("invalid_status".parse::<BookingStatus>().is_err());
        assert_eq!("bank_transfer".parse::<PaymentMethod>().unwrap(), PaymentMethod::BankTransfer);
        assert!("bitcoin".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn actor_login_name() {
        let id = Ulid::new();
        let actor: Actor = format!("admin:{id}").parse().unwrap();
        assert_eq!(actor, Actor::admin(id));
        assert_eq!(actor.to_string().parse::<Actor>().unwrap(), actor);
        assert!("root".parse::<Actor>().is_err());
        assert!("guest:01ARZ3NDEKTSV4RRFFQ69G5FAV".parse::<Actor>().is_err());
        assert!("customer:not-a-ulid".parse::<Actor>().is_err());
    }

    #[test]
    fn actor_ownership() {
        let owner = Ulid::new();
        assert!(Actor::customer(owner).may_act_for(owner));
        assert!(!Actor::customer(Ulid::new()).may_act_for(owner));
        assert!(!Actor::manager(Ulid::new()).may_act_for(owner));
        assert!(Actor::admin(Ulid::new()).may_act_for(owner));
    }

    #[test]
    fn ledger_ordering() {
        let mut ledger = RoomLedger::new(Ulid::new());
        ledger.insert_booking(booking(20, 22, BookingStatus::Pending));
        ledger.insert_booking(booking(1, 3, BookingStatus::Pending));
        ledger.insert_booking(booking(10, 12, BookingStatus::Confirmed));
        let starts: Vec<_> = ledger.bookings.iter().map(|b| b.stay.check_in).collect();
        assert_eq!(starts, vec![d(1), d(10), d(20)]);
    }

    #[test]
    fn ledger_remove_middle_preserves_order() {
        let mut ledger = RoomLedger::new(Ulid::new());
        let a = booking(1, 2, BookingStatus::Pending);
        let b = booking(3, 4, BookingStatus::Pending);
        let c = booking(5, 6, BookingStatus::Pending);
        let (ida, idb, idc) = (a.id, b.id, c.id);
        ledger.insert_booking(a);
        ledger.insert_booking(b);
        ledger.insert_booking(c);
        assert!(ledger.remove_booking(idb).is_some());
        assert!(ledger.remove_booking(Ulid::new()).is_none());
        assert_eq!(ledger.bookings[0].id, ida);
        assert_eq!(ledger.bookings[1].id, idc);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ledger = RoomLedger::new(Ulid::new());
        ledger.insert_booking(booking(1, 3, BookingStatus::Pending));
        ledger.insert_booking(booking(9, 12, BookingStatus::Pending));
        ledger.insert_booking(booking(20, 22, BookingStatus::Pending));

        let hits: Vec<_> = ledger.overlapping(&Stay::new(d(10), d(15))).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].stay, Stay::new(d(9), d(12)));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ledger = RoomLedger::new(Ulid::new());
        ledger.insert_booking(booking(1, 3, BookingStatus::Confirmed));
        assert_eq!(ledger.overlapping(&Stay::new(d(3), d(5))).count(), 0);
        assert_eq!(ledger.overlapping(&Stay::new(d(2), d(5))).count(), 1);
    }

    #[test]
    fn active_overlapping_ignores_terminal() {
        let mut ledger = RoomLedger::new(Ulid::new());
        ledger.insert_booking(booking(1, 5, BookingStatus::Cancelled));
        ledger.insert_booking(booking(2, 4, BookingStatus::Completed));
        let query = Stay::new(d(1), d(5));
        assert_eq!(ledger.overlapping(&query).count(), 2);
        assert_eq!(ledger.active_overlapping(&query).count(), 0);
    }

    #[test]
    fn event_rooms() {
        let b = booking(1, 2, BookingStatus::Pending);
        let moved = Event::BookingRescheduled { from_room: Ulid::new(), booking: b.clone() };
        assert_eq!(moved.rooms().len(), 2);
        let same = Event::BookingRescheduled { from_room: b.room_id, booking: b.clone() };
        assert_eq!(same.rooms(), vec![b.room_id]);
        let pay = Event::PaymentBookingSet { id: Ulid::new(), booking_id: None, at: 0 };
        assert!(pay.rooms().is_empty());
        assert!(pay.payment_id().is_some());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated { booking: booking(1, 3, BookingStatus::Pending) };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
