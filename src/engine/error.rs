use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::{BookingStatus, PaymentStatus};

/// Coarse error classes, one SQLSTATE each on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Conflict,
    Authorization,
    NotFound,
    Transient,
    Internal,
}

/// Either side of a transition that was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Booking(BookingStatus),
    Payment(PaymentStatus),
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Booking(s) => write!(f, "booking {s}"),
            Status::Payment(s) => write!(f, "payment {s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    LockTimeout,
    StaleRead,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid date range: {0}")]
    RangeInvalid(&'static str),
    #[error("invalid amount: {0}")]
    InvalidAmount(Decimal),
    #[error("amount mismatch: booking total is {expected}, payment is {got}")]
    AmountMismatch { expected: Decimal, got: Decimal },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("invalid actor: {0}")]
    InvalidActor(String),

    #[error("room unavailable: {room_id}")]
    RoomUnavailable { room_id: Ulid, conflicting: Option<Ulid> },
    #[error("booking {booking} already linked to payment {payment}")]
    AlreadyLinked { booking: Ulid, payment: Ulid },
    #[error("{id} is already {status}")]
    AlreadyTerminal { id: Ulid, status: Status },
    #[error("{id}: {from} cannot move to {to}")]
    InvalidTransition { id: Ulid, from: Status, to: Status },
    #[error("payment still backs booking {booking} ({status})")]
    RefundNotAllowed { booking: Ulid, status: BookingStatus },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("duplicate transaction id: {0}")]
    DuplicateTransaction(String),
    #[error("gave up after {0} attempts under contention")]
    Contention(u32),

    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("booking {0} does not belong to the payer")]
    BookingNotOwned(Ulid),

    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("room not found: {0}")]
    RoomNotFound(Ulid),

    #[error("transient store error: {0:?}")]
    Transient(TransientKind),

    #[error("WAL error: {0}")]
    WalError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::RangeInvalid(_)
            | EngineError::InvalidAmount(_)
            | EngineError::AmountMismatch { .. }
            | EngineError::LimitExceeded(_)
            | EngineError::InvalidActor(_) => ErrorClass::Validation,
            EngineError::RoomUnavailable { .. }
            | EngineError::AlreadyLinked { .. }
            | EngineError::AlreadyTerminal { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::RefundNotAllowed { .. }
            | EngineError::AlreadyExists(_)
            | EngineError::DuplicateTransaction(_)
            | EngineError::Contention(_) => ErrorClass::Conflict,
            EngineError::Forbidden(_) | EngineError::BookingNotOwned(_) => {
                ErrorClass::Authorization
            }
            EngineError::NotFound(_) | EngineError::RoomNotFound(_) => ErrorClass::NotFound,
            EngineError::Transient(_) => ErrorClass::Transient,
            EngineError::WalError(_) | EngineError::Internal(_) => ErrorClass::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::RoomUnavailable { .. } => "23P01",
            EngineError::AlreadyExists(_) | EngineError::DuplicateTransaction(_) => "23505",
            EngineError::Contention(_) => "40001",
            _ => match self.class() {
                ErrorClass::Validation => "22023",
                ErrorClass::Conflict => "55000",
                ErrorClass::Authorization => "42501",
                ErrorClass::NotFound => "P0002",
                ErrorClass::Transient => "40001",
                ErrorClass::Internal => "XX000",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_by_class() {
        assert_eq!(EngineError::RangeInvalid("x").sqlstate(), "22023");
        assert_eq!(
            EngineError::RoomUnavailable { room_id: Ulid::nil(), conflicting: None }.sqlstate(),
            "23P01"
        );
        assert_eq!(EngineError::AlreadyExists(Ulid::nil()).sqlstate(), "23505");
        assert_eq!(
            EngineError::AlreadyTerminal {
                id: Ulid::nil(),
                status: Status::Booking(BookingStatus::Cancelled)
            }
            .sqlstate(),
            "55000"
        );
        assert_eq!(EngineError::Forbidden("x").sqlstate(), "42501");
        assert_eq!(EngineError::RoomNotFound(Ulid::nil()).sqlstate(), "P0002");
        assert_eq!(EngineError::Contention(3).sqlstate(), "40001");
        assert_eq!(EngineError::WalError("disk".into()).sqlstate(), "XX000");
        assert_eq!(EngineError::Internal("lock".into()).sqlstate(), "XX000");
        assert_eq!(EngineError::Internal("lock".into()).class(), ErrorClass::Internal);
    }

    #[test]
    fn transient_only_for_lock_and_stale() {
        assert!(EngineError::Transient(TransientKind::LockTimeout).is_transient());
        assert!(EngineError::Transient(TransientKind::StaleRead).is_transient());
        assert!(!EngineError::Contention(5).is_transient());
        assert!(!EngineError::NotFound(Ulid::nil()).is_transient());
    }
}
