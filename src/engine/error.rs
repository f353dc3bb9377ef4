use ulid::Ulid;

use crate::model::{BookingStatus, Span};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The requested interval overlaps this active booking.
    Conflict(Ulid),
    InvalidSpan(Span),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    /// Operation refused because the booking is completed or cancelled.
    Terminal {
        op: &'static str,
        status: BookingStatus,
    },
    HasActiveBookings(Ulid),
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// HTTP-style status code for callers that surface errors to users.
    pub fn code(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::AlreadyExists(_) => 409,
            EngineError::Conflict(_)
            | EngineError::InvalidSpan(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::Terminal { .. }
            | EngineError::HasActiveBookings(_)
            | EngineError::Invalid(_)
            | EngineError::LimitExceeded(_) => 400,
            EngineError::WalError(_) => 500,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => {
                write!(f, "there is a conflicting booking for this time slot: {id}")
            }
            EngineError::InvalidSpan(span) => {
                write!(f, "invalid interval [{}, {}): start must be before end", span.start, span.end)
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::Terminal { op, status } => write!(f, "cannot {op} a {status} booking"),
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot delete studio {id}: has active bookings")
            }
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
