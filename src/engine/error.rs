use chrono::NaiveDate;
use serde_json::json;
use ulid::Ulid;

use crate::model::{Conflict, ReservationStatus};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The stay shares nights with these confirmed reservations.
    Conflict(Vec<Conflict>),
    InvalidDates {
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    GuestCountExceeded {
        requested: u32,
        max: u32,
    },
    HasActiveReservations(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// HTTP-style status the booking flow reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::AlreadyExists(_)
            | EngineError::Conflict(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::HasActiveReservations(_) => 409,
            EngineError::InvalidDates { .. } | EngineError::LimitExceeded(_) => 400,
            EngineError::GuestCountExceeded { .. } => 422,
            EngineError::WalError(_) => 500,
        }
    }

    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Conflict(_) => "reservation_conflict",
            EngineError::InvalidDates { .. } => "invalid_dates",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::GuestCountExceeded { .. } => "guest_count_exceeded",
            EngineError::HasActiveReservations(_) => "has_active_reservations",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage_error",
        }
    }

    /// JSON response body. Conflicts carry the blocking date ranges so the
    /// booking form can show them.
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = json!({
            "status": self.status_code(),
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let EngineError::Conflict(conflicts) = self {
            body["conflicts"] = json!(conflicts);
        }
        body
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(conflicts) => {
                write!(f, "dates unavailable: conflicts with")?;
                for (i, c) in conflicts.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}[{}, {})", c.check_in, c.check_out)?;
                }
                Ok(())
            }
            EngineError::InvalidDates {
                check_in,
                check_out,
            } => write!(
                f,
                "invalid dates: check-out {check_out} must be after check-in {check_in}"
            ),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id} cannot move from {from} to {to}")
            }
            EngineError::GuestCountExceeded { requested, max } => {
                write!(f, "{requested} guests requested, property allows {max}")
            }
            EngineError::HasActiveReservations(id) => {
                write!(f, "cannot delete property {id}: has active reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
