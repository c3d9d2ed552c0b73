use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Reject malformed stays before they reach the overlap check.
pub fn validate_stay(check_in: NaiveDate, check_out: NaiveDate) -> Result<StayRange, EngineError> {
    use crate::limits::*;
    if check_out <= check_in {
        return Err(EngineError::InvalidDates {
            check_in,
            check_out,
        });
    }
    if check_in.year() < MIN_VALID_YEAR || check_out.year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    let stay = StayRange::new(check_in, check_out);
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(stay)
}

/// Confirmed reservations that share at least one night with `candidate`.
/// Requested and cancelled reservations never block.
pub fn find_conflicts<'a, I>(candidate: &StayRange, existing: I) -> Vec<&'a Reservation>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    existing
        .into_iter()
        .filter(|r| r.is_confirmed() && r.stay.overlaps(candidate))
        .collect()
}

/// Conflict check against a property's current state. `ignore` skips the
/// reservation being confirmed so it does not collide with itself.
pub(crate) fn check_no_conflict(
    ps: &PropertyState,
    stay: &StayRange,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    let conflicts: Vec<Conflict> = find_conflicts(stay, ps.overlapping(stay))
        .into_iter()
        .filter(|r| Some(r.id) != ignore)
        .map(Conflict::from)
        .collect();
    if conflicts.is_empty() {
        Ok(())
    } else {
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
        Err(EngineError::Conflict(conflicts))
    }
}
