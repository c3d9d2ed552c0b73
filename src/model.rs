use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit timestamps only. Stays are calendar dates.
pub type Ms = i64;

/// Half-open stay `[check_in, check_out)`: the guest sleeps every night from
/// `check_in` up to, but not including, `check_out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StayRange {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl StayRange {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "check-in must be before check-out");
        Self { check_in, check_out }
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    /// Two stays conflict when they share at least one night. A checkout on the
    /// same day as another check-in shares none.
    pub fn overlaps(&self, other: &StayRange) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    pub fn contains_night(&self, night: NaiveDate) -> bool {
        self.check_in <= night && night < self.check_out
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_range(&self, other: &StayRange) -> bool {
        self.check_in <= other.check_in && other.check_out <= self.check_out
    }

    /// Every date the stay touches, check-in through check-out inclusive.
    pub fn touched_dates(&self) -> impl Iterator<Item = NaiveDate> {
        let last = self.check_out;
        self.check_in.iter_days().take_while(move |d| *d <= last)
    }
}

impl fmt::Display for StayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Pending admin action. Never blocks availability.
    Requested,
    /// Approved by an admin. The only status that blocks other bookings.
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Requested => "requested",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "requested" => Some(ReservationStatus::Requested),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub property_id: Ulid,
    pub stay: StayRange,
    pub status: ReservationStatus,
    pub guest_count: u32,
    pub email: String,
    /// Minor currency units.
    pub total_price: i64,
    pub special_requests: Option<String>,
    pub created_at: Ms,
    pub confirmed_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
}

impl Reservation {
    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }

    pub fn is_active(&self) -> bool {
        self.status != ReservationStatus::Cancelled
    }
}

/// Property fields to change. `None` leaves a field as it is;
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyPatch {
    pub name: Option<Option<String>>,
    pub max_guests: Option<Option<u32>>,
}

/// A booking as submitted, before its dates have been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub property_id: Ulid,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guest_count: u32,
    pub email: String,
    pub total_price: i64,
    pub special_requests: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PropertyState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Upper bound on `guest_count`; `None` means unchecked.
    pub max_guests: Option<u32>,
    /// All reservations, any status, sorted by `stay.check_in`.
    pub reservations: Vec<Reservation>,
    /// Set under the write lock when the property is deleted. Holders of a
    /// stale `Arc` must treat the property as gone.
    pub deleted: bool,
}

impl PropertyState {
    pub fn new(id: Ulid, name: Option<String>, max_guests: Option<u32>) -> Self {
        Self {
            id,
            name,
            max_guests,
            reservations: Vec::new(),
            deleted: false,
        }
    }

    /// Insert reservation maintaining sort order by check-in.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.stay.check_in <= reservation.stay.check_in);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    pub fn has_active_reservations(&self) -> bool {
        self.reservations.iter().any(Reservation::is_active)
    }

    /// Reservations (any status) sharing at least one night with `stay`.
    /// Binary search skips everything checking in on or after `stay.check_out`.
    pub fn overlapping(&self, stay: &StayRange) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.stay.check_in < stay.check_out);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.stay.check_out > stay.check_in)
    }

    /// Reservations whose closed range `[check_in, check_out]` touches
    /// `[first, last]`. This is the calendar's month pre-filter.
    pub fn touching(&self, first: NaiveDate, last: NaiveDate) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.stay.check_in <= last);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.stay.check_out >= first)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PropertyCreated {
        id: Ulid,
        name: Option<String>,
        max_guests: Option<u32>,
    },
    PropertyUpdated {
        id: Ulid,
        name: Option<String>,
        max_guests: Option<u32>,
    },
    PropertyDeleted {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        property_id: Ulid,
        stay: StayRange,
        status: ReservationStatus,
        guest_count: u32,
        email: String,
        total_price: i64,
        special_requests: Option<String>,
        created_at: Ms,
    },
    ReservationConfirmed {
        id: Ulid,
        property_id: Ulid,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        property_id: Ulid,
        at: Ms,
    },
    ReservationDeleted {
        id: Ulid,
        property_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub max_guests: Option<u32>,
    pub active_reservations: usize,
}

/// One confirmed reservation standing in the way of a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub reservation_id: Ulid,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl From<&Reservation> for Conflict {
    fn from(r: &Reservation) -> Self {
        Self {
            reservation_id: r.id,
            check_in: r.stay.check_in,
            check_out: r.stay.check_out,
        }
    }
}

/// Per-date booking activity for calendar rendering. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayAggregate {
    pub date: NaiveDate,
    pub check_in_count: u32,
    pub check_out_count: u32,
    pub staying_count: u32,
    pub requested_count: u32,
    pub has_confirmed: bool,
}

impl DayAggregate {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            check_in_count: 0,
            check_out_count: 0,
            staying_count: 0,
            requested_count: 0,
            has_confirmed: false,
        }
    }
}
