use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};

use crate::model::*;

/// One calendar month, `first..=last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthWindow {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl MonthWindow {
    /// `None` if `month` is not in 1..=12 or the year is out of chrono's range.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        Some(Self {
            first,
            last: next.pred_opt()?,
        })
    }

    /// Parse `YYYY-MM`.
    pub fn parse(s: &str) -> Option<Self> {
        let (y, m) = s.trim().split_once('-')?;
        Self::new(y.parse().ok()?, m.parse().ok()?)
    }

    pub fn year(&self) -> i32 {
        self.first.year()
    }

    pub fn month(&self) -> u32 {
        self.first.month()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.first <= date && date <= self.last
    }

    /// Month pre-filter: the stay's closed range `[check_in, check_out]`
    /// touches the month. A checkout on the 1st counts.
    pub fn intersects(&self, stay: &StayRange) -> bool {
        stay.check_in <= self.last && stay.check_out >= self.first
    }
}

/// Per-date check-in / staying / check-out counts for one month, keyed by
/// `YYYY-MM-DD`. Dates with no activity have no entry.
///
/// Every date of each stay, check-in through check-out inclusive, is visited;
/// only dates inside `month` are recorded. Cancelled reservations are
/// skipped. Requested ones also bump `requested_count`; confirmed ones set
/// `has_confirmed`.
pub fn aggregate_month<'a, I>(reservations: I, month: &MonthWindow) -> BTreeMap<String, DayAggregate>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    let mut days: BTreeMap<NaiveDate, DayAggregate> = BTreeMap::new();

    for r in reservations {
        if !r.is_active() {
            continue;
        }
        let stay = r.stay;
        for date in stay.touched_dates() {
            if !month.contains(date) {
                continue;
            }
            let day = days
                .entry(date)
                .or_insert_with(|| DayAggregate::empty(date));
            if date == stay.check_in {
                day.check_in_count += 1;
            }
            if date == stay.check_out {
                day.check_out_count += 1;
            }
            if stay.check_in < date && date < stay.check_out {
                day.staying_count += 1;
            }
            match r.status {
                ReservationStatus::Confirmed => day.has_confirmed = true,
                ReservationStatus::Requested => day.requested_count += 1,
                ReservationStatus::Cancelled => {}
            }
        }
    }

    days.into_iter()
        .map(|(date, day)| (date.format("%Y-%m-%d").to_string(), day))
        .collect()
}
