use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::open_ranges;
use super::calendar::{aggregate_month, MonthWindow};
use super::conflict::{find_conflicts, validate_stay};
use super::{Engine, EngineError, SharedPropertyState};

impl Engine {
    /// Confirmed reservations standing in the way of `[check_in, check_out)`.
    /// An unknown property has nothing booked.
    pub async fn check_conflicts(
        &self,
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Result<Vec<Conflict>, EngineError> {
        let stay = validate_stay(check_in, check_out)?;
        let ps = match self.get_property(&property_id) {
            Some(ps) => ps,
            None => return Ok(vec![]),
        };
        let guard = ps.read().await;
        Ok(find_conflicts(&stay, guard.overlapping(&stay))
            .into_iter()
            .map(Conflict::from)
            .collect())
    }

    /// Day-by-day activity for one month. With no property, every property
    /// of the tenant is folded into the same calendar.
    pub async fn month_calendar(
        &self,
        property_id: Option<Ulid>,
        year: i32,
        month: u32,
    ) -> Result<BTreeMap<String, DayAggregate>, EngineError> {
        if !(MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&year) {
            return Err(EngineError::LimitExceeded("date out of range"));
        }
        let window =
            MonthWindow::new(year, month).ok_or(EngineError::LimitExceeded("invalid month"))?;

        let properties: Vec<SharedPropertyState> = match property_id {
            Some(id) => self.get_property(&id).into_iter().collect(),
            None => self.state.iter().map(|e| e.value().clone()).collect(),
        };

        let mut in_month = Vec::new();
        for ps in properties {
            let guard = ps.read().await;
            in_month.extend(guard.touching(window.first, window.last).cloned());
        }
        Ok(aggregate_month(&in_month, &window))
    }

    /// Free ranges of at least `min_nights` nights inside
    /// `[window_start, window_end)`.
    pub async fn open_ranges(
        &self,
        property_id: Ulid,
        window_start: NaiveDate,
        window_end: NaiveDate,
        min_nights: Option<i64>,
    ) -> Result<Vec<StayRange>, EngineError> {
        if window_end <= window_start {
            return Err(EngineError::InvalidDates {
                check_in: window_start,
                check_out: window_end,
            });
        }
        if window_start.year() < MIN_VALID_YEAR || window_end.year() > MAX_VALID_YEAR {
            return Err(EngineError::LimitExceeded("date out of range"));
        }
        let window = StayRange::new(window_start, window_end);
        if window.nights() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let ps = match self.get_property(&property_id) {
            Some(ps) => ps,
            None => return Ok(vec![]),
        };
        let guard = ps.read().await;
        let mut open = open_ranges(&guard, &window);
        if let Some(min) = min_nights {
            open.retain(|r| r.nights() >= min);
        }
        Ok(open)
    }

    pub async fn list_properties(&self) -> Vec<PropertyInfo> {
        let properties: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(properties.len());
        for ps in properties {
            let guard = ps.read().await;
            infos.push(PropertyInfo {
                id: guard.id,
                name: guard.name.clone(),
                max_guests: guard.max_guests,
                active_reservations: guard.reservations.iter().filter(|r| r.is_active()).count(),
            });
        }
        infos.sort_by_key(|p| p.id);
        infos
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let property_id = self
            .get_property_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ps = self
            .get_property(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.read().await;
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Reservations ordered by check-in, optionally narrowed to one property
    /// and one status.
    pub async fn list_reservations(
        &self,
        property_id: Option<Ulid>,
        status: Option<ReservationStatus>,
    ) -> Vec<Reservation> {
        let properties: Vec<SharedPropertyState> = match property_id {
            Some(id) => self.get_property(&id).into_iter().collect(),
            None => self.state.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for ps in properties {
            let guard = ps.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| status.is_none_or(|s| r.status == s))
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.stay.check_in, r.id));
        out
    }
}
