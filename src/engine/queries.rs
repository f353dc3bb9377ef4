use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{compute_daily_availability, day_span};
use super::conflict::{has_conflict, validate_span};
use super::filter::{BookingFilter, calendar_predicate, matches_all};
use super::pricing::price_for_interval;
use super::{Engine, EngineError, SharedStudioState};

impl Engine {
    pub async fn get_studio(&self, id: Ulid) -> Result<Studio, EngineError> {
        let ss = self.get_studio_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ss.read().await;
        Ok(guard.studio.clone())
    }

    pub async fn list_studios(&self) -> Vec<Studio> {
        let mut studios = Vec::with_capacity(self.state.len());
        for ss in self.snapshot_studios() {
            studios.push(ss.read().await.studio.clone());
        }
        studios.sort_by_key(|s| s.id);
        studios
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let studio_id = self
            .get_studio_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ss = self
            .get_studio_state(&studio_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = ss.read().await;
        guard.get_booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Bookings matching every set criterion of `filter`, ordered by start.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let preds = filter.predicates();
        let studios = match filter.studio_id {
            Some(sid) => self.get_studio_state(&sid).into_iter().collect(),
            None => self.snapshot_studios(),
        };

        let mut result = Vec::new();
        for ss in studios {
            let guard = ss.read().await;
            result.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| matches_all(&preds, b))
                    .cloned(),
            );
        }
        sort_by_start(&mut result);
        result
    }

    /// Active bookings across all studios touching the closed range `[from, to]`.
    pub async fn calendar_bookings(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, EngineError> {
        if to < from {
            return Err(EngineError::InvalidSpan(Span { start: from, end: to }));
        }
        if from < MIN_VALID_TIMESTAMP_MS || to > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if to - from > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let pred = calendar_predicate(from, to);
        // Closed range: widen by one ms so bookings ending exactly at `from` are visited.
        let window = Span::new(from - 1, to + 1);

        let mut result = Vec::new();
        for ss in self.snapshot_studios() {
            let guard = ss.read().await;
            result.extend(guard.overlapping(&window).filter(|b| pred(*b)).cloned());
        }
        sort_by_start(&mut result);
        Ok(result)
    }

    /// Hourly free/busy slots of one studio day, in the studio's local time.
    pub async fn check_availability(
        &self,
        studio_id: Ulid,
        day: NaiveDate,
    ) -> Result<AvailabilityReport, EngineError> {
        let ss = self
            .get_studio_state(&studio_id)
            .ok_or(EngineError::NotFound(studio_id))?;
        let guard = ss.read().await;
        let window = guard.studio.window();
        let whole_day = day_span(day, window.utc_offset_secs);
        if whole_day.start < MIN_VALID_TIMESTAMP_MS || whole_day.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("date out of range"));
        }

        let slots = compute_daily_availability(
            studio_id,
            day,
            &window,
            guard.overlapping(&whole_day),
        );
        Ok(AvailabilityReport {
            date: whole_day.start,
            studio_id,
            available_slots: slots.available_slots,
            booked_slots: slots.booked_slots,
            opening_hour: window.opening_hour,
            closing_hour: window.closing_hour,
        })
    }

    /// Read-only conflict check, e.g. for form validation before submitting.
    pub async fn has_conflict(
        &self,
        studio_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let span = validate_span(start, end)?;
        let ss = self
            .get_studio_state(&studio_id)
            .ok_or(EngineError::NotFound(studio_id))?;
        let guard = ss.read().await;
        Ok(has_conflict(studio_id, &span, guard.overlapping(&span), exclude))
    }

    /// Unrounded price of an interval at the studio's current rate.
    pub async fn quote(&self, studio_id: Ulid, start: Ms, end: Ms) -> Result<f64, EngineError> {
        let span = validate_span(start, end)?;
        let studio = self.get_studio(studio_id).await?;
        Ok(price_for_interval(studio.hourly_rate, &span))
    }

    fn snapshot_studios(&self) -> Vec<SharedStudioState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }
}

fn sort_by_start(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
}
