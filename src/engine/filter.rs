use serde::Deserialize;
use ulid::Ulid;

use crate::model::*;

pub type Predicate = Box<dyn Fn(&Booking) -> bool + Send + Sync>;

/// Optional booking list criteria. Each set field contributes one predicate;
/// a booking matches when every predicate holds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub client_id: Option<Ulid>,
    pub engineer_id: Option<Ulid>,
    pub studio_id: Option<Ulid>,
    /// Inclusive lower bound on `start`. Only applied together with `end_date`.
    pub start_date: Option<Ms>,
    /// Inclusive upper bound on `start`. Only applied together with `start_date`.
    pub end_date: Option<Ms>,
}

impl BookingFilter {
    pub fn predicates(&self) -> Vec<Predicate> {
        let mut preds: Vec<Predicate> = Vec::new();
        if let Some(status) = self.status {
            preds.push(Box::new(move |b: &Booking| b.status == status));
        }
        if let Some(client_id) = self.client_id {
            preds.push(Box::new(move |b: &Booking| b.client_id == client_id));
        }
        if let Some(engineer_id) = self.engineer_id {
            preds.push(Box::new(move |b: &Booking| b.engineer_id == Some(engineer_id)));
        }
        if let Some(studio_id) = self.studio_id {
            preds.push(Box::new(move |b: &Booking| b.studio_id == studio_id));
        }
        if let (Some(from), Some(to)) = (self.start_date, self.end_date) {
            preds.push(Box::new(move |b: &Booking| from <= b.span.start && b.span.start <= to));
        }
        preds
    }
}

/// AND of all predicates. An empty list matches everything.
pub fn matches_all(preds: &[Predicate], booking: &Booking) -> bool {
    preds.iter().all(|p| p(booking))
}

/// Active bookings touching the closed range `[from, to]`: starting inside it,
/// ending inside it, or covering it entirely.
pub fn calendar_predicate(from: Ms, to: Ms) -> Predicate {
    Box::new(move |b: &Booking| {
        b.is_active()
            && ((from <= b.span.start && b.span.start <= to)
                || (from <= b.span.end && b.span.end <= to)
                || (b.span.start <= from && b.span.end >= to))
    })
}
