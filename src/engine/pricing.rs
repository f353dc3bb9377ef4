use crate::model::{HOUR_MS, Span};

/// `hourly_rate * hours(span)`, fractional hours included, unrounded.
pub fn price_for_interval(hourly_rate: f64, span: &Span) -> f64 {
    hourly_rate * (span.duration_ms() as f64 / HOUR_MS as f64)
}

/// Round half away from zero to two decimals, the precision bookings are stored at.
pub fn round_to_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
