use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::conflict::has_conflict;

// ── Daily slot availability ───────────────────────────────────────

/// Milliseconds of local midnight of `day` for a clock at `utc_offset_secs`.
pub fn local_midnight_ms(day: NaiveDate, utc_offset_secs: i32) -> Ms {
    let utc_midnight = day.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    utc_midnight - utc_offset_secs as Ms * 1000
}

/// The whole local day `[midnight, midnight + 24h)`.
pub fn day_span(day: NaiveDate, utc_offset_secs: i32) -> Span {
    let midnight = local_midnight_ms(day, utc_offset_secs);
    Span::new(midnight, midnight + 24 * HOUR_MS)
}

/// Consecutive slots from opening to closing hour of `day`.
///
/// Slot `k` starts at `midnight + (opening + k * width) h`. The last slot is
/// clamped to the closing hour when the width does not divide the window.
pub fn day_slots(day: NaiveDate, window: &AvailabilityWindow) -> Vec<Span> {
    if !window.is_valid() {
        return Vec::new();
    }
    let midnight = local_midnight_ms(day, window.utc_offset_secs);
    let width = window.slot_width_hours as Ms * HOUR_MS;
    let close = midnight + window.closing_hour as Ms * HOUR_MS;

    let mut slots = Vec::new();
    let mut slot_start = midnight + window.opening_hour as Ms * HOUR_MS;
    while slot_start < close {
        let slot_end = (slot_start + width).min(close);
        slots.push(Span::new(slot_start, slot_end));
        slot_start = slot_end;
    }
    slots
}

/// Partition the opening hours of `day` into available and booked slots.
///
/// A slot is booked if any active booking of `studio_id` overlaps it, even
/// partially. `bookings` may be the full studio list or a pre-filtered day.
pub fn compute_daily_availability<'a, I>(
    studio_id: Ulid,
    day: NaiveDate,
    window: &AvailabilityWindow,
    bookings: I,
) -> DailyAvailability
where
    I: IntoIterator<Item = &'a Booking>,
{
    let whole_day = day_span(day, window.utc_offset_secs);
    let relevant: Vec<&Booking> = bookings
        .into_iter()
        .filter(|b| b.studio_id == studio_id && b.is_active() && b.span.overlaps(&whole_day))
        .collect();

    let mut result = DailyAvailability::default();
    for slot in day_slots(day, window) {
        if has_conflict(studio_id, &slot, relevant.iter().copied(), None) {
            result.booked_slots.push(slot);
        } else {
            result.available_slots.push(slot);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR_MS;
    const M: Ms = 60_000;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 3).unwrap()
    }

    fn midnight() -> Ms {
        local_midnight_ms(day(), 0)
    }

    fn booking(studio_id: Ulid, start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            studio_id,
            client_id: Ulid::new(),
            engineer_id: None,
            span: Span::new(start, end),
            status,
            notes: None,
            total_price: 0.0,
            is_paid: false,
            cancelled_reason: None,
            equipment_ids: Vec::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn assert_partition(result: &DailyAvailability, window: &AvailabilityWindow) {
        let mut all: Vec<Span> = result
            .available_slots
            .iter()
            .chain(result.booked_slots.iter())
            .copied()
            .collect();
        all.sort_by_key(|s| s.start);
        let m = local_midnight_ms(day(), window.utc_offset_secs);
        assert_eq!(all.first().unwrap().start, m + window.opening_hour as Ms * H);
        assert_eq!(all.last().unwrap().end, m + window.closing_hour as Ms * H);
        for pair in all.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap between slots");
        }
        for list in [&result.available_slots, &result.booked_slots] {
            for pair in list.windows(2) {
                assert!(pair[0].start < pair[1].start, "slots not ascending");
            }
        }
    }

    #[test]
    fn midnight_utc() {
        // 2025-07-03T00:00:00Z
        assert_eq!(midnight(), 1_751_500_800_000);
    }

    #[test]
    fn midnight_with_positive_offset() {
        // UTC+2 midnight is 22:00Z of the previous day
        assert_eq!(local_midnight_ms(day(), 2 * 3600), midnight() - 2 * H);
    }

    #[test]
    fn one_booking_ten_to_twelve() {
        let sid = Ulid::new();
        let m = midnight();
        let bookings = [booking(sid, m + 10 * H, m + 12 * H, BookingStatus::Confirmed)];
        let window = AvailabilityWindow::hourly(9, 22);
        let result = compute_daily_availability(sid, day(), &window, &bookings);

        assert_eq!(result.available_slots.len(), 11);
        assert_eq!(
            result.booked_slots,
            vec![
                Span::new(m + 10 * H, m + 11 * H),
                Span::new(m + 11 * H, m + 12 * H),
            ]
        );
        assert_partition(&result, &window);
    }

    #[test]
    fn empty_day_is_all_available() {
        let sid = Ulid::new();
        let window = AvailabilityWindow::hourly(9, 22);
        let result = compute_daily_availability(sid, day(), &window, std::iter::empty());
        assert_eq!(result.available_slots.len(), 13);
        assert!(result.booked_slots.is_empty());
        assert_partition(&result, &window);
    }

    #[test]
    fn partial_overlap_books_whole_slot() {
        let sid = Ulid::new();
        let m = midnight();
        let bookings = [booking(sid, m + 13 * H + 45 * M, m + 14 * H + 15 * M, BookingStatus::Pending)];
        let window = AvailabilityWindow::hourly(9, 22);
        let result = compute_daily_availability(sid, day(), &window, &bookings);
        assert_eq!(
            result.booked_slots,
            vec![
                Span::new(m + 13 * H, m + 14 * H),
                Span::new(m + 14 * H, m + 15 * H),
            ]
        );
        assert_eq!(result.available_slots.len() + result.booked_slots.len(), 13);
    }

    #[test]
    fn cancelled_and_foreign_bookings_ignored() {
        let sid = Ulid::new();
        let m = midnight();
        let bookings = [
            booking(sid, m + 10 * H, m + 12 * H, BookingStatus::Cancelled),
            booking(Ulid::new(), m + 10 * H, m + 12 * H, BookingStatus::Confirmed),
        ];
        let window = AvailabilityWindow::hourly(9, 22);
        let result = compute_daily_availability(sid, day(), &window, &bookings);
        assert!(result.booked_slots.is_empty());
    }

    #[test]
    fn booking_spanning_midnight_marks_both_days() {
        let sid = Ulid::new();
        let m = midnight();
        // 20:00 today → 10:00 tomorrow
        let bookings = [booking(sid, m + 20 * H, m + 34 * H, BookingStatus::Confirmed)];
        let window = AvailabilityWindow::hourly(9, 22);

        let today = compute_daily_availability(sid, day(), &window, &bookings);
        assert_eq!(today.booked_slots.len(), 2);

        let tomorrow = day().succ_opt().unwrap();
        let next = compute_daily_availability(sid, tomorrow, &window, &bookings);
        assert_eq!(next.booked_slots, vec![Span::new(m + 33 * H, m + 34 * H)]);
    }

    #[test]
    fn booking_outside_opening_hours_books_nothing() {
        let sid = Ulid::new();
        let m = midnight();
        let bookings = [booking(sid, m + 6 * H, m + 9 * H, BookingStatus::Confirmed)];
        let window = AvailabilityWindow::hourly(9, 22);
        let result = compute_daily_availability(sid, day(), &window, &bookings);
        assert!(result.booked_slots.is_empty());
    }

    #[test]
    fn wider_slots_clamp_to_closing() {
        let sid = Ulid::new();
        let window = AvailabilityWindow {
            slot_width_hours: 4,
            ..AvailabilityWindow::hourly(9, 22)
        };
        let result = compute_daily_availability(sid, day(), &window, std::iter::empty());
        // 9-13, 13-17, 17-21, 21-22
        assert_eq!(result.available_slots.len(), 4);
        let last = result.available_slots.last().unwrap();
        assert_eq!(last.duration_ms(), H);
        assert_partition(&result, &window);
    }

    #[test]
    fn offset_shifts_slot_boundaries() {
        let sid = Ulid::new();
        let window = AvailabilityWindow::hourly(9, 10).with_offset(-5 * 3600);
        let result = compute_daily_availability(sid, day(), &window, std::iter::empty());
        // 09:00 at UTC-5 is 14:00Z
        assert_eq!(
            result.available_slots,
            vec![Span::new(midnight() + 14 * H, midnight() + 15 * H)]
        );
    }

    #[test]
    fn full_day_window() {
        let sid = Ulid::new();
        let window = AvailabilityWindow::hourly(0, 24);
        let result = compute_daily_availability(sid, day(), &window, std::iter::empty());
        assert_eq!(result.available_slots.len(), 24);
        assert_partition(&result, &window);
    }

    #[test]
    fn invalid_window_yields_no_slots() {
        let window = AvailabilityWindow::hourly(12, 12);
        assert!(day_slots(day(), &window).is_empty());
    }
}
