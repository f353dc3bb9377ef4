use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant in the system is one of these.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`. Also the wire shape of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Fallible constructor for untrusted input.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Booking lifecycle: `pending → confirmed → completed`, and
/// `pending | confirmed → cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Everything except `cancelled` occupies the studio.
    pub fn is_active(self) -> bool {
        self != BookingStatus::Cancelled
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, Completed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opening hours of a studio for one calendar day, plus slot granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityWindow {
    pub opening_hour: u8,
    pub closing_hour: u8,
    pub slot_width_hours: u8,
    /// Hours are wall-clock hours at this offset from UTC.
    #[serde(default)]
    pub utc_offset_secs: i32,
}

impl AvailabilityWindow {
    pub fn hourly(opening_hour: u8, closing_hour: u8) -> Self {
        Self {
            opening_hour,
            closing_hour,
            slot_width_hours: 1,
            utc_offset_secs: 0,
        }
    }

    pub fn with_offset(mut self, utc_offset_secs: i32) -> Self {
        self.utc_offset_secs = utc_offset_secs;
        self
    }

    /// `0 <= opening < closing <= 24` and a non-zero slot width.
    pub fn is_valid(&self) -> bool {
        self.opening_hour < self.closing_hour
            && self.closing_hour <= 24
            && self.slot_width_hours > 0
    }
}

impl Default for AvailabilityWindow {
    fn default() -> Self {
        Self::hourly(9, 22)
    }
}

/// A bookable room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Studio {
    pub id: Ulid,
    pub name: String,
    pub hourly_rate: f64,
    pub opening_hour: u8,
    pub closing_hour: u8,
    /// Offset of the studio's wall clock from UTC. Day boundaries are local.
    #[serde(default)]
    pub utc_offset_secs: i32,
}

impl Studio {
    pub fn window(&self) -> AvailabilityWindow {
        AvailabilityWindow::hourly(self.opening_hour, self.closing_hour)
            .with_offset(self.utc_offset_secs)
    }
}

/// Serialized as a flat record with `startTime` / `endTime`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "BookingRecord", from = "BookingRecord")]
pub struct Booking {
    pub id: Ulid,
    pub studio_id: Ulid,
    pub client_id: Ulid,
    pub engineer_id: Option<Ulid>,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub total_price: f64,
    pub is_paid: bool,
    pub cancelled_reason: Option<String>,
    pub equipment_ids: Vec<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookingRecord {
    id: Ulid,
    studio_id: Ulid,
    client_id: Ulid,
    engineer_id: Option<Ulid>,
    start_time: Ms,
    end_time: Ms,
    status: BookingStatus,
    notes: Option<String>,
    total_price: f64,
    is_paid: bool,
    cancelled_reason: Option<String>,
    equipment_ids: Vec<Ulid>,
    created_at: Ms,
    updated_at: Ms,
}

impl From<Booking> for BookingRecord {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id,
            studio_id: b.studio_id,
            client_id: b.client_id,
            engineer_id: b.engineer_id,
            start_time: b.span.start,
            end_time: b.span.end,
            status: b.status,
            notes: b.notes,
            total_price: b.total_price,
            is_paid: b.is_paid,
            cancelled_reason: b.cancelled_reason,
            equipment_ids: b.equipment_ids,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

impl From<BookingRecord> for Booking {
    fn from(r: BookingRecord) -> Self {
        Self {
            id: r.id,
            studio_id: r.studio_id,
            client_id: r.client_id,
            engineer_id: r.engineer_id,
            span: Span {
                start: r.start_time,
                end: r.end_time,
            },
            status: r.status,
            notes: r.notes,
            total_price: r.total_price,
            is_paid: r.is_paid,
            cancelled_reason: r.cancelled_reason,
            equipment_ids: r.equipment_ids,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudioState {
    pub studio: Studio,
    /// All bookings of this studio (cancelled included), sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl StudioState {
    pub fn new(studio: Studio) -> Self {
        Self {
            studio,
            bookings: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.studio.id
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Remove booking by id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Replace a booking in place, re-sorting if its start moved.
    pub fn replace_booking(&mut self, booking: Booking) {
        self.remove_booking(booking.id);
        self.insert_booking(booking);
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| &b.id == id)
    }

    pub fn has_active_bookings(&self) -> bool {
        self.bookings.iter().any(Booking::is_active)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// Every state change, as recorded in the WAL and broadcast to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    StudioCreated {
        studio: Studio,
    },
    StudioUpdated {
        studio: Studio,
    },
    StudioDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Full replacement of a booking that stays on the same studio.
    BookingUpdated {
        booking: Booking,
    },
    /// Booking moved from `from_studio_id` to `booking.studio_id`.
    BookingMoved {
        from_studio_id: Ulid,
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        studio_id: Ulid,
        reason: String,
        at: Ms,
    },
}

impl Event {
    /// Studio whose state this event changes. Moves report the destination.
    pub fn studio_id(&self) -> Ulid {
        match self {
            Event::StudioCreated { studio } | Event::StudioUpdated { studio } => studio.id,
            Event::StudioDeleted { id } => *id,
            Event::BookingCreated { booking }
            | Event::BookingUpdated { booking }
            | Event::BookingMoved { booking, .. } => booking.studio_id,
            Event::BookingCancelled { studio_id, .. } => *studio_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Free/busy partition of one studio day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAvailability {
    pub available_slots: Vec<Span>,
    pub booked_slots: Vec<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityReport {
    /// Local midnight of the queried day.
    pub date: Ms,
    pub studio_id: Ulid,
    pub available_slots: Vec<Span>,
    pub booked_slots: Vec<Span>,
    pub opening_hour: u8,
    pub closing_hour: u8,
}
