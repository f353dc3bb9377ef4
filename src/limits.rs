use crate::model::Ms;

pub const MAX_STUDIOS: usize = 10_000;
pub const MAX_BOOKINGS_PER_STUDIO: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_EQUIPMENT_PER_BOOKING: usize = 64;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
/// List and calendar queries may not exceed one year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

/// Fixed offsets beyond ±14h do not exist in practice.
pub const MAX_UTC_OFFSET_SECS: i32 = 14 * 3600;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
