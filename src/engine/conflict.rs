use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Build a span from untrusted bounds and check it against the limits.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    let span = Span::checked(start, end).ok_or(EngineError::InvalidSpan(Span { start, end }))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// First active booking of `studio_id` overlapping `span`, skipping `exclude`.
///
/// Cancelled bookings and bookings of other studios never match. Overlap is
/// strict half-open: a booking ending exactly at `span.start` does not match.
pub fn find_conflict<'a, I>(
    studio_id: Ulid,
    span: &Span,
    bookings: I,
    exclude: Option<Ulid>,
) -> Option<&'a Booking>
where
    I: IntoIterator<Item = &'a Booking>,
{
    bookings.into_iter().find(|b| {
        b.studio_id == studio_id
            && b.is_active()
            && exclude != Some(b.id)
            && b.span.overlaps(span)
    })
}

pub fn has_conflict<'a, I>(studio_id: Ulid, span: &Span, bookings: I, exclude: Option<Ulid>) -> bool
where
    I: IntoIterator<Item = &'a Booking>,
{
    find_conflict(studio_id, span, bookings, exclude).is_some()
}

/// Conflict check against the studio's own booking list. Caller holds the lock.
pub(crate) fn check_no_conflict(
    ss: &StudioState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(ss.id(), span, ss.overlapping(span), exclude) {
        Some(existing) => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(existing.id))
        }
        None => Ok(()),
    }
}
