use std::net::SocketAddr;
use std::time::Duration;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotbook_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

// ── Booking metrics ─────────────────────────────────────────────

/// Gauge: studios currently in the directory.
pub const STUDIOS_ACTIVE: &str = "slotbook_studios_active";

/// Counter: booking writes refused because the interval was taken.
pub const CONFLICTS_TOTAL: &str = "slotbook_conflicts_total";

pub const BOOKINGS_CREATED_TOTAL: &str = "slotbook_bookings_created_total";

pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotbook_bookings_cancelled_total";

/// Counter: bookings moved to another studio.
pub const BOOKINGS_MOVED_TOTAL: &str = "slotbook_bookings_moved_total";

// ── Persistence ─────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Counter: snapshot rewrites of the WAL.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotbook_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Count one executed request and record its latency under `op`.
pub fn record_request(op: &'static str, succeeded: bool, elapsed: Duration) {
    let status = if succeeded { "ok" } else { "error" };
    metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(elapsed.as_secs_f64());
}

/// Lines that never parsed into a request are counted under op `invalid`.
pub fn record_unparsed_request() {
    metrics::counter!(REQUESTS_TOTAL, "op" => "invalid", "status" => "error").increment(1);
}

/// Metric label for a request. Matches the `op` tag it arrived with.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::CreateStudio { .. } => "create_studio",
        Request::UpdateStudio { .. } => "update_studio",
        Request::DeleteStudio { .. } => "delete_studio",
        Request::GetStudio { .. } => "get_studio",
        Request::ListStudios => "list_studios",
        Request::CreateBooking { .. } => "create_booking",
        Request::UpdateBooking { .. } => "update_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::MarkPaid { .. } => "mark_paid",
        Request::GetBooking { .. } => "get_booking",
        Request::ListBookings { .. } => "list_bookings",
        Request::Calendar { .. } => "calendar",
        Request::Availability { .. } => "availability",
        Request::HasConflict { .. } => "has_conflict",
        Request::Quote { .. } => "quote",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
