use std::net::SocketAddr;

// ── Booking path ────────────────────────────────────────────────

/// Counter: bookings committed locally. Labels: origin (local, import).
pub const BOOKINGS_CREATED_TOTAL: &str = "roomsync_bookings_created_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "roomsync_bookings_cancelled_total";

/// Counter: mutations rejected because the slot overlapped a confirmed booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roomsync_booking_conflicts_total";

/// Counter: admin actions on bookings the admin does not own.
pub const ADMIN_OVERRIDES_TOTAL: &str = "roomsync_admin_overrides_total";

// ── Reconciliation ──────────────────────────────────────────────

/// Counter: outward pushes that failed. Labels: op (create, update, cancel, link).
pub const REMOTE_PUSH_FAILURES_TOTAL: &str = "roomsync_remote_push_failures_total";

/// Counter: remote events imported as local bookings.
pub const SYNC_EVENTS_IMPORTED_TOTAL: &str = "roomsync_sync_events_imported_total";

/// Histogram: duration of a calendar sync run in seconds.
pub const SYNC_DURATION_SECONDS: &str = "roomsync_sync_duration_seconds";

/// Counter: directory rooms upserted. Labels: outcome (created, updated).
pub const ROOMS_SYNCED_TOTAL: &str = "roomsync_rooms_synced_total";

/// Counter: sign-ins not admitted. Labels: reason (pending, denied).
pub const SIGN_IN_DENIED_TOTAL: &str = "roomsync_sign_in_denied_total";

/// Counter: notifications that failed to send.
pub const NOTIFY_FAILURES_TOTAL: &str = "roomsync_notify_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomsync_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomsync_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
