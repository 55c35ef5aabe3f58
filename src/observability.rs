use std::net::SocketAddr;

// ── Reservations ────────────────────────────────────────────────

/// Counter: reservations committed. Labels: source.
pub const RESERVATIONS_CREATED_TOTAL: &str = "bayline_reservations_created_total";

/// Counter: create requests refused for lack of capacity.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "bayline_reservation_conflicts_total";

/// Counter: lifecycle transitions. Labels: to.
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "bayline_reservation_transitions_total";

// ── Waitlist ────────────────────────────────────────────────────

/// Counter: waitlist joins.
pub const WAITLIST_JOINS_TOTAL: &str = "bayline_waitlist_joins_total";

/// Counter: entries promoted to NOTIFIED.
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "bayline_waitlist_promotions_total";

/// Counter: conversion attempts. Labels: outcome (converted, demoted).
pub const WAITLIST_CONVERSIONS_TOTAL: &str = "bayline_waitlist_conversions_total";

// ── Recurrence ──────────────────────────────────────────────────

/// Counter: occurrences processed. Labels: outcome (booked, failed).
pub const RECURRENCE_OCCURRENCES_TOTAL: &str = "bayline_recurrence_occurrences_total";

// ── Notifications ───────────────────────────────────────────────

/// Counter: channel send attempts. Labels: outcome (sent, failed, timeout).
pub const NOTIFICATION_SENDS_TOTAL: &str = "bayline_notification_sends_total";

/// Counter: pending jobs dropped at expiry.
pub const NOTIFICATIONS_EXPIRED_TOTAL: &str = "bayline_notifications_expired_total";

// ── Orchestrator ────────────────────────────────────────────────

/// Histogram: tick wall time in seconds. Labels: tick.
pub const TICK_DURATION_SECONDS: &str = "bayline_tick_duration_seconds";

/// Counter: ticks aborted by a store error. Labels: tick.
pub const TICK_FAILURES_TOTAL: &str = "bayline_tick_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bayline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bayline_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
