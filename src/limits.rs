use crate::model::Ms;

pub const SECOND_MS: Ms = 1_000;
pub const MINUTE_MS: Ms = 60 * SECOND_MS;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

// ── Lifecycle windows ────────────────────────────────────────────

/// Check-in opens this long before the reservation starts.
pub const CHECK_IN_EARLY_MS: Ms = 15 * MINUTE_MS;
/// Cancellation is refused once the start is closer than this.
pub const CANCEL_CUTOFF_MS: Ms = 2 * HOUR_MS;
/// Cancelling at least this far ahead refunds in full.
pub const FULL_REFUND_LEAD_MS: Ms = 24 * HOUR_MS;
pub const FULL_REFUND_PERCENT: u8 = 100;
pub const PARTIAL_REFUND_PERCENT: u8 = 50;

// ── Waitlist ─────────────────────────────────────────────────────

/// An un-promoted entry lapses this long after its desired start.
pub const WAITLIST_TTL_AFTER_START_MS: Ms = 24 * HOUR_MS;
/// How long a promoted entry may take to convert.
pub const OFFER_WINDOW_MS: Ms = 15 * MINUTE_MS;

// ── Notifications ────────────────────────────────────────────────

/// Retry delay is `BACKOFF_BASE ^ retry_count` minutes.
pub const BACKOFF_BASE: i64 = 5;

// ── Input bounds ─────────────────────────────────────────────────

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
pub const MAX_SPAN_DURATION_MS: Ms = 31 * DAY_MS;
pub const MAX_CAPACITY: u32 = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1_024;
pub const MAX_RECURRENCE_INTERVAL: u32 = 52;
pub const MAX_RECURRENCE_DURATION_MINUTES: u32 = 24 * 60;
/// Upper bound on the day-by-day scan for filter patterns.
pub const MAX_FILTER_SCAN_DAYS: u32 = 7 * MAX_RECURRENCE_INTERVAL + 7;
pub const MAX_RETRIES_LIMIT: u32 = 10;
