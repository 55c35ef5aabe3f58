use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

/// Users are opaque to the engine.
pub type UserId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Zero or negative length.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// A facility with a fixed number of bookable units, numbered `1..=capacity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
    pub hourly_rate_cents: u64,
}

impl Resource {
    /// Price of occupying one unit for `span`, floored to the cent.
    pub fn price(&self, span: &Span) -> u64 {
        let ms = span.duration_ms().max(0) as u128;
        (self.hourly_rate_cents as u128 * ms / crate::limits::HOUR_MS as u128) as u64
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
    NoShow,
}

impl ReservationStatus {
    /// Statuses that occupy a unit for conflict purposes.
    pub fn holds_capacity(self) -> bool {
        matches!(self, Self::Confirmed | Self::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::NoShow => "NO_SHOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    PartiallyRefunded,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub plate: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub percent: u8,
    pub amount_cents: u64,
    pub reason: String,
    pub issued_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub previous_end: Ms,
    pub new_end: Ms,
    pub additional_cents: u64,
    pub extended_at: Ms,
}

/// Where a reservation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingSource {
    Direct,
    Waitlist { entry_id: Ulid },
    Recurrence { rule_id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: UserId,
    pub unit: u32,
    pub span: Span,
    pub status: ReservationStatus,
    pub payment_status: PaymentStatus,
    pub amount_cents: u64,
    pub vehicle: Option<VehicleInfo>,
    pub source: BookingSource,
    pub created_at: Ms,
    pub checked_in_at: Option<Ms>,
    pub checked_out_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub refund: Option<Refund>,
    pub extensions: Vec<Extension>,
    pub reminder_sent: bool,
}

/// Input to `Engine::create_reservation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub resource_id: Ulid,
    pub user_id: UserId,
    pub span: Span,
    pub vehicle: Option<VehicleInfo>,
}

/// Resolver output for one `(resource, span, units)` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub resource_id: Ulid,
    pub span: Span,
    pub capacity: u32,
    pub required_units: u32,
    pub available_units: u32,
    pub is_available: bool,
    /// Units free for the whole span, ascending.
    pub free_units: Vec<u32>,
    /// Lowest `required_units` free units; empty when unavailable.
    pub assigned_units: Vec<u32>,
}

// ── Waitlist ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Active,
    Notified,
    Converted,
    Expired,
    Cancelled,
}

impl WaitlistStatus {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::Notified)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Notified => "NOTIFIED",
            Self::Converted => "CONVERTED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: UserId,
    pub desired: Span,
    pub required_units: u32,
    /// 1-based queue position; meaningful only while `Active`.
    pub position: u32,
    /// Per-resource join order, never reused.
    pub sequence: u64,
    pub status: WaitlistStatus,
    pub joined_at: Ms,
    pub notified_at: Option<Ms>,
    pub expires_at: Ms,
    /// One per unit, filled on conversion.
    pub reservation_ids: Vec<Ulid>,
}

// ── Recurrence ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    Daily,
    Weekly,
    Monthly,
    Weekdays,
    Weekends,
    Custom { days: Vec<Weekday> },
}

impl Pattern {
    /// Patterns that advance day-by-day through a weekday filter.
    pub fn is_filter(&self) -> bool {
        matches!(self, Self::Weekdays | Self::Weekends | Self::Custom { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStatus {
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl RuleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceRecord {
    pub date: NaiveDate,
    pub reservation_id: Ulid,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub date: NaiveDate,
    pub reason: String,
    pub failed_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: UserId,
    pub pattern: Pattern,
    /// Days for DAILY, weeks for WEEKLY and CUSTOM, months for MONTHLY.
    pub interval: u32,
    /// UTC time of day each occurrence starts.
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub max_occurrences: Option<u32>,
    pub next_occurrence: NaiveDate,
    pub occurrence_count: u32,
    pub occurrences: Vec<OccurrenceRecord>,
    pub failures: Vec<FailureRecord>,
    pub status: RuleStatus,
    pub vehicle: Option<VehicleInfo>,
    pub created_at: Ms,
}

/// Input to `Engine::create_recurrence_rule`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRequest {
    pub resource_id: Ulid,
    pub user_id: UserId,
    pub pattern: Pattern,
    pub interval: u32,
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub max_occurrences: Option<u32>,
    pub vehicle: Option<VehicleInfo>,
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    /// Dropped unsent after `expires_at`.
    Expired,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Read => "READ",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
}

/// One variant per notification type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    ReservationConfirmed {
        reservation_id: Ulid,
        resource_id: Ulid,
        unit: u32,
        span: Span,
        amount_cents: u64,
    },
    ReservationCancelled {
        reservation_id: Ulid,
        refund_percent: u8,
        refund_cents: u64,
    },
    ReservationReminder {
        reservation_id: Ulid,
        resource_id: Ulid,
        unit: u32,
        starts_at: Ms,
    },
    ReservationNoShow {
        reservation_id: Ulid,
    },
    WaitlistSpotAvailable {
        entry_id: Ulid,
        resource_id: Ulid,
        span: Span,
        offer_expires_at: Ms,
    },
    RecurringBookingCreated {
        rule_id: Ulid,
        reservation_id: Ulid,
        date: NaiveDate,
        span: Span,
    },
    RecurringBookingFailed {
        rule_id: Ulid,
        date: NaiveDate,
        reason: String,
    },
}

impl Payload {
    /// Time-sensitive messages go to push, the rest to email.
    pub fn default_channel(&self) -> Channel {
        match self {
            Payload::ReservationReminder { .. } | Payload::WaitlistSpotAvailable { .. } => {
                Channel::Push
            }
            Payload::ReservationConfirmed { .. }
            | Payload::ReservationCancelled { .. }
            | Payload::ReservationNoShow { .. }
            | Payload::RecurringBookingCreated { .. }
            | Payload::RecurringBookingFailed { .. } => Channel::Email,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::ReservationConfirmed { .. } => "reservation_confirmed",
            Payload::ReservationCancelled { .. } => "reservation_cancelled",
            Payload::ReservationReminder { .. } => "reservation_reminder",
            Payload::ReservationNoShow { .. } => "reservation_no_show",
            Payload::WaitlistSpotAvailable { .. } => "waitlist_spot_available",
            Payload::RecurringBookingCreated { .. } => "recurring_booking_created",
            Payload::RecurringBookingFailed { .. } => "recurring_booking_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: Ulid,
    pub user_id: UserId,
    /// The reservation, waitlist entry, or rule this is about.
    pub subject_id: Ulid,
    pub channel: Channel,
    pub payload: Payload,
    pub status: NotificationStatus,
    pub created_at: Ms,
    pub scheduled_for: Option<Ms>,
    pub sent_at: Option<Ms>,
    pub delivered_at: Option<Ms>,
    pub read_at: Option<Ms>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Set only while a retry is still owed.
    pub next_retry_at: Option<Ms>,
    pub expires_at: Option<Ms>,
    pub failure_reason: Option<String>,
}

impl NotificationJob {
    /// Terminal: nothing further will happen to this job.
    pub fn is_settled(&self) -> bool {
        match self.status {
            NotificationStatus::Pending | NotificationStatus::Sent => false,
            NotificationStatus::Failed => self.next_retry_at.is_none(),
            NotificationStatus::Delivered
            | NotificationStatus::Read
            | NotificationStatus::Expired => true,
        }
    }
}

// ── Live events ──────────────────────────────────────────────────

/// Fire-and-forget status-change events for real-time subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiveEvent {
    ReservationChanged {
        reservation_id: Ulid,
        resource_id: Ulid,
        status: ReservationStatus,
        span: Span,
    },
    WaitlistChanged {
        entry_id: Ulid,
        resource_id: Ulid,
        user_id: UserId,
        position: u32,
        status: WaitlistStatus,
    },
    RecurrenceChanged {
        rule_id: Ulid,
        resource_id: Ulid,
        status: RuleStatus,
        next_occurrence: NaiveDate,
    },
}

impl LiveEvent {
    pub fn resource_id(&self) -> Ulid {
        match self {
            LiveEvent::ReservationChanged { resource_id, .. }
            | LiveEvent::WaitlistChanged { resource_id, .. }
            | LiveEvent::RecurrenceChanged { resource_id, .. } => *resource_id,
        }
    }
}
