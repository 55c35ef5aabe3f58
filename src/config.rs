use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::limits::*;
use crate::model::Ms;

/// Runtime settings. Read from `BAYLINE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,

    pub recurrence_tick: Duration,
    pub waitlist_tick: Duration,
    pub reminder_tick: Duration,
    pub dispatch_tick: Duration,
    pub cleanup_tick: Duration,

    /// Upper bound on one channel send; a timeout counts as a failure.
    pub send_timeout: Duration,
    pub dispatch_concurrency: usize,
    pub max_retries: u32,
    pub reminder_lead_ms: Ms,
    /// Default lifetime of a pending notification.
    pub notification_ttl_ms: Ms,
    /// Settled notifications older than this are purged.
    pub notification_retention_ms: Ms,
    pub compact_threshold: u64,
    pub availability_cache_ttl_ms: Ms,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            recurrence_tick: Duration::from_secs(60),
            waitlist_tick: Duration::from_secs(30),
            reminder_tick: Duration::from_secs(60),
            dispatch_tick: Duration::from_secs(10),
            cleanup_tick: Duration::from_secs(300),
            send_timeout: Duration::from_secs(10),
            dispatch_concurrency: 16,
            max_retries: 3,
            reminder_lead_ms: 30 * MINUTE_MS,
            notification_ttl_ms: DAY_MS,
            notification_retention_ms: 7 * DAY_MS,
            compact_threshold: 1000,
            availability_cache_ttl_ms: 5 * SECOND_MS,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source. Missing or unparseable keys keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let secs = |key: &str, default: Duration| {
            parse(&lookup, key).map(Duration::from_secs).unwrap_or(default)
        };
        let millis = |key: &str, default: Ms| {
            parse::<u64>(&lookup, key).map(|s| s as Ms * SECOND_MS).unwrap_or(default)
        };

        Self {
            data_dir: lookup("BAYLINE_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: parse(&lookup, "BAYLINE_METRICS_PORT"),
            recurrence_tick: secs("BAYLINE_RECURRENCE_TICK_SECS", d.recurrence_tick),
            waitlist_tick: secs("BAYLINE_WAITLIST_TICK_SECS", d.waitlist_tick),
            reminder_tick: secs("BAYLINE_REMINDER_TICK_SECS", d.reminder_tick),
            dispatch_tick: secs("BAYLINE_DISPATCH_TICK_SECS", d.dispatch_tick),
            cleanup_tick: secs("BAYLINE_CLEANUP_TICK_SECS", d.cleanup_tick),
            send_timeout: secs("BAYLINE_SEND_TIMEOUT_SECS", d.send_timeout),
            dispatch_concurrency: parse(&lookup, "BAYLINE_DISPATCH_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.dispatch_concurrency),
            max_retries: parse(&lookup, "BAYLINE_MAX_RETRIES")
                .map(|n: u32| n.min(MAX_RETRIES_LIMIT))
                .unwrap_or(d.max_retries),
            reminder_lead_ms: millis("BAYLINE_REMINDER_LEAD_SECS", d.reminder_lead_ms),
            notification_ttl_ms: millis("BAYLINE_NOTIFICATION_TTL_SECS", d.notification_ttl_ms),
            notification_retention_ms: millis(
                "BAYLINE_NOTIFICATION_RETENTION_SECS",
                d.notification_retention_ms,
            ),
            compact_threshold: parse(&lookup, "BAYLINE_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            availability_cache_ttl_ms: millis(
                "BAYLINE_CACHE_TTL_SECS",
                d.availability_cache_ttl_ms,
            ),
        }
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparseable {key}={raw:?}");
            None
        }
    }
}
