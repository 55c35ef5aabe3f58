mod conflict;
mod error;
mod lifecycle;
mod notifications;
mod recurrence;
mod waitlist;

pub use conflict::resolve;
pub use error::EngineError;
pub use lifecycle::refund_percent;
pub use notifications::{apply_send_failure, backoff_delay_ms};
pub use recurrence::{
    first_occurrence, is_due, is_finished, matches_pattern, next_occurrence, occurrence_span,
    MaterializeOutcome,
};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;
use ulid::Ulid;

use crate::cache::{availability_key, cached, AvailabilityKey, TtlCache};
use crate::channel::NotificationChannel;
use crate::clock::Clock;
use crate::config::Config;
use crate::limits::*;
use crate::live::LiveHub;
use crate::model::*;
use crate::store::Store;

use conflict::validate_span;

/// Async mutex per entity id. Resource ids serialise capacity changes and
/// waitlist membership; rule and job ids serialise their own advancement.
#[derive(Default)]
struct KeyedLocks {
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: Ulid) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(key).or_default().clone();
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on.
    fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// The reservation and scheduling core. All collaborators are injected.
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) channel: Arc<dyn NotificationChannel>,
    pub live: Arc<LiveHub>,
    pub(crate) config: Config,
    availability_cache: TtlCache<AvailabilityKey, Availability>,
    locks: KeyedLocks,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        channel: Arc<dyn NotificationChannel>,
        config: Config,
    ) -> Self {
        Self {
            store,
            clock,
            channel,
            live: Arc::new(LiveHub::new()),
            config,
            availability_cache: TtlCache::new(),
            locks: KeyedLocks::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub(crate) async fn lock(&self, key: Ulid) -> OwnedMutexGuard<()> {
        self.locks.lock(key).await
    }

    pub(crate) fn publish(&self, event: LiveEvent) {
        self.live.publish(event);
    }

    pub(crate) fn invalidate_availability(&self, resource_id: Ulid) {
        self.availability_cache
            .invalidate_where(|key| key.resource_id == resource_id);
    }

    /// Drop idle locks, stale cache entries and abandoned live channels.
    pub fn prune(&self) {
        self.locks.prune();
        self.availability_cache.evict_expired(self.now());
        self.live.prune();
    }

    // ── Lookups ──────────────────────────────────────────────

    pub async fn resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        self.store.get_resource(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store.get_reservation(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn waitlist_entry(&self, id: Ulid) -> Result<WaitlistEntry, EngineError> {
        self.store.get_waitlist_entry(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn rule(&self, id: Ulid) -> Result<RecurrenceRule, EngineError> {
        self.store.get_rule(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn notification(&self, id: Ulid) -> Result<NotificationJob, EngineError> {
        self.store.get_notification(id).await?.ok_or(EngineError::NotFound(id))
    }

    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(
        &self,
        name: Option<String>,
        capacity: u32,
        hourly_rate_cents: u64,
    ) -> Result<Resource, EngineError> {
        if capacity == 0 {
            return Err(EngineError::validation("capacity must be at least 1"));
        }
        if capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        let resource = Resource {
            id: Ulid::new(),
            name,
            capacity,
            hourly_rate_cents,
        };
        self.store.put_resource(&resource).await?;
        info!("resource {} created with {capacity} units", resource.id);
        Ok(resource)
    }

    /// Read-only resolver query, served cache-aside.
    pub async fn check_availability(
        &self,
        resource_id: Ulid,
        span: Span,
        required_units: u32,
    ) -> Result<Availability, EngineError> {
        validate_span(&span)?;
        let now = self.now();
        cached(
            &self.availability_cache,
            availability_key(resource_id, span, required_units),
            now,
            self.config.availability_cache_ttl_ms,
            || async {
                let resource = self.resource(resource_id).await?;
                let existing = self.store.overlapping_reservations(resource_id, span).await?;
                resolve(&resource, &existing, &span, required_units, None)
            },
        )
        .await
    }
}
