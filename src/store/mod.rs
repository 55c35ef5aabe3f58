//! Persistence seam. The engine only talks to `dyn Store`.
//!
//! `MemoryStore` keeps everything in `DashMap`s with a per-resource start-sorted
//! reservation index; `DurableStore` layers a group-committed WAL on top of it.

mod durable;
mod memory;

pub use durable::DurableStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("WAL error: {0}")]
    Wal(String),
}

/// One durable upsert (or delete). This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreRecord {
    Resource(Resource),
    Reservation(Reservation),
    Waitlist(WaitlistEntry),
    Rule(RecurrenceRule),
    Notification(NotificationJob),
    NotificationDeleted(Ulid),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn put_resource(&self, resource: &Resource) -> Result<(), StoreError>;
    async fn get_resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError>;
    async fn list_resources(&self) -> Result<Vec<Resource>, StoreError>;

    async fn put_reservation(&self, reservation: &Reservation) -> Result<(), StoreError>;
    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;
    /// Reservations on `resource_id` (any status) whose span overlaps `span`,
    /// ordered by start.
    async fn overlapping_reservations(
        &self,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Vec<Reservation>, StoreError>;
    async fn reservations_with_status(
        &self,
        status: ReservationStatus,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn put_waitlist_entry(&self, entry: &WaitlistEntry) -> Result<(), StoreError>;
    async fn get_waitlist_entry(&self, id: Ulid) -> Result<Option<WaitlistEntry>, StoreError>;
    /// Every entry ever created on the resource, in join order.
    async fn waitlist_for_resource(&self, resource_id: Ulid) -> Result<Vec<WaitlistEntry>, StoreError>;
    /// ACTIVE and NOTIFIED entries across all resources.
    async fn open_waitlist_entries(&self) -> Result<Vec<WaitlistEntry>, StoreError>;

    async fn put_rule(&self, rule: &RecurrenceRule) -> Result<(), StoreError>;
    async fn get_rule(&self, id: Ulid) -> Result<Option<RecurrenceRule>, StoreError>;
    async fn list_rules(&self) -> Result<Vec<RecurrenceRule>, StoreError>;

    async fn put_notification(&self, job: &NotificationJob) -> Result<(), StoreError>;
    async fn get_notification(&self, id: Ulid) -> Result<Option<NotificationJob>, StoreError>;
    async fn notifications_with_status(
        &self,
        status: NotificationStatus,
    ) -> Result<Vec<NotificationJob>, StoreError>;
    async fn delete_notification(&self, id: Ulid) -> Result<(), StoreError>;

    /// Periodic housekeeping hook (e.g. log compaction). Called from the cleanup tick.
    async fn maintain(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
