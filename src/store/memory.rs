use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::{Store, StoreError, StoreRecord};

pub struct MemoryStore {
    resources: DashMap<Ulid, Resource>,
    reservations: DashMap<Ulid, Reservation>,
    /// Resource id → `(start, reservation id)`, sorted by start.
    by_resource: DashMap<Ulid, Vec<(Ms, Ulid)>>,
    waitlist: DashMap<Ulid, WaitlistEntry>,
    /// Resource id → entry ids in insertion order.
    waitlist_by_resource: DashMap<Ulid, Vec<Ulid>>,
    rules: DashMap<Ulid, RecurrenceRule>,
    notifications: DashMap<Ulid, NotificationJob>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            reservations: DashMap::new(),
            by_resource: DashMap::new(),
            waitlist: DashMap::new(),
            waitlist_by_resource: DashMap::new(),
            rules: DashMap::new(),
            notifications: DashMap::new(),
        }
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.len()
    }

    /// Apply a record directly (replay and write path share this).
    pub fn apply(&self, record: StoreRecord) {
        match record {
            StoreRecord::Resource(r) => {
                self.resources.insert(r.id, r);
            }
            StoreRecord::Reservation(r) => self.index_reservation(r),
            StoreRecord::Waitlist(e) => {
                let (id, resource_id) = (e.id, e.resource_id);
                if self.waitlist.insert(id, e).is_none() {
                    self.waitlist_by_resource.entry(resource_id).or_default().push(id);
                }
            }
            StoreRecord::Rule(r) => {
                self.rules.insert(r.id, r);
            }
            StoreRecord::Notification(j) => {
                self.notifications.insert(j.id, j);
            }
            StoreRecord::NotificationDeleted(id) => {
                self.notifications.remove(&id);
            }
        }
    }

    fn index_reservation(&self, r: Reservation) {
        let (id, resource_id, start) = (r.id, r.resource_id, r.span.start);
        let previous = self.reservations.insert(id, r);
        if let Some(prev) = previous {
            if prev.resource_id == resource_id && prev.span.start == start {
                return;
            }
            if let Some(mut idx) = self.by_resource.get_mut(&prev.resource_id) {
                idx.retain(|(_, rid)| *rid != id);
            }
        }
        let mut idx = self.by_resource.entry(resource_id).or_default();
        // Equal starts keep insertion order.
        let pos = idx.partition_point(|(s, _)| *s <= start);
        idx.insert(pos, (start, id));
    }

    /// Minimal set of records that recreates the current state.
    pub fn snapshot(&self) -> Vec<StoreRecord> {
        let mut records = Vec::new();
        records.extend(self.resources.iter().map(|e| StoreRecord::Resource(e.value().clone())));
        records.extend(
            self.reservations
                .iter()
                .map(|e| StoreRecord::Reservation(e.value().clone())),
        );
        // Waitlist entries in per-resource insertion order so replay rebuilds the same index.
        for ids in self.waitlist_by_resource.iter() {
            for id in ids.value() {
                if let Some(entry) = self.waitlist.get(id) {
                    records.push(StoreRecord::Waitlist(entry.value().clone()));
                }
            }
        }
        records.extend(self.rules.iter().map(|e| StoreRecord::Rule(e.value().clone())));
        records.extend(
            self.notifications
                .iter()
                .map(|e| StoreRecord::Notification(e.value().clone())),
        );
        records
    }

    fn overlapping(&self, resource_id: Ulid, span: &Span) -> Vec<Reservation> {
        let Some(idx) = self.by_resource.get(&resource_id) else {
            return Vec::new();
        };
        // Everything at index >= right_bound starts at or after span.end → can't overlap.
        let right_bound = idx.partition_point(|(start, _)| *start < span.end);
        idx[..right_bound]
            .iter()
            .filter_map(|(_, id)| self.reservations.get(id).map(|r| r.value().clone()))
            .filter(|r| r.span.end > span.start)
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        self.apply(StoreRecord::Resource(resource.clone()));
        Ok(())
    }

    async fn get_resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        Ok(self.resources.get(&id).map(|e| e.value().clone()))
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, StoreError> {
        Ok(self.resources.iter().map(|e| e.value().clone()).collect())
    }

    async fn put_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.apply(StoreRecord::Reservation(reservation.clone()));
        Ok(())
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.reservations.get(&id).map(|e| e.value().clone()))
    }

    async fn overlapping_reservations(
        &self,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.overlapping(resource_id, &span))
    }

    async fn reservations_with_status(
        &self,
        status: ReservationStatus,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self
            .reservations
            .iter()
            .filter(|e| e.value().status == status)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn put_waitlist_entry(&self, entry: &WaitlistEntry) -> Result<(), StoreError> {
        self.apply(StoreRecord::Waitlist(entry.clone()));
        Ok(())
    }

    async fn get_waitlist_entry(&self, id: Ulid) -> Result<Option<WaitlistEntry>, StoreError> {
        Ok(self.waitlist.get(&id).map(|e| e.value().clone()))
    }

    async fn waitlist_for_resource(&self, resource_id: Ulid) -> Result<Vec<WaitlistEntry>, StoreError> {
        let ids = self
            .waitlist_by_resource
            .get(&resource_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut entries: Vec<WaitlistEntry> = ids
            .iter()
            .filter_map(|id| self.waitlist.get(id).map(|e| e.value().clone()))
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn open_waitlist_entries(&self) -> Result<Vec<WaitlistEntry>, StoreError> {
        Ok(self
            .waitlist
            .iter()
            .filter(|e| e.value().status.is_open())
            .map(|e| e.value().clone())
            .collect())
    }

    async fn put_rule(&self, rule: &RecurrenceRule) -> Result<(), StoreError> {
        self.apply(StoreRecord::Rule(rule.clone()));
        Ok(())
    }

    async fn get_rule(&self, id: Ulid) -> Result<Option<RecurrenceRule>, StoreError> {
        Ok(self.rules.get(&id).map(|e| e.value().clone()))
    }

    async fn list_rules(&self) -> Result<Vec<RecurrenceRule>, StoreError> {
        Ok(self.rules.iter().map(|e| e.value().clone()).collect())
    }

    async fn put_notification(&self, job: &NotificationJob) -> Result<(), StoreError> {
        self.apply(StoreRecord::Notification(job.clone()));
        Ok(())
    }

    async fn get_notification(&self, id: Ulid) -> Result<Option<NotificationJob>, StoreError> {
        Ok(self.notifications.get(&id).map(|e| e.value().clone()))
    }

    async fn notifications_with_status(
        &self,
        status: NotificationStatus,
    ) -> Result<Vec<NotificationJob>, StoreError> {
        Ok(self
            .notifications
            .iter()
            .filter(|e| e.value().status == status)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn delete_notification(&self, id: Ulid) -> Result<(), StoreError> {
        self.apply(StoreRecord::NotificationDeleted(id));
        Ok(())
    }
}
