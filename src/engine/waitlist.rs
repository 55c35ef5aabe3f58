use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::*;

use super::conflict::{conflict, resolve, validate_span};
use super::{Engine, EngineError};

fn illegal(entry: &WaitlistEntry, action: &'static str, reason: &'static str) -> EngineError {
    EngineError::InvalidStateTransition {
        id: entry.id,
        state: entry.status.as_str(),
        action,
        reason,
    }
}

impl Engine {
    /// Queue for a window that is currently full.
    pub async fn join_waitlist(
        &self,
        resource_id: Ulid,
        user_id: UserId,
        desired: Span,
        required_units: u32,
    ) -> Result<WaitlistEntry, EngineError> {
        validate_span(&desired)?;
        let now = self.now();
        if desired.start < now {
            return Err(EngineError::validation("desired window has already started"));
        }

        let _guard = self.lock(resource_id).await;
        let resource = self.resource(resource_id).await?;
        if required_units > resource.capacity {
            return Err(EngineError::validation("more units requested than the resource has"));
        }
        let existing = self.store.overlapping_reservations(resource_id, desired).await?;
        let availability = resolve(&resource, &existing, &desired, required_units, None)?;
        if availability.is_available {
            return Err(EngineError::validation("capacity is available; book directly"));
        }

        let entries = self.store.waitlist_for_resource(resource_id).await?;
        if let Some(dup) = entries.iter().find(|e| {
            e.user_id == user_id && e.status.is_open() && e.desired.overlaps(&desired)
        }) {
            return Err(EngineError::Duplicate(dup.id));
        }
        let position = entries
            .iter()
            .filter(|e| e.status == WaitlistStatus::Active)
            .count() as u32
            + 1;
        let sequence = entries.iter().map(|e| e.sequence).max().unwrap_or(0) + 1;

        let entry = WaitlistEntry {
            id: Ulid::new(),
            resource_id,
            user_id,
            desired,
            required_units,
            position,
            sequence,
            status: WaitlistStatus::Active,
            joined_at: now,
            notified_at: None,
            expires_at: desired.start + WAITLIST_TTL_AFTER_START_MS,
            reservation_ids: Vec::new(),
        };
        self.store.put_waitlist_entry(&entry).await?;
        self.publish_entry(&entry);
        metrics::counter!(WAITLIST_JOINS_TOTAL).increment(1);
        info!("waitlist {} joined on {resource_id} at position {position}", entry.id);
        Ok(entry)
    }

    pub async fn leave_waitlist(&self, entry_id: Ulid) -> Result<WaitlistEntry, EngineError> {
        let (_guard, mut entry) = self.locked_entry(entry_id).await?;
        if !entry.status.is_open() {
            return Err(illegal(&entry, "leave", "entry is closed"));
        }
        entry.status = WaitlistStatus::Cancelled;
        self.store.put_waitlist_entry(&entry).await?;
        self.publish_entry(&entry);
        self.renumber(entry.resource_id).await?;
        info!("waitlist {entry_id} left");
        Ok(entry)
    }

    /// Offer the entry's window if nominal capacity allows. Capacity already
    /// offered to other outstanding NOTIFIED entries counts as taken.
    pub async fn promote_waitlist_entry(
        &self,
        entry_id: Ulid,
    ) -> Result<WaitlistEntry, EngineError> {
        let (_guard, mut entry) = self.locked_entry(entry_id).await?;
        if entry.status != WaitlistStatus::Active {
            return Err(illegal(&entry, "promote", "entry is not waiting"));
        }
        let now = self.now();
        if entry.expires_at <= now {
            return Err(illegal(&entry, "promote", "entry has expired"));
        }
        if entry.desired.start <= now {
            return Err(EngineError::validation("desired window has already started"));
        }

        let resource = self.resource(entry.resource_id).await?;
        let existing = self
            .store
            .overlapping_reservations(resource.id, entry.desired)
            .await?;
        let availability = resolve(&resource, &existing, &entry.desired, entry.required_units, None)?;
        let offered: u32 = self
            .store
            .waitlist_for_resource(resource.id)
            .await?
            .iter()
            .filter(|e| e.id != entry.id && e.status == WaitlistStatus::Notified)
            .filter(|e| e.expires_at > now && e.desired.overlaps(&entry.desired))
            .map(|e| e.required_units)
            .sum();
        let nominal = availability.available_units.saturating_sub(offered);
        if nominal < entry.required_units {
            return Err(EngineError::Conflict {
                resource_id: resource.id,
                available_units: nominal,
                required_units: entry.required_units,
            });
        }

        let offer_expires_at = now + OFFER_WINDOW_MS;
        entry.status = WaitlistStatus::Notified;
        entry.notified_at = Some(now);
        entry.expires_at = offer_expires_at;
        self.store.put_waitlist_entry(&entry).await?;
        self.publish_entry(&entry);
        self.renumber(entry.resource_id).await?;
        metrics::counter!(WAITLIST_PROMOTIONS_TOTAL).increment(1);
        info!("waitlist {entry_id} promoted, offer open until {offer_expires_at}");
        self.enqueue(
            entry.user_id,
            entry.id,
            Payload::WaitlistSpotAvailable {
                entry_id: entry.id,
                resource_id: entry.resource_id,
                span: entry.desired,
                offer_expires_at,
            },
            Some(offer_expires_at),
        )
        .await;
        Ok(entry)
    }

    /// Turn an open offer into one reservation per required unit, all or
    /// nothing. Bookings left by an earlier attempt that failed part way are
    /// picked up rather than made again. If the capacity has gone in the
    /// meantime the entry goes back in the queue at its original place and
    /// the caller gets the Conflict.
    pub async fn convert_waitlist_entry(
        &self,
        entry_id: Ulid,
        vehicle: Option<VehicleInfo>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let (_guard, mut entry) = self.locked_entry(entry_id).await?;
        if entry.status != WaitlistStatus::Notified {
            return Err(illegal(&entry, "convert", "entry has no open offer"));
        }
        let now = self.now();
        if entry.expires_at <= now {
            return Err(illegal(&entry, "convert", "offer has expired"));
        }

        let resource = self.resource(entry.resource_id).await?;
        let existing = self
            .store
            .overlapping_reservations(resource.id, entry.desired)
            .await?;
        let mut booked: Vec<Reservation> = existing
            .iter()
            .filter(|r| r.source == BookingSource::Waitlist { entry_id })
            .filter(|r| r.status.holds_capacity() && r.span == entry.desired)
            .cloned()
            .collect();
        let missing = entry.required_units.saturating_sub(booked.len() as u32);

        if missing > 0 {
            let availability = resolve(&resource, &existing, &entry.desired, missing, None)?;
            if !availability.is_available {
                self.requeue(&mut entry, &booked).await?;
                return Err(conflict(&availability));
            }
            for _ in 0..missing {
                let request = ReservationRequest {
                    resource_id: entry.resource_id,
                    user_id: entry.user_id,
                    span: entry.desired,
                    vehicle: vehicle.clone(),
                };
                booked.push(
                    self.create_locked(request, BookingSource::Waitlist { entry_id })
                        .await?,
                );
            }
        } else {
            info!("waitlist {entry_id} already booked, finishing conversion");
        }

        booked.sort_by_key(|r| r.unit);
        entry.status = WaitlistStatus::Converted;
        entry.reservation_ids = booked.iter().map(|r| r.id).collect();
        self.store.put_waitlist_entry(&entry).await?;
        self.publish_entry(&entry);
        metrics::counter!(WAITLIST_CONVERSIONS_TOTAL, "outcome" => "converted").increment(1);
        info!(
            "waitlist {entry_id} converted to {} reservation(s)",
            booked.len()
        );
        Ok(booked)
    }

    /// Put a lost offer back in the queue, releasing any units an earlier
    /// partial conversion left behind. Caller must hold the resource lock.
    async fn requeue(
        &self,
        entry: &mut WaitlistEntry,
        partial: &[Reservation],
    ) -> Result<(), EngineError> {
        let now = self.now();
        for r in partial {
            let mut released = r.clone();
            released.status = ReservationStatus::Cancelled;
            released.cancelled_at = Some(now);
            self.store.put_reservation(&released).await?;
            self.invalidate_availability(released.resource_id);
            self.publish_reservation(&released);
        }

        entry.status = WaitlistStatus::Active;
        entry.notified_at = None;
        entry.expires_at = entry.desired.start + WAITLIST_TTL_AFTER_START_MS;
        self.store.put_waitlist_entry(entry).await?;
        self.renumber(entry.resource_id).await?;
        if let Some(requeued) = self.store.get_waitlist_entry(entry.id).await? {
            self.publish_entry(&requeued);
        }
        metrics::counter!(WAITLIST_CONVERSIONS_TOTAL, "outcome" => "demoted").increment(1);
        warn!("waitlist {} lost its offer to a race, requeued", entry.id);
        Ok(())
    }

    /// Lapse an open entry whose expiry has passed.
    pub async fn expire_waitlist_entry(
        &self,
        entry_id: Ulid,
    ) -> Result<WaitlistEntry, EngineError> {
        let (_guard, mut entry) = self.locked_entry(entry_id).await?;
        if !entry.status.is_open() {
            return Err(illegal(&entry, "expire", "entry is closed"));
        }
        if entry.expires_at > self.now() {
            return Err(illegal(&entry, "expire", "entry has not expired"));
        }
        let was_waiting = entry.status == WaitlistStatus::Active;
        entry.status = WaitlistStatus::Expired;
        self.store.put_waitlist_entry(&entry).await?;
        self.publish_entry(&entry);
        if was_waiting {
            self.renumber(entry.resource_id).await?;
        }
        info!("waitlist {entry_id} expired");
        Ok(entry)
    }

    /// ACTIVE entries that can still be offered, in resource then position order.
    pub async fn promotable_entries(&self) -> Result<Vec<Ulid>, EngineError> {
        let now = self.now();
        let mut entries: Vec<WaitlistEntry> = self
            .store
            .open_waitlist_entries()
            .await?
            .into_iter()
            .filter(|e| e.status == WaitlistStatus::Active)
            .filter(|e| e.expires_at > now && e.desired.start > now)
            .collect();
        entries.sort_by_key(|e| (e.resource_id, e.position));
        Ok(entries.into_iter().map(|e| e.id).collect())
    }

    pub async fn expired_waitlist_entries(&self) -> Result<Vec<Ulid>, EngineError> {
        let now = self.now();
        Ok(self
            .store
            .open_waitlist_entries()
            .await?
            .into_iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.id)
            .collect())
    }

    /// Open entries on a resource: ACTIVE ones in position order, then offers.
    pub async fn waitlist(&self, resource_id: Ulid) -> Result<Vec<WaitlistEntry>, EngineError> {
        self.resource(resource_id).await?;
        let mut open: Vec<WaitlistEntry> = self
            .store
            .waitlist_for_resource(resource_id)
            .await?
            .into_iter()
            .filter(|e| e.status.is_open())
            .collect();
        open.sort_by_key(|e| (e.status != WaitlistStatus::Active, e.position, e.sequence));
        Ok(open)
    }

    async fn locked_entry(
        &self,
        entry_id: Ulid,
    ) -> Result<(OwnedMutexGuard<()>, WaitlistEntry), EngineError> {
        let resource_id = self.waitlist_entry(entry_id).await?.resource_id;
        let guard = self.lock(resource_id).await;
        let entry = self.waitlist_entry(entry_id).await?;
        Ok((guard, entry))
    }

    /// Reassign positions 1..N over ACTIVE entries in join order.
    /// Caller must hold the resource lock.
    async fn renumber(&self, resource_id: Ulid) -> Result<(), EngineError> {
        let entries = self.store.waitlist_for_resource(resource_id).await?;
        let mut position = 0;
        for mut entry in entries
            .into_iter()
            .filter(|e| e.status == WaitlistStatus::Active)
        {
            position += 1;
            if entry.position != position {
                entry.position = position;
                self.store.put_waitlist_entry(&entry).await?;
                self.publish_entry(&entry);
            }
        }
        Ok(())
    }

    fn publish_entry(&self, entry: &WaitlistEntry) {
        self.publish(LiveEvent::WaitlistChanged {
            entry_id: entry.id,
            resource_id: entry.resource_id,
            user_id: entry.user_id,
            position: entry.position,
            status: entry.status,
        });
    }
}
