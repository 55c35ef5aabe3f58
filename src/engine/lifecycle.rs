use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::date_of;
use crate::limits::*;
use crate::model::*;
use crate::observability::*;

use super::conflict::{conflict, resolve, validate_span};
use super::{Engine, EngineError};

/// Refund owed when cancelling a reservation starting at `start` at time `now`.
pub fn refund_percent(start: Ms, now: Ms) -> u8 {
    let lead = start - now;
    if lead >= FULL_REFUND_LEAD_MS {
        FULL_REFUND_PERCENT
    } else if lead >= CANCEL_CUTOFF_MS {
        PARTIAL_REFUND_PERCENT
    } else {
        0
    }
}

fn illegal(r: &Reservation, action: &'static str, reason: &'static str) -> EngineError {
    EngineError::InvalidStateTransition {
        id: r.id,
        state: r.status.as_str(),
        action,
        reason,
    }
}

fn transitioned(to: ReservationStatus) {
    metrics::counter!(RESERVATION_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
}

impl Engine {
    /// Book one unit. Serialised per resource, so two racing creates can
    /// never both take the last unit.
    pub async fn create_reservation(
        &self,
        request: ReservationRequest,
    ) -> Result<Reservation, EngineError> {
        let _guard = self.lock(request.resource_id).await;
        self.create_locked(request, BookingSource::Direct).await
    }

    /// Caller must hold the resource lock.
    pub(super) async fn create_locked(
        &self,
        request: ReservationRequest,
        source: BookingSource,
    ) -> Result<Reservation, EngineError> {
        validate_span(&request.span)?;
        let now = self.now();
        if request.span.start < now {
            return Err(EngineError::validation("reservation cannot start in the past"));
        }
        if let Some(v) = &request.vehicle
            && v.plate.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("plate too long"));
        }

        let resource = self.resource(request.resource_id).await?;
        let existing = self
            .store
            .overlapping_reservations(resource.id, request.span)
            .await?;
        let availability = resolve(&resource, &existing, &request.span, 1, None)?;
        let Some(&unit) = availability.assigned_units.first() else {
            metrics::counter!(RESERVATION_CONFLICTS_TOTAL).increment(1);
            debug!("no capacity on {} for {:?}", resource.id, request.span);
            return Err(conflict(&availability));
        };

        let reservation = Reservation {
            id: Ulid::new(),
            resource_id: resource.id,
            user_id: request.user_id,
            unit,
            span: request.span,
            status: ReservationStatus::Confirmed,
            payment_status: PaymentStatus::Pending,
            amount_cents: resource.price(&request.span),
            vehicle: request.vehicle,
            source,
            created_at: now,
            checked_in_at: None,
            checked_out_at: None,
            cancelled_at: None,
            refund: None,
            extensions: Vec::new(),
            reminder_sent: false,
        };
        self.store.put_reservation(&reservation).await?;
        self.invalidate_availability(resource.id);
        self.publish_reservation(&reservation);

        let label = match source {
            BookingSource::Direct => "direct",
            BookingSource::Waitlist { .. } => "waitlist",
            BookingSource::Recurrence { .. } => "recurrence",
        };
        let payload = match source {
            BookingSource::Recurrence { rule_id } => Payload::RecurringBookingCreated {
                rule_id,
                reservation_id: reservation.id,
                date: date_of(reservation.span.start),
                span: reservation.span,
            },
            BookingSource::Direct | BookingSource::Waitlist { .. } => {
                Payload::ReservationConfirmed {
                    reservation_id: reservation.id,
                    resource_id: resource.id,
                    unit,
                    span: reservation.span,
                    amount_cents: reservation.amount_cents,
                }
            }
        };
        metrics::counter!(RESERVATIONS_CREATED_TOTAL, "source" => label).increment(1);
        info!(
            "reservation {} confirmed on {} unit {unit} ({label})",
            reservation.id, resource.id
        );
        self.enqueue(reservation.user_id, reservation.id, payload, None)
            .await;
        Ok(reservation)
    }

    /// Lock the reservation's resource and reload it under the lock.
    async fn locked_reservation(
        &self,
        id: Ulid,
    ) -> Result<(OwnedMutexGuard<()>, Reservation), EngineError> {
        let resource_id = self.reservation(id).await?.resource_id;
        let guard = self.lock(resource_id).await;
        let reservation = self.reservation(id).await?;
        Ok((guard, reservation))
    }

    pub(super) fn publish_reservation(&self, r: &Reservation) {
        self.publish(LiveEvent::ReservationChanged {
            reservation_id: r.id,
            resource_id: r.resource_id,
            status: r.status,
            span: r.span,
        });
    }

    /// Persist a status change, free capacity if needed, and tell subscribers.
    async fn commit_transition(&self, r: &Reservation) -> Result<(), EngineError> {
        self.store.put_reservation(r).await?;
        self.invalidate_availability(r.resource_id);
        self.publish_reservation(r);
        transitioned(r.status);
        Ok(())
    }

    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        reason: &str,
    ) -> Result<Reservation, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let (_guard, mut r) = self.locked_reservation(id).await?;
        if !matches!(
            r.status,
            ReservationStatus::Pending | ReservationStatus::Confirmed
        ) {
            return Err(illegal(&r, "cancel", "already started or finished"));
        }
        let now = self.now();
        if now > r.span.start - CANCEL_CUTOFF_MS {
            return Err(illegal(&r, "cancel", "cancellation window closed"));
        }

        let percent = refund_percent(r.span.start, now);
        let amount_cents = r.amount_cents * percent as u64 / 100;
        r.status = ReservationStatus::Cancelled;
        r.cancelled_at = Some(now);
        r.refund = Some(Refund {
            percent,
            amount_cents,
            reason: reason.to_string(),
            issued_at: now,
        });
        if r.payment_status == PaymentStatus::Paid {
            r.payment_status = if percent == FULL_REFUND_PERCENT {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartiallyRefunded
            };
        }
        self.commit_transition(&r).await?;
        info!("reservation {id} cancelled, refund {percent}%");
        self.enqueue(
            r.user_id,
            r.id,
            Payload::ReservationCancelled {
                reservation_id: r.id,
                refund_percent: percent,
                refund_cents: amount_cents,
            },
            None,
        )
        .await;
        Ok(r)
    }

    /// Allowed from 15 minutes before start until the end.
    pub async fn check_in(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (_guard, mut r) = self.locked_reservation(id).await?;
        if r.status != ReservationStatus::Confirmed {
            return Err(illegal(&r, "check in", "reservation is not confirmed"));
        }
        let now = self.now();
        if now < r.span.start - CHECK_IN_EARLY_MS || now > r.span.end {
            return Err(illegal(&r, "check in", "outside check-in window"));
        }
        r.status = ReservationStatus::Active;
        r.checked_in_at = Some(now);
        self.commit_transition(&r).await?;
        info!("reservation {id} checked in");
        Ok(r)
    }

    pub async fn check_out(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (_guard, mut r) = self.locked_reservation(id).await?;
        if r.status != ReservationStatus::Active || r.checked_in_at.is_none() {
            return Err(illegal(&r, "check out", "reservation is not checked in"));
        }
        r.status = ReservationStatus::Completed;
        r.checked_out_at = Some(self.now());
        self.commit_transition(&r).await?;
        info!("reservation {id} checked out");
        Ok(r)
    }

    /// Push the end of an ACTIVE reservation out, keeping its unit.
    pub async fn extend_reservation(
        &self,
        id: Ulid,
        new_end: Ms,
    ) -> Result<Reservation, EngineError> {
        let (_guard, mut r) = self.locked_reservation(id).await?;
        if r.status != ReservationStatus::Active {
            return Err(illegal(&r, "extend", "reservation is not active"));
        }
        let now = self.now();
        if now >= r.span.end {
            return Err(illegal(&r, "extend", "reservation already ended"));
        }
        if new_end <= r.span.end {
            return Err(EngineError::validation("new end must be after the current end"));
        }
        validate_span(&Span::new(r.span.start, new_end))?;

        let extra = Span::new(r.span.end, new_end);
        let resource = self.resource(r.resource_id).await?;
        let existing = self.store.overlapping_reservations(resource.id, extra).await?;
        let availability = resolve(&resource, &existing, &extra, 1, Some(r.id))?;
        if !availability.free_units.contains(&r.unit) {
            metrics::counter!(RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict {
                resource_id: resource.id,
                available_units: 0,
                required_units: 1,
            });
        }

        let additional_cents = resource.price(&extra);
        r.extensions.push(Extension {
            previous_end: r.span.end,
            new_end,
            additional_cents,
            extended_at: now,
        });
        r.amount_cents += additional_cents;
        r.span.end = new_end;
        self.store.put_reservation(&r).await?;
        self.invalidate_availability(r.resource_id);
        self.publish_reservation(&r);
        info!("reservation {id} extended to {new_end} (+{additional_cents} cents)");
        Ok(r)
    }

    /// Record settlement of the reservation's charge.
    pub async fn mark_paid(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (_guard, mut r) = self.locked_reservation(id).await?;
        if r.status == ReservationStatus::Cancelled {
            return Err(illegal(&r, "pay", "reservation is cancelled"));
        }
        if r.payment_status != PaymentStatus::Pending {
            return Err(illegal(&r, "pay", "payment already settled"));
        }
        r.payment_status = PaymentStatus::Paid;
        self.store.put_reservation(&r).await?;
        Ok(r)
    }

    // ── Time-driven transitions ──────────────────────────────

    /// CONFIRMED reservations whose window ended without a check-in.
    pub async fn no_show_candidates(&self) -> Result<Vec<Ulid>, EngineError> {
        let now = self.now();
        Ok(self
            .store
            .reservations_with_status(ReservationStatus::Confirmed)
            .await?
            .into_iter()
            .filter(|r| now > r.span.end)
            .map(|r| r.id)
            .collect())
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (_guard, mut r) = self.locked_reservation(id).await?;
        if r.status != ReservationStatus::Confirmed {
            return Err(illegal(&r, "mark no-show", "reservation is not confirmed"));
        }
        if self.now() <= r.span.end {
            return Err(illegal(&r, "mark no-show", "reservation has not ended"));
        }
        r.status = ReservationStatus::NoShow;
        self.commit_transition(&r).await?;
        info!("reservation {id} marked no-show");
        self.enqueue(
            r.user_id,
            r.id,
            Payload::ReservationNoShow { reservation_id: r.id },
            None,
        )
        .await;
        Ok(r)
    }

    /// Sweep every overdue CONFIRMED reservation to NO_SHOW. Returns how many moved.
    pub async fn mark_no_shows(&self) -> Result<usize, EngineError> {
        let mut marked = 0;
        for id in self.no_show_candidates().await? {
            match self.mark_no_show(id).await {
                Ok(_) => marked += 1,
                Err(e) if e.is_store() => return Err(e),
                Err(e) => debug!("no-show skip {id}: {e}"),
            }
        }
        Ok(marked)
    }

    /// CONFIRMED reservations starting within the reminder lead time.
    pub async fn reminder_candidates(&self) -> Result<Vec<Ulid>, EngineError> {
        let now = self.now();
        let lead = self.config.reminder_lead_ms;
        Ok(self
            .store
            .reservations_with_status(ReservationStatus::Confirmed)
            .await?
            .into_iter()
            .filter(|r| !r.reminder_sent && r.span.start > now && r.span.start - lead <= now)
            .map(|r| r.id)
            .collect())
    }

    /// Queue the start reminder once. Returns false if it no longer applies.
    pub async fn send_reminder(&self, id: Ulid) -> Result<bool, EngineError> {
        let (_guard, mut r) = self.locked_reservation(id).await?;
        let now = self.now();
        if r.status != ReservationStatus::Confirmed || r.reminder_sent || now >= r.span.start {
            return Ok(false);
        }
        r.reminder_sent = true;
        self.store.put_reservation(&r).await?;
        self.enqueue(
            r.user_id,
            r.id,
            Payload::ReservationReminder {
                reservation_id: r.id,
                resource_id: r.resource_id,
                unit: r.unit,
                starts_at: r.span.start,
            },
            Some(r.span.start),
        )
        .await;
        Ok(true)
    }

    pub async fn reservations_for_resource(
        &self,
        resource_id: Ulid,
        window: Span,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.resource(resource_id).await?;
        Ok(self.store.overlapping_reservations(resource_id, window).await?)
    }
}
