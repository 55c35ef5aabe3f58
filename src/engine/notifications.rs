use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::channel::ChannelError;
use crate::limits::*;
use crate::model::*;
use crate::observability::*;

use super::{Engine, EngineError};

/// Wait before retry number `retry_count` (1-based): 5, 25, 125, ... minutes.
pub fn backoff_delay_ms(retry_count: u32) -> Ms {
    BACKOFF_BASE
        .checked_pow(retry_count)
        .and_then(|m| m.checked_mul(MINUTE_MS))
        .unwrap_or(MAX_VALID_TIMESTAMP_MS)
}

/// Record a failed send. Schedules the next retry while attempts remain,
/// otherwise leaves the job terminally FAILED.
pub fn apply_send_failure(job: &mut NotificationJob, reason: String, now: Ms) {
    job.status = NotificationStatus::Failed;
    job.failure_reason = Some(reason);
    if job.retry_count < job.max_retries {
        job.retry_count += 1;
        job.next_retry_at = Some(now.saturating_add(backoff_delay_ms(job.retry_count)));
    } else {
        job.next_retry_at = None;
    }
}

fn illegal(job: &NotificationJob, action: &'static str, reason: &'static str) -> EngineError {
    EngineError::InvalidStateTransition {
        id: job.id,
        state: job.status.as_str(),
        action,
        reason,
    }
}

impl Engine {
    /// Create a PENDING job. `expires_at` defaults to now + the configured TTL.
    pub async fn schedule_notification(
        &self,
        user_id: UserId,
        subject_id: Ulid,
        payload: Payload,
        scheduled_for: Option<Ms>,
        expires_at: Option<Ms>,
    ) -> Result<NotificationJob, EngineError> {
        let now = self.now();
        let job = NotificationJob {
            id: Ulid::new(),
            user_id,
            subject_id,
            channel: payload.default_channel(),
            payload,
            status: NotificationStatus::Pending,
            created_at: now,
            scheduled_for,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            retry_count: 0,
            max_retries: self.config.max_retries,
            next_retry_at: None,
            expires_at: Some(expires_at.unwrap_or(now + self.config.notification_ttl_ms)),
            failure_reason: None,
        };
        self.store.put_notification(&job).await?;
        debug!("notification {} queued ({})", job.id, job.payload.kind());
        Ok(job)
    }

    /// Queue a message as a side effect of a committed change. A failure here
    /// never undoes the change; it is logged and dropped.
    pub(super) async fn enqueue(
        &self,
        user_id: UserId,
        subject_id: Ulid,
        payload: Payload,
        expires_at: Option<Ms>,
    ) -> Option<NotificationJob> {
        let kind = payload.kind();
        match self
            .schedule_notification(user_id, subject_id, payload, None, expires_at)
            .await
        {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("failed to queue {kind} notification for {subject_id}: {e}");
                None
            }
        }
    }

    /// One delivery attempt, bounded by the configured send timeout.
    /// Returns the job's status afterwards.
    pub async fn send_notification(&self, id: Ulid) -> Result<NotificationStatus, EngineError> {
        let _guard = self.lock(id).await;
        let mut job = self.notification(id).await?;
        let now = self.now();
        if job.status != NotificationStatus::Pending {
            return Ok(job.status);
        }
        if job.expires_at.is_some_and(|t| t <= now) {
            job.status = NotificationStatus::Expired;
            self.store.put_notification(&job).await?;
            metrics::counter!(NOTIFICATIONS_EXPIRED_TOTAL).increment(1);
            return Ok(job.status);
        }
        if job.scheduled_for.is_some_and(|t| t > now) {
            return Ok(job.status);
        }

        let timeout = self.config.send_timeout;
        let result = match tokio::time::timeout(timeout, self.channel.send(&job)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(timeout)),
        };
        let now = self.now();
        match result {
            Ok(()) => {
                job.status = NotificationStatus::Sent;
                job.sent_at = Some(now);
                job.next_retry_at = None;
                job.failure_reason = None;
                metrics::counter!(NOTIFICATION_SENDS_TOTAL, "outcome" => "sent").increment(1);
            }
            Err(e) => {
                let outcome = match e {
                    ChannelError::Timeout(_) => "timeout",
                    ChannelError::Rejected(_) => "failed",
                };
                metrics::counter!(NOTIFICATION_SENDS_TOTAL, "outcome" => outcome).increment(1);
                apply_send_failure(&mut job, e.to_string(), now);
                warn!(
                    "notification {id} send failed (attempt {}): {e}",
                    job.retry_count
                );
            }
        }
        self.store.put_notification(&job).await?;
        Ok(job.status)
    }

    /// Move FAILED jobs whose backoff has elapsed back to PENDING.
    pub async fn retry_due_notifications(&self) -> Result<usize, EngineError> {
        let now = self.now();
        let mut requeued = 0;
        for job in self
            .store
            .notifications_with_status(NotificationStatus::Failed)
            .await?
        {
            if !job.next_retry_at.is_some_and(|t| t <= now) {
                continue;
            }
            let _guard = self.lock(job.id).await;
            let mut job = self.notification(job.id).await?;
            if job.status != NotificationStatus::Failed
                || !job.next_retry_at.is_some_and(|t| t <= now)
            {
                continue;
            }
            job.status = NotificationStatus::Pending;
            job.next_retry_at = None;
            self.store.put_notification(&job).await?;
            requeued += 1;
        }
        Ok(requeued)
    }

    /// PENDING jobs ready to send, oldest first.
    pub async fn dispatchable_notifications(&self) -> Result<Vec<Ulid>, EngineError> {
        let now = self.now();
        let mut jobs: Vec<NotificationJob> = self
            .store
            .notifications_with_status(NotificationStatus::Pending)
            .await?
            .into_iter()
            .filter(|j| !j.scheduled_for.is_some_and(|t| t > now))
            .filter(|j| !j.expires_at.is_some_and(|t| t <= now))
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs.into_iter().map(|j| j.id).collect())
    }

    /// PENDING jobs past their expiry.
    pub async fn expired_notifications(&self) -> Result<Vec<Ulid>, EngineError> {
        let now = self.now();
        Ok(self
            .store
            .notifications_with_status(NotificationStatus::Pending)
            .await?
            .into_iter()
            .filter(|j| j.expires_at.is_some_and(|t| t <= now))
            .map(|j| j.id)
            .collect())
    }

    /// Drop an unsent job past its expiry. Returns false if it no longer qualifies.
    pub async fn expire_notification(&self, id: Ulid) -> Result<bool, EngineError> {
        let _guard = self.lock(id).await;
        let mut job = self.notification(id).await?;
        if job.status != NotificationStatus::Pending
            || !job.expires_at.is_some_and(|t| t <= self.now())
        {
            return Ok(false);
        }
        job.status = NotificationStatus::Expired;
        self.store.put_notification(&job).await?;
        metrics::counter!(NOTIFICATIONS_EXPIRED_TOTAL).increment(1);
        debug!("notification {id} expired unsent");
        Ok(true)
    }

    /// Delivery receipt from the channel provider.
    pub async fn mark_delivered(&self, id: Ulid) -> Result<NotificationJob, EngineError> {
        let _guard = self.lock(id).await;
        let mut job = self.notification(id).await?;
        if job.status != NotificationStatus::Sent {
            return Err(illegal(&job, "mark delivered", "notification was not sent"));
        }
        job.status = NotificationStatus::Delivered;
        job.delivered_at = Some(self.now());
        self.store.put_notification(&job).await?;
        Ok(job)
    }

    pub async fn mark_read(&self, id: Ulid) -> Result<NotificationJob, EngineError> {
        let _guard = self.lock(id).await;
        let mut job = self.notification(id).await?;
        if !matches!(
            job.status,
            NotificationStatus::Sent | NotificationStatus::Delivered
        ) {
            return Err(illegal(&job, "mark read", "notification was not sent"));
        }
        let now = self.now();
        job.status = NotificationStatus::Read;
        job.delivered_at.get_or_insert(now);
        job.read_at = Some(now);
        self.store.put_notification(&job).await?;
        Ok(job)
    }

    /// Delete finished jobs older than the retention window.
    pub async fn purge_notifications(&self) -> Result<usize, EngineError> {
        let cutoff = self.now() - self.config.notification_retention_ms;
        let mut purged = 0;
        for status in [
            NotificationStatus::Sent,
            NotificationStatus::Delivered,
            NotificationStatus::Read,
            NotificationStatus::Failed,
            NotificationStatus::Expired,
        ] {
            for job in self.store.notifications_with_status(status).await? {
                let finished = job.is_settled() || job.status == NotificationStatus::Sent;
                if finished && job.created_at < cutoff {
                    self.store.delete_notification(job.id).await?;
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            info!("purged {purged} old notifications");
        }
        Ok(purged)
    }

    pub async fn notifications_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<NotificationJob>, EngineError> {
        let mut jobs = Vec::new();
        for status in [
            NotificationStatus::Pending,
            NotificationStatus::Sent,
            NotificationStatus::Delivered,
            NotificationStatus::Read,
            NotificationStatus::Failed,
            NotificationStatus::Expired,
        ] {
            jobs.extend(
                self.store
                    .notifications_with_status(status)
                    .await?
                    .into_iter()
                    .filter(|j| j.user_id == user_id),
            );
        }
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }
}
