use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::model::NotificationJob;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel rejected message: {0}")]
    Rejected(String),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// Outbound delivery adapter (email gateway, push service, ...).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, job: &NotificationJob) -> Result<(), ChannelError>;
}

/// Writes each message to the log. The default when no real gateway is wired in.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, job: &NotificationJob) -> Result<(), ChannelError> {
        let body = serde_json::to_string(&job.payload)
            .map_err(|e| ChannelError::Rejected(e.to_string()))?;
        info!(
            job = %job.id,
            user = %job.user_id,
            channel = ?job.channel,
            kind = job.payload.kind(),
            "notify {body}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn log_channel_accepts_every_payload() {
        let job = NotificationJob {
            id: Ulid::new(),
            user_id: Ulid::new(),
            subject_id: Ulid::new(),
            channel: Channel::Email,
            payload: Payload::RecurringBookingFailed {
                rule_id: Ulid::new(),
                date: chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                reason: "no capacity".into(),
            },
            status: NotificationStatus::Pending,
            created_at: 0,
            scheduled_for: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            expires_at: None,
            failure_reason: None,
        };
        tokio_test::assert_ok!(LogChannel.send(&job).await);
    }
}
