//! Notification worker: multi-channel outbound delivery.
//!
//! Each requested channel is tried in turn; a channel failure is absorbed
//! and the rest still run. The job succeeds if at least one channel
//! delivered; only total failure bubbles up for queue-level retry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use conveyor::LeasedJob;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::coordinator::{JobContext, JobProcessor};
use crate::error::EngineError;
use crate::model::{AuditEntry, Channel, Notification};
use crate::storage::SharedAuditStore;

use super::{decode_payload, NotificationJob};

/// Delivery over one channel.
#[async_trait::async_trait]
pub trait ChannelSender: Send + Sync {
    /// The channel this sender serves.
    fn channel(&self) -> Channel;

    /// Deliver one notification.
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Webhook delivery: POSTs the notification as JSON to the
/// `webhook_url` carried in its metadata.
pub struct WebhookSender {
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChannelSender for WebhookSender {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let url = notification
            .metadata
            .get("webhook_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("notification {} has no webhook_url", notification.id))?;

        let response = self.client.post(url).json(notification).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("webhook returned {}", response.status()));
        }
        Ok(())
    }
}

/// Test sender: records deliveries, optionally failing on demand.
pub struct RecordingSender {
    channel: Channel,
    sent: Mutex<Vec<Notification>>,
    fail: Mutex<bool>,
}

impl RecordingSender {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            sent: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
        }
    }

    /// Make subsequent sends fail.
    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Deliveries seen so far.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait::async_trait]
impl ChannelSender for RecordingSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        if *self.fail.lock() {
            return Err(anyhow!("{} channel unavailable", self.channel));
        }
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

/// The delivery processor.
pub struct NotificationWorker {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
    audit: SharedAuditStore,
}

impl NotificationWorker {
    /// A worker with no senders; register them with
    /// [`NotificationWorker::with_sender`].
    pub fn new(audit: SharedAuditStore) -> Self {
        Self {
            senders: HashMap::new(),
            audit,
        }
    }

    /// Register a channel sender. Replaces any previous sender for the
    /// same channel.
    pub fn with_sender(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(sender.channel(), sender);
        self
    }
}

#[async_trait::async_trait]
impl JobProcessor for NotificationWorker {
    async fn process(&self, job: LeasedJob, ctx: JobContext) -> Result<(), EngineError> {
        let payload: NotificationJob = decode_payload(&job)?;
        let notification = payload.notification;

        if notification.channels.is_empty() {
            return Err(EngineError::Validation(format!(
                "notification {} requests no channels",
                notification.id
            )));
        }

        let total = notification.channels.len();
        let mut delivered = 0usize;
        let mut failures: Vec<String> = Vec::new();

        for (index, channel) in notification.channels.iter().enumerate() {
            let outcome = match self.senders.get(channel) {
                Some(sender) => sender.send(&notification).await,
                None => Err(anyhow!("no sender registered for {channel}")),
            };
            match outcome {
                Ok(()) => {
                    delivered += 1;
                    debug!(notification_id = %notification.id, channel = %channel, "delivered");
                }
                Err(e) => {
                    warn!(notification_id = %notification.id, channel = %channel, error = %e, "channel failed");
                    failures.push(format!("{channel}: {e}"));
                }
            }
            ctx.progress((((index + 1) * 100) / total) as u8);
        }

        if delivered == 0 {
            let summary = failures.join("; ");
            self.audit
                .append(&AuditEntry::failure(
                    "notification",
                    "notification_failed",
                    "deliver",
                    "notification",
                    notification.id,
                    &summary,
                ))
                .await?;
            return Err(EngineError::Transient(format!(
                "all channels failed: {summary}"
            )));
        }

        self.audit
            .append(
                &AuditEntry::ok(
                    "notification",
                    "notification_sent",
                    "deliver",
                    "notification",
                    notification.id,
                )
                .with_metadata(serde_json::json!({
                    "delivered": delivered,
                    "failed": failures,
                })),
            )
            .await?;
        info!(notification_id = %notification.id, delivered, failed = failures.len(), "notification delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{JobContext, QueueName};
    use crate::events::PipelineEvent;
    use crate::storage::MemoryStores;
    use chrono::Utc;
    use conveyor::EventBus;
    use uuid::Uuid;

    fn ctx() -> JobContext {
        let events: EventBus<PipelineEvent> = EventBus::new();
        JobContext::new(
            QueueName::Notification,
            Uuid::new_v4(),
            1,
            tokio_util::sync::CancellationToken::new(),
            events,
        )
    }

    fn job(notification: Notification) -> LeasedJob {
        LeasedJob {
            id: Uuid::new_v4(),
            queue: "notification".into(),
            payload: serde_json::to_value(NotificationJob { notification }).unwrap(),
            attempt: 1,
            max_attempts: 3,
            enqueued_at: Utc::now(),
        }
    }

    fn notification(channels: Vec<Channel>) -> Notification {
        Notification::builder()
            .title("Transaction confirmed")
            .body("your transfer confirmed")
            .channels(channels)
            .build()
    }

    #[tokio::test]
    async fn one_surviving_channel_is_a_success() {
        let audit = Arc::new(MemoryStores::new());
        let in_app = Arc::new(RecordingSender::new(Channel::InApp));
        let email = Arc::new(RecordingSender::new(Channel::Email));
        email.set_fail(true);

        let worker = NotificationWorker::new(audit.clone())
            .with_sender(in_app.clone())
            .with_sender(email.clone());

        worker
            .process(job(notification(vec![Channel::InApp, Channel::Email])), ctx())
            .await
            .unwrap();

        assert_eq!(in_app.sent().len(), 1);
        assert!(email.sent().is_empty());
    }

    #[tokio::test]
    async fn total_failure_bubbles_for_retry() {
        let audit = Arc::new(MemoryStores::new());
        let push = Arc::new(RecordingSender::new(Channel::Push));
        push.set_fail(true);

        let worker = NotificationWorker::new(audit.clone()).with_sender(push.clone());
        let err = worker
            .process(job(notification(vec![Channel::Push])), ctx())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_sender_counts_as_channel_failure() {
        let audit = Arc::new(MemoryStores::new());
        let in_app = Arc::new(RecordingSender::new(Channel::InApp));
        let worker = NotificationWorker::new(audit.clone()).with_sender(in_app.clone());

        // Webhook has no sender; in-app still delivers.
        worker
            .process(
                job(notification(vec![Channel::Webhook, Channel::InApp])),
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(in_app.sent().len(), 1);
    }

    #[tokio::test]
    async fn empty_channel_set_is_invalid() {
        let audit = Arc::new(MemoryStores::new());
        let worker = NotificationWorker::new(audit);
        let err = worker
            .process(job(notification(vec![])), ctx())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
