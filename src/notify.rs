//! Usage notifications (log + webhook).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::store::TrackedApplication;

/// Timeout for webhook requests (30s for slow networks)
const TIMEOUT_SECS: u64 = 30;

/// Notices waiting for delivery before new ones are dropped.
const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    /// The app is approaching the disable threshold.
    Reminder,
    /// The disable threshold passed; disabling the app is recommended.
    Recommendation,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::Reminder => "reminder",
            NoticeKind::Recommendation => "recommendation",
        }
    }
}

/// One notification about an unused application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageNotice {
    pub package_id: String,
    pub label: String,
    pub kind: NoticeKind,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl UsageNotice {
    pub fn from_app(app: &TrackedApplication, kind: NoticeKind) -> Self {
        Self {
            package_id: app.package_id.clone(),
            label: app.label.clone(),
            kind,
            last_used_at: app.last_used_at,
        }
    }
}

/// Fire-and-forget delivery of usage notices.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver `notice`. Failures are logged by the sink, never returned.
    async fn notify(&self, notice: &UsageNotice);
}

/// Logs every notice and forwards it to the configured webhook.
pub struct Notifier {
    webhook: WebhookConfig,
    client: Client,
}

impl Notifier {
    pub fn new(webhook: WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client for notifications")?;

        Ok(Self { webhook, client })
    }

    async fn send_webhook(&self, notice: &UsageNotice) -> Result<()> {
        let mut request = self.client.post(&self.webhook.url).json(notice);

        // headers were validated when the config was deserialized
        for (key, value) in &self.webhook.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let token = self.webhook.get_token();
        if !token.is_empty() {
            request = request.bearer_auth(token.as_str());
        }

        let response = request.send().await.context("Failed to send webhook")?;
        if !response.status().is_success() {
            anyhow::bail!("Webhook returned non-success status: {}", response.status());
        }

        debug!("Webhook notice sent for {}", notice.package_id);
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn notify(&self, notice: &UsageNotice) {
        let label = if notice.label.is_empty() {
            &notice.package_id
        } else {
            &notice.label
        };
        match notice.kind {
            NoticeKind::Reminder => info!("Reminder: {} ({}) has not been used recently", label, notice.package_id),
            NoticeKind::Recommendation => info!(
                "Recommendation: {} ({}) is unused, consider disabling it",
                label, notice.package_id
            ),
        }

        if self.webhook.enabled {
            if let Err(e) = self.send_webhook(notice).await {
                warn!("Failed to deliver {} notice: {:#}", notice.kind.as_str(), e);
            }
        }
    }
}

/// Hands notices to a background delivery task.
///
/// `push` never waits: a slow sink only delays its own queue. When the
/// queue is full the notice is dropped with a warning. The delivery task
/// ends once every queue handle is dropped.
#[derive(Clone)]
pub struct NoticeQueue {
    tx: mpsc::Sender<UsageNotice>,
}

impl NoticeQueue {
    /// Spawn the delivery task draining into `sink`.
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<UsageNotice>(QUEUE_CAPACITY);
        let task = tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                sink.notify(&notice).await;
            }
            debug!("Notice delivery stopped");
        });
        (Self { tx }, task)
    }

    /// Queue `notice` for delivery. Returns `false` when it was dropped.
    pub fn push(&self, notice: UsageNotice) -> bool {
        match self.tx.try_send(notice) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(notice)) => {
                warn!(
                    "Notice queue full, dropping {} for {}",
                    notice.kind.as_str(),
                    notice.package_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(notice)) => {
                warn!("Notice delivery has stopped, dropping notice for {}", notice.package_id);
                false
            }
        }
    }
}
