use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifySeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl NotifySeverity {
    pub fn badge(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentNotification {
    pub session_id: String,
    pub environment: String,
    pub phase: String,
    pub severity: NotifySeverity,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

impl DeploymentNotification {
    pub fn new(
        session_id: impl Into<String>,
        environment: impl Into<String>,
        phase: impl Into<String>,
        severity: NotifySeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            environment: environment.into(),
            phase: phase.into(),
            severity,
            message: message.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn subject(&self) -> String {
        format!(
            "[{badge}] {session} ({environment}) — {phase}",
            badge = self.severity.badge(),
            session = self.session_id,
            environment = self.environment,
            phase = self.phase
        )
    }
}

/// Delivery is best-effort: the orchestrator logs failures and moves on.
/// The evidence report is written from in-memory state, never from this
/// pipeline.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &DeploymentNotification) -> Result<(), NotifyError>;
}

pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(client: Client, webhook_url: impl Into<String>) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }

    pub fn with_default_client(webhook_url: impl Into<String>) -> Self {
        Self::new(Client::new(), webhook_url)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &DeploymentNotification) -> Result<(), NotifyError> {
        self.client
            .post(&self.webhook_url)
            .json(notification)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Used when the notification channel is disabled in config.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _notification: &DeploymentNotification) -> Result<(), NotifyError> {
        Ok(())
    }
}
