//! Action transports: the capability interfaces the rule engine calls.
//!
//! The engine never talks to mail servers or HTTP endpoints itself; it calls
//! these traits and records whatever outcome they report. Local defaults:
//! - `HttpWebhookCaller`: real HTTP via reqwest
//! - `RouterPublisher`: appends to the dashboard notification history
//! - `LogEmailSender`, `LogTaskCreator`, `LogApprovalRouter`: tracing only

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::actions::{ApprovalConfig, EmailConfig, NotificationConfig, TaskConfig, WebhookConfig};
use crate::notify::{NotifyPriority, NotifyRouter};

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, config: &EmailConfig) -> Result<(), String>;
}

#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, config: &NotificationConfig) -> Result<(), String>;
}

#[async_trait]
pub trait TaskCreator: Send + Sync {
    async fn create(&self, config: &TaskConfig) -> Result<(), String>;
}

#[async_trait]
pub trait ApprovalRouter: Send + Sync {
    async fn request(&self, config: &ApprovalConfig) -> Result<(), String>;
}

#[async_trait]
pub trait WebhookCaller: Send + Sync {
    async fn call(&self, config: &WebhookConfig) -> Result<(), String>;
}

/// The full set of transports an engine dispatches to.
#[derive(Clone)]
pub struct Transports {
    pub email: Arc<dyn EmailSender>,
    pub notifications: Arc<dyn NotificationPublisher>,
    pub tasks: Arc<dyn TaskCreator>,
    pub approvals: Arc<dyn ApprovalRouter>,
    pub webhooks: Arc<dyn WebhookCaller>,
}

impl Transports {
    /// Local defaults; notifications land in `router`.
    pub fn local(router: Arc<Mutex<NotifyRouter>>) -> Self {
        Self {
            email: Arc::new(LogEmailSender),
            notifications: Arc::new(RouterPublisher::new(router)),
            tasks: Arc::new(LogTaskCreator),
            approvals: Arc::new(LogApprovalRouter),
            webhooks: Arc::new(HttpWebhookCaller::new()),
        }
    }

    pub fn with_email(mut self, email: Arc<dyn EmailSender>) -> Self {
        self.email = email;
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationPublisher>) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_tasks(mut self, tasks: Arc<dyn TaskCreator>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalRouter>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_webhooks(mut self, webhooks: Arc<dyn WebhookCaller>) -> Self {
        self.webhooks = webhooks;
        self
    }
}

impl Default for Transports {
    fn default() -> Self {
        Self::local(Arc::new(Mutex::new(NotifyRouter::new())))
    }
}

/// Fires webhooks over HTTP.
pub struct HttpWebhookCaller {
    client: reqwest::Client,
}

impl HttpWebhookCaller {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpWebhookCaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookCaller for HttpWebhookCaller {
    async fn call(&self, config: &WebhookConfig) -> Result<(), String> {
        let req = match config.method.to_uppercase().as_str() {
            "POST" => self.client.post(&config.url),
            "PUT" => self.client.put(&config.url),
            "PATCH" => self.client.patch(&config.url),
            "DELETE" => self.client.delete(&config.url),
            _ => self.client.get(&config.url),
        };

        let mut req = match &config.body {
            Some(body) => req
                .header("Content-Type", "application/json")
                .body(body.clone()),
            None => req,
        };
        for (key, value) in &config.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| format!("Webhook send failed: {e}"))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook {} {} → {}", config.method, config.url, resp.status());
            Ok(())
        } else {
            Err(format!("Webhook error {}", resp.status()))
        }
    }
}

/// Publishes notifications into the shared dashboard history.
pub struct RouterPublisher {
    router: Arc<Mutex<NotifyRouter>>,
}

impl RouterPublisher {
    pub fn new(router: Arc<Mutex<NotifyRouter>>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl NotificationPublisher for RouterPublisher {
    async fn publish(&self, config: &NotificationConfig) -> Result<(), String> {
        let mut notification =
            NotifyRouter::create(&config.title, &config.message, "workflow", NotifyPriority::Normal);
        notification.channel = config.channel.clone();
        self.router
            .lock()
            .map_err(|_| "notification history unavailable".to_string())?
            .record(notification);
        tracing::debug!("📢 Notification recorded: {}", config.title);
        Ok(())
    }
}

/// Logs outgoing email instead of sending it.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, config: &EmailConfig) -> Result<(), String> {
        tracing::info!("📧 Email to {}: {}", config.to.join(", "), config.subject);
        Ok(())
    }
}

/// Logs task creation requests.
pub struct LogTaskCreator;

#[async_trait]
impl TaskCreator for LogTaskCreator {
    async fn create(&self, config: &TaskConfig) -> Result<(), String> {
        tracing::info!(
            "🗂️ Task '{}' for {}",
            config.title,
            config.assignee.as_deref().unwrap_or("unassigned")
        );
        Ok(())
    }
}

/// Logs approval requests.
pub struct LogApprovalRouter;

#[async_trait]
impl ApprovalRouter for LogApprovalRouter {
    async fn request(&self, config: &ApprovalConfig) -> Result<(), String> {
        tracing::info!("🖊️ Approval requested from {}: {}", config.approver, config.subject);
        Ok(())
    }
}
