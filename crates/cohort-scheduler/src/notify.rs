//! Notification history: what the dashboard's notification feed reads.
//! Lightweight: no queues. Bounded in-memory ring buffer.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// A notification shown to portal users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Title/summary.
    pub title: String,
    /// Body content.
    pub body: String,
    /// Channel it was published to (dashboard, slack, …).
    pub channel: String,
    /// Source (which rule or task produced this).
    pub source: String,
    pub priority: NotifyPriority,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Records published notifications for later display.
pub struct NotifyRouter {
    history: VecDeque<Notification>,
    limit: usize,
    default_channel: String,
}

impl NotifyRouter {
    pub fn new() -> Self {
        Self::with_limit(100, "dashboard")
    }

    pub fn with_limit(limit: usize, default_channel: &str) -> Self {
        Self {
            history: VecDeque::new(),
            limit: limit.max(1),
            default_channel: default_channel.to_string(),
        }
    }

    pub fn from_config(config: &cohort_core::NotifyConfig) -> Self {
        Self::with_limit(config.history_limit, &config.default_channel)
    }

    pub fn default_channel(&self) -> &str {
        &self.default_channel
    }

    /// Record a sent notification in history.
    pub fn record(&mut self, mut notification: Notification) {
        if notification.channel.is_empty() {
            notification.channel = self.default_channel.clone();
        }
        self.history.push_back(notification);
        while self.history.len() > self.limit {
            self.history.pop_front();
        }
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Notification> {
        self.history.iter()
    }

    /// Newest first, at most `limit`.
    pub fn recent(&self, limit: usize) -> Vec<Notification> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Create a notification.
    pub fn create(title: &str, body: &str, source: &str, priority: NotifyPriority) -> Notification {
        Notification {
            title: title.to_string(),
            body: body.to_string(),
            channel: String::new(),
            source: source.to_string(),
            priority,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::new()
    }
}
