//! Workflow actions: one typed config per action kind.

use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};
use crate::workflow::WorkflowEvent;

/// Action kind, used in outcomes and listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Email,
    Notification,
    Task,
    Approval,
    Webhook,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Email => write!(f, "email"),
            ActionType::Notification => write!(f, "notification"),
            ActionType::Task => write!(f, "task"),
            ActionType::Approval => write!(f, "approval"),
            ActionType::Webhook => write!(f, "webhook"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Target channel; empty = the configured default channel.
    #[serde(default)]
    pub channel: String,
    pub title: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub title: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub due_in_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub approver: String,
    pub subject: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

fn default_method() -> String {
    "POST".into()
}

/// Typed action configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    Email(EmailConfig),
    Notification(NotificationConfig),
    Task(TaskConfig),
    Approval(ApprovalConfig),
    Webhook(WebhookConfig),
}

impl ActionConfig {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionConfig::Email(_) => ActionType::Email,
            ActionConfig::Notification(_) => ActionType::Notification,
            ActionConfig::Task(_) => ActionType::Task,
            ActionConfig::Approval(_) => ActionType::Approval,
            ActionConfig::Webhook(_) => ActionType::Webhook,
        }
    }

    /// Static checks run when a rule is registered or edited.
    pub fn validate(&self) -> SchedulerResult<()> {
        let invalid = |msg: String| Err(SchedulerError::InvalidRule(msg));
        match self {
            ActionConfig::Email(cfg) => {
                if cfg.to.is_empty() {
                    return invalid("email action needs at least one recipient".into());
                }
                if let Some(bad) = cfg.to.iter().find(|addr| !addr.contains('@')) {
                    return invalid(format!("invalid email recipient: '{bad}'"));
                }
                if cfg.subject.trim().is_empty() {
                    return invalid("email action needs a subject".into());
                }
            }
            ActionConfig::Notification(cfg) => {
                if cfg.title.trim().is_empty() {
                    return invalid("notification action needs a title".into());
                }
            }
            ActionConfig::Task(cfg) => {
                if cfg.title.trim().is_empty() {
                    return invalid("task action needs a title".into());
                }
            }
            ActionConfig::Approval(cfg) => {
                if cfg.approver.trim().is_empty() || cfg.subject.trim().is_empty() {
                    return invalid("approval action needs an approver and a subject".into());
                }
            }
            ActionConfig::Webhook(cfg) => {
                if !(cfg.url.starts_with("http://") || cfg.url.starts_with("https://")) {
                    return invalid(format!("webhook url must be http(s): '{}'", cfg.url));
                }
                let method = cfg.method.to_uppercase();
                if !matches!(method.as_str(), "GET" | "POST" | "PUT" | "PATCH" | "DELETE") {
                    return invalid(format!("unsupported webhook method: '{}'", cfg.method));
                }
            }
        }
        Ok(())
    }

    /// Substitute event data into string fields.
    /// Supports {{event.name}}, {{event.timestamp}} and {{event.<payload field>}}.
    pub fn interpolate(&self, event: &WorkflowEvent) -> ActionConfig {
        let Ok(mut value) = serde_json::to_value(self) else {
            return self.clone();
        };
        interpolate_value(&mut value, event);
        serde_json::from_value(value).unwrap_or_else(|_| self.clone())
    }
}

fn interpolate_value(value: &mut serde_json::Value, event: &WorkflowEvent) {
    match value {
        serde_json::Value::String(s) if s.contains("{{") => *s = render(s, event),
        serde_json::Value::Array(items) => {
            items.iter_mut().for_each(|item| interpolate_value(item, event))
        }
        serde_json::Value::Object(map) => {
            map.values_mut().for_each(|item| interpolate_value(item, event))
        }
        _ => {}
    }
}

fn render(template: &str, event: &WorkflowEvent) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        match key.strip_prefix("event.") {
            Some(field) => out.push_str(&event_field(event, field)),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn event_field(event: &WorkflowEvent, field: &str) -> String {
    match field {
        "name" => event.name.clone(),
        "timestamp" => event.timestamp.to_rfc3339(),
        _ => {
            let found = field
                .split('.')
                .try_fold(&event.payload, |value, key| value.get(key));
            match found {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        }
    }
}

/// One step of an action chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAction {
    #[serde(flatten)]
    pub config: ActionConfig,
    /// Wait after the previous action completes before running this one.
    #[serde(default)]
    pub delay_secs: u64,
}

impl WorkflowAction {
    pub fn new(config: ActionConfig) -> Self {
        Self {
            config,
            delay_secs: 0,
        }
    }

    pub fn after(mut self, delay_secs: u64) -> Self {
        self.delay_secs = delay_secs;
        self
    }

    pub fn action_type(&self) -> ActionType {
        self.config.action_type()
    }

    pub fn email(to: &str, subject: &str, body: &str) -> Self {
        Self::new(ActionConfig::Email(EmailConfig {
            to: vec![to.to_string()],
            subject: subject.to_string(),
            body: body.to_string(),
        }))
    }

    pub fn notification(title: &str, message: &str) -> Self {
        Self::new(ActionConfig::Notification(NotificationConfig {
            channel: String::new(),
            title: title.to_string(),
            message: message.to_string(),
        }))
    }

    pub fn task(title: &str, assignee: Option<&str>) -> Self {
        Self::new(ActionConfig::Task(TaskConfig {
            title: title.to_string(),
            assignee: assignee.map(str::to_string),
            due_in_days: None,
        }))
    }

    pub fn approval(approver: &str, subject: &str) -> Self {
        Self::new(ActionConfig::Approval(ApprovalConfig {
            approver: approver.to_string(),
            subject: subject.to_string(),
            details: String::new(),
        }))
    }

    pub fn webhook(url: &str) -> Self {
        Self::new(ActionConfig::Webhook(WebhookConfig {
            url: url.to_string(),
            method: default_method(),
            body: None,
            headers: Vec::new(),
        }))
    }
}
