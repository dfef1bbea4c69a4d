//! Workflow Engine: trigger-based automation.
//!
//! When events happen (a procurement request is submitted, a tick from the
//! scheduler loop, a risk score changes), the engine evaluates workflow rules
//! and runs the action chains of the ones that match.
//!
//! ## Architecture
//! ```text
//! Event (domain event | scheduler tick)
//!   → RuleEngine.evaluate(event)
//!     → For each enabled rule whose trigger matches (concurrently):
//!       → execute: action₁ → (delay) → action₂ → … via Transports
//!       → record outcome per action, update run stats
//!       → ExecutionRecord into history
//! ```
//!
//! Each rule lives in its own slot behind a mutex: counter updates for one
//! rule serialize, different rules run in parallel. The slot lock is never
//! held across a delay or a transport call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::actions::{ActionConfig, ActionType, WorkflowAction};
use crate::clock::{Clock, SystemClock};
use crate::condition::Predicate;
use crate::cron::CronSchedule;
use crate::dispatch::Transports;
use crate::error::{SchedulerError, SchedulerResult};

/// Rule identifier.
pub type RuleId = String;

/// Portal area a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Procurement,
    Vendor,
    Document,
    Audit,
    Risk,
    Funding,
    Portfolio,
    Task,
    Community,
    #[default]
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Paused,
    Error,
}

impl RuleStatus {
    fn armed(enabled: bool) -> Self {
        if enabled { RuleStatus::Active } else { RuleStatus::Paused }
    }
}

/// What makes a rule fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Domain event with this exact name.
    Event { name: String },
    /// Cron expression, matched against scheduler ticks.
    Schedule { spec: String },
    /// Predicate over the payload of domain events (optionally only `event`).
    Condition {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
}

/// Trigger with its expression parsed once at registration.
#[derive(Debug, Clone)]
enum TriggerMatcher {
    Event(String),
    Schedule(CronSchedule),
    Condition {
        predicate: Predicate,
        event: Option<String>,
    },
}

impl TriggerMatcher {
    fn compile(trigger: &Trigger) -> SchedulerResult<Self> {
        match trigger {
            Trigger::Event { name } => {
                if name.trim().is_empty() {
                    return Err(SchedulerError::InvalidRule("event trigger needs a name".into()));
                }
                Ok(TriggerMatcher::Event(name.clone()))
            }
            Trigger::Schedule { spec } => Ok(TriggerMatcher::Schedule(CronSchedule::parse(spec)?)),
            Trigger::Condition { expression, event } => Ok(TriggerMatcher::Condition {
                predicate: Predicate::parse(expression)?,
                event: event.clone(),
            }),
        }
    }

    /// `tick_window` is the `(previous, current]` span covered by a tick event.
    fn matches(
        &self,
        event: &WorkflowEvent,
        tick_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> bool {
        match (self, event.kind) {
            (TriggerMatcher::Event(name), EventKind::Domain) => *name == event.name,
            (TriggerMatcher::Schedule(cron), EventKind::Tick) => {
                tick_window.is_some_and(|(from, to)| cron.fires_between(from, to))
            }
            (TriggerMatcher::Condition { predicate, event: scope }, EventKind::Domain) => {
                scope.as_ref().is_none_or(|name| *name == event.name)
                    && predicate.evaluate(&event.payload)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Domain,
    Tick,
}

/// An event pushed into the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub kind: EventKind,
    /// e.g. "procurement.submitted", "vendor.risk_changed", "tick".
    pub name: String,
    /// Event data (freeform JSON).
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    /// Create a domain event stamped now.
    pub fn domain(name: &str, payload: serde_json::Value) -> Self {
        Self::domain_at(name, payload, Utc::now())
    }

    pub fn domain_at(name: &str, payload: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::Domain,
            name: name.to_string(),
            payload,
            timestamp,
        }
    }

    /// Create a scheduler tick.
    pub fn tick(at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::Tick,
            name: "tick".to_string(),
            payload: serde_json::json!({}),
            timestamp: at,
        }
    }
}

/// Caller-supplied rule contents; identity, status and stats are engine-owned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: RuleCategory,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: Trigger,
    pub actions: Vec<WorkflowAction>,
}

fn default_enabled() -> bool {
    true
}

impl RuleDefinition {
    pub fn new(name: &str, trigger: Trigger, actions: Vec<WorkflowAction>) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            category: RuleCategory::General,
            enabled: true,
            trigger,
            actions,
        }
    }

    pub fn on_event(name: &str, event: &str, actions: Vec<WorkflowAction>) -> Self {
        Self::new(name, Trigger::Event { name: event.to_string() }, actions)
    }

    pub fn category(mut self, category: RuleCategory) -> Self {
        self.category = category;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self) -> SchedulerResult<TriggerMatcher> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::InvalidRule("rule needs a name".into()));
        }
        if self.actions.is_empty() {
            return Err(SchedulerError::InvalidRule(format!(
                "rule '{}' has no actions",
                self.name
            )));
        }
        for action in &self.actions {
            action.config.validate()?;
        }
        TriggerMatcher::compile(&self.trigger)
    }
}

/// A registered workflow rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRule {
    pub id: RuleId,
    pub name: String,
    pub description: String,
    pub category: RuleCategory,
    pub enabled: bool,
    pub status: RuleStatus,
    pub trigger: Trigger,
    pub actions: Vec<WorkflowAction>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Partial,
    Error,
}

impl ExecutionStatus {
    fn from_outcomes(outcomes: &[ActionOutcome]) -> Self {
        let succeeded = outcomes
            .iter()
            .filter(|o| o.status == ActionStatus::Succeeded)
            .count();
        if succeeded == outcomes.len() {
            ExecutionStatus::Success
        } else if succeeded == 0 {
            ExecutionStatus::Error
        } else {
            ExecutionStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Engine shut down while the action was still waiting on its delay.
    Cancelled,
}

/// Result of one action within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub index: usize,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// History entry for one rule run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub rule_id: RuleId,
    pub rule_name: String,
    /// Name of the triggering event.
    pub event: String,
    pub fired_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub outcomes: Vec<ActionOutcome>,
    pub duration_ms: u64,
}

struct RuleSlot {
    rule: WorkflowRule,
    matcher: TriggerMatcher,
}

/// Registry and executor for workflow rules.
pub struct RuleEngine {
    rules: RwLock<HashMap<RuleId, Arc<Mutex<RuleSlot>>>>,
    history: std::sync::Mutex<VecDeque<ExecutionRecord>>,
    history_limit: usize,
    last_tick: std::sync::Mutex<Option<DateTime<Utc>>>,
    transports: Transports,
    clock: Arc<dyn Clock>,
    action_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl RuleEngine {
    pub fn new(transports: Transports) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            history: std::sync::Mutex::new(VecDeque::new()),
            history_limit: 200,
            last_tick: std::sync::Mutex::new(None),
            transports,
            clock: Arc::new(SystemClock),
            action_timeout: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(transports: Transports, config: &cohort_core::SchedulerConfig) -> Self {
        Self::new(transports)
            .with_history_limit(config.history_limit)
            .with_action_timeout(config.action_timeout_secs.map(Duration::from_secs))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn with_action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Size of the in-memory execution history.
    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Token cancelled by [`RuleEngine::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel pending action delays; in-flight chains record the rest as cancelled.
    pub fn shutdown(&self) {
        tracing::info!("🛑 Workflow engine shutting down");
        self.shutdown.cancel();
    }

    /// Register a new rule. Status starts `active` if enabled, else `paused`.
    pub async fn register(&self, definition: RuleDefinition) -> SchedulerResult<RuleId> {
        let matcher = definition.validate()?;
        let id = uuid::Uuid::new_v4().to_string();
        let rule = WorkflowRule {
            id: id.clone(),
            name: definition.name,
            description: definition.description,
            category: definition.category,
            enabled: definition.enabled,
            status: RuleStatus::armed(definition.enabled),
            trigger: definition.trigger,
            actions: definition.actions,
            last_run_at: None,
            run_count: 0,
            created_at: self.clock.now(),
        };
        tracing::info!("⚙️ Workflow rule registered: '{}' ({})", rule.name, id);
        self.rules
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(RuleSlot { rule, matcher })));
        Ok(id)
    }

    /// Re-insert a previously persisted rule, keeping its id and statistics.
    pub async fn restore(&self, rule: WorkflowRule) -> SchedulerResult<()> {
        let matcher = TriggerMatcher::compile(&rule.trigger)?;
        let id = rule.id.clone();
        self.rules
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(RuleSlot { rule, matcher })));
        Ok(())
    }

    async fn slot(&self, id: &str) -> SchedulerResult<Arc<Mutex<RuleSlot>>> {
        self.rules
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("workflow rule {id}")))
    }

    /// Enable/disable a rule. Status follows; run statistics are untouched.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> SchedulerResult<()> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.rule.enabled = enabled;
        slot.rule.status = RuleStatus::armed(enabled);
        tracing::info!(
            "{} Workflow rule '{}' {}",
            if enabled { "▶️" } else { "⏸️" },
            slot.rule.name,
            if enabled { "enabled" } else { "paused" }
        );
        Ok(())
    }

    /// Replace a rule's definition, keeping id and statistics.
    pub async fn edit(&self, id: &str, definition: RuleDefinition) -> SchedulerResult<()> {
        let matcher = definition.validate()?;
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.rule.name = definition.name;
        slot.rule.description = definition.description;
        slot.rule.category = definition.category;
        slot.rule.enabled = definition.enabled;
        slot.rule.status = RuleStatus::armed(definition.enabled);
        slot.rule.trigger = definition.trigger;
        slot.rule.actions = definition.actions;
        slot.matcher = matcher;
        tracing::info!("✏️ Workflow rule edited: '{}'", slot.rule.name);
        Ok(())
    }

    /// Remove a rule. Past execution records are kept.
    pub async fn delete(&self, id: &str) -> SchedulerResult<()> {
        match self.rules.write().await.remove(id) {
            Some(_) => {
                tracing::info!("🗑️ Workflow rule deleted: {id}");
                Ok(())
            }
            None => Err(SchedulerError::NotFound(format!("workflow rule {id}"))),
        }
    }

    /// Snapshot of one rule.
    pub async fn get(&self, id: &str) -> SchedulerResult<WorkflowRule> {
        Ok(self.slot(id).await?.lock().await.rule.clone())
    }

    /// Snapshots of all rules, sorted by name.
    pub async fn list(&self) -> Vec<WorkflowRule> {
        let slots: Vec<_> = self.rules.read().await.values().cloned().collect();
        let mut rules = Vec::with_capacity(slots.len());
        for slot in slots {
            rules.push(slot.lock().await.rule.clone());
        }
        rules.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        rules
    }

    pub async fn count(&self) -> usize {
        self.rules.read().await.len()
    }

    /// Execution history, newest first, optionally for one rule.
    pub fn history(&self, rule_id: Option<&str>) -> Vec<ExecutionRecord> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .rev()
            .filter(|r| rule_id.is_none_or(|id| r.rule_id == id))
            .cloned()
            .collect()
    }

    pub fn latest_execution(&self, rule_id: &str) -> Option<ExecutionRecord> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().find(|r| r.rule_id == rule_id).cloned()
    }

    /// Ticks advance the schedule window; returns `(previous, current]`.
    fn advance_tick(&self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let mut last = self.last_tick.lock().unwrap_or_else(|e| e.into_inner());
        let from = match *last {
            Some(prev) if prev < at => prev,
            // First tick (or clock moved backwards): cover the minute ending now.
            _ => at - chrono::Duration::minutes(1),
        };
        *last = Some(at);
        (from, at)
    }

    /// Run every enabled rule whose trigger matches `event`. Matched rules
    /// run concurrently; records are returned in completion-independent order.
    pub async fn evaluate(&self, event: &WorkflowEvent) -> Vec<ExecutionRecord> {
        let matched = self.matching(event).await;
        self.run_matched(&matched, event).await
    }

    /// Ids of the enabled rules whose trigger matches `event`. A tick event
    /// advances the schedule window, so call this once per tick.
    pub async fn matching(&self, event: &WorkflowEvent) -> Vec<RuleId> {
        let tick_window = match event.kind {
            EventKind::Tick => Some(self.advance_tick(event.timestamp)),
            EventKind::Domain => None,
        };

        let slots: Vec<_> = self.rules.read().await.values().cloned().collect();
        let mut matched = Vec::new();
        for slot in slots {
            let slot = slot.lock().await;
            if slot.rule.enabled && slot.matcher.matches(event, tick_window) {
                tracing::debug!("⚡ Workflow rule '{}' matched event '{}'", slot.rule.name, event.name);
                matched.push(slot.rule.id.clone());
            }
        }
        matched
    }

    /// Run the given rules concurrently for `event`.
    pub async fn run_matched(&self, ids: &[RuleId], event: &WorkflowEvent) -> Vec<ExecutionRecord> {
        let runs = ids.iter().map(|id| self.execute(id, event));
        join_all(runs)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(record) => Some(record),
                // Disabled or deleted between matching and execution.
                Err(e) => {
                    tracing::debug!("Skipped matched rule: {e}");
                    None
                }
            })
            .collect()
    }

    /// Fire-and-forget `evaluate` on a background task.
    pub fn spawn_evaluate(
        self: &Arc<Self>,
        event: WorkflowEvent,
    ) -> tokio::task::JoinHandle<Vec<ExecutionRecord>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.evaluate(&event).await })
    }

    /// Run a rule's action chain in order. Action failures are recorded per
    /// action and never abort the chain. Disabled rules are refused.
    pub async fn execute(
        &self,
        id: &str,
        context: &WorkflowEvent,
    ) -> SchedulerResult<ExecutionRecord> {
        let slot = self.slot(id).await?;
        let (rule_name, actions) = {
            let slot = slot.lock().await;
            if !slot.rule.enabled {
                return Err(SchedulerError::Inactive(format!(
                    "workflow rule '{}' is paused",
                    slot.rule.name
                )));
            }
            (slot.rule.name.clone(), slot.rule.actions.clone())
        };

        tracing::info!("🔔 Workflow rule '{}' fired by '{}'", rule_name, context.name);
        let fired_at = self.clock.now();
        let mut outcomes = Vec::with_capacity(actions.len());

        for (index, action) in actions.iter().enumerate() {
            if action.delay_secs > 0 {
                let delay = tokio::time::sleep(Duration::from_secs(action.delay_secs));
                tokio::select! {
                    _ = delay => {}
                    _ = self.shutdown.cancelled() => {
                        let now = self.clock.now();
                        for (index, action) in actions.iter().enumerate().skip(index) {
                            outcomes.push(ActionOutcome {
                                index,
                                action_type: action.action_type(),
                                status: ActionStatus::Cancelled,
                                error: Some("engine shut down".into()),
                                started_at: now,
                                finished_at: now,
                            });
                        }
                        break;
                    }
                }
            }

            let config = action.config.interpolate(context);
            let started_at = self.clock.now();
            let (status, error) = self.perform(&config).await;
            let finished_at = self.clock.now();
            if let Some(err) = &error {
                tracing::warn!(
                    "⚠️ Action #{} ({}) of '{}' failed: {}",
                    index,
                    action.action_type(),
                    rule_name,
                    err
                );
            }
            outcomes.push(ActionOutcome {
                index,
                action_type: action.action_type(),
                status,
                error,
                started_at,
                finished_at,
            });
        }

        let status = ExecutionStatus::from_outcomes(&outcomes);
        let finished_at = self.clock.now();
        {
            let mut slot = slot.lock().await;
            slot.rule.run_count += 1;
            slot.rule.last_run_at = Some(finished_at);
            slot.rule.status = if !slot.rule.enabled {
                // Disabled while running.
                RuleStatus::Paused
            } else if status == ExecutionStatus::Error {
                RuleStatus::Error
            } else {
                RuleStatus::Active
            };
        }

        let record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: id.to_string(),
            rule_name,
            event: context.name.clone(),
            fired_at,
            finished_at,
            status,
            outcomes,
            duration_ms: (finished_at - fired_at).num_milliseconds().max(0) as u64,
        };
        self.push_history(record.clone());
        Ok(record)
    }

    fn push_history(&self, record: ExecutionRecord) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(record);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    async fn perform(&self, config: &ActionConfig) -> (ActionStatus, Option<String>) {
        let call = async {
            match config {
                ActionConfig::Email(cfg) => self.transports.email.send(cfg).await,
                ActionConfig::Notification(cfg) => self.transports.notifications.publish(cfg).await,
                ActionConfig::Task(cfg) => self.transports.tasks.create(cfg).await,
                ActionConfig::Approval(cfg) => self.transports.approvals.request(cfg).await,
                ActionConfig::Webhook(cfg) => self.transports.webhooks.call(cfg).await,
            }
        };

        let result = match self.action_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    return (
                        ActionStatus::TimedOut,
                        Some(format!("timed out after {}s", limit.as_secs())),
                    );
                }
            },
            None => call.await,
        };

        match result {
            Ok(()) => (ActionStatus::Succeeded, None),
            Err(e) => (
                ActionStatus::Failed,
                Some(SchedulerError::ActionFailure(e).to_string()),
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::actions::{EmailConfig, NotificationConfig, WebhookConfig};
    use crate::clock::TokioClock;
    use crate::dispatch::{EmailSender, NotificationPublisher, WebhookCaller};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that succeeds or fails on demand and counts calls.
    pub(crate) struct Scripted {
        pub fail: bool,
        pub calls: AtomicUsize,
        pub hang: bool,
    }

    impl Scripted {
        pub fn ok() -> Arc<Self> {
            Arc::new(Self { fail: false, calls: AtomicUsize::new(0), hang: false })
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self { fail: true, calls: AtomicUsize::new(0), hang: false })
        }

        pub fn hanging() -> Arc<Self> {
            Arc::new(Self { fail: false, calls: AtomicUsize::new(0), hang: true })
        }

        async fn respond(&self) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail { Err("transport down".into()) } else { Ok(()) }
        }
    }

    #[async_trait]
    impl EmailSender for Scripted {
        async fn send(&self, _config: &EmailConfig) -> Result<(), String> {
            self.respond().await
        }
    }

    #[async_trait]
    impl NotificationPublisher for Scripted {
        async fn publish(&self, _config: &NotificationConfig) -> Result<(), String> {
            self.respond().await
        }
    }

    #[async_trait]
    impl WebhookCaller for Scripted {
        async fn call(&self, _config: &WebhookConfig) -> Result<(), String> {
            self.respond().await
        }
    }

    fn engine_with(email: Arc<Scripted>, notify: Arc<Scripted>) -> RuleEngine {
        let transports = Transports::default()
            .with_email(email)
            .with_notifications(notify);
        RuleEngine::new(transports).with_clock(Arc::new(TokioClock::new()))
    }

    fn escalation_rule() -> RuleDefinition {
        RuleDefinition::on_event(
            "PO escalation",
            "procurement.submitted",
            vec![
                WorkflowAction::email("finance@cohort.vc", "New PO {{event.po}}", ""),
                WorkflowAction::notification("PO {{event.po}} still pending", "").after(600),
            ],
        )
        .category(RuleCategory::Procurement)
    }

    #[tokio::test]
    async fn test_register_requires_actions() {
        let engine = engine_with(Scripted::ok(), Scripted::ok());
        let err = engine
            .register(RuleDefinition::on_event("empty", "x", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRule(_)));
        assert_eq!(engine.count().await, 0);
    }

    #[tokio::test]
    async fn test_register_validates_trigger_and_config() {
        let engine = engine_with(Scripted::ok(), Scripted::ok());
        let bad_cron = RuleDefinition::new(
            "bad cron",
            Trigger::Schedule { spec: "every monday".into() },
            vec![WorkflowAction::notification("hi", "")],
        );
        assert!(engine.register(bad_cron).await.is_err());

        let bad_action = RuleDefinition::on_event("bad", "x", vec![WorkflowAction::webhook("not-a-url")]);
        assert!(engine.register(bad_action).await.is_err());
    }

    #[tokio::test]
    async fn test_initial_status_follows_enabled() {
        let engine = engine_with(Scripted::ok(), Scripted::ok());
        let active = engine.register(escalation_rule()).await.unwrap();
        let paused = engine.register(escalation_rule().disabled()).await.unwrap();
        assert_eq!(engine.get(&active).await.unwrap().status, RuleStatus::Active);
        assert_eq!(engine.get(&paused).await.unwrap().status, RuleStatus::Paused);
    }

    #[tokio::test]
    async fn test_set_enabled_toggles_status_only() {
        let engine = engine_with(Scripted::ok(), Scripted::ok());
        let id = engine
            .register(RuleDefinition::on_event("r", "x", vec![WorkflowAction::notification("n", "")]))
            .await
            .unwrap();
        engine.execute(&id, &WorkflowEvent::domain("x", json!({}))).await.unwrap();

        engine.set_enabled(&id, false).await.unwrap();
        let rule = engine.get(&id).await.unwrap();
        assert_eq!(rule.status, RuleStatus::Paused);
        assert_eq!(rule.run_count, 1);
        assert!(rule.last_run_at.is_some());

        engine.set_enabled(&id, true).await.unwrap();
        assert_eq!(engine.get(&id).await.unwrap().status, RuleStatus::Active);

        assert!(matches!(
            engine.set_enabled("missing", true).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_rule_is_skipped_and_refused() {
        let email = Scripted::ok();
        let engine = engine_with(email.clone(), Scripted::ok());
        let id = engine
            .register(RuleDefinition::on_event("r", "x", vec![WorkflowAction::email("a@b.co", "s", "")]))
            .await
            .unwrap();
        engine.set_enabled(&id, false).await.unwrap();

        let records = engine.evaluate(&WorkflowEvent::domain("x", json!({}))).await;
        assert!(records.is_empty());
        assert_eq!(engine.get(&id).await.unwrap().run_count, 0);
        assert_eq!(email.calls.load(Ordering::SeqCst), 0);

        let err = engine.execute(&id, &WorkflowEvent::domain("x", json!({}))).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Inactive(_)));
    }

    #[tokio::test]
    async fn test_event_name_must_match_exactly() {
        let engine = engine_with(Scripted::ok(), Scripted::ok());
        engine
            .register(RuleDefinition::on_event("r", "vendor.added", vec![WorkflowAction::notification("n", "")]))
            .await
            .unwrap();
        assert!(engine.evaluate(&WorkflowEvent::domain("vendor.added.bulk", json!({}))).await.is_empty());
        assert!(engine.evaluate(&WorkflowEvent::tick(Utc::now())).await.is_empty());
        assert_eq!(engine.evaluate(&WorkflowEvent::domain("vendor.added", json!({}))).await.len(), 1);
    }

    #[tokio::test]
    async fn test_condition_trigger() {
        let engine = engine_with(Scripted::ok(), Scripted::ok());
        let rule = RuleDefinition::new(
            "High-risk vendor",
            Trigger::Condition {
                expression: "risk_score >= 7".into(),
                event: Some("vendor.risk_changed".into()),
            },
            vec![WorkflowAction::notification("Vendor {{event.vendor}} is high risk", "")],
        )
        .category(RuleCategory::Risk);
        engine.register(rule).await.unwrap();

        let low = WorkflowEvent::domain("vendor.risk_changed", json!({"vendor": "Acme", "risk_score": 3}));
        let high = WorkflowEvent::domain("vendor.risk_changed", json!({"vendor": "Acme", "risk_score": 9}));
        let other = WorkflowEvent::domain("audit.flagged", json!({"risk_score": 9}));
        assert!(engine.evaluate(&low).await.is_empty());
        assert!(engine.evaluate(&other).await.is_empty());
        assert_eq!(engine.evaluate(&high).await.len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_trigger_fires_once_per_slot() {
        let engine = engine_with(Scripted::ok(), Scripted::ok());
        let id = engine
            .register(RuleDefinition::new(
                "Monday digest",
                Trigger::Schedule { spec: "0 9 * * 1".into() },
                vec![WorkflowAction::email("team@cohort.vc", "Weekly digest", "")],
            ))
            .await
            .unwrap();

        let monday = Utc.with_ymd_and_hms(2026, 10, 19, 8, 59, 0).unwrap();
        assert!(engine.evaluate(&WorkflowEvent::tick(monday)).await.is_empty());
        let fired = engine
            .evaluate(&WorkflowEvent::tick(monday + chrono::Duration::seconds(60)))
            .await;
        assert_eq!(fired.len(), 1);
        // Next tick inside the same minute window doesn't refire.
        assert!(engine
            .evaluate(&WorkflowEvent::tick(monday + chrono::Duration::seconds(90)))
            .await
            .is_empty());
        assert_eq!(engine.get(&id).await.unwrap().run_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_are_sequenced_from_previous_completion() {
        let engine = engine_with(Scripted::ok(), Scripted::ok());
        let id = engine.register(escalation_rule()).await.unwrap();
        let record = engine
            .execute(&id, &WorkflowEvent::domain("procurement.submitted", json!({"po": "PO-7"})))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Success);
        let gap = record.outcomes[1].started_at - record.outcomes[0].finished_at;
        assert!(gap >= chrono::Duration::seconds(600));
        assert!(record.duration_ms >= 600_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_does_not_block_other_rules() {
        let engine = Arc::new(engine_with(Scripted::ok(), Scripted::ok()));
        let slow = engine.register(escalation_rule()).await.unwrap();
        let fast = engine
            .register(RuleDefinition::on_event("fast", "ping", vec![WorkflowAction::notification("pong", "")]))
            .await
            .unwrap();

        let pending = engine.spawn_evaluate(WorkflowEvent::domain("procurement.submitted", json!({})));
        tokio::task::yield_now().await;
        let records = engine.evaluate(&WorkflowEvent::domain("ping", json!({}))).await;
        assert_eq!(records.len(), 1);
        assert_eq!(engine.get(&fast).await.unwrap().run_count, 1);
        assert_eq!(engine.get(&slow).await.unwrap().run_count, 0);

        let slow_records = pending.await.unwrap();
        assert_eq!(slow_records.len(), 1);
        assert_eq!(engine.get(&slow).await.unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn test_all_failed_sets_error_then_recovers() {
        let email = Scripted::failing();
        let engine = engine_with(email, Scripted::failing());
        let id = engine
            .register(RuleDefinition::on_event(
                "r",
                "x",
                vec![WorkflowAction::email("a@b.co", "s", ""), WorkflowAction::notification("n", "")],
            ))
            .await
            .unwrap();

        let record = engine.execute(&id, &WorkflowEvent::domain("x", json!({}))).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.outcomes.iter().all(|o| o.status == ActionStatus::Failed));
        assert!(record.outcomes[0].error.as_deref().unwrap().contains("transport down"));
        let rule = engine.get(&id).await.unwrap();
        assert_eq!(rule.status, RuleStatus::Error);
        assert_eq!(rule.run_count, 1);

        // Error rules still evaluate; manual re-arm goes back to active.
        engine.set_enabled(&id, true).await.unwrap();
        assert_eq!(engine.get(&id).await.unwrap().status, RuleStatus::Active);
    }

    #[tokio::test]
    async fn test_error_rule_recovers_after_success() {
        let engine = engine_with(Scripted::failing(), Scripted::ok());
        let failing = engine
            .register(RuleDefinition::on_event("mail", "x", vec![WorkflowAction::email("a@b.co", "s", "")]))
            .await
            .unwrap();
        engine.evaluate(&WorkflowEvent::domain("x", json!({}))).await;
        assert_eq!(engine.get(&failing).await.unwrap().status, RuleStatus::Error);

        engine
            .edit(&failing, RuleDefinition::on_event("mail", "x", vec![WorkflowAction::notification("n", "")]))
            .await
            .unwrap();
        let record = engine.execute(&failing, &WorkflowEvent::domain("x", json!({}))).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        let rule = engine.get(&failing).await.unwrap();
        assert_eq!(rule.status, RuleStatus::Active);
        assert_eq!(rule.run_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_timeout() {
        let transports = Transports::default().with_webhooks(Scripted::hanging());
        let engine = RuleEngine::new(transports).with_action_timeout(Some(Duration::from_secs(5)));
        let id = engine
            .register(RuleDefinition::on_event(
                "hook",
                "x",
                vec![WorkflowAction::webhook("https://hooks.example.com/x"), WorkflowAction::notification("n", "")],
            ))
            .await
            .unwrap();
        let record = engine.execute(&id, &WorkflowEvent::domain("x", json!({}))).await.unwrap();
        assert_eq!(record.outcomes[0].status, ActionStatus::TimedOut);
        assert_eq!(record.outcomes[1].status, ActionStatus::Succeeded);
        assert_eq!(record.status, ExecutionStatus::Partial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_delays() {
        let engine = Arc::new(engine_with(Scripted::ok(), Scripted::ok()));
        let id = engine.register(escalation_rule()).await.unwrap();
        let pending = engine.spawn_evaluate(WorkflowEvent::domain("procurement.submitted", json!({})));
        tokio::time::sleep(Duration::from_secs(10)).await;
        engine.shutdown();

        let records = pending.await.unwrap();
        assert_eq!(records.len(), 1);
        let outcomes = &records[0].outcomes;
        assert_eq!(outcomes[0].status, ActionStatus::Succeeded);
        assert_eq!(outcomes[1].status, ActionStatus::Cancelled);
        assert_eq!(records[0].status, ExecutionStatus::Partial);
        assert_eq!(engine.get(&id).await.unwrap().run_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_mid_flight_does_not_abort() {
        let notify = Scripted::ok();
        let engine = Arc::new(engine_with(Scripted::ok(), notify.clone()));
        let id = engine.register(escalation_rule()).await.unwrap();
        let pending = engine.spawn_evaluate(WorkflowEvent::domain("procurement.submitted", json!({})));
        tokio::time::sleep(Duration::from_secs(10)).await;
        engine.set_enabled(&id, false).await.unwrap();

        let records = pending.await.unwrap();
        assert_eq!(records[0].status, ExecutionStatus::Success);
        assert_eq!(notify.calls.load(Ordering::SeqCst), 1);
        let rule = engine.get(&id).await.unwrap();
        assert_eq!(rule.status, RuleStatus::Paused);
        assert_eq!(rule.run_count, 1);
    }

    #[tokio::test]
    async fn test_delete_keeps_history() {
        let engine = engine_with(Scripted::ok(), Scripted::ok());
        let id = engine
            .register(RuleDefinition::on_event("r", "x", vec![WorkflowAction::notification("n", "")]))
            .await
            .unwrap();
        engine.evaluate(&WorkflowEvent::domain("x", json!({}))).await;
        engine.delete(&id).await.unwrap();

        assert!(matches!(engine.get(&id).await, Err(SchedulerError::NotFound(_))));
        assert!(matches!(engine.delete(&id).await, Err(SchedulerError::NotFound(_))));
        assert_eq!(engine.history(Some(id.as_str())).len(), 1);
        assert!(engine.latest_execution(&id).is_some());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let engine = engine_with(Scripted::ok(), Scripted::ok()).with_history_limit(3);
        engine
            .register(RuleDefinition::on_event("r", "x", vec![WorkflowAction::notification("n", "")]))
            .await
            .unwrap();
        for _ in 0..5 {
            engine.evaluate(&WorkflowEvent::domain("x", json!({}))).await;
        }
        assert_eq!(engine.history(None).len(), 3);
    }

    #[tokio::test]
    async fn test_list_sorted_by_name() {
        let engine = engine_with(Scripted::ok(), Scripted::ok());
        for name in ["Vendor renewal", "Audit reminder", "Funding update"] {
            engine
                .register(RuleDefinition::on_event(name, "x", vec![WorkflowAction::notification("n", "")]))
                .await
                .unwrap();
        }
        let names: Vec<_> = engine.list().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["Audit reminder", "Funding update", "Vendor renewal"]);
    }

    #[test]
    fn test_rule_definition_from_toml() {
        let def: RuleDefinition = toml::from_str(
            r#"
            name = "Large PO approval"
            category = "procurement"

            [trigger]
            type = "condition"
            expression = "amount > 50000"
            event = "procurement.submitted"

            [[actions]]
            type = "approval"
            approver = "cfo@cohort.vc"
            subject = "PO {{event.po}} needs approval"

            [[actions]]
            type = "notification"
            title = "Approval still pending"
            delay_secs = 600
            "#,
        )
        .unwrap();
        assert!(def.enabled);
        assert_eq!(def.category, RuleCategory::Procurement);
        assert_eq!(def.actions.len(), 2);
        assert_eq!(def.actions[1].delay_secs, 600);
        assert_eq!(def.actions[0].action_type(), ActionType::Approval);
        assert!(def.validate().is_ok());
    }
}
