//! # Cohort Scheduler
//!
//! Workflow automation and recurring-task scheduling for incubator portfolio operations.
//!
//! ## Design Principles
//! - No external brokers (no Redis, no RabbitMQ): in-process registries
//! - SQLite persistence: survives restarts
//! - Tokio timers only: zero overhead when idle, deterministic under paused time
//! - Transports are traits: the engine records outcomes, it never delivers itself
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval)
//!   ├── tick → TaskInstanceGenerator.generate_due(today)
//!   ├── tick → RuleEngine.matching(tick) → spawned run : cron "0 9 * * 1" → weekly digest
//!   │            └── RecurrenceCalculator: weekly / monthly (clamped) / quarterly / custom
//!   └── SchedulerDb (rules, definitions, instances, executions)
//!
//! RuleEngine
//!   ├── Event (domain event, tick) → matching enabled rules (concurrently)
//!   ├── Action chain: email → (delay) → notification → …
//!   └── Transports: email, notifications (NotifyRouter), tasks, approvals, webhooks
//! ```

pub mod actions;
pub mod clock;
pub mod condition;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod notify;
pub mod persistence;
pub mod recurrence;
pub mod tasks;
pub mod workflow;

pub use actions::{ActionConfig, ActionType, WorkflowAction};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use dispatch::Transports;
pub use engine::{Scheduler, TickReport, spawn_scheduler};
pub use error::{SchedulerError, SchedulerResult};
pub use notify::{Notification, NotifyPriority, NotifyRouter};
pub use persistence::SchedulerDb;
pub use recurrence::{EndCondition, RecurrenceCalculator, RecurrenceKind, RecurrencePattern};
pub use tasks::{Priority, RecurringTaskDefinition, RecurringTaskSpec, TaskInstance, TaskInstanceGenerator};
pub use workflow::{
    ActionOutcome, ActionStatus, ExecutionRecord, ExecutionStatus, RuleCategory, RuleDefinition,
    RuleEngine, RuleStatus, Trigger, WorkflowEvent, WorkflowRule,
};
