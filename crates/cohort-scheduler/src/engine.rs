//! Scheduler service: composes the rule engine, the task generator and the
//! persistence adapter, and runs the tick loop.
//! Uses tokio::interval for zero-overhead ticking (sleeps between checks).
//! Matched rule chains run on their own tasks so delays never hold the loop.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::dispatch::Transports;
use crate::error::SchedulerResult;
use crate::notify::{Notification, NotifyPriority, NotifyRouter};
use crate::persistence::SchedulerDb;
use crate::recurrence::RecurrenceCalculator;
use crate::tasks::{RecurringTaskSpec, TaskInstance, TaskInstanceGenerator};
use crate::workflow::{
    ExecutionRecord, RuleDefinition, RuleEngine, RuleId, WorkflowEvent, WorkflowRule,
};

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub executions: Vec<ExecutionRecord>,
    pub generated: Vec<TaskInstance>,
}

/// The scheduler service: every mutation goes through here so it can be saved.
pub struct Scheduler {
    rules: Arc<RuleEngine>,
    tasks: Arc<TaskInstanceGenerator>,
    router: Arc<Mutex<NotifyRouter>>,
    db: Option<Mutex<SchedulerDb>>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    /// In-memory scheduler without persistence. `clock` replaces the clocks of
    /// both engines, so every timestamp comes from one source.
    pub fn new(
        rules: RuleEngine,
        tasks: TaskInstanceGenerator,
        router: Arc<Mutex<NotifyRouter>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rules: Arc::new(rules.with_clock(clock.clone())),
            tasks: Arc::new(tasks.with_clock(clock.clone())),
            router,
            db: None,
            clock,
        }
    }

    /// Build from config with local transports; notifications land in the router.
    pub fn from_config(
        config: &cohort_core::CohortConfig,
        calculator: Arc<RecurrenceCalculator>,
    ) -> Self {
        Self::from_config_with_clock(config, calculator, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock(
        config: &cohort_core::CohortConfig,
        calculator: Arc<RecurrenceCalculator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let router = Arc::new(Mutex::new(NotifyRouter::from_config(&config.notify)));
        let transports = Transports::local(router.clone());
        let rules = RuleEngine::from_config(transports, &config.scheduler);
        let tasks = TaskInstanceGenerator::new(calculator);
        Self::new(rules, tasks, router, clock)
    }

    /// Attach a database and restore everything it holds.
    pub async fn with_db(mut self, db: SchedulerDb) -> SchedulerResult<Self> {
        let rules = db.load_rules()?;
        let definitions = db.load_definitions()?;
        let (rule_count, task_count) = (rules.len(), definitions.len());

        for rule in rules {
            let name = rule.name.clone();
            if let Err(e) = self.rules.restore(rule).await {
                tracing::warn!("⚠️ Skipping stored rule '{name}': {e}");
            }
        }
        for (definition, instances) in definitions {
            self.tasks.restore(definition, instances);
        }
        tracing::info!("💾 Restored {rule_count} rules and {task_count} recurring tasks");

        self.db = Some(Mutex::new(db));
        Ok(self)
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn tasks(&self) -> &Arc<TaskInstanceGenerator> {
        &self.tasks
    }

    pub fn router(&self) -> &Arc<Mutex<NotifyRouter>> {
        &self.router
    }

    /// Newest notifications first.
    pub fn notifications(&self, limit: usize) -> Vec<Notification> {
        self.router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .recent(limit)
    }

    // ─── Persistence ─────────────────────────────────────────

    fn persist<F>(&self, what: &str, f: F)
    where
        F: FnOnce(&mut SchedulerDb) -> SchedulerResult<()>,
    {
        let Some(db) = &self.db else { return };
        let mut db = db.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = f(&mut *db) {
            tracing::warn!("⚠️ Failed to persist {what}: {e}");
        }
    }

    async fn persist_rule(&self, id: &str) {
        match self.rules.get(id).await {
            Ok(rule) => self.persist("workflow rule", |db| db.save_rule(&rule)),
            Err(e) => tracing::debug!("Rule {id} gone before save: {e}"),
        }
    }

    fn persist_definition(&self, id: &str) {
        let snapshot = self
            .tasks
            .get(id)
            .and_then(|definition| Ok((definition, self.tasks.instances(id)?)));
        match snapshot {
            Ok((definition, instances)) => self.persist("recurring task", |db| {
                db.save_definition(&definition, &instances)
            }),
            Err(e) => tracing::debug!("Recurring task {id} gone before save: {e}"),
        }
    }

    /// Save run records and trim stored history to the engine's history limit.
    async fn record_executions(&self, records: &[ExecutionRecord]) {
        if records.is_empty() {
            return;
        }
        for record in records {
            self.persist("execution record", |db| db.save_execution(record));
            self.persist_rule(&record.rule_id).await;
        }
        let keep = self.rules.history_limit();
        self.persist("execution history pruning", |db| {
            let removed = db.prune_executions(keep)?;
            if removed > 0 {
                tracing::debug!("🧹 Pruned {removed} old execution records");
            }
            Ok(())
        });
    }

    // ─── Workflow Rules ──────────────────────────────────────

    pub async fn register_rule(&self, definition: RuleDefinition) -> SchedulerResult<String> {
        let id = self.rules.register(definition).await?;
        self.persist_rule(&id).await;
        Ok(id)
    }

    pub async fn edit_rule(&self, id: &str, definition: RuleDefinition) -> SchedulerResult<()> {
        self.rules.edit(id, definition).await?;
        self.persist_rule(id).await;
        Ok(())
    }

    pub async fn set_rule_enabled(&self, id: &str, enabled: bool) -> SchedulerResult<()> {
        self.rules.set_enabled(id, enabled).await?;
        self.persist_rule(id).await;
        Ok(())
    }

    pub async fn delete_rule(&self, id: &str) -> SchedulerResult<()> {
        self.rules.delete(id).await?;
        self.persist("workflow rule deletion", |db| db.delete_rule(id));
        Ok(())
    }

    pub async fn list_rules(&self) -> Vec<WorkflowRule> {
        self.rules.list().await
    }

    /// Push an event through the rule engine.
    pub async fn fire(&self, event: &WorkflowEvent) -> Vec<ExecutionRecord> {
        let records = self.rules.evaluate(event).await;
        self.record_executions(&records).await;
        records
    }

    /// Run already-matched rules and save their records.
    pub async fn run_matched(&self, ids: &[RuleId], event: &WorkflowEvent) -> Vec<ExecutionRecord> {
        let records = self.rules.run_matched(ids, event).await;
        self.record_executions(&records).await;
        records
    }

    /// Run one rule directly, regardless of its trigger.
    pub async fn execute_rule(
        &self,
        id: &str,
        event: &WorkflowEvent,
    ) -> SchedulerResult<ExecutionRecord> {
        let record = self.rules.execute(id, event).await?;
        self.record_executions(std::slice::from_ref(&record)).await;
        Ok(record)
    }

    /// Execution history, newest first. Reads the database when attached so
    /// runs from earlier processes are included.
    pub fn history(&self, rule_id: Option<&str>, limit: usize) -> Vec<ExecutionRecord> {
        if let Some(db) = &self.db {
            let db = db.lock().unwrap_or_else(|e| e.into_inner());
            match db.recent_executions(rule_id, limit) {
                Ok(records) => return records,
                Err(e) => tracing::warn!("⚠️ Failed to read execution history: {e}"),
            }
        }
        self.rules.history(rule_id).into_iter().take(limit).collect()
    }

    // ─── Recurring Tasks ─────────────────────────────────────

    pub fn create_task(&self, spec: RecurringTaskSpec) -> SchedulerResult<String> {
        let id = self.tasks.create(spec)?;
        self.persist_definition(&id);
        Ok(id)
    }

    pub fn edit_task(&self, id: &str, spec: RecurringTaskSpec) -> SchedulerResult<()> {
        self.tasks.edit(id, spec)?;
        self.persist_definition(id);
        Ok(())
    }

    pub fn generate_next(&self, id: &str) -> SchedulerResult<TaskInstance> {
        let instance = self.tasks.generate_next(id)?;
        self.persist_definition(id);
        self.announce(&instance);
        Ok(instance)
    }

    pub fn complete_instance(&self, instance_id: &str) -> SchedulerResult<TaskInstance> {
        let instance = self.tasks.mark_instance_completed(instance_id)?;
        self.persist_definition(&instance.definition_id);
        Ok(instance)
    }

    pub fn pause_task(&self, id: &str) -> SchedulerResult<()> {
        self.tasks.pause(id)?;
        self.persist_definition(id);
        Ok(())
    }

    pub fn resume_task(&self, id: &str) -> SchedulerResult<()> {
        self.tasks.resume(id)?;
        self.persist_definition(id);
        Ok(())
    }

    pub fn delete_task(&self, id: &str) -> SchedulerResult<()> {
        self.tasks.delete(id)?;
        self.persist("recurring task deletion", |db| db.delete_definition(id));
        Ok(())
    }

    /// Generate every instance due on or before `as_of`.
    pub fn generate_due(&self, as_of: NaiveDate) -> Vec<TaskInstance> {
        let generated = self.tasks.generate_due(as_of);
        let mut touched: Vec<&str> = generated.iter().map(|i| i.definition_id.as_str()).collect();
        touched.sort_unstable();
        touched.dedup();
        for id in touched {
            self.persist_definition(id);
        }
        for instance in &generated {
            self.announce(instance);
        }
        generated
    }

    fn announce(&self, instance: &TaskInstance) {
        let mut notification = NotifyRouter::create(
            &format!("Task due: {}", instance.title),
            &format!(
                "#{} due {} ({})",
                instance.sequence,
                instance.due_date,
                instance.assignee.as_deref().unwrap_or("unassigned")
            ),
            &instance.definition_id,
            NotifyPriority::Normal,
        );
        notification.timestamp = self.clock.now();
        self.router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(notification);
    }

    // ─── Tick ────────────────────────────────────────────────

    /// Tick: generate due task instances, then run schedule rules to completion.
    pub async fn tick(&self, at: DateTime<Utc>) -> TickReport {
        let generated = self.generate_due(at.date_naive());
        let executions = self.fire(&WorkflowEvent::tick(at)).await;
        TickReport {
            executions,
            generated,
        }
    }

    /// Tick without waiting on action chains: due instances are generated
    /// inline, matched schedule rules are spawned onto `runs`.
    pub async fn tick_detached(
        self: &Arc<Self>,
        at: DateTime<Utc>,
        runs: &mut JoinSet<Vec<ExecutionRecord>>,
    ) -> Vec<TaskInstance> {
        let generated = self.generate_due(at.date_naive());
        let event = WorkflowEvent::tick(at);
        let matched = self.rules.matching(&event).await;
        if !matched.is_empty() {
            let scheduler = Arc::clone(self);
            runs.spawn(async move { scheduler.run_matched(&matched, &event).await });
        }
        generated
    }

    /// Stop pending action delays.
    pub fn shutdown(&self) {
        self.rules.shutdown();
    }
}

/// Spawn the scheduler loop. Ticks every `check_interval_secs` until `cancel`
/// fires, then shuts the rule engine down.
pub async fn spawn_scheduler(
    scheduler: Arc<Scheduler>,
    check_interval_secs: u64,
    cancel: CancellationToken,
) {
    tracing::info!(
        "⏰ Scheduler started (check every {}s)",
        check_interval_secs
    );

    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(check_interval_secs.max(1)));
    let mut runs = JoinSet::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            Some(joined) = runs.join_next(), if !runs.is_empty() => {
                log_run(joined);
                continue;
            }
            _ = cancel.cancelled() => break,
        }

        let generated = scheduler.tick_detached(scheduler.clock.now(), &mut runs).await;
        if !generated.is_empty() {
            tracing::info!("🗓️ {} task instances generated", generated.len());
        }
    }

    // Pending delays are cancelled; chains still record their outcomes.
    scheduler.shutdown();
    while let Some(joined) = runs.join_next().await {
        log_run(joined);
    }
    tracing::info!("⏹️ Scheduler stopped");
}

fn log_run(joined: Result<Vec<ExecutionRecord>, tokio::task::JoinError>) {
    match joined {
        Ok(records) => {
            for record in &records {
                tracing::info!(
                    "📣 [{}] {:?} in {}ms",
                    record.rule_name,
                    record.status,
                    record.duration_ms
                );
            }
        }
        Err(e) => tracing::error!("❌ Rule run task failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::WorkflowAction;
    use crate::clock::{ManualClock, TokioClock};
    use crate::recurrence::RecurrencePattern;
    use crate::workflow::{ActionStatus, RuleStatus, Trigger};
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn scheduler() -> Scheduler {
        Scheduler::from_config(
            &cohort_core::CohortConfig::default(),
            Arc::new(RecurrenceCalculator::new()),
        )
    }

    #[tokio::test]
    async fn test_tick_generates_due_tasks_and_notifies() {
        let scheduler = scheduler();
        scheduler
            .create_task(RecurringTaskSpec::new(
                "Investor update",
                RecurrencePattern::monthly(1, 1),
                d(2026, 10, 1),
            ))
            .unwrap();

        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();
        let report = scheduler.tick(at).await;
        assert_eq!(report.generated.len(), 1);
        assert!(report.executions.is_empty());
        assert_eq!(scheduler.notifications(5)[0].title, "Task due: Investor update");
    }

    #[tokio::test]
    async fn test_tick_fires_schedule_rules() {
        let scheduler = scheduler();
        let id = scheduler
            .register_rule(RuleDefinition::new(
                "Daily risk digest",
                Trigger::Schedule { spec: "0 8 * * *".into() },
                vec![WorkflowAction::notification("Risk digest", "")],
            ))
            .await
            .unwrap();

        let at = Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap();
        let report = scheduler.tick(at).await;
        assert_eq!(report.executions.len(), 1);
        assert_eq!(scheduler.rules().get(&id).await.unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("cohort-engine-{}", uuid::Uuid::new_v4()));
        let path = dir.join("scheduler.db");
        let config = cohort_core::CohortConfig::default();

        let (rule_id, task_id) = {
            let scheduler = Scheduler::from_config(&config, Arc::new(RecurrenceCalculator::new()))
                .with_db(SchedulerDb::open(&path).unwrap())
                .await
                .unwrap();
            let rule_id = scheduler
                .register_rule(RuleDefinition::on_event(
                    "Doc signed",
                    "document.signed",
                    vec![WorkflowAction::notification("Signed: {{event.doc}}", "")],
                ))
                .await
                .unwrap();
            scheduler
                .fire(&WorkflowEvent::domain("document.signed", serde_json::json!({"doc": "SAFE"})))
                .await;
            scheduler.set_rule_enabled(&rule_id, false).await.unwrap();

            let task_id = scheduler
                .create_task(RecurringTaskSpec::new("Board deck", RecurrencePattern::quarterly(1), d(2026, 10, 1)))
                .unwrap();
            let instance = scheduler.generate_next(&task_id).unwrap();
            scheduler.complete_instance(&instance.id).unwrap();
            (rule_id, task_id)
        };

        let reopened = Scheduler::from_config(&config, Arc::new(RecurrenceCalculator::new()))
            .with_db(SchedulerDb::open(&path).unwrap())
            .await
            .unwrap();
        let rule = reopened.rules().get(&rule_id).await.unwrap();
        assert_eq!(rule.run_count, 1);
        assert_eq!(rule.status, RuleStatus::Paused);
        assert_eq!(reopened.history(Some(rule_id.as_str()), 10).len(), 1);

        let definition = reopened.tasks().get(&task_id).unwrap();
        assert_eq!(definition.total_instances, 1);
        assert_eq!(definition.completed_instances, 1);
        assert_eq!(definition.next_due_date, d(2027, 1, 1));

        reopened.delete_task(&task_id).unwrap();
        reopened.delete_rule(&rule_id).await.unwrap();
        drop(reopened);

        let emptied = Scheduler::from_config(&config, Arc::new(RecurrenceCalculator::new()))
            .with_db(SchedulerDb::open(&path).unwrap())
            .await
            .unwrap();
        assert!(emptied.list_rules().await.is_empty());
        assert_eq!(emptied.tasks().count(), 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_cancel() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()));
        let scheduler = Arc::new(Scheduler::from_config_with_clock(
            &cohort_core::CohortConfig::default(),
            Arc::new(RecurrenceCalculator::new()),
            clock,
        ));
        scheduler
            .create_task(RecurringTaskSpec::new("Standup notes", RecurrencePattern::daily(1), d(2026, 10, 16)))
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(spawn_scheduler(scheduler.clone(), 60, cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(scheduler.tasks().list()[0].total_instances, 1);
        assert!(scheduler.rules().shutdown_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_chain_does_not_hold_the_loop() {
        let clock = Arc::new(TokioClock::starting_at(
            Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 30).unwrap(),
        ));
        let scheduler = Arc::new(Scheduler::from_config_with_clock(
            &cohort_core::CohortConfig::default(),
            Arc::new(RecurrenceCalculator::new()),
            clock,
        ));
        let id = scheduler
            .register_rule(RuleDefinition::new(
                "Overdue PO escalation",
                Trigger::Schedule { spec: "* * * * *".into() },
                vec![
                    WorkflowAction::notification("PO overdue", ""),
                    WorkflowAction::notification("PO escalated", "").after(600),
                ],
            ))
            .await
            .unwrap();
        scheduler
            .create_task(RecurringTaskSpec::new("Standup notes", RecurrencePattern::daily(1), d(2026, 10, 16)))
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(spawn_scheduler(scheduler.clone(), 60, cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_secs(190)).await;

        // Ticks at 0s, 60s, 120s and 180s each started a chain while earlier
        // chains were still waiting out their delay.
        assert_eq!(scheduler.tasks().list()[0].total_instances, 1);
        let started = scheduler
            .notifications(50)
            .iter()
            .filter(|n| n.title == "PO overdue")
            .count();
        assert_eq!(started, 4);
        assert_eq!(scheduler.rules().get(&id).await.unwrap().run_count, 0);

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(scheduler.rules().get(&id).await.unwrap().run_count, 4);
        let history = scheduler.history(Some(id.as_str()), 10);
        assert_eq!(history.len(), 4);
        assert!(history.iter().all(|r| r.outcomes[1].status == ActionStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_injected_clock_reaches_both_engines() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();
        let scheduler = Scheduler::from_config_with_clock(
            &cohort_core::CohortConfig::default(),
            Arc::new(RecurrenceCalculator::new()),
            Arc::new(ManualClock::new(at)),
        );

        let task_id = scheduler
            .create_task(RecurringTaskSpec::new("Cap table review", RecurrencePattern::monthly(1, 16), d(2026, 10, 16)))
            .unwrap();
        let instance = scheduler.generate_next(&task_id).unwrap();
        assert_eq!(scheduler.tasks().get(&task_id).unwrap().created_at, at);
        assert_eq!(instance.generated_at, at);
        assert_eq!(scheduler.notifications(1)[0].timestamp, at);

        let rule_id = scheduler
            .register_rule(RuleDefinition::on_event(
                "Vendor added",
                "vendor.added",
                vec![WorkflowAction::notification("New vendor", "")],
            ))
            .await
            .unwrap();
        let records = scheduler
            .fire(&WorkflowEvent::domain_at("vendor.added", serde_json::json!({}), at))
            .await;
        assert_eq!(records[0].fired_at, at);
        let rule = scheduler.rules().get(&rule_id).await.unwrap();
        assert_eq!(rule.created_at, at);
        assert_eq!(rule.last_run_at, Some(at));
    }

    #[tokio::test]
    async fn test_stored_history_is_trimmed_to_limit() {
        let mut config = cohort_core::CohortConfig::default();
        config.scheduler.history_limit = 3;
        let scheduler = Scheduler::from_config(&config, Arc::new(RecurrenceCalculator::new()))
            .with_db(SchedulerDb::open_in_memory().unwrap())
            .await
            .unwrap();
        let id = scheduler
            .register_rule(RuleDefinition::on_event(
                "Funding call",
                "funding.call",
                vec![WorkflowAction::notification("Capital call", "")],
            ))
            .await
            .unwrap();
        for _ in 0..5 {
            scheduler
                .fire(&WorkflowEvent::domain("funding.call", serde_json::json!({})))
                .await;
        }

        assert_eq!(scheduler.rules().get(&id).await.unwrap().run_count, 5);
        assert_eq!(scheduler.history(None, 10).len(), 3);
    }
}
