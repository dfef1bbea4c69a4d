//! SQLite-backed persistence for workflow rules, recurring tasks and execution history.
//! Survives restarts; the in-memory engines stay the source of truth while running.

use std::path::Path;

use crate::error::{SchedulerError, SchedulerResult};
use crate::tasks::{RecurringTaskDefinition, TaskInstance};
use crate::workflow::{ExecutionRecord, WorkflowRule};

/// SQLite-backed persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: rusqlite::Connection,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> SchedulerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedulerError::Storage(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let conn = rusqlite::Connection::open(path)?;
        let db = Self { conn };
        db.migrate()?;
        tracing::debug!("💾 Scheduler DB opened at {}", path.display());
        Ok(db)
    }

    /// Throwaway database for tests and dry runs.
    pub fn open_in_memory() -> SchedulerResult<Self> {
        let db = Self {
            conn: rusqlite::Connection::open_in_memory()?,
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> SchedulerResult<()> {
        self.conn.execute_batch(
            "
            -- Workflow rules; `data` holds the full rule as JSON
            CREATE TABLE IF NOT EXISTS workflow_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                category TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL,
                run_count INTEGER NOT NULL DEFAULT 0,
                last_run_at TEXT,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL
            );

            -- Recurring task definitions
            CREATE TABLE IF NOT EXISTS recurring_tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                next_due_date TEXT NOT NULL,
                total_instances INTEGER NOT NULL DEFAULT 0,
                completed_instances INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL
            );

            -- Generated task instances
            CREATE TABLE IF NOT EXISTS task_instances (
                id TEXT PRIMARY KEY,
                definition_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                due_date TEXT NOT NULL,
                completed_at TEXT,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_instances_def
                ON task_instances(definition_id, sequence);

            -- Rule execution history
            CREATE TABLE IF NOT EXISTS workflow_executions (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                status TEXT NOT NULL,
                fired_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workflow_executions_fired
                ON workflow_executions(fired_at);
            ",
        )?;
        Ok(())
    }

    // ─── Workflow Rules ──────────────────────────────────────

    pub fn save_rule(&self, rule: &WorkflowRule) -> SchedulerResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO workflow_rules
             (id, name, category, enabled, status, run_count, last_run_at, created_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                rule.id,
                rule.name,
                enum_label(&rule.category)?,
                rule.enabled as i32,
                enum_label(&rule.status)?,
                rule.run_count as i64,
                rule.last_run_at.map(|t| t.to_rfc3339()),
                rule.created_at.to_rfc3339(),
                serde_json::to_string(rule)?,
            ],
        )?;
        Ok(())
    }

    /// All persisted rules. Rows that no longer decode are skipped with a warning.
    pub fn load_rules(&self) -> SchedulerResult<Vec<WorkflowRule>> {
        self.load_json("SELECT data FROM workflow_rules ORDER BY name")
    }

    pub fn delete_rule(&self, id: &str) -> SchedulerResult<()> {
        self.conn
            .execute("DELETE FROM workflow_rules WHERE id = ?1", [id])?;
        Ok(())
    }

    // ─── Recurring Tasks ─────────────────────────────────────

    /// Save a definition together with its generated instances.
    pub fn save_definition(
        &mut self,
        definition: &RecurringTaskDefinition,
        instances: &[TaskInstance],
    ) -> SchedulerResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO recurring_tasks
             (id, title, is_active, next_due_date, total_instances, completed_instances, created_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                definition.id,
                definition.title,
                definition.is_active as i32,
                definition.next_due_date.to_string(),
                definition.total_instances,
                definition.completed_instances,
                definition.created_at.to_rfc3339(),
                serde_json::to_string(definition)?,
            ],
        )?;
        for instance in instances {
            tx.execute(
                "INSERT OR REPLACE INTO task_instances
                 (id, definition_id, sequence, due_date, completed_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    instance.id,
                    instance.definition_id,
                    instance.sequence,
                    instance.due_date.to_string(),
                    instance.completed_at.map(|t| t.to_rfc3339()),
                    serde_json::to_string(instance)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All definitions with their instances (oldest first).
    pub fn load_definitions(
        &self,
    ) -> SchedulerResult<Vec<(RecurringTaskDefinition, Vec<TaskInstance>)>> {
        let definitions: Vec<RecurringTaskDefinition> =
            self.load_json("SELECT data FROM recurring_tasks ORDER BY created_at")?;
        let mut stmt = self.conn.prepare(
            "SELECT data FROM task_instances WHERE definition_id = ?1 ORDER BY sequence",
        )?;

        let mut loaded = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let rows = stmt.query_map([&definition.id], |row| row.get::<_, String>(0))?;
            let mut instances = Vec::new();
            for row in rows {
                match serde_json::from_str::<TaskInstance>(&row?) {
                    Ok(instance) => instances.push(instance),
                    Err(e) => tracing::warn!("⚠️ Skipping unreadable task instance: {e}"),
                }
            }
            loaded.push((definition, instances));
        }
        Ok(loaded)
    }

    pub fn delete_definition(&mut self, id: &str) -> SchedulerResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM task_instances WHERE definition_id = ?1", [id])?;
        tx.execute("DELETE FROM recurring_tasks WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(())
    }

    // ─── Execution History ───────────────────────────────────

    pub fn save_execution(&self, record: &ExecutionRecord) -> SchedulerResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO workflow_executions (id, rule_id, status, fired_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                record.id,
                record.rule_id,
                enum_label(&record.status)?,
                record.fired_at.to_rfc3339(),
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    /// Most recent executions first, optionally for one rule.
    pub fn recent_executions(
        &self,
        rule_id: Option<&str>,
        limit: usize,
    ) -> SchedulerResult<Vec<ExecutionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT data FROM workflow_executions
             WHERE ?1 IS NULL OR rule_id = ?1
             ORDER BY fired_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![rule_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut records = Vec::new();
        for row in rows {
            match serde_json::from_str::<ExecutionRecord>(&row?) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable execution record: {e}"),
            }
        }
        Ok(records)
    }

    /// Keep only the `keep` most recent executions. Returns rows removed.
    pub fn prune_executions(&self, keep: usize) -> SchedulerResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM workflow_executions WHERE id NOT IN (
                SELECT id FROM workflow_executions ORDER BY fired_at DESC, id LIMIT ?1
             )",
            [keep as i64],
        )?;
        Ok(removed)
    }

    fn load_json<T: serde::de::DeserializeOwned>(&self, sql: &str) -> SchedulerResult<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut items = Vec::new();
        for row in rows {
            match serde_json::from_str::<T>(&row?) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable row: {e}"),
            }
        }
        Ok(items)
    }
}

/// snake_case label of a unit enum, as serde writes it.
fn enum_label<T: serde::Serialize>(value: &T) -> SchedulerResult<String> {
    Ok(serde_json::to_value(value)?
        .as_str()
        .unwrap_or_default()
        .to_string())
}
