//! Recurring tasks: definitions plus the instances generated from them.
//!
//! A definition carries a recurrence pattern and a `next_due_date`. Each
//! generation emits one `TaskInstance` due on `next_due_date` and advances it
//! by one occurrence. Counters obey `completed <= total` at all times.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::{SchedulerError, SchedulerResult};
use crate::recurrence::{EndCondition, RecurrenceCalculator, RecurrencePattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Caller input for creating or editing a recurring task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub pattern: RecurrencePattern,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    /// First due date.
    pub start_date: NaiveDate,
}

impl RecurringTaskSpec {
    pub fn new(title: &str, pattern: RecurrencePattern, start_date: NaiveDate) -> Self {
        Self {
            title: title.to_string(),
            description: String::new(),
            pattern,
            assignee: None,
            priority: Priority::Medium,
            estimated_hours: None,
            start_date,
        }
    }

    pub fn assignee(mut self, assignee: &str) -> Self {
        self.assignee = Some(assignee.to_string());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A recurring task template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTaskDefinition {
    pub id: String,
    pub title: String,
    pub description: String,
    pub pattern: RecurrencePattern,
    pub assignee: Option<String>,
    pub priority: Priority,
    pub estimated_hours: Option<f64>,
    pub start_date: NaiveDate,
    pub is_active: bool,
    pub next_due_date: NaiveDate,
    pub last_generated_at: Option<DateTime<Utc>>,
    pub total_instances: u32,
    pub completed_instances: u32,
    pub created_at: DateTime<Utc>,
}

/// One generated occurrence of a recurring task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: String,
    pub definition_id: String,
    /// 1-based position in the definition's series.
    pub sequence: u32,
    pub title: String,
    pub assignee: Option<String>,
    pub priority: Priority,
    pub due_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

struct DefinitionSlot {
    definition: RecurringTaskDefinition,
    instances: Vec<TaskInstance>,
}

/// Owns recurring task definitions and generates their instances.
pub struct TaskInstanceGenerator {
    calculator: Arc<RecurrenceCalculator>,
    definitions: RwLock<HashMap<String, Arc<Mutex<DefinitionSlot>>>>,
    /// instance id → definition id
    instance_index: RwLock<HashMap<String, String>>,
    clock: Arc<dyn Clock>,
}

impl TaskInstanceGenerator {
    pub fn new(calculator: Arc<RecurrenceCalculator>) -> Self {
        Self {
            calculator,
            definitions: RwLock::new(HashMap::new()),
            instance_index: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn calculator(&self) -> &RecurrenceCalculator {
        &self.calculator
    }

    fn slot(&self, id: &str) -> SchedulerResult<Arc<Mutex<DefinitionSlot>>> {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("recurring task {id}")))
    }

    fn validate_spec(&self, spec: &RecurringTaskSpec) -> SchedulerResult<()> {
        if spec.title.trim().is_empty() {
            return Err(SchedulerError::InvalidPattern("recurring task needs a title".into()));
        }
        self.calculator.validate(&spec.pattern)
    }

    /// Register a definition. The first instance will be due on `start_date`.
    pub fn create(&self, spec: RecurringTaskSpec) -> SchedulerResult<String> {
        self.validate_spec(&spec)?;
        let id = uuid::Uuid::new_v4().to_string();
        let definition = RecurringTaskDefinition {
            id: id.clone(),
            title: spec.title,
            description: spec.description,
            pattern: spec.pattern,
            assignee: spec.assignee,
            priority: spec.priority,
            estimated_hours: spec.estimated_hours,
            start_date: spec.start_date,
            is_active: true,
            next_due_date: spec.start_date,
            last_generated_at: None,
            total_instances: 0,
            completed_instances: 0,
            created_at: self.clock.now(),
        };
        tracing::info!(
            "🔁 Recurring task created: '{}' ({:?}, first due {})",
            definition.title,
            definition.pattern.kind,
            definition.next_due_date
        );
        self.definitions.write().unwrap_or_else(|e| e.into_inner()).insert(
            id.clone(),
            Arc::new(Mutex::new(DefinitionSlot {
                definition,
                instances: Vec::new(),
            })),
        );
        Ok(id)
    }

    /// Re-insert a persisted definition and its instances.
    pub fn restore(&self, definition: RecurringTaskDefinition, instances: Vec<TaskInstance>) {
        let id = definition.id.clone();
        {
            let mut index = self.instance_index.write().unwrap_or_else(|e| e.into_inner());
            for instance in &instances {
                index.insert(instance.id.clone(), id.clone());
            }
        }
        self.definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(Mutex::new(DefinitionSlot { definition, instances })));
    }

    /// Replace a definition's fields. A changed pattern re-derives
    /// `next_due_date` from the last generated due date.
    pub fn edit(&self, id: &str, spec: RecurringTaskSpec) -> SchedulerResult<()> {
        self.validate_spec(&spec)?;
        let slot = self.slot(id)?;
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());

        let next_due_date = if spec.pattern != slot.definition.pattern {
            match slot.instances.last() {
                Some(last) => self.calculator.next_occurrence(&spec.pattern, last.due_date)?,
                None => spec.start_date,
            }
        } else if slot.definition.total_instances == 0 {
            spec.start_date
        } else {
            slot.definition.next_due_date
        };

        let def = &mut slot.definition;
        def.title = spec.title;
        def.description = spec.description;
        def.pattern = spec.pattern;
        def.assignee = spec.assignee;
        def.priority = spec.priority;
        def.estimated_hours = spec.estimated_hours;
        def.start_date = spec.start_date;
        def.next_due_date = next_due_date;
        tracing::info!("✏️ Recurring task edited: '{}' (next due {})", def.title, next_due_date);
        Ok(())
    }

    /// Emit the instance due on `next_due_date` and advance the schedule.
    pub fn generate_next(&self, id: &str) -> SchedulerResult<TaskInstance> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        let instance = self.generate_locked(&mut slot)?;
        self.instance_index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance.id.clone(), id.to_string());
        Ok(instance)
    }

    fn generate_locked(&self, slot: &mut DefinitionSlot) -> SchedulerResult<TaskInstance> {
        let def = &slot.definition;
        if !def.is_active {
            return Err(SchedulerError::Inactive(format!("recurring task '{}' is paused", def.title)));
        }
        let due = def.next_due_date;
        self.calculator.ensure_within_end(&def.pattern, due, def.total_instances)?;
        // Computed before any mutation so a failure leaves the definition untouched.
        let following = self.calculator.next_occurrence(&def.pattern, due)?;

        let now = self.clock.now();
        let instance = TaskInstance {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: def.id.clone(),
            sequence: def.total_instances + 1,
            title: def.title.clone(),
            assignee: def.assignee.clone(),
            priority: def.priority,
            due_date: due,
            generated_at: now,
            completed_at: None,
        };

        let def = &mut slot.definition;
        def.last_generated_at = Some(now);
        def.next_due_date = following;
        def.total_instances += 1;
        slot.instances.push(instance.clone());
        tracing::info!(
            "🗓️ Generated '{}' #{} due {} (next {})",
            instance.title,
            instance.sequence,
            due,
            following
        );
        Ok(instance)
    }

    /// Catch-up generation: every active definition emits instances until its
    /// `next_due_date` is after `as_of` or its pattern is exhausted.
    pub fn generate_due(&self, as_of: NaiveDate) -> Vec<TaskInstance> {
        let slots: Vec<_> = self
            .definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut generated = Vec::new();
        for slot in slots {
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            while slot.definition.is_active && slot.definition.next_due_date <= as_of {
                match self.generate_locked(&mut slot) {
                    Ok(instance) => generated.push(instance),
                    Err(SchedulerError::ExhaustedPattern(_)) => break,
                    Err(e) => {
                        tracing::warn!("⚠️ Generation for '{}' failed: {e}", slot.definition.title);
                        break;
                    }
                }
            }
        }

        if !generated.is_empty() {
            let mut index = self.instance_index.write().unwrap_or_else(|e| e.into_inner());
            for instance in &generated {
                index.insert(instance.id.clone(), instance.definition_id.clone());
            }
        }
        generated.sort_by(|a, b| a.due_date.cmp(&b.due_date));
        generated
    }

    /// Record completion of a generated instance.
    pub fn mark_instance_completed(&self, instance_id: &str) -> SchedulerResult<TaskInstance> {
        let definition_id = self
            .instance_index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("task instance {instance_id}")))?;
        let slot = self.slot(&definition_id)?;
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());

        if slot.definition.completed_instances >= slot.definition.total_instances {
            return Err(SchedulerError::InvariantViolation(format!(
                "'{}' already has {} of {} instances completed",
                slot.definition.title,
                slot.definition.completed_instances,
                slot.definition.total_instances
            )));
        }
        let now = self.clock.now();
        let instance = slot
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("task instance {instance_id}")))?;
        if instance.is_completed() {
            return Err(SchedulerError::InvariantViolation(format!(
                "instance #{} of '{}' is already completed",
                instance.sequence, instance.title
            )));
        }
        instance.completed_at = Some(now);
        let completed = instance.clone();
        slot.definition.completed_instances += 1;
        tracing::info!(
            "✅ '{}' #{} completed ({}/{})",
            completed.title,
            completed.sequence,
            slot.definition.completed_instances,
            slot.definition.total_instances
        );
        Ok(completed)
    }

    pub fn pause(&self, id: &str) -> SchedulerResult<()> {
        self.set_active(id, false)
    }

    pub fn resume(&self, id: &str) -> SchedulerResult<()> {
        self.set_active(id, true)
    }

    fn set_active(&self, id: &str, active: bool) -> SchedulerResult<()> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.definition.is_active = active;
        tracing::info!(
            "{} Recurring task '{}' {}",
            if active { "▶️" } else { "⏸️" },
            slot.definition.title,
            if active { "resumed" } else { "paused" }
        );
        Ok(())
    }

    /// Remove a definition and all of its instances.
    pub fn delete(&self, id: &str) -> SchedulerResult<()> {
        let slot = self
            .definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| SchedulerError::NotFound(format!("recurring task {id}")))?;
        let slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.instance_index.write().unwrap_or_else(|e| e.into_inner());
        for instance in &slot.instances {
            index.remove(&instance.id);
        }
        tracing::info!("🗑️ Recurring task deleted: '{}'", slot.definition.title);
        Ok(())
    }

    /// completed / total, 0.0 when nothing was generated yet.
    pub fn completion_rate(&self, id: &str) -> SchedulerResult<f64> {
        let slot = self.slot(id)?;
        let slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        let def = &slot.definition;
        if def.total_instances == 0 {
            return Ok(0.0);
        }
        Ok(f64::from(def.completed_instances) / f64::from(def.total_instances))
    }

    pub fn get(&self, id: &str) -> SchedulerResult<RecurringTaskDefinition> {
        let slot = self.slot(id)?;
        let definition = slot.lock().unwrap_or_else(|e| e.into_inner()).definition.clone();
        Ok(definition)
    }

    /// All definitions ordered by next due date, then title.
    pub fn list(&self) -> Vec<RecurringTaskDefinition> {
        let slots: Vec<_> = self
            .definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut definitions: Vec<_> = slots
            .iter()
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).definition.clone())
            .collect();
        definitions.sort_by(|a, b| {
            a.next_due_date
                .cmp(&b.next_due_date)
                .then_with(|| a.title.cmp(&b.title))
        });
        definitions
    }

    /// Generated instances of a definition, oldest first.
    pub fn instances(&self, id: &str) -> SchedulerResult<Vec<TaskInstance>> {
        let slot = self.slot(id)?;
        let instances = slot.lock().unwrap_or_else(|e| e.into_inner()).instances.clone();
        Ok(instances)
    }

    /// Due dates the definition would generate up to `window_end`, starting
    /// with `next_due_date` and honouring what is left of the end condition.
    pub fn upcoming(&self, id: &str, window_end: NaiveDate) -> SchedulerResult<Vec<NaiveDate>> {
        let definition = self.get(id)?;
        let first = definition.next_due_date;
        if first > window_end
            || self
                .calculator
                .ensure_within_end(&definition.pattern, first, definition.total_instances)
                .is_err()
        {
            return Ok(Vec::new());
        }

        // The first date takes one occurrence; the rest come from the pattern.
        let mut remaining = definition.pattern.clone();
        if let Some(EndCondition::Count { max_occurrences }) = remaining.end {
            remaining.end = Some(EndCondition::Count {
                max_occurrences: max_occurrences.saturating_sub(definition.total_instances + 1),
            });
        }

        let mut dates = vec![first];
        match self.calculator.occurrences_between(&remaining, first, window_end) {
            Ok(occurrences) => {
                for date in occurrences {
                    dates.push(date?);
                }
            }
            Err(SchedulerError::ExhaustedPattern(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(dates)
    }

    pub fn count(&self) -> usize {
        self.definitions.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
