//! # Cohort: workflow automation and recurring-task scheduler
//!
//! Usage:
//!   cohort run                              # Start the scheduler loop
//!   cohort rules add demos/rules/po-escalation.toml
//!   cohort rules fire procurement.submitted --payload '{"po":"PO-7"}'
//!   cohort tasks add demos/tasks/month-end.toml
//!   cohort preview --pattern '{"kind":"monthly","day_of_month":31}' --from 2026-01-31 --until 2026-12-31

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cohort_core::CohortConfig;
use cohort_scheduler::{
    RecurrenceCalculator, RecurrencePattern, RecurringTaskSpec, RuleDefinition, Scheduler,
    SchedulerDb, WorkflowEvent, spawn_scheduler,
};

#[derive(Parser)]
#[command(
    name = "cohort",
    version,
    about = "🗓️ Cohort: workflow automation and recurring-task scheduler"
)]
struct Cli {
    /// Config file (default: ~/.cohort/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler loop (Ctrl-C to stop)
    Run {
        /// Seconds between ticks (overrides config)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Manage workflow rules
    Rules {
        #[command(subcommand)]
        action: RuleCommand,
    },
    /// Manage recurring tasks
    Tasks {
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// List the occurrences of a recurrence pattern
    Preview {
        /// Pattern as JSON, e.g. '{"kind":"weekly","days_of_week":[1]}'
        #[arg(long)]
        pattern: String,
        /// Anchor date (occurrences start after it)
        #[arg(long)]
        from: NaiveDate,
        /// Last date to include
        #[arg(long)]
        until: NaiveDate,
    },
}

#[derive(Subcommand)]
enum RuleCommand {
    /// List rules
    List,
    /// Register a rule from a TOML file
    Add { file: PathBuf },
    Enable { id: String },
    Disable { id: String },
    Delete { id: String },
    /// Push a domain event through the rules
    Fire {
        event: String,
        /// Event payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Show execution history
    History {
        id: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// List recurring tasks
    List,
    /// Create a recurring task from a TOML file
    Add { file: PathBuf },
    /// Generate the next instance now
    Generate { id: String },
    /// Mark a generated instance completed
    Complete { instance: String },
    Pause { id: String },
    Resume { id: String },
    Delete { id: String },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&Path>) -> Result<CohortConfig> {
    let config = match path {
        Some(path) => CohortConfig::load_from(path)?,
        None => CohortConfig::load()?,
    };
    Ok(config)
}

async fn open_scheduler(config: &CohortConfig) -> Result<Scheduler> {
    let db_path = expand_path(&config.scheduler.db_path);
    let db = SchedulerDb::open(&db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    let scheduler = Scheduler::from_config(config, Arc::new(RecurrenceCalculator::new()))
        .with_db(db)
        .await?;
    Ok(scheduler)
}

fn read_toml<T: serde::de::DeserializeOwned>(file: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing {}", file.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "cohort=debug,cohort_scheduler=debug"
    } else {
        "cohort=info,cohort_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run { interval } => {
            let scheduler = Arc::new(open_scheduler(&config).await?);
            let interval = interval.unwrap_or(config.scheduler.tick_interval_secs);
            println!(
                "🗓️ Cohort scheduler: {} rules, {} recurring tasks, tick every {}s",
                scheduler.rules().count().await,
                scheduler.tasks().count(),
                interval
            );

            let cancel = CancellationToken::new();
            let handle = tokio::spawn(spawn_scheduler(scheduler.clone(), interval, cancel.clone()));
            tokio::signal::ctrl_c().await?;
            println!("\n👋 Shutting down...");
            cancel.cancel();
            handle.await?;
        }
        Command::Rules { action } => run_rules(&config, action).await?,
        Command::Tasks { action } => run_tasks(&config, action).await?,
        Command::Preview { pattern, from, until } => {
            let pattern: RecurrencePattern =
                serde_json::from_str(&pattern).context("parsing --pattern")?;
            let calculator = RecurrenceCalculator::new();
            for date in calculator.occurrences_between(&pattern, from, until)? {
                let date = date?;
                println!("{date}  {}", date.format("%A"));
            }
        }
    }
    Ok(())
}

async fn run_rules(config: &CohortConfig, action: RuleCommand) -> Result<()> {
    let scheduler = open_scheduler(config).await?;
    match action {
        RuleCommand::List => {
            let rules = scheduler.list_rules().await;
            if rules.is_empty() {
                println!("No workflow rules.");
            }
            for rule in rules {
                println!(
                    "{}  {:<32} {:<12} {:?}  runs={} last={}",
                    rule.id,
                    rule.name,
                    format!("{:?}", rule.category).to_lowercase(),
                    rule.status,
                    rule.run_count,
                    rule.last_run_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".into())
                );
            }
        }
        RuleCommand::Add { file } => {
            let definition: RuleDefinition = read_toml(&file)?;
            let id = scheduler.register_rule(definition).await?;
            println!("✅ Rule registered: {id}");
        }
        RuleCommand::Enable { id } => {
            scheduler.set_rule_enabled(&id, true).await?;
            println!("▶️ Rule {id} enabled");
        }
        RuleCommand::Disable { id } => {
            scheduler.set_rule_enabled(&id, false).await?;
            println!("⏸️ Rule {id} paused");
        }
        RuleCommand::Delete { id } => {
            scheduler.delete_rule(&id).await?;
            println!("🗑️ Rule {id} deleted");
        }
        RuleCommand::Fire { event, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("parsing --payload")?;
            let records = scheduler
                .fire(&WorkflowEvent::domain_at(&event, payload, Utc::now()))
                .await;
            if records.is_empty() {
                println!("No enabled rule matched '{event}'.");
            }
            for record in records {
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
        }
        RuleCommand::History { id, limit } => {
            for record in scheduler.history(id.as_deref(), limit) {
                println!(
                    "{}  {:<32} {:?}  {} action(s), {}ms",
                    record.fired_at.format("%Y-%m-%d %H:%M:%S"),
                    record.rule_name,
                    record.status,
                    record.outcomes.len(),
                    record.duration_ms
                );
            }
        }
    }
    scheduler.shutdown();
    Ok(())
}

async fn run_tasks(config: &CohortConfig, action: TaskCommand) -> Result<()> {
    let scheduler = open_scheduler(config).await?;
    match action {
        TaskCommand::List => {
            let definitions = scheduler.tasks().list();
            if definitions.is_empty() {
                println!("No recurring tasks.");
            }
            for def in definitions {
                let rate = scheduler.tasks().completion_rate(&def.id)?;
                println!(
                    "{}  {:<32} {:?}  next={} {}/{} ({:.0}%){}",
                    def.id,
                    def.title,
                    def.pattern.kind,
                    def.next_due_date,
                    def.completed_instances,
                    def.total_instances,
                    rate * 100.0,
                    if def.is_active { "" } else { "  [paused]" }
                );
            }
        }
        TaskCommand::Add { file } => {
            let spec: RecurringTaskSpec = read_toml(&file)?;
            let id = scheduler.create_task(spec)?;
            println!("✅ Recurring task created: {id}");
        }
        TaskCommand::Generate { id } => {
            let instance = scheduler.generate_next(&id)?;
            println!(
                "🗓️ Instance {} (#{}) due {}",
                instance.id, instance.sequence, instance.due_date
            );
        }
        TaskCommand::Complete { instance } => {
            let instance = scheduler.complete_instance(&instance)?;
            println!("✅ '{}' #{} completed", instance.title, instance.sequence);
        }
        TaskCommand::Pause { id } => {
            scheduler.pause_task(&id)?;
            println!("⏸️ Task {id} paused");
        }
        TaskCommand::Resume { id } => {
            scheduler.resume_task(&id)?;
            println!("▶️ Task {id} resumed");
        }
        TaskCommand::Delete { id } => {
            scheduler.delete_task(&id)?;
            println!("🗑️ Task {id} deleted");
        }
    }
    scheduler.shutdown();
    Ok(())
}
