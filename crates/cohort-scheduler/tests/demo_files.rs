//! The TOML files under demos/ load and validate.

use std::sync::Arc;

use chrono::NaiveDate;
use cohort_scheduler::{
    ActionType, RecurrenceCalculator, RecurringTaskSpec, RuleDefinition, RuleEngine, Transports,
    TaskInstanceGenerator, Trigger,
};

#[tokio::test]
async fn demo_rules_register() {
    let engine = RuleEngine::new(Transports::default());
    for source in [
        include_str!("../../../demos/rules/po-escalation.toml"),
        include_str!("../../../demos/rules/monday-digest.toml"),
    ] {
        let definition: RuleDefinition = toml::from_str(source).unwrap();
        engine.register(definition).await.unwrap();
    }

    let rules = engine.list().await;
    assert_eq!(rules.len(), 2);
    let po = rules.iter().find(|r| r.name == "Large PO approval").unwrap();
    assert!(matches!(po.trigger, Trigger::Condition { .. }));
    assert_eq!(po.actions[0].action_type(), ActionType::Approval);
    assert_eq!(po.actions[1].delay_secs, 600);
}

#[test]
fn demo_task_generates_month_ends() {
    let spec: RecurringTaskSpec =
        toml::from_str(include_str!("../../../demos/tasks/month-end.toml")).unwrap();
    let tasks = TaskInstanceGenerator::new(Arc::new(RecurrenceCalculator::new()));
    let id = tasks.create(spec).unwrap();

    let dues: Vec<_> = (0..3).map(|_| tasks.generate_next(&id).unwrap().due_date).collect();
    assert_eq!(
        dues,
        vec![
            NaiveDate::from_ymd_opt(2026, 10, 31).unwrap(),
            NaiveDate::from_ymd_opt(2026, 11, 30).unwrap(),
            NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
        ]
    );
}
