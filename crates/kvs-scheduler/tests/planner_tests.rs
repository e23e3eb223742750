use std::collections::BTreeSet;

use kvs_scheduler::graph::GraphStore;
use kvs_scheduler::test_harness::{MockDescriptor, MockSouthbound, MockValue};
use kvs_scheduler::{value_ref, Operation, PlanInput, PlannedAction, Planner, Registry, Scheduler, SchedulerConfig, SchedulerError};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn key(i: usize) -> String {
    format!("config/mock/k{i:02}")
}

fn registry() -> Registry {
    let sb = MockSouthbound::new();
    let mut registry = Registry::new();
    registry
        .register(MockDescriptor::new("mock", "config/mock/", &sb).with_update())
        .unwrap();
    registry
}

proptest! {
    #[test]
    fn prop_dependencies_planned_first(
        deps in proptest::collection::vec(proptest::collection::btree_set(0..12usize, 0..4), 1..12),
        reversed in any::<bool>(),
    ) {
        let registry = registry();
        let store = GraphStore::new();
        let graph = store.snapshot();

        // key i only depends on keys below i, so the batch is acyclic
        let mut inputs: Vec<PlanInput> = deps
            .iter()
            .enumerate()
            .map(|(i, targets)| {
                let mut value = MockValue::new(format!("v{i}"));
                for t in targets.iter().filter(|t| **t < i) {
                    value = value.depends_on(key(*t));
                }
                PlanInput::put(key(i), value_ref(value))
            })
            .collect();
        if reversed {
            inputs.reverse();
        }

        let plan = Planner::new(&registry).plan(&graph, inputs).unwrap();
        let order = plan.keys();
        prop_assert_eq!(order.len(), deps.len());
        for (i, targets) in deps.iter().enumerate() {
            let pos = order.iter().position(|k| *k == key(i)).unwrap();
            for t in targets.iter().filter(|t| **t < i) {
                let dep_pos = order.iter().position(|k| *k == key(*t)).unwrap();
                prop_assert!(dep_pos < pos, "{} planned before its dependency {}", key(i), key(*t));
            }
        }
        prop_assert!(plan.ops().iter().all(|op| op.operation == Some(Operation::Create)));
    }
}

#[test]
fn test_unrelated_keys_are_lexicographic() {
    let registry = registry();
    let graph = GraphStore::new().snapshot();
    let inputs = ["c", "a", "b"]
        .iter()
        .map(|n| PlanInput::put(format!("config/mock/{n}"), value_ref(MockValue::new(*n))))
        .collect();

    let plan = Planner::new(&registry).plan(&graph, inputs).unwrap();
    assert_eq!(plan.keys(), vec!["config/mock/a", "config/mock/b", "config/mock/c"]);
}

#[test]
fn test_later_input_for_same_key_wins() {
    let registry = registry();
    let graph = GraphStore::new().snapshot();
    let inputs = vec![
        PlanInput::put(key(1), value_ref(MockValue::new("first"))),
        PlanInput::delete(key(1)),
        PlanInput::put(key(1), value_ref(MockValue::new("second"))),
    ];

    let plan = Planner::new(&registry).plan(&graph, inputs).unwrap();
    assert_eq!(plan.len(), 1);
    assert_eq!(plan.ops()[0].action, PlannedAction::Apply);
    assert!(plan.ops()[0].value.as_deref().is_some_and(|v| v.contains("second")));
}

#[test]
fn test_cycle_rejects_whole_batch() {
    let registry = registry();
    let graph = GraphStore::new().snapshot();
    let inputs = vec![
        PlanInput::put(key(1), value_ref(MockValue::new("a").depends_on(key(2)))),
        PlanInput::put(key(2), value_ref(MockValue::new("b").depends_on(key(1)))),
        PlanInput::put(key(3), value_ref(MockValue::new("c"))),
    ];

    let err = Planner::new(&registry).plan(&graph, inputs).unwrap_err();
    match err {
        SchedulerError::DependencyCycle { keys } => {
            let keys: BTreeSet<String> = keys.into_iter().collect();
            assert_eq!(keys, [key(1), key(2)].into_iter().collect());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_delete_of_unknown_key_plans_nothing() {
    let registry = registry();
    let graph = GraphStore::new().snapshot();
    let plan = Planner::new(&registry)
        .plan(&graph, vec![PlanInput::delete(key(9))])
        .unwrap();
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_delete_cascades_to_dependents_in_reverse_order() {
    let sb = MockSouthbound::new();
    let mut reg = Registry::new();
    reg.register(MockDescriptor::new("mock", "config/mock/", &sb)).unwrap();
    let scheduler = Scheduler::new(SchedulerConfig::default(), reg).unwrap();

    let result = scheduler
        .start_txn()
        .put(key(1), MockValue::new("base"))
        .put(key(2), MockValue::new("mid").depends_on(key(1)))
        .put(key(3), MockValue::new("top").depends_on(key(2)))
        .commit()
        .await
        .unwrap();
    assert!(result.is_success());

    let plan = Planner::new(scheduler.registry())
        .plan(&scheduler.graph(), vec![PlanInput::delete(key(1))])
        .unwrap();
    assert_eq!(plan.keys(), vec![key(3).as_str(), key(2).as_str(), key(1).as_str()]);
    let actions: Vec<PlannedAction> = plan.ops().iter().map(|op| op.action).collect();
    assert_eq!(
        actions,
        vec![PlannedAction::Unconfigure, PlannedAction::Unconfigure, PlannedAction::Remove]
    );
    assert!(plan.ops().iter().all(|op| op.operation == Some(Operation::Delete)));
}

#[tokio::test]
async fn test_update_without_support_predicts_recreate() {
    let sb = MockSouthbound::new();
    let mut reg = Registry::new();
    reg.register(MockDescriptor::new("mock", "config/mock/", &sb)).unwrap();
    let scheduler = Scheduler::new(SchedulerConfig::default(), reg).unwrap();
    scheduler
        .start_txn()
        .put(key(1), MockValue::new("old"))
        .commit()
        .await
        .unwrap();

    let plan = Planner::new(scheduler.registry())
        .plan(
            &scheduler.graph(),
            vec![PlanInput::put(key(1), value_ref(MockValue::new("new")))],
        )
        .unwrap();
    assert_eq!(plan.ops()[0].operation, Some(Operation::Update));
    assert!(plan.ops()[0].recreate);
}
