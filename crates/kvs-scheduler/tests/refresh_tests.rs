use std::sync::Arc;
use std::time::Duration;

use kvs_scheduler::test_harness::{MockDescriptor, MockMetadata, MockSouthbound, MockValue};
use kvs_scheduler::{
    downcast, Operation, RefreshOptions, Registry, RetryPolicy, Scheduler, SchedulerConfig, TxnKind, ValueOrigin,
    ValueState,
};
use pretty_assertions::assert_eq;

const IF: &str = "config/if/";
const ROUTE: &str = "config/route/";

fn setup(strict: bool) -> (Scheduler, Arc<MockSouthbound>) {
    let sb = MockSouthbound::new();
    let mut registry = Registry::new();
    registry
        .register(MockDescriptor::new("iface", IF, &sb).with_update().with_retrieve())
        .unwrap();
    registry
        .register(MockDescriptor::new("route", ROUTE, &sb).with_retrieve().retrieve_after("iface"))
        .unwrap();
    let config = SchedulerConfig {
        strict_refresh: strict,
        retry: RetryPolicy::new(Duration::from_millis(10), 3, false),
        print_txn_summary: false,
        ..SchedulerConfig::default()
    };
    (Scheduler::new(config, registry).unwrap(), sb)
}

fn eth(name: &str) -> String {
    format!("{IF}{name}")
}

#[tokio::test]
async fn test_refresh_of_converged_state_is_clean() {
    let (scheduler, sb) = setup(false);
    scheduler
        .start_txn()
        .put(eth("eth0"), MockValue::new("eth0"))
        .commit()
        .await
        .unwrap();
    sb.clear_calls();

    let result = scheduler.refresh(RefreshOptions::all()).await.unwrap();
    let report = result.refresh.unwrap();

    assert_eq!(result.kind, TxnKind::Refresh);
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.adopted, vec![eth("eth0")]);
    assert_eq!(report.retrieved, 1);
    assert!(sb.calls().is_empty());
}

#[tokio::test]
async fn test_resync_adopts_existing_values_without_calls() {
    let (scheduler, sb) = setup(false);
    let index = sb.insert_external(&eth("eth0"), MockValue::new("eth0"));

    let result = scheduler.refresh(RefreshOptions::all()).await.unwrap();
    assert_eq!(result.refresh.unwrap().unmanaged, vec![eth("eth0")]);
    assert_eq!(scheduler.value_status(&eth("eth0")).state, ValueState::Obtained);

    // NB now claims the same value: nothing to do in the southbound
    let put = scheduler
        .start_txn()
        .put(eth("eth0"), MockValue::new("eth0"))
        .commit()
        .await
        .unwrap();
    assert_eq!(put.state(&eth("eth0")), Some(ValueState::Configured));
    assert!(sb.calls().is_empty());

    let graph = scheduler.graph();
    let node = graph.get_node(&eth("eth0")).unwrap();
    assert_eq!(node.origin(), ValueOrigin::FromNb);
    let meta = node.metadata().and_then(|m| downcast::<MockMetadata>(&**m)).copied();
    assert_eq!(meta, Some(MockMetadata { index }));
}

#[tokio::test]
async fn test_refresh_recreates_missing_value() {
    let (scheduler, sb) = setup(false);
    scheduler
        .start_txn()
        .put(eth("eth0"), MockValue::new("eth0"))
        .commit()
        .await
        .unwrap();
    sb.remove_external(&eth("eth0"));
    sb.clear_calls();

    let result = scheduler.refresh(RefreshOptions::all()).await.unwrap();

    assert_eq!(result.refresh.as_ref().unwrap().missing, vec![eth("eth0")]);
    assert_eq!(result.state(&eth("eth0")), Some(ValueState::Configured));
    assert_eq!(sb.calls_for(&eth("eth0")), vec![Operation::Create]);
    assert!(sb.contains(&eth("eth0")));
}

#[tokio::test]
async fn test_refresh_corrects_drift() {
    let (scheduler, sb) = setup(false);
    scheduler
        .start_txn()
        .put(eth("eth0"), MockValue::new("up"))
        .commit()
        .await
        .unwrap();
    sb.insert_external(&eth("eth0"), MockValue::new("down"));
    sb.clear_calls();

    let result = scheduler.refresh(RefreshOptions::all()).await.unwrap();

    assert_eq!(result.refresh.unwrap().corrected, vec![eth("eth0")]);
    assert_eq!(sb.calls_for(&eth("eth0")), vec![Operation::Update]);
    assert_eq!(sb.value(&eth("eth0")).map(|v| v.label), Some("up".to_string()));
}

#[tokio::test]
async fn test_missing_dependency_unconfigures_dependent() {
    let (scheduler, sb) = setup(false);
    let route = format!("{ROUTE}default");
    scheduler
        .start_txn()
        .put(eth("eth0"), MockValue::new("eth0"))
        .put(route.clone(), MockValue::new("default").depends_on(eth("eth0")))
        .commit()
        .await
        .unwrap();
    sb.fail_always(&eth("eth0"), false);
    sb.remove_external(&eth("eth0"));

    let result = scheduler.refresh(RefreshOptions::all()).await.unwrap();

    assert_eq!(result.state(&eth("eth0")), Some(ValueState::Failed));
    assert_eq!(scheduler.value_status(&route).state, ValueState::Pending);
    assert!(!sb.contains(&route));
}

#[tokio::test]
async fn test_strict_refresh_removes_unknown_values() {
    let (scheduler, sb) = setup(true);
    sb.insert_external(&eth("lo"), MockValue::new("lo"));

    let result = scheduler.refresh(RefreshOptions::all()).await.unwrap();

    assert_eq!(result.refresh.unwrap().removed, vec![eth("lo")]);
    assert_eq!(sb.calls_for(&eth("lo")), vec![Operation::Delete]);
    assert!(!sb.contains(&eth("lo")));
    assert!(scheduler.graph().get_node(&eth("lo")).is_none());
}

#[tokio::test]
async fn test_strict_mode_per_refresh() {
    let (scheduler, sb) = setup(false);
    sb.insert_external(&eth("lo"), MockValue::new("lo"));

    scheduler
        .refresh(RefreshOptions::all().strict(true))
        .await
        .unwrap();
    assert!(!sb.contains(&eth("lo")));
}

#[tokio::test]
async fn test_vanished_obtained_value_is_dropped() {
    let (scheduler, sb) = setup(false);
    sb.insert_external(&eth("lo"), MockValue::new("lo"));
    scheduler.refresh(RefreshOptions::all()).await.unwrap();
    assert_eq!(scheduler.value_status(&eth("lo")).origin, ValueOrigin::FromSb);

    sb.remove_external(&eth("lo"));
    let result = scheduler.refresh(RefreshOptions::all()).await.unwrap();

    assert_eq!(result.refresh.unwrap().removed, vec![eth("lo")]);
    assert!(scheduler.graph().get_node(&eth("lo")).is_none());
    assert!(sb.calls().is_empty());
}

#[tokio::test]
async fn test_refresh_limited_to_descriptors() {
    let (scheduler, sb) = setup(false);
    sb.insert_external(&eth("lo"), MockValue::new("lo"));
    sb.insert_external(&format!("{ROUTE}r1"), MockValue::new("r1"));

    let result = scheduler
        .refresh(RefreshOptions::only(["route"]))
        .await
        .unwrap();

    assert_eq!(result.refresh.unwrap().unmanaged, vec![format!("{ROUTE}r1")]);
    assert!(scheduler.graph().get_node(&eth("lo")).is_none());
}

#[tokio::test]
async fn test_periodic_refresh() {
    let sb = MockSouthbound::new();
    let mut registry = Registry::new();
    registry
        .register(MockDescriptor::new("iface", IF, &sb).with_retrieve())
        .unwrap();
    let config = SchedulerConfig {
        refresh_interval_secs: Some(1),
        print_txn_summary: false,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(config, registry).unwrap();
    sb.insert_external(&eth("lo"), MockValue::new("lo"));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(scheduler.value_status(&eth("lo")).state, ValueState::Obtained);
    assert!(scheduler
        .transaction_history()
        .iter()
        .any(|txn| txn.kind == TxnKind::Refresh));
    scheduler.close();
}
