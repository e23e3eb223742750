//! ACL and ABF configuration on the simulated dataplane

use std::sync::Arc;

use kvs_scheduler::index_alloc::IndexStatus;
use kvs_scheduler::test_harness::dataplane::{
    abf_interface_key, abf_key, acl_key, interface_key, Abf, AbfMeta, Acl, AclMeta, Interface, ACL_DESCRIPTOR,
};
use kvs_scheduler::test_harness::Dataplane;
use kvs_scheduler::{downcast, RefreshOptions, Registry, Scheduler, SchedulerConfig, ValueState};
use pretty_assertions::assert_eq;

fn setup() -> (Scheduler, Arc<Dataplane>) {
    let dp = Dataplane::new();
    let mut registry = Registry::new();
    dp.register(&mut registry).unwrap();
    let config = SchedulerConfig {
        enable_retry: false,
        print_txn_summary: false,
        ..SchedulerConfig::default()
    };
    (Scheduler::new(config, registry).unwrap(), dp)
}

fn abf_meta(scheduler: &Scheduler, index: u32) -> Option<AbfMeta> {
    let graph = scheduler.graph();
    let node = graph.get_node(&abf_key(index))?;
    node.metadata().and_then(|m| downcast::<AbfMeta>(&**m)).copied()
}

async fn configure_abf(scheduler: &Scheduler) {
    let result = scheduler
        .start_txn()
        .put(interface_key("tap0"), Interface::new("tap0"))
        .put(interface_key("memif1"), Interface::new("memif1"))
        .put(acl_key("acl1"), Acl::permit("acl1", "10.0.0.0/24"))
        .put(
            abf_key(1),
            Abf::new(1, "acl1").attach("tap0", 10).forward_via("memif1", "10.0.0.1"),
        )
        .commit()
        .await
        .unwrap();
    assert!(result.is_success(), "{:?}", result.failed_keys());
}

#[tokio::test]
async fn test_abf_waits_for_acl() {
    let (scheduler, dp) = setup();

    let first = scheduler
        .start_txn()
        .put(abf_key(1), Abf::new(1, "acl1").attach("tap0", 10))
        .put(interface_key("tap0"), Interface::new("tap0"))
        .commit()
        .await
        .unwrap();
    assert_eq!(first.state(&abf_key(1)), Some(ValueState::Pending));
    assert_eq!(dp.policy_id(1), None);

    let second = scheduler
        .start_txn()
        .put(acl_key("acl1"), Acl::permit("acl1", "10.0.0.0/24"))
        .commit()
        .await
        .unwrap();

    assert_eq!(second.state(&abf_key(1)), Some(ValueState::Configured));
    assert_eq!(second.state(&abf_interface_key(1, "tap0")), Some(ValueState::Configured));
    assert_eq!(dp.policy_acl(1), dp.acl_index("acl1"));
    assert_eq!(dp.attachments(), vec![(1, "tap0".to_string())]);
}

#[tokio::test]
async fn test_acl_index_is_available_to_abf() {
    let (scheduler, dp) = setup();
    configure_abf(&scheduler).await;

    let acls = scheduler.metadata_view::<AclMeta>(ACL_DESCRIPTOR);
    let acl = acls.get("acl1").copied();
    assert_eq!(acl.map(|m| m.index), dp.acl_index("acl1"));
    assert_eq!(acls.lookup_by_index(acl.unwrap().index).map(|(label, _)| label), Some("acl1"));
}

#[tokio::test]
async fn test_delete_acl_referenced_by_abf() {
    let (scheduler, dp) = setup();
    configure_abf(&scheduler).await;

    let result = scheduler.start_txn().delete(acl_key("acl1")).commit().await.unwrap();

    assert!(result.is_success(), "{:?}", result.failed_keys());
    assert_eq!(result.state(&acl_key("acl1")), Some(ValueState::Removed));
    assert_eq!(result.state(&abf_key(1)), Some(ValueState::Pending));
    assert_eq!(dp.acl_index("acl1"), None);
    assert_eq!(dp.policy_id(1), None);
    assert!(dp.attachments().is_empty());
    assert!(scheduler.graph().get_node(&abf_interface_key(1, "tap0")).is_none());

    // the ABF comes back with its ACL
    scheduler
        .start_txn()
        .put(acl_key("acl1"), Acl::permit("acl1", "10.0.0.0/24"))
        .commit()
        .await
        .unwrap();
    assert_eq!(scheduler.value_status(&abf_key(1)).state, ValueState::Configured);
    assert_eq!(dp.attachments(), vec![(1, "tap0".to_string())]);
}

#[tokio::test]
async fn test_delete_abf_detaches_first() {
    let (scheduler, dp) = setup();
    configure_abf(&scheduler).await;

    let result = scheduler.start_txn().delete(abf_key(1)).commit().await.unwrap();

    assert!(result.is_success(), "{:?}", result.failed_keys());
    assert_eq!(dp.policy_id(1), None);
    assert!(dp.attachments().is_empty());
    assert!(dp.acl_index("acl1").is_some());
}

#[tokio::test]
async fn test_policy_id_confirmed_by_refresh() {
    let (scheduler, dp) = setup();
    configure_abf(&scheduler).await;

    let tentative = abf_meta(&scheduler, 1).unwrap();
    assert_eq!(tentative.status, IndexStatus::Tentative);
    assert_eq!(Some(tentative.policy_id), dp.policy_id(1));

    let result = scheduler.refresh(RefreshOptions::all()).await.unwrap();
    let report = result.refresh.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(report.adopted.contains(&abf_key(1)));
    assert!(report.adopted.contains(&abf_interface_key(1, "tap0")));

    let confirmed = abf_meta(&scheduler, 1).unwrap();
    assert_eq!(confirmed.status, IndexStatus::Confirmed);
    assert_eq!(dp.policy_id_status(confirmed.policy_id), Some(IndexStatus::Confirmed));
}

#[tokio::test]
async fn test_interface_validation() {
    let (scheduler, dp) = setup();
    let mut jumbo = Interface::new("eth0");
    jumbo.mtu = 20_000;

    let result = scheduler
        .start_txn()
        .put(interface_key("eth0"), jumbo)
        .commit()
        .await
        .unwrap();

    assert_eq!(result.state(&interface_key("eth0")), Some(ValueState::Invalid));
    assert!(dp.interface_names().is_empty());
}
