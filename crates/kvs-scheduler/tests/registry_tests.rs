use kvs_scheduler::error::RegistryError;
use kvs_scheduler::test_harness::dataplane::{
    abf_interface_key, abf_key, acl_key, ABF_DESCRIPTOR, ABF_INTERFACE_DESCRIPTOR, ACL_DESCRIPTOR,
    INTERFACE_DESCRIPTOR,
};
use kvs_scheduler::test_harness::{Dataplane, MockDescriptor, MockSouthbound};
use kvs_scheduler::{Registry, Scheduler, SchedulerConfig, SchedulerError};
use pretty_assertions::assert_eq;

#[test]
fn test_rejects_duplicate_name() {
    let sb = MockSouthbound::new();
    let mut registry = Registry::new();
    registry.register(MockDescriptor::new("route", "config/route/", &sb)).unwrap();

    let err = registry
        .register(MockDescriptor::new("route", "config/other/", &sb))
        .unwrap_err();
    assert_eq!(err, RegistryError::DescriptorExists("route".into()));
}

#[test]
fn test_rejects_overlapping_prefix() {
    let sb = MockSouthbound::new();
    let mut registry = Registry::new();
    registry.register(MockDescriptor::new("iface", "config/if/", &sb)).unwrap();

    let err = registry
        .register(MockDescriptor::new("iface-addr", "config/if/addr/", &sb))
        .unwrap_err();
    assert!(matches!(err, RegistryError::DescriptorConflict { ref existing, .. } if existing == "iface"));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_lookup_by_key() {
    let sb = MockSouthbound::new();
    let mut registry = Registry::new();
    registry.register(MockDescriptor::new("iface", "config/if/", &sb)).unwrap();
    registry.register(MockDescriptor::new("route", "config/route/", &sb)).unwrap();

    assert_eq!(registry.lookup("config/route/r1").map(|d| d.name()), Some("route"));
    assert_eq!(registry.lookup("config/if/eth0").map(|d| d.name()), Some("iface"));
    assert!(registry.lookup("config/nat/n1").is_none());
    assert_eq!(registry.nb_key_prefixes(), vec!["config/if/".to_string(), "config/route/".to_string()]);
}

#[test]
fn test_dataplane_keys_are_owned_by_one_descriptor() {
    let dp = Dataplane::new();
    let mut registry = Registry::new();
    dp.register(&mut registry).unwrap();

    assert_eq!(registry.lookup(&acl_key("acl1")).map(|d| d.name()), Some(ACL_DESCRIPTOR));
    assert_eq!(registry.lookup(&abf_key(3)).map(|d| d.name()), Some(ABF_DESCRIPTOR));
    assert_eq!(
        registry.lookup(&abf_interface_key(3, "tap0")).map(|d| d.name()),
        Some(ABF_INTERFACE_DESCRIPTOR)
    );
}

#[test]
fn test_retrieve_order_follows_dependencies() {
    let dp = Dataplane::new();
    let mut registry = Registry::new();
    dp.register(&mut registry).unwrap();

    let order = registry.retrieve_order().unwrap();
    let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
    assert!(pos(INTERFACE_DESCRIPTOR) < pos(ABF_DESCRIPTOR));
    assert!(pos(ACL_DESCRIPTOR) < pos(ABF_DESCRIPTOR));
    assert!(pos(ABF_DESCRIPTOR) < pos(ABF_INTERFACE_DESCRIPTOR));
}

#[tokio::test]
async fn test_scheduler_refuses_retrieve_cycle() {
    let sb = MockSouthbound::new();
    let mut registry = Registry::new();
    registry
        .register(MockDescriptor::new("a", "config/a/", &sb).retrieve_after("b"))
        .unwrap();
    registry
        .register(MockDescriptor::new("b", "config/b/", &sb).retrieve_after("a"))
        .unwrap();

    assert!(matches!(
        registry.retrieve_order(),
        Err(RegistryError::RetrieveCycle(_))
    ));
    let err = Scheduler::new(SchedulerConfig::default(), registry).unwrap_err();
    assert!(matches!(err, SchedulerError::Registry(RegistryError::RetrieveCycle(_))));
    assert!(err.is_fatal());
}
