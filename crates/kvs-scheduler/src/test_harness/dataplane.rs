//! Simulated packet-processing dataplane with interface, ACL and ABF
//! descriptors
//!
//! ACL indices are assigned by the dataplane and returned on create. ABF
//! policy ids are assigned too but never returned, so the ABF descriptor
//! guesses them with a [`TentativeIndexAllocator`] and trusts them only after
//! a retrieve confirmed them. Attachments of ABF policies to interfaces are
//! derived values with their own descriptor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kvs_keys::{prefix_for, ModelKey, RelationKey};
use parking_lot::Mutex;
use tracing::debug;

use crate::descriptor::{Dependency, Descriptor, IndexedMetadata, OpContext};
use crate::error::{DescriptorError, RegistryError};
use crate::index_alloc::{IndexStatus, TentativeIndexAllocator};
use crate::registry::Registry;
use crate::value::{KeyValuePair, KvWithMetadata, ValueOrigin};

/// Interface descriptor name
pub const INTERFACE_DESCRIPTOR: &str = "vpp-interface";
/// ACL descriptor name
pub const ACL_DESCRIPTOR: &str = "vpp-acl";
/// ABF descriptor name
pub const ABF_DESCRIPTOR: &str = "vpp-abf";
/// ABF-to-interface descriptor name
pub const ABF_INTERFACE_DESCRIPTOR: &str = "vpp-abf-to-interface";

/// Key of interface `name`
#[must_use]
pub fn interface_key(name: &str) -> String {
    ModelKey::new("vpp", "v2", "interfaces", name).render()
}

/// Key of ACL `name`
#[must_use]
pub fn acl_key(name: &str) -> String {
    ModelKey::new("vpp-acls", "v2", "acl", name).render()
}

/// Key of ABF policy `index`
#[must_use]
pub fn abf_key(index: u32) -> String {
    ModelKey::new("vpp-abfs", "v2", "abf", index.to_string()).render()
}

/// Key of the derived value attaching ABF `index` to an interface
#[must_use]
pub fn abf_interface_key(index: u32, interface: &str) -> String {
    RelationKey::new("vpp", "abf", index.to_string(), "interface", interface).to_string()
}

/// Dataplane interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// Admin state
    pub enabled: bool,
    /// MTU in bytes
    pub mtu: u32,
}

impl Interface {
    /// Enabled interface with the default MTU
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            mtu: 1500,
        }
    }
}

/// Metadata of a created interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceMeta {
    /// Index assigned by the dataplane
    pub sw_if_index: u32,
}

impl IndexedMetadata for InterfaceMeta {
    fn index(&self) -> u32 {
        self.sw_if_index
    }
}

/// What an ACL rule does with matching traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    /// Drop matching traffic
    Deny,
    /// Let matching traffic through
    Permit,
}

/// One ACL rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    /// Action for matching traffic
    pub action: AclAction,
    /// Source prefix
    pub source: String,
}

/// Access control list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    /// ACL name
    pub name: String,
    /// Rules in match order
    pub rules: Vec<AclRule>,
}

impl Acl {
    /// ACL with a single permit rule
    pub fn permit(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: vec![AclRule {
                action: AclAction::Permit,
                source: source.into(),
            }],
        }
    }
}

/// Metadata of a created ACL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclMeta {
    /// Index assigned by the dataplane
    pub index: u32,
}

impl IndexedMetadata for AclMeta {
    fn index(&self) -> u32 {
        self.index
    }
}

/// Interface an ABF policy is attached to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AttachedInterface {
    /// Interface name
    pub name: String,
    /// Attachment priority
    pub priority: u32,
}

/// Forwarding path of an ABF policy
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ForwardingPath {
    /// Empty for paths resolved by next hop only
    pub interface: String,
    /// Next hop address
    pub next_hop: String,
}

/// ACL-based forwarding policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abf {
    /// Policy index chosen by the client
    pub index: u32,
    /// ACL selecting the traffic
    pub acl_name: String,
    /// Interfaces the policy applies to
    pub attached: Vec<AttachedInterface>,
    /// Where matching traffic is sent
    pub paths: Vec<ForwardingPath>,
}

impl Abf {
    /// Policy without attachments or paths
    pub fn new(index: u32, acl_name: impl Into<String>) -> Self {
        Self {
            index,
            acl_name: acl_name.into(),
            attached: Vec::new(),
            paths: Vec::new(),
        }
    }

    /// Attach the policy to `interface`
    #[must_use]
    pub fn attach(mut self, interface: impl Into<String>, priority: u32) -> Self {
        self.attached.push(AttachedInterface {
            name: interface.into(),
            priority,
        });
        self
    }

    /// Add a forwarding path
    #[must_use]
    pub fn forward_via(mut self, interface: impl Into<String>, next_hop: impl Into<String>) -> Self {
        self.paths.push(ForwardingPath {
            interface: interface.into(),
            next_hop: next_hop.into(),
        });
        self
    }
}

/// Metadata of a created ABF policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbfMeta {
    /// Policy id, possibly guessed
    pub policy_id: u32,
    /// Whether a retrieve confirmed `policy_id`
    pub status: IndexStatus,
}

/// Value of an ABF-to-interface attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbfAttachment {
    /// Attachment priority
    pub priority: u32,
}

#[derive(Debug, Clone)]
struct PolicyRecord {
    abf_index: u32,
    acl_index: u32,
    paths: Vec<ForwardingPath>,
}

#[derive(Debug, Default)]
struct DpState {
    interfaces: BTreeMap<String, Interface>,
    sw_if_index: BTreeMap<String, u32>,
    next_sw_if_index: u32,
    acls: BTreeMap<u32, Acl>,
    policies: BTreeMap<u32, PolicyRecord>,
    /// `(policy_id, sw_if_index) -> priority`
    attachments: BTreeMap<(u32, u32), u32>,
}

fn lowest_free<V>(used: &BTreeMap<u32, V>) -> u32 {
    (0..).find(|i| !used.contains_key(i)).unwrap_or(u32::MAX)
}

/// The simulated dataplane
#[derive(Debug, Default)]
pub struct Dataplane {
    state: Mutex<DpState>,
    policy_ids: TentativeIndexAllocator,
}

impl Dataplane {
    /// Empty dataplane
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the four descriptors of this dataplane
    ///
    /// # Errors
    /// Registry conflicts with previously registered descriptors.
    pub fn register(self: &Arc<Self>, registry: &mut Registry) -> Result<(), RegistryError> {
        registry.register(InterfaceDescriptor {
            dp: Arc::clone(self),
            prefix: prefix_for("vpp", "v2", "interfaces"),
        })?;
        registry.register(AclDescriptor {
            dp: Arc::clone(self),
            prefix: prefix_for("vpp-acls", "v2", "acl"),
        })?;
        registry.register(AbfDescriptor {
            dp: Arc::clone(self),
            prefix: prefix_for("vpp-abfs", "v2", "abf"),
        })?;
        registry.register(AbfInterfaceDescriptor { dp: Arc::clone(self) })
    }

    /// Names of created interfaces
    #[must_use]
    pub fn interface_names(&self) -> Vec<String> {
        self.state.lock().interfaces.keys().cloned().collect()
    }

    /// Index of ACL `name`
    #[must_use]
    pub fn acl_index(&self, name: &str) -> Option<u32> {
        self.state
            .lock()
            .acls
            .iter()
            .find(|(_, acl)| acl.name == name)
            .map(|(index, _)| *index)
    }

    /// Policy id the dataplane assigned to ABF `abf_index`
    #[must_use]
    pub fn policy_id(&self, abf_index: u32) -> Option<u32> {
        self.state
            .lock()
            .policies
            .iter()
            .find(|(_, p)| p.abf_index == abf_index)
            .map(|(id, _)| *id)
    }

    /// ACL index used by ABF policy `abf_index`
    #[must_use]
    pub fn policy_acl(&self, abf_index: u32) -> Option<u32> {
        self.state
            .lock()
            .policies
            .values()
            .find(|p| p.abf_index == abf_index)
            .map(|p| p.acl_index)
    }

    /// Attached `(abf_index, interface)` pairs
    #[must_use]
    pub fn attachments(&self) -> Vec<(u32, String)> {
        let state = self.state.lock();
        state
            .attachments
            .keys()
            .filter_map(|(policy_id, sw_if_index)| {
                let abf = state.policies.get(policy_id)?.abf_index;
                let name = state
                    .sw_if_index
                    .iter()
                    .find(|(_, idx)| *idx == sw_if_index)?
                    .0
                    .clone();
                Some((abf, name))
            })
            .collect()
    }

    /// Status of policy id `policy_id`
    #[must_use]
    pub fn policy_id_status(&self, policy_id: u32) -> Option<IndexStatus> {
        self.policy_ids.status(policy_id)
    }

    fn add_interface(&self, iface: &Interface) -> Result<u32, DescriptorError> {
        let mut state = self.state.lock();
        if state.interfaces.contains_key(&iface.name) {
            return Err(DescriptorError::Failed(format!("interface {} exists", iface.name)));
        }
        let index = state.next_sw_if_index;
        state.next_sw_if_index += 1;
        state.interfaces.insert(iface.name.clone(), iface.clone());
        state.sw_if_index.insert(iface.name.clone(), index);
        Ok(index)
    }

    fn modify_interface(&self, iface: &Interface) -> Result<(), DescriptorError> {
        let mut state = self.state.lock();
        match state.interfaces.get_mut(&iface.name) {
            Some(current) => {
                *current = iface.clone();
                Ok(())
            }
            None => Err(DescriptorError::Failed(format!("no interface {}", iface.name))),
        }
    }

    fn delete_interface(&self, name: &str) -> Result<(), DescriptorError> {
        let mut state = self.state.lock();
        let Some(&index) = state.sw_if_index.get(name) else {
            return Err(DescriptorError::Failed(format!("no interface {name}")));
        };
        if state.attachments.keys().any(|(_, sw)| *sw == index) {
            return Err(DescriptorError::Failed(format!("interface {name} has ABF attached")));
        }
        if state
            .policies
            .values()
            .any(|p| p.paths.iter().any(|path| path.interface == name))
        {
            return Err(DescriptorError::Failed(format!("interface {name} used by ABF path")));
        }
        state.interfaces.remove(name);
        state.sw_if_index.remove(name);
        Ok(())
    }

    fn add_acl(&self, acl: &Acl) -> u32 {
        let mut state = self.state.lock();
        let index = lowest_free(&state.acls);
        state.acls.insert(index, acl.clone());
        index
    }

    fn replace_acl(&self, index: u32, acl: &Acl) -> Result<(), DescriptorError> {
        match self.state.lock().acls.get_mut(&index) {
            Some(current) => {
                *current = acl.clone();
                Ok(())
            }
            None => Err(DescriptorError::Failed(format!("no ACL with index {index}"))),
        }
    }

    fn delete_acl(&self, index: u32) -> Result<(), DescriptorError> {
        let mut state = self.state.lock();
        if state.policies.values().any(|p| p.acl_index == index) {
            return Err(DescriptorError::Failed(format!("ACL {index} in use by ABF")));
        }
        state
            .acls
            .remove(&index)
            .map(|_| ())
            .ok_or_else(|| DescriptorError::Failed(format!("no ACL with index {index}")))
    }

    /// Adds a policy; the assigned policy id is not reported back
    fn add_abf_policy(&self, abf_index: u32, acl_index: u32, paths: &[ForwardingPath]) -> Result<(), DescriptorError> {
        let mut state = self.state.lock();
        if !state.acls.contains_key(&acl_index) {
            return Err(DescriptorError::Failed(format!("no ACL with index {acl_index}")));
        }
        for path in paths.iter().filter(|p| !p.interface.is_empty()) {
            if !state.interfaces.contains_key(&path.interface) {
                return Err(DescriptorError::Failed(format!("no interface {}", path.interface)));
            }
        }
        let policy_id = lowest_free(&state.policies);
        state.policies.insert(
            policy_id,
            PolicyRecord {
                abf_index,
                acl_index,
                paths: paths.to_vec(),
            },
        );
        Ok(())
    }

    fn delete_abf_policy(&self, policy_id: u32) -> Result<(), DescriptorError> {
        let mut state = self.state.lock();
        if state.attachments.keys().any(|(p, _)| *p == policy_id) {
            return Err(DescriptorError::Failed(format!("policy {policy_id} still attached")));
        }
        state
            .policies
            .remove(&policy_id)
            .map(|_| ())
            .ok_or_else(|| DescriptorError::Failed(format!("no ABF policy {policy_id}")))
    }

    fn attach(&self, policy_id: u32, interface: &str, priority: u32) -> Result<(), DescriptorError> {
        let mut state = self.state.lock();
        if !state.policies.contains_key(&policy_id) {
            return Err(DescriptorError::Failed(format!("no ABF policy {policy_id}")));
        }
        let Some(&sw_if_index) = state.sw_if_index.get(interface) else {
            return Err(DescriptorError::Failed(format!("no interface {interface}")));
        };
        state.attachments.insert((policy_id, sw_if_index), priority);
        Ok(())
    }

    fn detach(&self, policy_id: u32, interface: &str) -> Result<(), DescriptorError> {
        let mut state = self.state.lock();
        let Some(&sw_if_index) = state.sw_if_index.get(interface) else {
            return Err(DescriptorError::Failed(format!("no interface {interface}")));
        };
        state
            .attachments
            .remove(&(policy_id, sw_if_index))
            .map(|_| ())
            .ok_or_else(|| DescriptorError::Failed(format!("policy {policy_id} not attached to {interface}")))
    }
}

fn origin_of<V, M>(key: &str, correlate: &[KvWithMetadata<V, M>]) -> ValueOrigin {
    if correlate.iter().any(|kv| kv.key == key) {
        ValueOrigin::FromNb
    } else {
        ValueOrigin::FromSb
    }
}

struct InterfaceDescriptor {
    dp: Arc<Dataplane>,
    prefix: String,
}

impl Descriptor for InterfaceDescriptor {
    type Value = Interface;
    type Metadata = InterfaceMeta;

    fn name(&self) -> &str {
        INTERFACE_DESCRIPTOR
    }

    fn key_prefix(&self) -> Option<&str> {
        Some(&self.prefix)
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        self.key_prefix()
    }

    fn validate(&self, key: &str, value: &Interface) -> Result<(), DescriptorError> {
        if value.name.is_empty() || interface_key(&value.name) != key {
            return Err(DescriptorError::invalid("name", "does not match the key"));
        }
        if !(64..=9216).contains(&value.mtu) {
            return Err(DescriptorError::invalid("mtu", format!("{} out of range", value.mtu)));
        }
        Ok(())
    }

    fn create(&self, _ctx: &OpContext, _key: &str, value: &Interface) -> Result<InterfaceMeta, DescriptorError> {
        let sw_if_index = self.dp.add_interface(value)?;
        Ok(InterfaceMeta { sw_if_index })
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn update(
        &self,
        _ctx: &OpContext,
        _key: &str,
        _old: &Interface,
        new: &Interface,
        metadata: Option<&InterfaceMeta>,
    ) -> Result<InterfaceMeta, DescriptorError> {
        self.dp.modify_interface(new)?;
        metadata
            .copied()
            .ok_or_else(|| DescriptorError::Failed(format!("no metadata for interface {}", new.name)))
    }

    fn delete(
        &self,
        _ctx: &OpContext,
        _key: &str,
        value: &Interface,
        _metadata: Option<&InterfaceMeta>,
    ) -> Result<(), DescriptorError> {
        self.dp.delete_interface(&value.name)
    }

    fn supports_retrieve(&self) -> bool {
        true
    }

    fn retrieve(
        &self,
        _ctx: &OpContext,
        correlate: &[KvWithMetadata<Interface, InterfaceMeta>],
    ) -> Result<Vec<KvWithMetadata<Interface, InterfaceMeta>>, DescriptorError> {
        let state = self.dp.state.lock();
        Ok(state
            .interfaces
            .values()
            .filter_map(|iface| {
                let sw_if_index = *state.sw_if_index.get(&iface.name)?;
                let key = interface_key(&iface.name);
                Some(KvWithMetadata {
                    origin: origin_of(&key, correlate),
                    key,
                    value: iface.clone(),
                    metadata: Some(InterfaceMeta { sw_if_index }),
                })
            })
            .collect())
    }
}

struct AclDescriptor {
    dp: Arc<Dataplane>,
    prefix: String,
}

impl Descriptor for AclDescriptor {
    type Value = Acl;
    type Metadata = AclMeta;

    fn name(&self) -> &str {
        ACL_DESCRIPTOR
    }

    fn key_prefix(&self) -> Option<&str> {
        Some(&self.prefix)
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        self.key_prefix()
    }

    fn validate(&self, _key: &str, value: &Acl) -> Result<(), DescriptorError> {
        if value.rules.is_empty() {
            return Err(DescriptorError::invalid("rules", "ACL without rules"));
        }
        Ok(())
    }

    fn create(&self, _ctx: &OpContext, _key: &str, value: &Acl) -> Result<AclMeta, DescriptorError> {
        let index = self.dp.add_acl(value);
        debug!(acl = %value.name, index, "ACL added");
        Ok(AclMeta { index })
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn update(
        &self,
        _ctx: &OpContext,
        _key: &str,
        _old: &Acl,
        new: &Acl,
        metadata: Option<&AclMeta>,
    ) -> Result<AclMeta, DescriptorError> {
        let meta = metadata
            .copied()
            .ok_or_else(|| DescriptorError::Failed(format!("no metadata for ACL {}", new.name)))?;
        self.dp.replace_acl(meta.index, new)?;
        Ok(meta)
    }

    fn delete(
        &self,
        _ctx: &OpContext,
        _key: &str,
        value: &Acl,
        metadata: Option<&AclMeta>,
    ) -> Result<(), DescriptorError> {
        let meta =
            metadata.ok_or_else(|| DescriptorError::Failed(format!("no metadata for ACL {}", value.name)))?;
        self.dp.delete_acl(meta.index)
    }

    fn supports_retrieve(&self) -> bool {
        true
    }

    fn retrieve(
        &self,
        _ctx: &OpContext,
        correlate: &[KvWithMetadata<Acl, AclMeta>],
    ) -> Result<Vec<KvWithMetadata<Acl, AclMeta>>, DescriptorError> {
        let state = self.dp.state.lock();
        Ok(state
            .acls
            .iter()
            .map(|(index, acl)| {
                let key = acl_key(&acl.name);
                KvWithMetadata {
                    origin: origin_of(&key, correlate),
                    key,
                    value: acl.clone(),
                    metadata: Some(AclMeta { index: *index }),
                }
            })
            .collect())
    }
}

struct AbfDescriptor {
    dp: Arc<Dataplane>,
    prefix: String,
}

impl Descriptor for AbfDescriptor {
    type Value = Abf;
    type Metadata = AbfMeta;

    fn name(&self) -> &str {
        ABF_DESCRIPTOR
    }

    fn key_prefix(&self) -> Option<&str> {
        Some(&self.prefix)
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        self.key_prefix()
    }

    fn equivalent(&self, _key: &str, old: &Abf, new: &Abf) -> bool {
        let set = |items: &[AttachedInterface]| items.iter().cloned().collect::<BTreeSet<_>>();
        let paths = |items: &[ForwardingPath]| items.iter().cloned().collect::<BTreeSet<_>>();
        old.acl_name == new.acl_name
            && set(&old.attached) == set(&new.attached)
            && paths(&old.paths) == paths(&new.paths)
    }

    fn validate(&self, key: &str, value: &Abf) -> Result<(), DescriptorError> {
        if value.acl_name.is_empty() {
            return Err(DescriptorError::invalid("acl_name", "ABF configuration defined without ACL"));
        }
        if abf_key(value.index) != key {
            return Err(DescriptorError::invalid("index", "does not match the key"));
        }
        Ok(())
    }

    fn create(&self, ctx: &OpContext, _key: &str, value: &Abf) -> Result<AbfMeta, DescriptorError> {
        let acls = ctx.metadata_view::<AclMeta>(ACL_DESCRIPTOR);
        let acl = acls.get(&value.acl_name).ok_or_else(|| {
            DescriptorError::Failed(format!("failed to obtain metadata for ACL {}", value.acl_name))
        })?;
        let guess = self.dp.policy_ids.allocate();
        if let Err(err) = self.dp.add_abf_policy(value.index, acl.index, &value.paths) {
            self.dp.policy_ids.release(guess);
            return Err(err);
        }
        debug!(abf = value.index, policy_id = guess, "ABF policy added with guessed id");
        Ok(AbfMeta {
            policy_id: guess,
            status: IndexStatus::Tentative,
        })
    }

    fn delete(
        &self,
        _ctx: &OpContext,
        _key: &str,
        value: &Abf,
        metadata: Option<&AbfMeta>,
    ) -> Result<(), DescriptorError> {
        let meta =
            metadata.ok_or_else(|| DescriptorError::Failed(format!("no metadata for ABF {}", value.index)))?;
        self.dp.delete_abf_policy(meta.policy_id)?;
        self.dp.policy_ids.release(meta.policy_id);
        Ok(())
    }

    fn supports_retrieve(&self) -> bool {
        true
    }

    fn retrieve(
        &self,
        ctx: &OpContext,
        correlate: &[KvWithMetadata<Abf, AbfMeta>],
    ) -> Result<Vec<KvWithMetadata<Abf, AbfMeta>>, DescriptorError> {
        let acls = ctx.metadata_view::<AclMeta>(ACL_DESCRIPTOR);
        let state = self.dp.state.lock();
        let mut out = Vec::new();
        for (policy_id, policy) in &state.policies {
            let Some((label, _)) = acls.lookup_by_index(policy.acl_index) else {
                debug!(policy_id, acl = policy.acl_index, "ABF policy references unknown ACL");
                continue;
            };
            let key = abf_key(policy.abf_index);
            let attached = correlate
                .iter()
                .find(|kv| kv.key == key)
                .map(|kv| kv.value.attached.clone())
                .unwrap_or_default();
            out.push(KvWithMetadata {
                origin: origin_of(&key, correlate),
                key,
                value: Abf {
                    index: policy.abf_index,
                    acl_name: label.to_string(),
                    attached,
                    paths: policy.paths.clone(),
                },
                metadata: Some(AbfMeta {
                    policy_id: *policy_id,
                    status: IndexStatus::Confirmed,
                }),
            });
        }
        self.dp.policy_ids.reconcile(state.policies.keys().copied());
        Ok(out)
    }

    fn dependencies(&self, _key: &str, value: &Abf) -> Vec<Dependency> {
        let mut deps: Vec<Dependency> = value
            .paths
            .iter()
            .filter(|path| !path.interface.is_empty())
            .map(|path| Dependency::on_key("interface", interface_key(&path.interface)))
            .collect();
        deps.push(Dependency::on_key("acl", acl_key(&value.acl_name)));
        deps
    }

    fn derived_values(&self, _key: &str, value: &Abf) -> Vec<KeyValuePair> {
        value
            .attached
            .iter()
            .map(|iface| {
                KeyValuePair::new(
                    abf_interface_key(value.index, &iface.name),
                    AbfAttachment {
                        priority: iface.priority,
                    },
                )
            })
            .collect()
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        vec![INTERFACE_DESCRIPTOR.to_string(), ACL_DESCRIPTOR.to_string()]
    }
}

struct AbfInterfaceDescriptor {
    dp: Arc<Dataplane>,
}

impl AbfInterfaceDescriptor {
    fn parse(key: &str) -> Result<(u32, String), DescriptorError> {
        RelationKey::parse_relation(key, "vpp", "abf", "interface")
            .and_then(|rel| rel.id.parse().ok().map(|index| (index, rel.target)))
            .ok_or_else(|| DescriptorError::invalid("key", format!("not an ABF attachment: {key}")))
    }

    fn policy_id(ctx: &OpContext, abf_index: u32) -> Result<u32, DescriptorError> {
        ctx.metadata::<AbfMeta>(&abf_key(abf_index))
            .map(|meta| meta.policy_id)
            .ok_or_else(|| DescriptorError::Failed(format!("ABF {abf_index} not configured")))
    }
}

impl Descriptor for AbfInterfaceDescriptor {
    type Value = AbfAttachment;
    type Metadata = ();

    fn name(&self) -> &str {
        ABF_INTERFACE_DESCRIPTOR
    }

    fn key_selector(&self, key: &str) -> bool {
        RelationKey::parse_relation(key, "vpp", "abf", "interface").is_some()
    }

    fn validate(&self, key: &str, _value: &AbfAttachment) -> Result<(), DescriptorError> {
        Self::parse(key).map(|_| ())
    }

    fn create(&self, ctx: &OpContext, key: &str, value: &AbfAttachment) -> Result<(), DescriptorError> {
        let (abf_index, interface) = Self::parse(key)?;
        let policy_id = Self::policy_id(ctx, abf_index)?;
        self.dp.attach(policy_id, &interface, value.priority)
    }

    fn delete(
        &self,
        ctx: &OpContext,
        key: &str,
        _value: &AbfAttachment,
        _metadata: Option<&()>,
    ) -> Result<(), DescriptorError> {
        let (abf_index, interface) = Self::parse(key)?;
        let policy_id = Self::policy_id(ctx, abf_index)?;
        self.dp.detach(policy_id, &interface)
    }

    fn supports_retrieve(&self) -> bool {
        true
    }

    fn retrieve(
        &self,
        _ctx: &OpContext,
        _correlate: &[KvWithMetadata<AbfAttachment, ()>],
    ) -> Result<Vec<KvWithMetadata<AbfAttachment, ()>>, DescriptorError> {
        let state = self.dp.state.lock();
        Ok(state
            .attachments
            .iter()
            .filter_map(|((policy_id, sw_if_index), priority)| {
                let abf_index = state.policies.get(policy_id)?.abf_index;
                let (name, _) = state.sw_if_index.iter().find(|(_, idx)| *idx == sw_if_index)?;
                Some(KvWithMetadata {
                    key: abf_interface_key(abf_index, name),
                    value: AbfAttachment { priority: *priority },
                    metadata: None,
                    // attachments are always derived from an ABF
                    origin: ValueOrigin::FromNb,
                })
            })
            .collect())
    }

    fn dependencies(&self, key: &str, _value: &AbfAttachment) -> Vec<Dependency> {
        Self::parse(key)
            .map(|(_, interface)| vec![Dependency::on_key("interface", interface_key(&interface))])
            .unwrap_or_default()
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        vec![ABF_DESCRIPTOR.to_string(), INTERFACE_DESCRIPTOR.to_string()]
    }
}
