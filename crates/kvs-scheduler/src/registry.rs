//! Descriptor registry
//!
//! Provides [`Registry`], built once before the scheduler starts and
//! immutable afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::dag::Dag;
use crate::descriptor::{Descriptor, DescriptorAdapter, KvDescriptor};
use crate::error::RegistryError;

/// Registered descriptors in registration order
#[derive(Debug, Default, Clone)]
pub struct Registry {
    descriptors: Vec<Arc<dyn KvDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl Registry {
    /// Empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed descriptor
    ///
    /// # Errors
    /// Fails when the name is taken or the key prefix overlaps an already
    /// registered descriptor.
    pub fn register<D: Descriptor>(&mut self, descriptor: D) -> Result<(), RegistryError> {
        self.register_erased(Arc::new(DescriptorAdapter(descriptor)))
    }

    /// Register an already erased descriptor
    ///
    /// # Errors
    /// Same as [`Registry::register`].
    pub fn register_erased(&mut self, descriptor: Arc<dyn KvDescriptor>) -> Result<(), RegistryError> {
        let name = descriptor.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::DescriptorExists(name));
        }
        for existing in &self.descriptors {
            if let Some(prefix) = overlap(existing.as_ref(), descriptor.as_ref()) {
                return Err(RegistryError::DescriptorConflict {
                    name,
                    existing: existing.name().to_string(),
                    prefix,
                });
            }
        }
        debug!(descriptor = %name, prefix = ?descriptor.key_prefix(), "registered descriptor");
        self.by_name.insert(name, self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Descriptor owning `key`; first match in registration order
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&Arc<dyn KvDescriptor>> {
        self.descriptors.iter().find(|d| d.matches(key))
    }

    /// Descriptor by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn KvDescriptor>> {
        self.by_name.get(name).map(|idx| &self.descriptors[*idx])
    }

    /// Names in registration order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name()).collect()
    }

    /// Prefixes under which NB clients publish values
    #[must_use]
    pub fn nb_key_prefixes(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .filter_map(|d| d.nb_key_prefix().map(str::to_string))
            .collect()
    }

    /// Number of registered descriptors
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no descriptor is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Order in which descriptors must be retrieved
    ///
    /// Respects `retrieve_dependencies`; unrelated descriptors are ordered by
    /// name. Dependencies on unknown descriptors are ignored.
    ///
    /// # Errors
    /// Returns [`RegistryError::RetrieveCycle`] when dependencies form a cycle.
    pub fn retrieve_order(&self) -> Result<Vec<String>, RegistryError> {
        let mut dag = Dag::new();
        for descriptor in &self.descriptors {
            dag.add_node(descriptor.name());
            for dep in descriptor.retrieve_dependencies() {
                if self.by_name.contains_key(&dep) {
                    dag.add_edge(&dep, descriptor.name());
                }
            }
        }
        if let Some(cycle) = dag.cycles().into_iter().next() {
            return Err(RegistryError::RetrieveCycle(cycle));
        }
        dag.topological_order().map_err(RegistryError::RetrieveCycle)
    }
}

/// Overlapping key prefix of two descriptors, if any
fn overlap(a: &dyn KvDescriptor, b: &dyn KvDescriptor) -> Option<String> {
    let (pa, pb) = (a.key_prefix()?, b.key_prefix()?);
    if pa.starts_with(pb) || pb.starts_with(pa) {
        Some(pb.to_string())
    } else {
        None
    }
}
