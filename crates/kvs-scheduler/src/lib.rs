//! KV scheduler: reconciliation engine of a dataplane configuration agent
//!
//! Northbound clients describe desired configuration as key-value pairs.
//! Descriptors, one per value kind, know how to create, update, delete and
//! retrieve values in the southbound (the dataplane). The scheduler keeps a
//! graph of all values and their dependencies and drives the southbound
//! towards the desired state:
//! 1. **Planning**: a transaction's changes are ordered so that dependencies
//!    are created first and removed last
//! 2. **Execution**: descriptor callbacks run with bounded concurrency;
//!    values with unmet dependencies wait and are applied once satisfied
//! 3. **Refresh**: the southbound is re-read and the graph reconciled with it
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use kvs_scheduler::prelude::*;
//!
//! let mut registry = Registry::new();
//! registry.register(MyDescriptor::new())?;
//! let scheduler = Scheduler::new(SchedulerConfig::default(), registry)?;
//!
//! let result = scheduler
//!     .start_txn()
//!     .put("config/vpp-acls/v2/acl/acl1", acl)
//!     .commit()
//!     .await?;
//! assert!(result.is_success());
//! ```

pub mod config;
pub mod dag;
pub mod descriptor;
pub mod error;
mod executor;
pub mod graph;
pub mod history;
pub mod index_alloc;
pub mod logging;
pub mod planner;
pub mod refresh;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod txn;
pub mod value;

// Test harness
pub mod test_harness;

pub use config::SchedulerConfig;
pub use descriptor::{
    AnyOf, Dependency, DependencyTarget, Descriptor, DescriptorAdapter, IndexedMetadata, KeySelector,
    KvDescriptor, MetadataView, OpContext,
};
pub use error::{ConfigError, DescriptorError, KvError, RegistryError, SchedulerError};
pub use graph::{GraphSnapshot, Node, ValueState};
pub use history::{RecordedKv, RecordedOp, RecordedTxn, TxnKind};
pub use planner::{Plan, PlanInput, PlannedAction, PlannedOp, Planner};
pub use refresh::{RefreshOptions, RefreshReport};
pub use registry::Registry;
pub use retry::RetryPolicy;
pub use scheduler::{with_prefix, Scheduler, View};
pub use txn::{KeyResult, Txn, TxnHandle, TxnOptions, TxnResult, ValueStatus};
pub use value::{downcast, value_ref, ErasedKv, KeyValuePair, KvWithMetadata, Operation, Value, ValueOrigin, ValueRef};

/// Common imports for descriptor authors and scheduler clients
pub mod prelude {
    pub use crate::descriptor::{Dependency, Descriptor, IndexedMetadata, OpContext};
    pub use crate::error::{DescriptorError, KvError, SchedulerError};
    pub use crate::graph::ValueState;
    pub use crate::refresh::RefreshOptions;
    pub use crate::registry::Registry;
    pub use crate::retry::RetryPolicy;
    pub use crate::scheduler::{Scheduler, View};
    pub use crate::txn::{TxnOptions, TxnResult};
    pub use crate::value::{KeyValuePair, KvWithMetadata, Operation, ValueOrigin};
    pub use crate::SchedulerConfig;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
