//! Dependency graph store
//!
//! Nodes are keyed by value key and carry intent, applied southbound state,
//! metadata and lifecycle state. Edges are implicit: they are evaluated from
//! each node's dependencies and `derived_from` back-reference.

mod node;
mod store;

pub use node::{Node, ValueState};
pub use store::{GraphSnapshot, GraphStore, GraphWriter};
