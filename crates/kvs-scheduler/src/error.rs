//! Error types for the KV scheduler
//!
//! Errors are split by where they surface:
//! - [`DescriptorError`]: returned by descriptor callbacks
//! - [`KvError`]: per-key outcome reported in transaction results
//! - [`RegistryError`]: descriptor registration
//! - [`SchedulerError`]: whole-transaction and API failures

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Operation;

/// Error returned by a descriptor callback
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// Value rejected by `validate`; never retried
    #[error("invalid value: field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Southbound transiently unavailable
    #[error("southbound unavailable: {0}")]
    Unavailable(String),

    /// Southbound call failed
    #[error("southbound call failed: {0}")]
    Failed(String),

    /// Value or metadata handed to the descriptor has the wrong type
    #[error("value type mismatch for descriptor '{descriptor}'")]
    TypeMismatch { descriptor: String },

    /// Descriptor has no in-place update
    #[error("descriptor '{0}' does not support update")]
    UpdateUnsupported(String),

    /// Descriptor cannot retrieve southbound state
    #[error("descriptor '{0}' does not support retrieve")]
    RetrieveUnsupported(String),
}

impl DescriptorError {
    /// Shorthand for [`DescriptorError::InvalidValue`]
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Default retriability used when a descriptor does not override it
    #[inline]
    #[must_use]
    pub fn is_retriable_by_default(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Failed(_))
    }
}

/// Per-key error carried in results, node state and status notifications
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum KvError {
    /// Validation failed
    #[error("invalid value for '{key}': field '{field}': {reason}")]
    InvalidValue {
        key: String,
        field: String,
        reason: String,
    },

    /// Create/Update/Delete failed
    #[error("{operation} of '{key}' failed (attempt {attempts}): {message}")]
    Operation {
        key: String,
        operation: Operation,
        message: String,
        retriable: bool,
        attempts: u32,
    },

    /// A dependency failed, so this value was not attempted
    #[error("'{key}' blocked by failed dependency '{dependency}'")]
    BlockedByFailedDependency { key: String, dependency: String },

    /// Dependencies still unsatisfied when the caller stopped waiting
    #[error("'{key}' has unmet dependencies: {}", missing.join(", "))]
    DependencyUnmet { key: String, missing: Vec<String> },

    /// No descriptor owns the key
    #[error("no descriptor registered for '{key}'")]
    Unimplemented { key: String },

    /// The key kept changing within one transaction and was given up on
    #[error("'{key}' did not settle after {steps} steps")]
    Unsettled { key: String, steps: u32 },
}

impl KvError {
    /// Key the error refers to
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::InvalidValue { key, .. }
            | Self::Operation { key, .. }
            | Self::BlockedByFailedDependency { key, .. }
            | Self::DependencyUnmet { key, .. }
            | Self::Unimplemented { key }
            | Self::Unsettled { key, .. } => key,
        }
    }

    /// Whether the scheduler may retry the failed operation
    #[inline]
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Operation { retriable: true, .. })
    }
}

/// Descriptor registration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Another descriptor already uses the name
    #[error("descriptor '{0}' already registered")]
    DescriptorExists(String),

    /// Key spaces of two descriptors overlap
    #[error("descriptor '{name}' key prefix '{prefix}' overlaps descriptor '{existing}'")]
    DescriptorConflict {
        name: String,
        existing: String,
        prefix: String,
    },

    /// Retrieve dependencies form a cycle
    #[error("retrieve dependencies form a cycle: {}", .0.join(" -> "))]
    RetrieveCycle(Vec<String>),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// YAML did not parse
    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON did not parse
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// File extension is neither YAML nor JSON
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// Settings out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Scheduler-level errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Descriptor registration failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Explicit dependencies of the transaction form a cycle; nothing was executed
    #[error("dependency cycle among: {}", keys.join(", "))]
    DependencyCycle { keys: Vec<String> },

    /// Transaction was cancelled while still queued
    #[error("transaction cancelled before execution")]
    Cancelled,

    /// Scheduler has shut down
    #[error("scheduler closed")]
    Closed,

    /// Lookup named an unregistered descriptor
    #[error("no descriptor named '{0}'")]
    UnknownDescriptor(String),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Descriptor call failed outside a transaction
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

impl SchedulerError {
    /// Errors that indicate a programming or deployment fault rather than a
    /// runtime condition
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Registry(_) | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retriability() {
        assert!(DescriptorError::Unavailable("down".into()).is_retriable_by_default());
        assert!(DescriptorError::Failed("EBUSY".into()).is_retriable_by_default());
        assert!(!DescriptorError::invalid("name", "empty").is_retriable_by_default());
        assert!(!DescriptorError::UpdateUnsupported("acl".into()).is_retriable_by_default());
    }

    #[test]
    fn kv_error_key_and_message() {
        let err = KvError::DependencyUnmet {
            key: "config/a".into(),
            missing: vec!["config/b".into(), "any-of:iface".into()],
        };
        assert_eq!(err.key(), "config/a");
        assert!(err.to_string().contains("config/b, any-of:iface"));
        assert!(!err.is_retriable());
    }

    #[test]
    fn unsettled_key_and_message() {
        let err = KvError::Unsettled { key: "config/a".into(), steps: 64 };
        assert_eq!(err.key(), "config/a");
        assert_eq!(err.to_string(), "'config/a' did not settle after 64 steps");
        assert!(!err.is_retriable());
    }

    #[test]
    fn kv_error_serializes_tagged() {
        let err = KvError::Unimplemented { key: "k".into() };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"unimplemented\""));
    }

    #[test]
    fn fatal_classification() {
        assert!(SchedulerError::from(RegistryError::DescriptorExists("x".into())).is_fatal());
        assert!(!SchedulerError::Cancelled.is_fatal());
        assert!(!SchedulerError::DependencyCycle { keys: vec![] }.is_fatal());
    }
}
