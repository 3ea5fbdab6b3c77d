//! Shared value types used across the control plane

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque node identifier, unique per worker for the lifetime of a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from anything string-like
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

/// Flags attached to a distributed model
///
/// `set_reference` tells the worker to update its reference snapshot,
/// `nosync` marks an echo from the no-sync baseline strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFlags {
    /// Worker should snapshot the received model as its new reference
    #[serde(default)]
    pub set_reference: bool,
    /// Model is an echo produced by the no-sync strategy
    #[serde(default)]
    pub nosync: bool,
}

impl ModelFlags {
    /// Flags of a full synchronization round
    pub fn reference_update() -> Self {
        ModelFlags {
            set_reference: true,
            nosync: false,
        }
    }

    /// Flags of a no-sync echo
    pub fn nosync_echo() -> Self {
        ModelFlags {
            set_reference: false,
            nosync: true,
        }
    }
}

/// One labeled training example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    /// Feature vector
    pub features: Vec<f64>,
    /// Ground-truth label
    pub label: f64,
}

impl Example {
    /// Create an example from features and label
    pub fn new(features: Vec<f64>, label: f64) -> Self {
        Example { features, label }
    }
}
