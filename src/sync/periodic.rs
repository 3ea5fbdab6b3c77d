//! Periodic full synchronization
//!
//! Every worker reports after the same number of training steps, so the
//! round simply waits until every active node has contributed and then
//! distributes the aggregate to all of them.

use super::{concrete_members, covers, BalancingSet, SyncDecision};
use crate::aggregation::Aggregator;
use crate::error::Result;
use crate::types::{ModelFlags, NodeId};
use indexmap::IndexSet;

/// Periodic model averaging
#[derive(Debug, Clone, Copy, Default)]
pub struct PeriodicSync;

impl PeriodicSync {
    pub(crate) fn evaluate(
        &self,
        set: &mut BalancingSet,
        active: &IndexSet<NodeId>,
        aggregator: &Aggregator,
    ) -> Result<SyncDecision> {
        if !covers(set, active) {
            return Ok(SyncDecision::wait());
        }
        let Some(values) = concrete_members(set) else {
            return Ok(SyncDecision::wait());
        };
        Ok(SyncDecision {
            nodes: active.iter().cloned().collect(),
            params: Some(aggregator.aggregate(&values)?),
            flags: ModelFlags::default(),
        })
    }
}
