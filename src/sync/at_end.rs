//! Aggregation at the end of training
//!
//! Batch learners train once and report their final model as a violation.
//! The round aggregates a single time, once every active node has reported.

use super::{concrete_members, covers, BalancingSet, SyncDecision};
use crate::aggregation::Aggregator;
use crate::error::Result;
use crate::types::{ModelFlags, NodeId};
use indexmap::IndexSet;

/// One aggregation after all nodes finished
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationAtEnd;

impl AggregationAtEnd {
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
