//! Synchronization strategies
//!
//! A synchronizer decides which nodes take part in an aggregation round and
//! whether the round can aggregate yet. The coordinator calls [`evaluate`]
//! while driving a round; workers call [`evaluate_local`] to test their
//! local condition after a training step.
//!
//! [`evaluate`]: Synchronizer::evaluate
//! [`evaluate_local`]: Synchronizer::evaluate_local

mod at_end;
mod dynamic;
mod nosync;
mod periodic;

pub use at_end::AggregationAtEnd;
pub use dynamic::{DynamicHedgeSync, DynamicSync};
pub use nosync::NoSync;
pub use periodic::PeriodicSync;

use crate::aggregation::Aggregator;
use crate::error::{Result, SyncError};
use crate::params::Parameters;
use crate::types::{ModelFlags, NodeId};
use indexmap::{IndexMap, IndexSet};

/// Nodes of the current round, mapped to their reported parameters.
/// `None` marks a node whose parameters were requested but not yet received.
pub type BalancingSet = IndexMap<NodeId, Option<Parameters>>;

/// Outcome of one synchronizer evaluation
#[derive(Debug, Clone)]
pub struct SyncDecision {
    /// With `params` set: the recipients of the aggregated model.
    /// Without: the nodes whose parameters the round still needs.
    pub nodes: Vec<NodeId>,
    /// The aggregated model, once the round can aggregate
    pub params: Option<Parameters>,
    /// Flags to attach to the distributed model
    pub flags: ModelFlags,
}

impl SyncDecision {
    /// Keep waiting for outstanding replies or further violations
    pub fn wait() -> Self {
        SyncDecision {
            nodes: Vec::new(),
            params: None,
            flags: ModelFlags::default(),
        }
    }
}

/// Result of a worker-side local condition check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalCheck {
    /// Measured divergence, for the strategies that compute one
    pub divergence: Option<f64>,
    /// Whether the local condition still holds (false triggers a violation)
    pub holds: bool,
}

/// Synchronization strategy selected for an experiment
#[derive(Debug)]
pub enum Synchronizer {
    /// Full synchronization every `sync_period` steps
    Periodic(PeriodicSync),
    /// Divergence-triggered full synchronization
    Dynamic(DynamicSync),
    /// Divergence-triggered incremental balancing with a full-sync hedge
    DynamicHedge(DynamicHedgeSync),
    /// Isolated training with central logging
    NoSync(NoSync),
    /// One aggregation once every node finished training
    AggregationAtEnd(AggregationAtEnd),
}

impl Synchronizer {
    /// Periodic full synchronization
    pub fn periodic() -> Self {
        Synchronizer::Periodic(PeriodicSync)
    }

    /// Dynamic synchronization with divergence threshold `delta`
    pub fn dynamic(delta: f64) -> Self {
        Synchronizer::Dynamic(DynamicSync::new(delta))
    }

    /// Dynamic hedge synchronization with divergence threshold `delta`
    pub fn dynamic_hedge(delta: f64) -> Self {
        Synchronizer::DynamicHedge(DynamicHedgeSync::new(delta))
    }

    /// Dynamic hedge with a deterministic augmentation sampler
    pub fn dynamic_hedge_seeded(delta: f64, seed: u64) -> Self {
        Synchronizer::DynamicHedge(DynamicHedgeSync::with_seed(delta, seed))
    }

    /// No synchronization
    pub fn nosync() -> Self {
        Synchronizer::NoSync(NoSync)
    }

    /// Aggregation at the end of training
    pub fn aggregation_at_end() -> Self {
        Synchronizer::AggregationAtEnd(AggregationAtEnd)
    }

    /// Decide how the current round proceeds
    pub fn evaluate(
        &mut self,
        set: &mut BalancingSet,
        active: &IndexSet<NodeId>,
        registered: &IndexSet<NodeId>,
        ref_point: &mut Option<Parameters>,
        aggregator: &Aggregator,
    ) -> Result<SyncDecision> {
        match self {
            Synchronizer::Periodic(s) => s.evaluate(set, active, aggregator),
            Synchronizer::Dynamic(s) => s.evaluate(set, active, registered, ref_point, aggregator),
            Synchronizer::DynamicHedge(s) => {
                s.evaluate(set, active, registered, ref_point, aggregator)
            }
            Synchronizer::NoSync(s) => s.evaluate(set),
            Synchronizer::AggregationAtEnd(s) => s.evaluate(set, active, aggregator),
        }
    }

    /// Worker-side check of the local condition
    pub fn evaluate_local(
        &self,
        current: &Parameters,
        reference: Option<&Parameters>,
    ) -> Result<LocalCheck> {
        match self {
            Synchronizer::Periodic(_) | Synchronizer::NoSync(_) => Ok(LocalCheck {
                divergence: None,
                holds: false,
            }),
            Synchronizer::Dynamic(s) => s.evaluate_local(current, reference),
            Synchronizer::DynamicHedge(s) => s.evaluate_local(current, reference),
            Synchronizer::AggregationAtEnd(_) => Ok(LocalCheck {
                divergence: None,
                holds: true,
            }),
        }
    }

    /// Divergence threshold, for the strategies that have one
    pub fn delta(&self) -> Option<f64> {
        match self {
            Synchronizer::Dynamic(s) => Some(s.delta()),
            Synchronizer::DynamicHedge(s) => Some(s.delta()),
            _ => None,
        }
    }
}

/// Check whether the balancing set covers exactly the given node set
fn covers(set: &BalancingSet, nodes: &IndexSet<NodeId>) -> bool {
    set.len() == nodes.len() && set.keys().all(|k| nodes.contains(k))
}

/// Resolve the balancing set for aggregation: wait if any active member is
/// still pending, substitute the reference point for inactive members.
///
/// Returns `None` while the round has to keep waiting; otherwise the
/// parameters of every member in insertion order.
fn resolve_members(
    set: &mut BalancingSet,
    active: &IndexSet<NodeId>,
    ref_point: &Option<Parameters>,
) -> Result<Option<Vec<Parameters>>> {
    for (id, slot) in set.iter_mut() {
        if slot.is_none() {
            if active.contains(id) {
                // not all requested nodes have answered yet
                return Ok(None);
            }
            // a deactivated node cannot answer; its share is the reference point
            let substitute = ref_point.clone().ok_or_else(|| {
                SyncError::Configuration(format!(
                    "no reference point to substitute for inactive node {id}"
                ))
            })?;
            *slot = Some(substitute);
        }
    }
    let mut values = Vec::with_capacity(set.len());
    for slot in set.values() {
        match slot {
            Some(param) => values.push(param.clone()),
            None => return Ok(None),
        }
    }
    Ok(Some(values))
}

/// Collect the concrete parameters of a set that expects no pending entries
fn concrete_members(set: &BalancingSet) -> Option<Vec<Parameters>> {
    let mut values = Vec::with_capacity(set.len());
    for slot in set.values() {
        values.push(slot.clone()?);
    }
    Some(values)
}
