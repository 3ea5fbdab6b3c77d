//! Divergence-triggered synchronization
//!
//! [`DynamicSync`] widens every violation straight into a full
//! synchronization. [`DynamicHedgeSync`] first tries to settle the violation
//! locally: it aggregates the nodes at hand, and only if the provisional
//! aggregate still diverges from the reference does it pull in more nodes,
//! doubling the request set each attempt. Once the projected set would cover
//! half of all registered nodes it hedges into a full synchronization
//! instead of balancing locally forever.

use super::{covers, resolve_members, BalancingSet, LocalCheck, SyncDecision};
use crate::aggregation::Aggregator;
use crate::error::Result;
use crate::params::Parameters;
use crate::types::{ModelFlags, NodeId};
use indexmap::IndexSet;
use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

/// Full synchronization as soon as any node diverges
#[derive(Debug, Clone, Copy)]
pub struct DynamicSync {
    delta: f64,
}

impl DynamicSync {
    /// Create with the maximum divergence threshold
    pub fn new(delta: f64) -> Self {
        DynamicSync { delta }
    }

    /// Divergence threshold
    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub(crate) fn evaluate(
        &self,
        set: &mut BalancingSet,
        active: &IndexSet<NodeId>,
        registered: &IndexSet<NodeId>,
        ref_point: &mut Option<Parameters>,
        aggregator: &Aggregator,
    ) -> Result<SyncDecision> {
        if covers(set, registered) {
            full_sync(set, active, ref_point, aggregator)
        } else {
            // a violation is in and nothing is pending: widen to a full sync
            Ok(SyncDecision {
                nodes: registered.iter().cloned().collect(),
                params: None,
                flags: ModelFlags::default(),
            })
        }
    }

    pub(crate) fn evaluate_local(
        &self,
        current: &Parameters,
        reference: Option<&Parameters>,
    ) -> Result<LocalCheck> {
        local_divergence_check(self.delta, current, reference)
    }
}

/// Incremental balancing with a full-synchronization hedge
#[derive(Debug)]
pub struct DynamicHedgeSync {
    delta: f64,
    rng: StdRng,
}

impl DynamicHedgeSync {
    /// Create with the maximum divergence threshold
    pub fn new(delta: f64) -> Self {
        DynamicHedgeSync {
            delta,
            rng: StdRng::from_entropy(),
        }
    }

    /// Create with a deterministic augmentation sampler
    pub fn with_seed(delta: f64, seed: u64) -> Self {
        DynamicHedgeSync {
            delta,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Divergence threshold
    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub(crate) fn evaluate(
        &mut self,
        set: &mut BalancingSet,
        active: &IndexSet<NodeId>,
        registered: &IndexSet<NodeId>,
        ref_point: &mut Option<Parameters>,
        aggregator: &Aggregator,
    ) -> Result<SyncDecision> {
        let Some(values) = resolve_members(set, active, ref_point)? else {
            return Ok(SyncDecision::wait());
        };

        if covers(set, registered) {
            // a full sync was triggered and every model is in
            return full_sync(set, active, ref_point, aggregator);
        }

        // local balancing attempt
        let provisional = aggregator.aggregate(&values)?;
        let divergence = match ref_point {
            Some(reference) => provisional.distance(reference)?,
            // no reference yet: force the violation through
            None => self.delta + 1.0,
        };
        if divergence <= self.delta {
            let recipients: Vec<NodeId> = set
                .keys()
                .filter(|id| active.contains(*id))
                .cloned()
                .collect();
            debug!(
                members = set.len(),
                divergence, "local balancing settled the violation"
            );
            return Ok(SyncDecision {
                nodes: recipients,
                params: Some(provisional),
                flags: ModelFlags::default(),
            });
        }

        let request = self.augment(set, registered);
        if 2 * (request.len() + set.len()) >= registered.len() {
            // the set would grow past half of all learners: hedge into a
            // full synchronization instead of endless local balancing
            debug!(members = set.len(), requested = request.len(), "hedging into a full sync");
            return Ok(SyncDecision {
                nodes: registered.iter().cloned().collect(),
                params: None,
                flags: ModelFlags::default(),
            });
        }
        Ok(SyncDecision {
            nodes: request,
            params: None,
            flags: ModelFlags::default(),
        })
    }

    /// Sample twice the current set size from the registered nodes not yet
    /// involved; all of the remainder when fewer are left
    fn augment(&mut self, set: &BalancingSet, registered: &IndexSet<NodeId>) -> Vec<NodeId> {
        let candidates: Vec<NodeId> = registered
            .iter()
            .filter(|id| !set.contains_key(*id))
            .cloned()
            .collect();
        let required = 2 * set.len();
        if candidates.len() <= required {
            candidates
        } else {
            candidates
                .choose_multiple(&mut self.rng, required)
                .cloned()
                .collect()
        }
    }

    pub(crate) fn evaluate_local(
        &self,
        current: &Parameters,
        reference: Option<&Parameters>,
    ) -> Result<LocalCheck> {
        local_divergence_check(self.delta, current, reference)
    }
}

fn full_sync(
    set: &mut BalancingSet,
    active: &IndexSet<NodeId>,
    ref_point: &mut Option<Parameters>,
    aggregator: &Aggregator,
) -> Result<SyncDecision> {
    let Some(values) = resolve_members(set, active, ref_point)? else {
        return Ok(SyncDecision::wait());
    };
    let model = aggregator.aggregate(&values)?;
    *ref_point = Some(model.clone());
    Ok(SyncDecision {
        nodes: active.iter().cloned().collect(),
        params: Some(model),
        flags: ModelFlags::reference_update(),
    })
}

fn local_divergence_check(
    delta: f64,
    current: &Parameters,
    reference: Option<&Parameters>,
) -> Result<LocalCheck> {
    match reference {
        Some(reference) => {
            let divergence = current.distance(reference)?;
            Ok(LocalCheck {
                divergence: Some(divergence),
                holds: divergence <= delta,
            })
        }
        // no reference snapshot yet counts as a violation
        None => Ok(LocalCheck {
            divergence: None,
            holds: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> IndexSet<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn entry(set: &mut BalancingSet, id: &str, weight: f64) {
        set.insert(NodeId::from(id), Some(Parameters::dense(vec![weight])));
    }

    #[test]
    fn test_dynamic_widens_to_full_sync() {
        let sync = DynamicSync::new(0.1);
        let registered = ids(&["a", "b", "c"]);
        let active = registered.clone();
        let mut set = BalancingSet::new();
        entry(&mut set, "a", 1.0);
        let mut ref_point = Some(Parameters::dense(vec![0.0]));

        let decision = sync
            .evaluate(&mut set, &active, &registered, &mut ref_point, &Aggregator::average())
            .unwrap();
        assert!(decision.params.is_none());
        assert_eq!(decision.nodes, registered.iter().cloned().collect::<Vec<_>>());
    }

    #[test]
    fn test_dynamic_full_sync_updates_reference() {
        let sync = DynamicSync::new(0.1);
        let registered = ids(&["a", "b"]);
        let active = registered.clone();
        let mut set = BalancingSet::new();
        entry(&mut set, "a", 1.0);
        entry(&mut set, "b", 3.0);
        let mut ref_point = None;

        let decision = sync
            .evaluate(&mut set, &active, &registered, &mut ref_point, &Aggregator::average())
            .unwrap();
        assert_eq!(decision.params, Some(Parameters::dense(vec![2.0])));
        assert!(decision.flags.set_reference);
        assert_eq!(ref_point, Some(Parameters::dense(vec![2.0])));
    }

    #[test]
    fn test_dynamic_substitutes_reference_for_inactive() {
        let sync = DynamicSync::new(0.1);
        let registered = ids(&["a", "b", "c"]);
        let active = ids(&["a", "b"]);
        let mut set = BalancingSet::new();
        entry(&mut set, "a", 1.0);
        entry(&mut set, "b", 2.0);
        set.insert(NodeId::from("c"), None);
        let mut ref_point = Some(Parameters::dense(vec![3.0]));

        let decision = sync
            .evaluate(&mut set, &active, &registered, &mut ref_point, &Aggregator::average())
            .unwrap();
        assert_eq!(decision.params, Some(Parameters::dense(vec![2.0])));
        assert_eq!(decision.nodes.len(), 2);
    }

    #[test]
    fn test_hedge_waits_for_pending_active_member() {
        let mut sync = DynamicHedgeSync::with_seed(0.1, 7);
        let registered = ids(&["a", "b", "c", "d"]);
        let active = registered.clone();
        let mut set = BalancingSet::new();
        entry(&mut set, "a", 1.0);
        set.insert(NodeId::from("b"), None);
        let mut ref_point = Some(Parameters::dense(vec![0.0]));

        let decision = sync
            .evaluate(&mut set, &active, &registered, &mut ref_point, &Aggregator::average())
            .unwrap();
        assert!(decision.params.is_none());
        assert!(decision.nodes.is_empty());
    }

    #[test]
    fn test_hedge_balances_locally_within_delta() {
        let mut sync = DynamicHedgeSync::with_seed(0.2, 7);
        let registered = ids(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let active = registered.clone();
        let mut set = BalancingSet::new();
        entry(&mut set, "a", 0.3);
        entry(&mut set, "b", 0.0);
        entry(&mut set, "c", 0.0);
        let mut ref_point = Some(Parameters::dense(vec![0.0]));

        let decision = sync
            .evaluate(&mut set, &active, &registered, &mut ref_point, &Aggregator::average())
            .unwrap();
        let model = decision.params.expect("local balancing aggregates");
        assert!(model.distance(&Parameters::dense(vec![0.1])).unwrap() < 1e-12);
        assert_eq!(decision.nodes.len(), 3);
        assert!(!decision.flags.set_reference);
        // local balancing must not move the reference
        assert_eq!(ref_point, Some(Parameters::dense(vec![0.0])));
    }

    #[test]
    fn test_hedge_augments_with_twice_the_set() {
        let mut sync = DynamicHedgeSync::with_seed(0.1, 7);
        let registered = ids(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l"]);
        let active = registered.clone();
        let mut set = BalancingSet::new();
        entry(&mut set, "a", 1.0);
        let mut ref_point = Some(Parameters::dense(vec![0.0]));

        let decision = sync
            .evaluate(&mut set, &active, &registered, &mut ref_point, &Aggregator::average())
            .unwrap();
        assert!(decision.params.is_none());
        assert_eq!(decision.nodes.len(), 2);
        for node in &decision.nodes {
            assert!(registered.contains(node));
            assert!(!set.contains_key(node));
        }
    }

    #[test]
    fn test_hedge_triggers_full_sync_at_half() {
        let mut sync = DynamicHedgeSync::with_seed(0.1, 7);
        let registered = ids(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let active = registered.clone();
        let mut set = BalancingSet::new();
        entry(&mut set, "a", 1.0);
        entry(&mut set, "b", 1.0);
        entry(&mut set, "c", 1.0);
        let mut ref_point = Some(Parameters::dense(vec![0.0]));

        // set of 3 would request 6 more: the projected 9 of 8 hedges
        let decision = sync
            .evaluate(&mut set, &active, &registered, &mut ref_point, &Aggregator::average())
            .unwrap();
        assert!(decision.params.is_none());
        assert_eq!(decision.nodes.len(), registered.len());
    }

    #[test]
    fn test_hedge_without_reference_forces_full_sync() {
        let mut sync = DynamicHedgeSync::with_seed(0.5, 7);
        let registered = ids(&["a", "b"]);
        let active = registered.clone();
        let mut set = BalancingSet::new();
        entry(&mut set, "a", 0.0);
        let mut ref_point = None;

        let decision = sync
            .evaluate(&mut set, &active, &registered, &mut ref_point, &Aggregator::average())
            .unwrap();
        // distance counts as delta + 1, and the only candidate pushes the
        // projected set over half of the two registered nodes
        assert!(decision.params.is_none());
        assert_eq!(decision.nodes.len(), registered.len());
    }

    #[test]
    fn test_local_check_against_reference() {
        let sync = DynamicSync::new(0.1);
        let current = Parameters::dense(vec![0.05]);
        let reference = Parameters::dense(vec![0.0]);
        let check = sync.evaluate_local(&current, Some(&reference)).unwrap();
        assert!(check.holds);
        assert!(check.divergence.unwrap() > 0.0);

        let drifted = Parameters::dense(vec![0.3]);
        let check = sync.evaluate_local(&drifted, Some(&reference)).unwrap();
        assert!(!check.holds);
    }
}
