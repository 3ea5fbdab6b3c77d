//! Central coordinator
//!
//! Tracks the registered and active nodes and drives balancing rounds. One
//! single-threaded event loop over the transport queue; every handler runs
//! to completion before the next message is considered, so no state is ever
//! shared.
//!
//! A round starts with the first queued violation and ends when the
//! synchronizer produces an aggregate (published as `newModel`) or when the
//! round is absorbed into another. Balancing replies are folded into the
//! violation queue: a node answers a given parameter request at most once,
//! so a reply is simply the completion of an earlier `request`.

use crate::aggregation::Aggregator;
use crate::error::Result;
use crate::init::InitHandler;
use crate::learning::LearningLogger;
use crate::params::Parameters;
use crate::protocol::{self, CoordinatorEvent};
use crate::sync::{BalancingSet, Synchronizer};
use crate::transport::{queue_closed, Delivery, Direction, Transport};
use crate::types::{ModelFlags, NodeId};
use indexmap::{IndexMap, IndexSet};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// Coordinator policies
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorConfig {
    /// Hold back initial models until this many nodes have registered
    pub nodes_to_wait: Option<usize>,
    /// Ask every remaining node to exit once fewer than this many are active
    pub min_active: usize,
}

/// The central coordinator process
pub struct Coordinator {
    transport: Transport,
    synchronizer: Synchronizer,
    aggregator: Aggregator,
    init_handler: InitHandler,
    logger: Arc<LearningLogger>,

    registered: IndexSet<NodeId>,
    active: IndexSet<NodeId>,
    violations: VecDeque<(NodeId, Parameters)>,
    balancing_set: BalancingSet,
    nodes_in_violation: Vec<NodeId>,
    ref_point: Option<Parameters>,
    waiting_nodes: IndexMap<NodeId, Parameters>,
    nodes_to_wait: Option<usize>,
    min_active: usize,
}

enum Flow {
    Continue,
    Shutdown,
}

impl Coordinator {
    /// Wire up a coordinator
    pub fn new(
        config: CoordinatorConfig,
        transport: Transport,
        synchronizer: Synchronizer,
        aggregator: Aggregator,
        init_handler: InitHandler,
        logger: Arc<LearningLogger>,
    ) -> Self {
        Coordinator {
            transport,
            synchronizer,
            aggregator,
            init_handler,
            logger,
            registered: IndexSet::new(),
            active: IndexSet::new(),
            violations: VecDeque::new(),
            balancing_set: BalancingSet::new(),
            nodes_in_violation: Vec::new(),
            ref_point: None,
            waiting_nodes: IndexMap::new(),
            nodes_to_wait: config.nodes_to_wait,
            min_active: config.min_active,
        }
    }

    /// Run until the last node deregisters
    pub async fn run(mut self) -> Result<()> {
        let mut inbox = self.transport.subscribe_coordinator().await?;
        info!("coordinator ready");
        loop {
            let delivery = inbox.recv().await.ok_or_else(queue_closed)?;
            match self.on_delivery(delivery).await? {
                Flow::Shutdown => {
                    info!("training finished, coordinator exiting");
                    return Ok(());
                }
                Flow::Continue => {}
            }
            self.advance_round().await?;
        }
    }

    async fn on_delivery(&mut self, delivery: Delivery) -> Result<Flow> {
        let size = delivery.body.len();
        let exchange = delivery.exchange.clone();
        let key = delivery.routing_key.clone();
        match protocol::parse_event(&delivery)? {
            CoordinatorEvent::Registration(id, param) => {
                info!(node_id = %id, "node registered");
                self.logger
                    .log_registration_message(&exchange, &key, &id, size, Direction::Receive);
                self.on_registration(id, param).await?;
                Ok(Flow::Continue)
            }
            CoordinatorEvent::Deregistration(id, param) => {
                info!(node_id = %id, "node deregistered");
                self.logger
                    .log_deregistration_message(&exchange, &key, &id, size, Direction::Receive);
                self.on_deregistration(id, param).await
            }
            CoordinatorEvent::Violation(id, param) => {
                debug!(node_id = %id, "violation received");
                self.logger
                    .log_violation_message(&exchange, &key, &id, size, Direction::Receive);
                self.violations.push_back((id, param));
                Ok(Flow::Continue)
            }
            CoordinatorEvent::Balancing(id, param) => {
                debug!(node_id = %id, "balancing model received");
                self.logger
                    .log_balancing_message(&exchange, &key, &id, size, Direction::Receive);
                // folded into the violation queue: the reply completes an
                // earlier request and re-enters the same round logic
                self.violations.push_back((id, param));
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_registration(&mut self, id: NodeId, param: Parameters) -> Result<()> {
        self.logger
            .log_model_snapshot(&format!("initialization_node{id}"), &param)?;
        let (handed, ref_seed) = self.init_handler.apply(&param)?;
        self.logger
            .log_model_snapshot(&format!("startState_node{id}"), &handed)?;

        self.registered.insert(id.clone());
        self.active.insert(id.clone());
        if self.ref_point.is_none() {
            self.ref_point = Some(ref_seed);
        }

        match self.nodes_to_wait {
            None => {
                self.transport
                    .send_model(&[id], &handed, ModelFlags::reference_update())
                    .await?;
            }
            Some(expected) => {
                self.waiting_nodes.insert(id, handed);
                // initial models go out only once every expected node is here
                if self.waiting_nodes.len() >= expected {
                    let staged: Vec<(NodeId, Parameters)> = self.waiting_nodes.drain(..).collect();
                    for (node, params) in staged {
                        self.transport
                            .send_model(&[node], &params, ModelFlags::reference_update())
                            .await?;
                    }
                    self.nodes_to_wait = None;
                }
            }
        }
        Ok(())
    }

    async fn on_deregistration(&mut self, id: NodeId, param: Parameters) -> Result<Flow> {
        self.logger
            .log_model_snapshot(&format!("finalState_node{id}"), &param)?;
        self.active.shift_remove(&id);
        // a concrete contribution of the leaving node is dropped from the
        // round; a still-pending entry stays and resolves to the reference
        if matches!(self.balancing_set.get(&id), Some(Some(_))) {
            self.balancing_set.shift_remove(&id);
        }

        if self.min_active > 0 && self.active.len() < self.min_active {
            info!(
                active = self.active.len(),
                min_active = self.min_active,
                "not enough active workers left, asking the rest to exit"
            );
            for node in self.active.clone() {
                self.transport.send_exit(&node).await?;
            }
            // the exit broadcast happens once
            self.min_active = 0;
        }

        if self.active.is_empty() {
            return Ok(Flow::Shutdown);
        }
        Ok(Flow::Continue)
    }

    /// Drive the balancing round as far as the available models allow
    async fn advance_round(&mut self) -> Result<()> {
        loop {
            if let Some((id, param)) = self.violations.pop_front() {
                self.nodes_in_violation.push(id.clone());
                self.balancing_set.insert(id, Some(param));
            }
            if self.balancing_set.is_empty() {
                return Ok(());
            }

            let decision = self.synchronizer.evaluate(
                &mut self.balancing_set,
                &self.active,
                &self.registered,
                &mut self.ref_point,
                &self.aggregator,
            )?;
            for node in &decision.nodes {
                if !self.balancing_set.contains_key(node) {
                    self.balancing_set.insert(node.clone(), None);
                }
            }

            match decision.params {
                None => {
                    let pending: Vec<NodeId> = decision
                        .nodes
                        .iter()
                        .filter(|node| {
                            matches!(self.balancing_set.get(*node), Some(None))
                                && self.active.contains(*node)
                        })
                        .cloned()
                        .collect();
                    if !pending.is_empty() {
                        for node in &pending {
                            self.transport.send_request(node).await?;
                        }
                        // wait for the replies
                        return Ok(());
                    }
                    if self.violations.is_empty() {
                        // wait for further violations or replies
                        return Ok(());
                    }
                }
                Some(aggregated) => {
                    // nodes that went inactive since the round started get nothing
                    let recipients: Vec<NodeId> = decision
                        .nodes
                        .iter()
                        .filter(|node| self.active.contains(*node))
                        .cloned()
                        .collect();
                    self.transport
                        .send_model(&recipients, &aggregated, decision.flags)
                        .await?;
                    let members: Vec<NodeId> = self.balancing_set.keys().cloned().collect();
                    self.logger.log_balancing_decision(
                        decision.flags,
                        &self.nodes_in_violation,
                        &members,
                    );
                    self.logger
                        .log_aggregated_model(&recipients, &aggregated, decision.flags)?;
                    info!(
                        recipients = recipients.len(),
                        full_sync = decision.flags.set_reference,
                        "aggregation round completed"
                    );
                    self.balancing_set.clear();
                    self.nodes_in_violation.clear();
                    if self.violations.is_empty() {
                        return Ok(());
                    }
                    // absorb the next queued violation into a fresh round
                }
            }
        }
    }
}
