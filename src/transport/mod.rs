//! Pub/sub transport
//!
//! The only connection to the message broker is held here. Two exchanges per
//! run carry the whole wire protocol; every process owns its own transport
//! and talks to nobody except through it.
//!
//! Broker best practice carried over from the reference deployment: separate
//! connections for publishing and consuming, prefetch of one, exclusive
//! auto-named queues per consumer, automatic acknowledgement on delivery.

mod memory;
mod pattern;
mod server;
mod tcp;

pub use memory::MemoryBroker;
pub use pattern::TopicPattern;
pub use server::{run_broker, BrokerServer};
pub use tcp::TcpBroker;

use crate::error::{Result, SyncError};
use crate::learning::LearningLogger;
use crate::params::Parameters;
use crate::protocol::{self, Payload};
use crate::types::{ModelFlags, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One message as delivered to a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Routing key the message was published under
    pub routing_key: String,
    /// Exchange the message passed through
    pub exchange: String,
    /// Payload body
    pub body: Vec<u8>,
}

/// A topic-exchange broker
///
/// `subscribe` binds an exclusive queue to an exchange with a set of
/// patterns; a routing key matching several patterns of the same
/// subscription is delivered once. Delivery is FIFO per publisher.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message to an exchange
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()>;

    /// Bind a new exclusive queue and stream its deliveries
    async fn subscribe(
        &self,
        exchange: &str,
        patterns: &[String],
    ) -> Result<mpsc::UnboundedReceiver<Delivery>>;
}

/// Typed message-passing facade over a broker
///
/// Owns the two per-run exchange names and encodes/logs every message kind
/// of the wire protocol.
#[derive(Clone)]
pub struct Transport {
    broker: Arc<dyn Broker>,
    exchange_coordinator: String,
    exchange_nodes: String,
    logger: Arc<LearningLogger>,
}

impl Transport {
    /// Create a transport for the given run on the given broker
    pub fn new(broker: Arc<dyn Broker>, run_id: &str, logger: Arc<LearningLogger>) -> Self {
        Transport {
            broker,
            exchange_coordinator: protocol::coordinator_exchange(run_id),
            exchange_nodes: protocol::nodes_exchange(run_id),
            logger,
        }
    }

    /// Exchange the workers publish to
    pub fn coordinator_exchange(&self) -> &str {
        &self.exchange_coordinator
    }

    /// Exchange the coordinator publishes to
    pub fn nodes_exchange(&self) -> &str {
        &self.exchange_nodes
    }

    /// Bind the coordinator's queue: the four worker-originated keys
    pub async fn subscribe_coordinator(&self) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        self.broker
            .subscribe(&self.exchange_coordinator, &protocol::coordinator_bindings())
            .await
    }

    /// Bind a worker's queue: every key carrying its id as a segment
    pub async fn subscribe_worker(&self, id: &NodeId) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        self.broker
            .subscribe(&self.exchange_nodes, &protocol::worker_bindings(id))
            .await
    }

    async fn publish_node_record(
        &self,
        routing_key: &str,
        id: &NodeId,
        param: &Parameters,
    ) -> Result<usize> {
        let body = protocol::encode(&Payload::Node {
            id: id.clone(),
            param: param.clone(),
        })?;
        let size = body.len();
        self.broker
            .publish(&self.exchange_coordinator, routing_key, body)
            .await?;
        Ok(size)
    }

    /// Register a node with the coordinator
    pub async fn send_registration(&self, id: &NodeId, param: &Parameters) -> Result<()> {
        let size = self
            .publish_node_record(protocol::KEY_REGISTRATION, id, param)
            .await?;
        self.logger.log_registration_message(
            &self.exchange_coordinator,
            protocol::KEY_REGISTRATION,
            id,
            size,
            Direction::Send,
        );
        Ok(())
    }

    /// Deregister a node that met its stopping criterion
    pub async fn send_deregistration(&self, id: &NodeId, param: &Parameters) -> Result<()> {
        let size = self
            .publish_node_record(protocol::KEY_DEREGISTRATION, id, param)
            .await?;
        self.logger.log_deregistration_message(
            &self.exchange_coordinator,
            protocol::KEY_DEREGISTRATION,
            id,
            size,
            Direction::Send,
        );
        Ok(())
    }

    /// Report a local-condition violation
    pub async fn send_violation(&self, id: &NodeId, param: &Parameters) -> Result<()> {
        let size = self
            .publish_node_record(protocol::KEY_VIOLATION, id, param)
            .await?;
        info!(node_id = %id, "sent violation to coordinator");
        self.logger.log_violation_message(
            &self.exchange_coordinator,
            protocol::KEY_VIOLATION,
            id,
            size,
            Direction::Send,
        );
        Ok(())
    }

    /// Answer a balancing request with the node's current parameters
    pub async fn send_balancing(&self, id: &NodeId, param: &Parameters) -> Result<()> {
        let size = self
            .publish_node_record(protocol::KEY_BALANCING, id, param)
            .await?;
        self.logger.log_balancing_message(
            &self.exchange_coordinator,
            protocol::KEY_BALANCING,
            id,
            size,
            Direction::Send,
        );
        Ok(())
    }

    /// Ask a worker for its parameters
    pub async fn send_request(&self, id: &NodeId) -> Result<()> {
        let topic = protocol::request_key(id);
        self.broker
            .publish(&self.exchange_nodes, &topic, Vec::new())
            .await?;
        debug!(node_id = %id, "requested parameters for balancing");
        self.logger
            .log_balancing_request_message(&self.exchange_nodes, &topic, 0, Direction::Send, None);
        Ok(())
    }

    /// Ask a worker to shut down
    pub async fn send_exit(&self, id: &NodeId) -> Result<()> {
        let topic = protocol::exit_key(id);
        self.broker
            .publish(&self.exchange_nodes, &topic, Vec::new())
            .await?;
        info!(node_id = %id, "asked node to exit");
        Ok(())
    }

    /// Distribute a model to a set of workers
    pub async fn send_model(
        &self,
        ids: &[NodeId],
        param: &Parameters,
        flags: ModelFlags,
    ) -> Result<()> {
        let topic = protocol::new_model_key(ids);
        let body = protocol::encode(&Payload::Model {
            param: param.clone(),
            flags,
        })?;
        let size = body.len();
        self.broker
            .publish(&self.exchange_nodes, &topic, body)
            .await?;
        self.logger
            .log_send_model_message(&self.exchange_nodes, &topic, size, Direction::Send, None);
        Ok(())
    }
}

/// Whether a logged message was sent or received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Outbound message
    Send,
    /// Inbound message
    Receive,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// Fail fast when the inbound queue of a process closes underneath it
pub(crate) fn queue_closed() -> SyncError {
    SyncError::Transport("inbound delivery queue closed".to_string())
}
