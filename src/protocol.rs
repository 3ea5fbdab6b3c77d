//! Wire protocol between workers and the coordinator
//!
//! Two topic exchanges per run: workers publish to `coordinator<runId>`,
//! the coordinator publishes to `nodes<runId>`. Routing keys:
//!
//! | direction | key | payload |
//! |---|---|---|
//! | W→C | `registration` | `{id, param}` |
//! | W→C | `deregistration` | `{id, param}` |
//! | W→C | `violation` | `{id, param}` |
//! | W→C | `balancing` | `{id, param}` |
//! | C→W | `request.<id>` | empty |
//! | C→W | `exit.<id>` | empty |
//! | C→W | `newModel.<id>[.<id>…]` | `{param, flags}` |
//!
//! Bodies are bincode-encoded tagged records; `Parameters` round-trips
//! byte-exactly. An inbound delivery that fails to decode is a protocol
//! violation, fatal in the receiving process.

use crate::error::{Result, SyncError};
use crate::params::Parameters;
use crate::transport::Delivery;
use crate::types::{ModelFlags, NodeId};
use serde::{Deserialize, Serialize};

/// Routing key of worker registrations
pub const KEY_REGISTRATION: &str = "registration";
/// Routing key of worker deregistrations
pub const KEY_DEREGISTRATION: &str = "deregistration";
/// Routing key of local-condition violations
pub const KEY_VIOLATION: &str = "violation";
/// Routing key of balancing replies
pub const KEY_BALANCING: &str = "balancing";
/// First segment of parameter requests
pub const KEY_REQUEST: &str = "request";
/// First segment of exit requests
pub const KEY_EXIT: &str = "exit";
/// First segment of model distributions
pub const KEY_NEW_MODEL: &str = "newModel";

/// Exchange the workers publish to
pub fn coordinator_exchange(run_id: &str) -> String {
    format!("coordinator{run_id}")
}

/// Exchange the coordinator publishes to
pub fn nodes_exchange(run_id: &str) -> String {
    format!("nodes{run_id}")
}

/// `request.<id>` routing key
pub fn request_key(id: &NodeId) -> String {
    format!("{KEY_REQUEST}.{id}")
}

/// `exit.<id>` routing key
pub fn exit_key(id: &NodeId) -> String {
    format!("{KEY_EXIT}.{id}")
}

/// `newModel.<id>[.<id>…]` routing key listing every recipient
pub fn new_model_key(ids: &[NodeId]) -> String {
    let mut key = String::from(KEY_NEW_MODEL);
    for id in ids {
        key.push('.');
        key.push_str(id.as_str());
    }
    key
}

/// Binding patterns of a worker: every key carrying its id as a segment
pub fn worker_bindings(id: &NodeId) -> Vec<String> {
    vec![format!("#.{id}.#"), format!("#.{id}")]
}

/// Binding patterns of the coordinator
pub fn coordinator_bindings() -> Vec<String> {
    vec![
        KEY_REGISTRATION.to_string(),
        KEY_DEREGISTRATION.to_string(),
        KEY_VIOLATION.to_string(),
        KEY_BALANCING.to_string(),
    ]
}

/// Tagged payload record carried in message bodies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A worker-originated record: `{id, param}`
    Node {
        /// Originating worker
        id: NodeId,
        /// Its current parameters
        param: Parameters,
    },
    /// A coordinator-originated model: `{param, flags}`
    Model {
        /// The distributed parameters
        param: Parameters,
        /// Distribution flags
        flags: ModelFlags,
    },
}

/// Encode a payload for publishing
pub fn encode(payload: &Payload) -> Result<Vec<u8>> {
    Ok(bincode::serialize(payload)?)
}

/// Decode an inbound payload body
pub fn decode(body: &[u8]) -> Result<Payload> {
    bincode::deserialize(body)
        .map_err(|e| SyncError::Protocol(format!("payload failed to decode: {e}")))
}

/// Control messages a worker receives from the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// A new (initial or aggregated) model
    NewModel {
        /// The distributed parameters
        param: Parameters,
        /// Distribution flags
        flags: ModelFlags,
    },
    /// The coordinator asks for this worker's parameters
    ParameterRequest,
    /// The coordinator asks this worker to shut down
    Exit,
}

/// Parse a delivery on the nodes exchange into a worker control message
pub fn parse_control(delivery: &Delivery) -> Result<ControlMessage> {
    let head = delivery
        .routing_key
        .split('.')
        .next()
        .unwrap_or(delivery.routing_key.as_str());
    match head {
        KEY_NEW_MODEL => match decode(&delivery.body)? {
            Payload::Model { param, flags } => Ok(ControlMessage::NewModel { param, flags }),
            Payload::Node { .. } => Err(SyncError::Protocol(format!(
                "newModel delivery carried a node record (key {})",
                delivery.routing_key
            ))),
        },
        KEY_REQUEST => Ok(ControlMessage::ParameterRequest),
        KEY_EXIT => Ok(ControlMessage::Exit),
        other => Err(SyncError::Protocol(format!(
            "unexpected routing key for a worker: {other}"
        ))),
    }
}

/// Events the coordinator receives from workers
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// A node joins the run
    Registration(NodeId, Parameters),
    /// A node leaves the run
    Deregistration(NodeId, Parameters),
    /// A node reports that its local condition no longer holds
    Violation(NodeId, Parameters),
    /// A node answers a parameter request
    Balancing(NodeId, Parameters),
}

/// Parse a delivery on the coordinator exchange into a coordinator event
pub fn parse_event(delivery: &Delivery) -> Result<CoordinatorEvent> {
    let (id, param) = match decode(&delivery.body)? {
        Payload::Node { id, param } => (id, param),
        Payload::Model { .. } => {
            return Err(SyncError::Protocol(format!(
                "coordinator delivery carried a model record (key {})",
                delivery.routing_key
            )))
        }
    };
    match delivery.routing_key.as_str() {
        KEY_REGISTRATION => Ok(CoordinatorEvent::Registration(id, param)),
        KEY_DEREGISTRATION => Ok(CoordinatorEvent::Deregistration(id, param)),
        KEY_VIOLATION => Ok(CoordinatorEvent::Violation(id, param)),
        KEY_BALANCING => Ok(CoordinatorEvent::Balancing(id, param)),
        other => Err(SyncError::Protocol(format!(
            "unexpected routing key for the coordinator: {other}"
        ))),
    }
}
