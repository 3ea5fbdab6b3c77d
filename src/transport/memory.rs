//! In-process broker
//!
//! A topic exchange living inside one process, used by the simulator and the
//! scenario tests. Routing semantics are identical to the TCP broker: every
//! subscription is an exclusive queue, a message matching several patterns
//! of one subscription is delivered once, delivery order follows publish
//! order.

use super::{Broker, Delivery, TopicPattern};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

struct Binding {
    patterns: Vec<TopicPattern>,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Exchange table shared by the in-process and the TCP broker
#[derive(Default)]
pub(crate) struct RoutingTable {
    exchanges: Mutex<HashMap<String, Vec<Binding>>>,
}

impl RoutingTable {
    /// Deliver a message to every subscription with a matching pattern.
    /// Subscriptions whose queue has been dropped are pruned on the way.
    pub(crate) fn route(&self, exchange: &str, routing_key: &str, body: Vec<u8>) {
        let delivery = Delivery {
            routing_key: routing_key.to_string(),
            exchange: exchange.to_string(),
            body,
        };
        let mut exchanges = self.exchanges.lock();
        let bindings = exchanges.entry(exchange.to_string()).or_default();
        bindings.retain(|binding| {
            if binding.patterns.iter().any(|p| p.matches(routing_key)) {
                binding.tx.send(delivery.clone()).is_ok()
            } else {
                !binding.tx.is_closed()
            }
        });
        trace!(exchange, routing_key, "routed message");
    }

    /// Register an exclusive subscription on an exchange
    pub(crate) fn bind(
        &self,
        exchange: &str,
        patterns: &[String],
        tx: mpsc::UnboundedSender<Delivery>,
    ) {
        let binding = Binding {
            patterns: patterns.iter().map(|p| TopicPattern::parse(p)).collect(),
            tx,
        };
        self.exchanges
            .lock()
            .entry(exchange.to_string())
            .or_default()
            .push(binding);
    }

    #[cfg(test)]
    fn binding_count(&self, exchange: &str) -> usize {
        self.exchanges
            .lock()
            .get(exchange)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Broker implementation backed by an in-process routing table
#[derive(Clone, Default)]
pub struct MemoryBroker {
    table: Arc<RoutingTable>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        MemoryBroker::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        self.table.route(exchange, routing_key, body);
        Ok(())
    }

    async fn subscribe(
        &self,
        exchange: &str,
        patterns: &[String],
    ) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.table.bind(exchange, patterns, tx);
        Ok(rx)
    }
}
