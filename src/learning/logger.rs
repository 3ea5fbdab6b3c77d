//! Learning event sink
//!
//! One directory per node id, tab-separated records with wall-clock second
//! timestamps, plus binary model snapshots named by event tag. Log writes
//! never fail the learning process: an unwritable record is traced and
//! dropped.

use crate::error::Result;
use crate::params::Parameters;
use crate::transport::Direction;
use crate::types::{ModelFlags, NodeId};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

const LOSS_FILE: &str = "losses.txt";
const PREDICTIONS_FILE: &str = "predictions.txt";
const VIOLATIONS_FILE: &str = "violations.txt";
const BALANCING_FILE: &str = "balancing.txt";
const REGISTRATIONS_FILE: &str = "registrations.txt";
const BALANCING_REQUESTS_FILE: &str = "balancing_requests.txt";
const SEND_MODEL_FILE: &str = "send_model.txt";

/// File sink for learning events of one process
pub struct LearningLogger {
    dir: Option<PathBuf>,
}

impl LearningLogger {
    /// Create a logger writing under `<path>/<id>/`
    pub fn new(path: impl Into<PathBuf>, id: &str) -> Result<Self> {
        let dir = path.into().join(id);
        fs::create_dir_all(&dir)?;
        Ok(LearningLogger { dir: Some(dir) })
    }

    /// A logger that drops every event
    pub fn disabled() -> Self {
        LearningLogger { dir: None }
    }

    fn timestamp() -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn append(&self, file: &str, line: &str) {
        let Some(dir) = &self.dir else { return };
        let path = dir.join(file);
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = written {
            warn!(file = %path.display(), error = %e, "dropping learning log record");
        }
    }

    /// Record the loss of one training step
    pub fn log_loss(&self, loss: f64) {
        self.append(LOSS_FILE, &format!("{:.3}\t{loss:.8}", Self::timestamp()));
    }

    /// Record predictions next to their labels, one pair per line
    pub fn log_predictions(&self, predictions: &[f64], labels: &[f64]) {
        let ts = Self::timestamp();
        for (prediction, label) in predictions.iter().zip(labels) {
            self.append(
                PREDICTIONS_FILE,
                &format!("{ts:.3}\t{prediction}\t{label}"),
            );
        }
    }

    /// Record the outcome of a local condition check
    pub fn log_local_check(&self, divergence: Option<f64>, delta: Option<f64>, holds: bool) {
        let violated = u8::from(!holds);
        let line = match (divergence, delta) {
            (Some(divergence), Some(delta)) => {
                format!("{:.3}\t{violated}\t{divergence}\t{delta}", Self::timestamp())
            }
            _ => format!("{:.3}\t{violated}", Self::timestamp()),
        };
        self.append(VIOLATIONS_FILE, &line);
    }

    /// Record a completed balancing decision on the coordinator
    pub fn log_balancing_decision(
        &self,
        flags: ModelFlags,
        violation_nodes: &[NodeId],
        balancing_set: &[NodeId],
    ) {
        self.append(
            BALANCING_FILE,
            &format!(
                "{:.3}\t{}\t{}\t{}",
                Self::timestamp(),
                u8::from(flags.set_reference),
                join_ids(violation_nodes),
                join_ids(balancing_set),
            ),
        );
    }

    /// Snapshot a model under an event tag
    pub fn log_model_snapshot(&self, tag: &str, params: &Parameters) -> Result<()> {
        let Some(dir) = &self.dir else { return Ok(()) };
        let bytes = bincode::serialize(params)?;
        fs::write(dir.join(tag), bytes)?;
        Ok(())
    }

    /// Snapshot an aggregated model after a round
    pub fn log_aggregated_model(
        &self,
        nodes: &[NodeId],
        params: &Parameters,
        flags: ModelFlags,
    ) -> Result<()> {
        if flags.nosync {
            match nodes.first() {
                Some(node) => {
                    self.log_model_snapshot(&format!("currentAveragedState_node_{node}"), params)
                }
                None => Ok(()),
            }
        } else {
            self.log_model_snapshot("currentAveragedState", params)
        }
    }

    fn log_message(
        &self,
        file: &str,
        exchange: &str,
        topic: &str,
        id: Option<&NodeId>,
        size: usize,
        direction: Direction,
    ) {
        let line = match id {
            Some(id) => format!(
                "{:.3}\t{exchange}\t{topic}\t{id}\t{size}\t{direction}",
                Self::timestamp()
            ),
            None => format!(
                "{:.3}\t{exchange}\t{topic}\t{size}\t{direction}",
                Self::timestamp()
            ),
        };
        self.append(file, &line);
    }

    /// Record a violation message passing through the transport
    pub fn log_violation_message(
        &self,
        exchange: &str,
        topic: &str,
        id: &NodeId,
        size: usize,
        direction: Direction,
    ) {
        self.log_message(VIOLATIONS_FILE, exchange, topic, Some(id), size, direction);
    }

    /// Record a registration message
    pub fn log_registration_message(
        &self,
        exchange: &str,
        topic: &str,
        id: &NodeId,
        size: usize,
        direction: Direction,
    ) {
        self.log_message(REGISTRATIONS_FILE, exchange, topic, Some(id), size, direction);
    }

    /// Record a deregistration message
    pub fn log_deregistration_message(
        &self,
        exchange: &str,
        topic: &str,
        id: &NodeId,
        size: usize,
        direction: Direction,
    ) {
        self.log_message(REGISTRATIONS_FILE, exchange, topic, Some(id), size, direction);
    }

    /// Record a balancing reply message
    pub fn log_balancing_message(
        &self,
        exchange: &str,
        topic: &str,
        id: &NodeId,
        size: usize,
        direction: Direction,
    ) {
        self.log_message(BALANCING_FILE, exchange, topic, Some(id), size, direction);
    }

    /// Record a balancing request; the worker id is known on the receive side
    pub fn log_balancing_request_message(
        &self,
        exchange: &str,
        topic: &str,
        size: usize,
        direction: Direction,
        worker: Option<&NodeId>,
    ) {
        self.log_message(BALANCING_REQUESTS_FILE, exchange, topic, worker, size, direction);
    }

    /// Record a model distribution message
    pub fn log_send_model_message(
        &self,
        exchange: &str,
        topic: &str,
        size: usize,
        direction: Direction,
        worker: Option<&NodeId>,
    ) {
        self.log_message(SEND_MODEL_FILE, exchange, topic, worker, size, direction);
    }
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}
