//! Learning worker
//!
//! One single-threaded event loop over two inbound channels: the control
//! queue fed by the transport and the data pipe fed by the data task.
//! Control messages are handled first, arriving examples are buffered, and
//! the buffer head is forwarded to the learner whenever the training gate is
//! open.
//!
//! The gate is what makes the protocol converge: while the worker waits for
//! a model it neither trains nor answers another parameter request, so every
//! violation or balancing reply is matched by exactly one `newModel`.

use crate::data::{spawn_feed, DataSource, FeedPacing};
use crate::error::{Result, SyncError};
use crate::learning::{Learner, LearningLogger};
use crate::params::Parameters;
use crate::protocol::{self, ControlMessage};
use crate::stopping::StoppingCriterion;
use crate::sync::Synchronizer;
use crate::transport::{queue_closed, Delivery, Direction, Transport};
use crate::types::{Example, NodeId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// How a worker trains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingMode {
    /// Train on every full mini-batch as data streams in
    Incremental,
    /// Accumulate everything and train once when the stopping criterion fires
    Batch,
}

/// Static settings of one worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Node identifier, unique for the lifetime of the run
    pub id: NodeId,
    /// Examples per training step
    pub batch_size: usize,
    /// Training steps between local condition checks
    pub sync_period: usize,
    /// Training mode
    pub mode: TrainingMode,
}

impl WorkerConfig {
    /// Validate configuration constraints
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Configuration(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.sync_period == 0 {
            return Err(SyncError::Configuration(
                "sync period must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Mutable worker state, owned by the worker loop alone
#[derive(Debug, Default)]
struct WorkerState {
    training_batch: Vec<Example>,
    data_buffer: VecDeque<Example>,
    is_training: bool,
    waiting_for_model: bool,
    is_initialized: bool,
    stop: bool,
    sync_counter: usize,
    seen_examples: u64,
    reference_params: Option<Parameters>,
}

enum Flow {
    Continue,
    Exit,
}

/// One learning worker process
pub struct Worker<L: Learner> {
    config: WorkerConfig,
    transport: Transport,
    synchronizer: Synchronizer,
    stopping: Option<StoppingCriterion>,
    logger: Arc<LearningLogger>,
    learner: L,
    state: WorkerState,
}

impl<L: Learner> Worker<L> {
    /// Wire up a worker
    pub fn new(
        config: WorkerConfig,
        transport: Transport,
        synchronizer: Synchronizer,
        stopping: Option<StoppingCriterion>,
        logger: Arc<LearningLogger>,
        learner: L,
    ) -> Result<Self> {
        config.validate()?;
        if config.mode == TrainingMode::Batch && stopping.is_none() {
            return Err(SyncError::Configuration(
                "batch training requires a stopping criterion".to_string(),
            ));
        }
        Ok(Worker {
            config,
            transport,
            synchronizer,
            stopping,
            logger,
            learner,
            state: WorkerState::default(),
        })
    }

    /// Run until the stopping criterion fires or the coordinator asks us to exit
    pub async fn run<S>(mut self, source: S, pacing: FeedPacing) -> Result<()>
    where
        S: DataSource + 'static,
    {
        // subscribe before registering, so the registration answer cannot race us
        let mut inbox = self.transport.subscribe_worker(&self.config.id).await?;
        let (mut data_rx, feed) = spawn_feed(source, pacing);

        self.transport
            .send_registration(&self.config.id, &self.learner.parameters())
            .await?;
        self.state.waiting_for_model = true;
        info!(node_id = %self.config.id, "worker registered");

        let mut data_open = true;
        let outcome = loop {
            // control messages take precedence over data
            match inbox.try_recv() {
                Ok(delivery) => {
                    match self.on_control(delivery).await? {
                        Flow::Exit => break Ok(()),
                        Flow::Continue => continue,
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => break Err(queue_closed()),
            }

            if data_open {
                match data_rx.try_recv() {
                    Ok(example) => {
                        self.state.data_buffer.push_back(example);
                        continue;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {}
                    Err(mpsc::error::TryRecvError::Disconnected) => data_open = false,
                }
            }

            if self.can_obtain_data() {
                if let Some(example) = self.state.data_buffer.pop_front() {
                    match self.obtain(example).await? {
                        Flow::Exit => break Ok(()),
                        Flow::Continue => continue,
                    }
                }
            }

            // nothing ready: suspend until either channel produces
            if data_open {
                tokio::select! {
                    delivery = inbox.recv() => match delivery {
                        Some(delivery) => {
                            if let Flow::Exit = self.on_control(delivery).await? {
                                break Ok(());
                            }
                        }
                        None => break Err(queue_closed()),
                    },
                    example = data_rx.recv() => match example {
                        Some(example) => self.state.data_buffer.push_back(example),
                        None => data_open = false,
                    },
                }
            } else {
                match inbox.recv().await {
                    Some(delivery) => {
                        if let Flow::Exit = self.on_control(delivery).await? {
                            break Ok(());
                        }
                    }
                    None => break Err(queue_closed()),
                }
            }
        };
        feed.abort();
        outcome
    }

    /// Whether the learner may receive the next example
    fn can_obtain_data(&self) -> bool {
        let gate = !self.state.is_training && !self.state.waiting_for_model;
        match self.config.mode {
            TrainingMode::Incremental => gate,
            TrainingMode::Batch => gate && self.state.is_initialized && !self.state.stop,
        }
    }

    async fn on_control(&mut self, delivery: Delivery) -> Result<Flow> {
        let size = delivery.body.len();
        let exchange = delivery.exchange.clone();
        let key = delivery.routing_key.clone();
        match protocol::parse_control(&delivery)? {
            ControlMessage::NewModel { param, flags } => {
                self.logger.log_send_model_message(
                    &exchange,
                    &key,
                    size,
                    Direction::Receive,
                    Some(&self.config.id),
                );
                debug!(node_id = %self.config.id, ?flags, "received a model");
                if flags.set_reference {
                    self.state.reference_params = Some(param.clone());
                }
                self.learner.set_parameters(param)?;
                self.state.waiting_for_model = false;
                self.state.is_initialized = true;
                if self.config.mode == TrainingMode::Batch && self.state.stop {
                    // the aggregate after the final training step arrived
                    self.deregister().await?;
                    return Ok(Flow::Exit);
                }
                Ok(Flow::Continue)
            }
            ControlMessage::ParameterRequest => {
                self.logger.log_balancing_request_message(
                    &exchange,
                    &key,
                    size,
                    Direction::Receive,
                    Some(&self.config.id),
                );
                // a violation already in flight answers the request implicitly
                if !self.state.waiting_for_model {
                    self.state.waiting_for_model = true;
                    self.transport
                        .send_balancing(&self.config.id, &self.learner.parameters())
                        .await?;
                }
                Ok(Flow::Continue)
            }
            ControlMessage::Exit => {
                info!(node_id = %self.config.id, "coordinator asked us to exit");
                self.deregister().await?;
                Ok(Flow::Exit)
            }
        }
    }

    async fn obtain(&mut self, example: Example) -> Result<Flow> {
        match self.config.mode {
            TrainingMode::Incremental => self.obtain_incremental(example).await,
            TrainingMode::Batch => self.obtain_batch(example).await,
        }
    }

    async fn obtain_incremental(&mut self, example: Example) -> Result<Flow> {
        self.state.training_batch.push(example);
        if self.state.training_batch.len() < self.config.batch_size {
            return Ok(Flow::Continue);
        }

        let batch: Vec<Example> = self
            .state
            .training_batch
            .drain(..self.config.batch_size)
            .collect();
        self.state.is_training = true;
        let step = self.learner.train(&batch)?;
        self.state.seen_examples += batch.len() as u64;
        let labels: Vec<f64> = batch.iter().map(|e| e.label).collect();
        self.logger.log_loss(step.loss);
        self.logger.log_predictions(&step.predictions, &labels);

        self.state.sync_counter += 1;
        let check = if self.state.sync_counter >= self.config.sync_period {
            self.state.sync_counter = 0;
            self.synchronizer
                .evaluate_local(&self.learner.parameters(), self.state.reference_params.as_ref())?
        } else {
            crate::sync::LocalCheck {
                divergence: None,
                holds: true,
            }
        };
        self.logger
            .log_local_check(check.divergence, self.synchronizer.delta(), check.holds);

        if self.stopping_met() {
            self.state.is_training = false;
            self.deregister().await?;
            return Ok(Flow::Exit);
        }
        if !check.holds {
            self.report_violation().await?;
        }
        self.state.is_training = false;
        Ok(Flow::Continue)
    }

    async fn obtain_batch(&mut self, example: Example) -> Result<Flow> {
        self.state.training_batch.push(example);
        self.state.seen_examples = self.state.training_batch.len() as u64;
        if !self.stopping_met() {
            return Ok(Flow::Continue);
        }

        self.state.is_training = true;
        let step = self.learner.train(&self.state.training_batch)?;
        let labels: Vec<f64> = self.state.training_batch.iter().map(|e| e.label).collect();
        self.logger.log_loss(step.loss);
        self.logger.log_predictions(&step.predictions, &labels);
        // the final model goes out once; the worker then waits for the
        // aggregate and leaves when it arrives
        self.report_violation().await?;
        self.state.stop = true;
        self.state.is_training = false;
        Ok(Flow::Continue)
    }

    fn stopping_met(&self) -> bool {
        self.stopping
            .map(|criterion| criterion.is_met(self.state.seen_examples, Instant::now()))
            .unwrap_or(false)
    }

    async fn report_violation(&mut self) -> Result<()> {
        self.transport
            .send_violation(&self.config.id, &self.learner.parameters())
            .await?;
        self.state.waiting_for_model = true;
        Ok(())
    }

    async fn deregister(&mut self) -> Result<()> {
        info!(node_id = %self.config.id, seen_examples = self.state.seen_examples, "deregistering");
        self.transport
            .send_deregistration(&self.config.id, &self.learner.parameters())
            .await?;
        Ok(())
    }
}
