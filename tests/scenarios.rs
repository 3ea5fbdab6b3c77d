//! End-to-end scenarios over the in-process broker
//!
//! Workers and the coordinator run as tasks; a probe subscription on the
//! nodes exchange observes every model distribution and parameter request
//! at the wire level.

use std::sync::Arc;
use std::time::Duration;
use syncmesh::data::{FeedPacing, InMemorySource};
use syncmesh::protocol::{self, Payload};
use syncmesh::transport::Delivery;
use syncmesh::{
    Aggregator, Broker, Coordinator, CoordinatorConfig, Example, InitHandler, Learner,
    LearningLogger, MemoryBroker, ModelFlags, NodeId, Parameters, Result, StoppingCriterion,
    SyncError, Synchronizer, TrainStep, TrainingMode, Transport, Worker, WorkerConfig,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Learner whose weights move by a fixed amount per training step
#[derive(Debug, Clone)]
struct DriftLearner {
    weights: Vec<f64>,
    drift: f64,
}

impl DriftLearner {
    fn new(dimension: usize, drift: f64) -> Self {
        DriftLearner {
            weights: vec![0.0; dimension],
            drift,
        }
    }
}

impl Learner for DriftLearner {
    fn set_parameters(&mut self, params: Parameters) -> Result<()> {
        let flat = params.to_vector();
        if flat.len() != self.weights.len() {
            return Err(SyncError::TypeContract("drift learner shape mismatch".into()));
        }
        self.weights = flat;
        Ok(())
    }

    fn parameters(&self) -> Parameters {
        Parameters::dense(self.weights.clone())
    }

    fn train(&mut self, batch: &[Example]) -> Result<TrainStep> {
        for w in &mut self.weights {
            *w += self.drift;
        }
        Ok(TrainStep {
            loss: 0.0,
            predictions: vec![0.0; batch.len()],
        })
    }
}

/// What the probe saw on the nodes exchange
#[derive(Debug)]
enum ProbeMsg {
    NewModel {
        ids: Vec<NodeId>,
        param: Parameters,
        flags: ModelFlags,
    },
    Request(NodeId),
    Exit(NodeId),
}

fn classify(delivery: &Delivery) -> ProbeMsg {
    let mut segments = delivery.routing_key.split('.');
    let head = segments.next().expect("routing keys are non-empty");
    match head {
        "newModel" => match protocol::decode(&delivery.body).expect("model payload decodes") {
            Payload::Model { param, flags } => ProbeMsg::NewModel {
                ids: segments.map(NodeId::from).collect(),
                param,
                flags,
            },
            Payload::Node { .. } => panic!("newModel carried a node record"),
        },
        "request" => ProbeMsg::Request(NodeId::from(segments.next().expect("request carries an id"))),
        "exit" => ProbeMsg::Exit(NodeId::from(segments.next().expect("exit carries an id"))),
        other => panic!("unexpected key on the nodes exchange: {other}"),
    }
}

async fn next_probe(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> ProbeMsg {
    let delivery = timeout(WAIT, rx.recv())
        .await
        .expect("probe timed out")
        .expect("probe channel closed");
    classify(&delivery)
}

/// Skip forward to the next aggregated model (more than one recipient, or
/// matching any recipient count when `min_ids` is 1)
async fn next_new_model(
    rx: &mut mpsc::UnboundedReceiver<Delivery>,
    min_ids: usize,
) -> (Vec<NodeId>, Parameters, ModelFlags) {
    loop {
        if let ProbeMsg::NewModel { ids, param, flags } = next_probe(rx).await {
            if ids.len() >= min_ids {
                return (ids, param, flags);
            }
        }
    }
}

async fn next_request(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> NodeId {
    loop {
        if let ProbeMsg::Request(id) = next_probe(rx).await {
            return id;
        }
    }
}

struct Run {
    broker: MemoryBroker,
    run_id: String,
}

impl Run {
    fn new(run_id: &str) -> Self {
        Run {
            broker: MemoryBroker::new(),
            run_id: run_id.to_string(),
        }
    }

    fn transport(&self) -> Transport {
        Transport::new(
            Arc::new(self.broker.clone()),
            &self.run_id,
            Arc::new(LearningLogger::disabled()),
        )
    }

    async fn probe(&self) -> mpsc::UnboundedReceiver<Delivery> {
        self.broker
            .subscribe(&protocol::nodes_exchange(&self.run_id), &["#".to_string()])
            .await
            .expect("probe subscription")
    }

    async fn spawn_coordinator(
        &self,
        config: CoordinatorConfig,
        synchronizer: Synchronizer,
    ) -> JoinHandle<Result<()>> {
        let coordinator = Coordinator::new(
            config,
            self.transport(),
            synchronizer,
            Aggregator::average(),
            InitHandler::identity(),
            Arc::new(LearningLogger::disabled()),
        );
        let handle = tokio::spawn(coordinator.run());
        // let the coordinator bind its queue before anything registers
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle
    }

    fn spawn_worker(
        &self,
        config: WorkerConfig,
        synchronizer: Synchronizer,
        stopping: StoppingCriterion,
        learner: DriftLearner,
        examples: Vec<Example>,
    ) -> JoinHandle<Result<()>> {
        let worker = Worker::new(
            config,
            self.transport(),
            synchronizer,
            Some(stopping),
            Arc::new(LearningLogger::disabled()),
            learner,
        )
        .expect("worker config is valid");
        tokio::spawn(worker.run(InMemorySource::new(examples), FeedPacing::Flatout))
    }
}

fn examples(n: usize) -> Vec<Example> {
    (0..n).map(|i| Example::new(vec![i as f64], 0.0)).collect()
}

fn dense(w: f64) -> Parameters {
    Parameters::dense(vec![w])
}

async fn join_clean(handle: JoinHandle<Result<()>>) {
    timeout(WAIT, handle)
        .await
        .expect("task timed out")
        .expect("task panicked")
        .expect("task failed");
}

/// S1: three periodic workers produce exactly one aggregation round whose
/// result is the arithmetic mean of the post-training models.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn periodic_full_sync_aggregates_once() {
    let run = Run::new("s1");
    let mut probe = run.probe().await;
    let coordinator = run
        .spawn_coordinator(
            CoordinatorConfig {
                nodes_to_wait: Some(3),
                min_active: 0,
            },
            Synchronizer::periodic(),
        )
        .await;

    let drifts = [0.1, 0.2, 0.3];
    let mut workers = Vec::new();
    for (i, drift) in drifts.iter().enumerate() {
        workers.push(run.spawn_worker(
            WorkerConfig {
                id: NodeId::new(format!("w{i}")),
                batch_size: 2,
                sync_period: 4,
                mode: TrainingMode::Incremental,
            },
            Synchronizer::periodic(),
            StoppingCriterion::max_examples(10),
            DriftLearner::new(1, *drift),
            examples(10),
        ));
    }

    // three initial models, then exactly one aggregated model
    let (ids, param, flags) = next_new_model(&mut probe, 2).await;
    assert_eq!(ids.len(), 3, "all three workers take part in the round");
    // after four steps the models sit at 0.4, 0.8 and 1.2
    assert!(param.distance(&dense(0.8)).unwrap() < 1e-9);
    assert_eq!(flags, ModelFlags::default());

    for worker in workers {
        join_clean(worker).await;
    }
    join_clean(coordinator).await;

    // no second aggregated model was distributed
    while let Ok(delivery) = probe.try_recv() {
        if let ProbeMsg::NewModel { ids, .. } = classify(&delivery) {
            assert!(ids.len() < 2, "unexpected extra aggregation round");
        }
    }
}

/// S2: a dynamic-hedge round settles locally once the provisional aggregate
/// is within delta; the reference point stays untouched.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dynamic_hedge_balances_locally() {
    let run = Run::new("s2");
    let mut probe = run.probe().await;
    let coordinator = run
        .spawn_coordinator(
            CoordinatorConfig::default(),
            Synchronizer::dynamic_hedge_seeded(0.15, 11),
        )
        .await;

    let harness = run.transport();
    let nodes: Vec<NodeId> = (0..12).map(|i| NodeId::new(format!("w{i}"))).collect();
    for node in &nodes {
        harness.send_registration(node, &dense(0.0)).await.unwrap();
    }
    // consume the twelve initial models
    for _ in 0..12 {
        let (ids, _, flags) = next_new_model(&mut probe, 1).await;
        assert_eq!(ids.len(), 1);
        assert!(flags.set_reference);
    }

    // one node drifts above delta and reports
    harness
        .send_violation(&nodes[0], &dense(0.3))
        .await
        .unwrap();

    // the round pulls in twice the current set
    let first = next_request(&mut probe).await;
    let second = next_request(&mut probe).await;
    assert_ne!(first, second);
    assert_ne!(first, nodes[0]);
    assert_ne!(second, nodes[0]);

    harness.send_balancing(&first, &dense(0.0)).await.unwrap();
    harness.send_balancing(&second, &dense(0.0)).await.unwrap();

    // aggregate of {0.3, 0, 0} is within delta: local balancing to the trio
    let (ids, param, flags) = next_new_model(&mut probe, 2).await;
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&nodes[0]) && ids.contains(&first) && ids.contains(&second));
    assert!(param.distance(&dense(0.1)).unwrap() < 1e-9);
    assert!(!flags.set_reference, "local balancing must not move the reference");

    coordinator.abort();
}

/// S3: when every model diverges, the hedge abandons local balancing and
/// widens the round into a full synchronization.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dynamic_hedge_hedges_into_full_sync() {
    let run = Run::new("s3");
    let mut probe = run.probe().await;
    let coordinator = run
        .spawn_coordinator(
            CoordinatorConfig::default(),
            Synchronizer::dynamic_hedge_seeded(0.1, 23),
        )
        .await;

    let harness = run.transport();
    let nodes: Vec<NodeId> = (0..8).map(|i| NodeId::new(format!("w{i}"))).collect();
    for node in &nodes {
        harness.send_registration(node, &dense(0.0)).await.unwrap();
    }
    for _ in 0..8 {
        next_new_model(&mut probe, 1).await;
    }

    harness
        .send_violation(&nodes[0], &dense(0.3))
        .await
        .unwrap();

    // first augmentation asks two more nodes
    let first = next_request(&mut probe).await;
    let second = next_request(&mut probe).await;
    harness.send_balancing(&first, &dense(0.3)).await.unwrap();
    harness.send_balancing(&second, &dense(0.3)).await.unwrap();

    // still diverging at three members: the projected set passes half of
    // the eight registered nodes, so the remaining five are requested
    let mut remaining = Vec::new();
    for _ in 0..5 {
        remaining.push(next_request(&mut probe).await);
    }
    remaining.sort();
    remaining.dedup();
    assert_eq!(remaining.len(), 5, "every outstanding node is requested once");
    for node in &remaining {
        harness.send_balancing(node, &dense(0.3)).await.unwrap();
    }

    let (ids, param, flags) = next_new_model(&mut probe, 2).await;
    assert_eq!(ids.len(), 8, "a full sync reaches every active node");
    assert!(param.distance(&dense(0.3)).unwrap() < 1e-9);
    assert!(flags.set_reference, "a full sync updates the reference");

    coordinator.abort();
}

/// S4: a node deregistering while its reply is outstanding is substituted
/// by the reference point and the round still completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deregistration_mid_round_substitutes_reference() {
    let run = Run::new("s4");
    let mut probe = run.probe().await;
    let coordinator = run
        .spawn_coordinator(CoordinatorConfig::default(), Synchronizer::dynamic(0.1))
        .await;

    let harness = run.transport();
    let nodes: Vec<NodeId> = (0..3).map(|i| NodeId::new(format!("w{i}"))).collect();
    // the first registration seeds the reference point at 1.0
    harness.send_registration(&nodes[0], &dense(1.0)).await.unwrap();
    harness.send_registration(&nodes[1], &dense(2.0)).await.unwrap();
    harness.send_registration(&nodes[2], &dense(5.0)).await.unwrap();
    for _ in 0..3 {
        next_new_model(&mut probe, 1).await;
    }

    harness.send_violation(&nodes[0], &dense(1.0)).await.unwrap();
    // dynamic sync widens to a full round over all three nodes
    let mut requested = vec![next_request(&mut probe).await, next_request(&mut probe).await];
    requested.sort();
    assert_eq!(requested, vec![nodes[1].clone(), nodes[2].clone()]);

    harness.send_balancing(&nodes[1], &dense(2.0)).await.unwrap();
    // the third node leaves instead of answering
    harness
        .send_deregistration(&nodes[2], &dense(5.0))
        .await
        .unwrap();

    let (ids, param, flags) = next_new_model(&mut probe, 2).await;
    let mut recipients = ids.clone();
    recipients.sort();
    assert_eq!(recipients, vec![nodes[0].clone(), nodes[1].clone()]);
    // the leaver contributes the reference point: mean(1, 2, 1)
    assert!(param.distance(&dense(4.0 / 3.0)).unwrap() < 1e-9);
    assert!(flags.set_reference);

    coordinator.abort();
}

/// S5: the no-sync baseline echoes every submitted model back to its sender
/// alone; no cross-worker parameters ever travel.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nosync_echoes_to_sender_only() {
    let run = Run::new("s5");
    let mut probe = run.probe().await;
    let coordinator = run
        .spawn_coordinator(
            CoordinatorConfig {
                nodes_to_wait: Some(4),
                min_active: 0,
            },
            Synchronizer::nosync(),
        )
        .await;

    let drifts = [0.1, 0.2, 0.3, 0.4];
    let mut workers = Vec::new();
    for (i, drift) in drifts.iter().enumerate() {
        workers.push(run.spawn_worker(
            WorkerConfig {
                id: NodeId::new(format!("w{i}")),
                batch_size: 1,
                sync_period: 1,
                mode: TrainingMode::Incremental,
            },
            Synchronizer::nosync(),
            StoppingCriterion::max_examples(3),
            DriftLearner::new(1, *drift),
            examples(3),
        ));
    }

    for worker in workers {
        join_clean(worker).await;
    }
    join_clean(coordinator).await;

    let mut echoes = 0;
    while let Ok(delivery) = probe.try_recv() {
        if let ProbeMsg::NewModel { ids, param, flags } = classify(&delivery) {
            if !flags.nosync {
                continue; // initial model
            }
            assert_eq!(ids.len(), 1, "echo goes to the sender only");
            let index: usize = ids[0].as_str()[1..].parse().unwrap();
            let drift = drifts[index];
            let steps = (param.to_vector()[0] / drift).round();
            // the echoed model is a multiple of the sender's own drift
            assert!(param.distance(&dense(drift * steps)).unwrap() < 1e-9);
            assert!(steps >= 1.0 && steps <= 2.0);
            echoes += 1;
        }
    }
    // two echoed violations per worker; the third step stops instead
    assert_eq!(echoes, 8);
}

/// S6: batch learners train once, the coordinator aggregates once all five
/// reported, and everything shuts down cleanly.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn aggregation_at_end_broadcasts_once() {
    let run = Run::new("s6");
    let mut probe = run.probe().await;
    let coordinator = run
        .spawn_coordinator(
            CoordinatorConfig {
                nodes_to_wait: Some(5),
                min_active: 0,
            },
            Synchronizer::aggregation_at_end(),
        )
        .await;

    let drifts = [0.1, 0.2, 0.3, 0.4, 0.5];
    let mut workers = Vec::new();
    for (i, drift) in drifts.iter().enumerate() {
        workers.push(run.spawn_worker(
            WorkerConfig {
                id: NodeId::new(format!("w{i}")),
                batch_size: 1,
                sync_period: 1,
                mode: TrainingMode::Batch,
            },
            Synchronizer::aggregation_at_end(),
            StoppingCriterion::max_examples(3),
            DriftLearner::new(1, *drift),
            examples(3),
        ));
    }

    let (ids, param, flags) = next_new_model(&mut probe, 2).await;
    assert_eq!(ids.len(), 5, "the final aggregate reaches every worker");
    // each learner trained exactly once: mean of the drifts
    assert!(param.distance(&dense(0.3)).unwrap() < 1e-9);
    assert_eq!(flags, ModelFlags::default());

    for worker in workers {
        join_clean(worker).await;
    }
    join_clean(coordinator).await;
}

/// The min-active policy asks every remaining node to exit once the active
/// set shrinks below the threshold.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn min_active_broadcasts_exit() {
    let run = Run::new("minactive");
    let mut probe = run.probe().await;
    let coordinator = run
        .spawn_coordinator(
            CoordinatorConfig {
                nodes_to_wait: None,
                min_active: 3,
            },
            Synchronizer::periodic(),
        )
        .await;

    let harness = run.transport();
    let nodes: Vec<NodeId> = (0..3).map(|i| NodeId::new(format!("w{i}"))).collect();
    for node in &nodes {
        harness.send_registration(node, &dense(0.0)).await.unwrap();
    }
    for _ in 0..3 {
        next_new_model(&mut probe, 1).await;
    }

    harness
        .send_deregistration(&nodes[0], &dense(0.0))
        .await
        .unwrap();

    let mut exited = Vec::new();
    for _ in 0..2 {
        loop {
            if let ProbeMsg::Exit(id) = next_probe(&mut probe).await {
                exited.push(id);
                break;
            }
        }
    }
    exited.sort();
    assert_eq!(exited, vec![nodes[1].clone(), nodes[2].clone()]);

    // the remaining nodes obey and the coordinator terminates
    harness.send_deregistration(&nodes[1], &dense(0.0)).await.unwrap();
    harness.send_deregistration(&nodes[2], &dense(0.0)).await.unwrap();
    join_clean(coordinator).await;
}
