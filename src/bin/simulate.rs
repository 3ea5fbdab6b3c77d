//! Single-process experiment driver
//!
//! Wires a coordinator and N workers over the in-process broker (or a
//! remote `syncmesh-broker`) with the reference linear learner and a
//! synthetic data stream, then waits for the run to finish.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use syncmesh::data::{FeedPacing, SyntheticLinearSource};
use syncmesh::learning::LinearLearner;
use syncmesh::{
    Aggregator, Broker, BrokerConfig, Coordinator, CoordinatorConfig, InitHandler, LearningLogger,
    MemoryBroker, NodeId, StoppingCriterion, Synchronizer, TcpBroker, TrainingMode, Transport,
    Worker, WorkerConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    Periodic,
    Dynamic,
    DynamicHedge,
    Nosync,
    AggregationAtEnd,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AggregatorKind {
    Mean,
    GeometricMedian,
}

#[derive(Parser, Debug)]
#[command(name = "syncmesh-sim", about = "Run a local model-averaging experiment")]
struct Args {
    /// Number of workers
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Synchronization strategy
    #[arg(long, value_enum, default_value_t = Strategy::DynamicHedge)]
    strategy: Strategy,

    /// Aggregation operator
    #[arg(long, value_enum, default_value_t = AggregatorKind::Mean)]
    aggregator: AggregatorKind,

    /// Divergence threshold of the dynamic strategies
    #[arg(long, default_value_t = 0.5)]
    delta: f64,

    /// Examples per training step
    #[arg(long, default_value_t = 4)]
    batch_size: usize,

    /// Training steps between local condition checks
    #[arg(long, default_value_t = 4)]
    sync_period: usize,

    /// Examples each worker consumes before stopping
    #[arg(long, default_value_t = 200)]
    max_examples: u64,

    /// Feature dimension of the synthetic stream
    #[arg(long, default_value_t = 4)]
    dimension: usize,

    /// SGD learning rate
    #[arg(long, default_value_t = 0.05)]
    learning_rate: f64,

    /// Label noise of the synthetic stream
    #[arg(long, default_value_t = 0.05)]
    noise: f64,

    /// Directory for learning logs; omitted disables file logging
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Remote broker as host:port; omitted runs an in-process broker
    #[arg(long)]
    broker: Option<String>,
}

fn synchronizer(args: &Args) -> Synchronizer {
    match args.strategy {
        Strategy::Periodic => Synchronizer::periodic(),
        Strategy::Dynamic => Synchronizer::dynamic(args.delta),
        Strategy::DynamicHedge => Synchronizer::dynamic_hedge(args.delta),
        Strategy::Nosync => Synchronizer::nosync(),
        Strategy::AggregationAtEnd => Synchronizer::aggregation_at_end(),
    }
}

fn logger(args: &Args, id: &str) -> Result<Arc<LearningLogger>> {
    Ok(Arc::new(match &args.log_dir {
        Some(dir) => LearningLogger::new(dir, id)?,
        None => LearningLogger::disabled(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    syncmesh::init_tracing();
    let args = Args::parse();
    let started = Instant::now();

    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let broker: Arc<dyn Broker> = match &args.broker {
        Some(addr) => {
            let (hostname, port) = addr
                .rsplit_once(':')
                .context("broker address must be host:port")?;
            let config = BrokerConfig {
                hostname: hostname.to_string(),
                port: port.parse().context("broker port must be numeric")?,
                user: "guest".to_string(),
                password: "guest".to_string(),
                run_id: run_id.clone(),
            };
            config.validate()?;
            Arc::new(TcpBroker::connect(config).await?)
        }
        None => Arc::new(MemoryBroker::new()),
    };

    let mode = match args.strategy {
        Strategy::AggregationAtEnd => TrainingMode::Batch,
        _ => TrainingMode::Incremental,
    };

    let coordinator = Coordinator::new(
        CoordinatorConfig {
            nodes_to_wait: Some(args.workers),
            min_active: 0,
        },
        Transport::new(Arc::clone(&broker), &run_id, logger(&args, "coordinator")?),
        synchronizer(&args),
        match args.aggregator {
            AggregatorKind::Mean => Aggregator::average(),
            AggregatorKind::GeometricMedian => Aggregator::geometric_median(),
        },
        InitHandler::use_first(),
        logger(&args, "coordinator")?,
    );
    let coordinator_task = tokio::spawn(coordinator.run());
    // let the coordinator bind its queue before the first registration
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let target: Vec<f64> = (0..args.dimension).map(|i| 1.0 + i as f64 * 0.5).collect();
    let mut worker_tasks = Vec::with_capacity(args.workers);
    for i in 0..args.workers {
        let id = NodeId::new(format!("worker{i}"));
        let worker = Worker::new(
            WorkerConfig {
                id: id.clone(),
                batch_size: args.batch_size,
                sync_period: args.sync_period,
                mode,
            },
            Transport::new(Arc::clone(&broker), &run_id, logger(&args, id.as_str())?),
            synchronizer(&args),
            Some(StoppingCriterion::max_examples(args.max_examples)),
            logger(&args, id.as_str())?,
            LinearLearner::new(args.dimension, args.learning_rate),
        )?;
        let source = SyntheticLinearSource::new(target.clone(), args.noise, None, i as u64 + 1);
        worker_tasks.push(tokio::spawn(worker.run(source, FeedPacing::Flatout)));
    }

    for (i, task) in worker_tasks.into_iter().enumerate() {
        task.await
            .with_context(|| format!("worker{i} panicked"))?
            .with_context(|| format!("worker{i} failed"))?;
    }
    coordinator_task
        .await
        .context("coordinator panicked")?
        .context("coordinator failed")?;

    let summary = serde_json::json!({
        "run_id": run_id,
        "workers": args.workers,
        "strategy": format!("{:?}", args.strategy),
        "examples_per_worker": args.max_examples,
        "elapsed_ms": started.elapsed().as_millis() as u64,
    });
    println!("{summary}");
    Ok(())
}
