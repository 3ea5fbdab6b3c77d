//! Standalone topic-exchange broker

use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "syncmesh-broker", about = "Topic-exchange broker for syncmesh runs")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SYNCMESH_BROKER_ADDR", default_value = "127.0.0.1:7455")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    syncmesh::init_tracing();
    let args = Args::parse();
    syncmesh::transport::run_broker(&args.bind).await?;
    Ok(())
}
