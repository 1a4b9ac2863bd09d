mod client;
mod config;
mod machine;
mod main_path;
mod worker;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("taskdb_worker=debug,reqwest=info")),
        )
        .init();

    let cfg = WorkerConfig::from_env()?;
    worker::run(cfg).await
}
