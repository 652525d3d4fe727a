use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use zw_kernel::Kernel;
use zw_worker::config::WorkerConfig;
use zw_worker::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let cfg = WorkerConfig::from_env();
    std::fs::create_dir_all(&cfg.state_dir)?;
    let kernel = Kernel::open(&cfg.state_dir)?;
    info!(
        worker = %cfg.worker_id,
        db = %kernel.db_path().display(),
        chunk_size = cfg.chunk_size,
        "zw-worker starting"
    );

    let scheduler = Scheduler::new(kernel, cfg);
    let handles = scheduler.start();

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
