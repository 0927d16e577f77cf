//! Chat core server binary.

use std::sync::Arc;

use anyhow::Result;
use llm_client::HttpGateway;
use tracing::info;
use tracing_subscriber::EnvFilter;

use server_core::config::Config;
use server_core::kernel::lanes::build_lane_store;
use server_core::kernel::tools::ToolRegistry;
use server_core::kernel::{worker, ChatKernel, WorkerPool};
use server_core::server::build_router;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        backend = config.queue_backend.as_str(),
        data_dir = %config.data_dir.display(),
        workers = config.worker_pool_size,
        "starting chat core"
    );

    let lanes = build_lane_store(&config).await?;
    let gateway = Arc::new(HttpGateway::new(config.gateway_targets())?);

    // Skills register their tools here at deployment time; the core itself
    // ships none.
    let tools = Arc::new(ToolRegistry::new());

    let port = config.port;
    let (kernel, receiver) = ChatKernel::new(config, lanes, gateway, tools);
    let _pool = WorkerPool::spawn(kernel.clone(), receiver);

    let recovered = worker::scan_and_enqueue(&kernel).await;
    if recovered > 0 {
        info!(count = recovered, "startup scan re-enqueued pending jobs");
    }

    let app = build_router(kernel);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "chat core listening");
    axum::serve(listener, app).await?;
    Ok(())
}
