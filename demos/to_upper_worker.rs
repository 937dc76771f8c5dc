//! ToUpper工作节点示例：把收到的载荷转为大写
//!
//! 服务器列表取自`GEARMAN_SERVERS`(逗号分隔)，默认`127.0.0.1:4730`。

use std::env;

use gear_pool::{HandlerRegistry, HandlerResult, Job, WorkerConfig, WorkerEngine};
use log::info;

fn servers() -> Vec<String> {
    env::var("GEARMAN_SERVERS")
        .unwrap_or_else(|_| "127.0.0.1:4730".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn to_upper(job: &Job) -> HandlerResult {
    job.send_status(0, 1);
    let result = job.payload().to_ascii_uppercase();
    job.send_status(1, 1);
    Ok(result)
}

#[tokio::main]
async fn main() -> gear_pool::Result<()> {
    env_logger::init();

    let config = WorkerConfig::new(servers()).with_client_id("to-upper-worker");
    let registry = HandlerRegistry::new();
    registry.register("ToUpper", to_upper, None)?;

    let engine = WorkerEngine::start(config, registry, None).await?;
    info!("Serving ToUpper with {} workers, Ctrl-C to stop", engine.worker_count());

    tokio::signal::ctrl_c().await.map_err(gear_pool::NetworkError::Io)?;
    engine.shutdown().await
}
