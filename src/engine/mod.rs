use std::time::Duration;

use log::{error, info};
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::drone::{Handler, HandlerRegistry, ShutdownHandle, Worker};
use crate::Result;

/// 多工作节点执行引擎
///
/// 每个工作节点独立连接全部服务器并串行执行作业，
/// 节点之间共享同一张处理函数注册表。
pub struct WorkerEngine {
    registry: HandlerRegistry,
    shutdown: ShutdownHandle,
    workers: Vec<JoinHandle<Result<()>>>,
}

impl WorkerEngine {
    /// 启动`count`个工作节点，默认与CPU核数相同
    pub async fn start(config: WorkerConfig, registry: HandlerRegistry, count: Option<usize>) -> Result<Self> {
        let count = count.unwrap_or_else(num_cpus::get).max(1);
        let shutdown = ShutdownHandle::new();
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let mut config = config.clone();
            if let Some(id) = config.client_id.take() {
                config.client_id = Some(format!("{}-{}", id, index));
            }
            let mut worker = Worker::with_registry(config, registry.clone())?.with_shutdown(shutdown.clone());
            if let Err(e) = worker.connect().await {
                shutdown.shutdown();
                return Err(e);
            }
            workers.push(tokio::spawn(async move { worker.run_forever().await }));
        }
        info!("Worker engine started with {} workers", count);

        Ok(Self {
            registry,
            shutdown,
            workers,
        })
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// 注册处理函数，各节点在下一轮循环中声明
    pub fn register<H>(&self, function: impl Into<String>, handler: H) -> Result<()>
    where
        H: Handler + 'static,
    {
        self.registry.register(function, handler, None)
    }

    pub fn register_with_timeout<H>(&self, function: impl Into<String>, handler: H, timeout: Duration) -> Result<()>
    where
        H: Handler + 'static,
    {
        self.registry.register(function, handler, Some(timeout))
    }

    pub fn unregister(&self, function: &str) -> bool {
        self.registry.unregister(function)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// 停止全部工作节点并等待其退出
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.shutdown();
        let mut outcome = Ok(());
        for worker in self.workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Worker exited with error: {}", e);
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
                Err(e) => error!("Worker task aborted: {}", e),
            }
        }
        info!("Worker engine stopped");
        outcome
    }
}
