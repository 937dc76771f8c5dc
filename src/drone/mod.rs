//! 工作节点(Drone)实现模块
//!
//! 单个`Worker`串行执行作业：在每个连接上抢占作业，执行处理函数，
//! 再把结果回报给分配作业的那个连接。需要并发时使用`engine::WorkerEngine`
//! 启动多个独立的`Worker`。

pub mod backoff;
mod handler;
mod job;

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::select_all;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Notify};

use crate::config::WorkerConfig;
use crate::network::NetworkError;
use crate::pool::ServerPool;
use crate::proto::Packet;
use crate::{GearError, Result, ServerId};

pub use backoff::Backoff;
pub use handler::{Handler, HandlerError, HandlerRegistry, HandlerResult, Registration};
pub use job::Job;
use job::JobUpdate;

/// 工作节点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Executing,
}

/// 单个连接上的抢占状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Agent {
    /// 可以发送GRAB_JOB
    Ready,
    /// 已发送GRAB_JOB，等待NO_JOB或JOB_ASSIGN
    Grabbing,
    /// 已发送PRE_SLEEP，等待NOOP
    Sleeping,
}

/// 协作式停止信号，可跨任务克隆
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownSignal>,
}

#[derive(Debug, Default)]
struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求停止，正在执行的作业会先完成
    pub fn shutdown(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// 等待停止请求
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_shutdown() {
                return;
            }
            notified.await;
        }
    }
}

/// 工作节点运行时
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
    pool: ServerPool,
    registry: HandlerRegistry,
    agents: Vec<Agent>,
    backoffs: Vec<Backoff>,
    state: WorkerState,
    shutdown: ShutdownHandle,
    started: bool,
    jobs_completed: u64,
    jobs_failed: u64,
}

impl Worker {
    /// 创建工作节点(尚未连接)
    pub fn new(config: WorkerConfig) -> Result<Self> {
        Self::with_registry(config, HandlerRegistry::new())
    }

    /// 使用共享的处理函数注册表创建
    pub fn with_registry(config: WorkerConfig, registry: HandlerRegistry) -> Result<Self> {
        config.validate()?;
        let pool = ServerPool::new(config.servers.iter().cloned(), config.connect_timeout());
        let backoffs = (0..pool.len())
            .map(|_| Backoff::new(config.reconnect_base(), config.reconnect_max()))
            .collect();
        Ok(Self {
            agents: vec![Agent::Ready; pool.len()],
            backoffs,
            pool,
            registry,
            config,
            state: WorkerState::Idle,
            shutdown: ShutdownHandle::new(),
            started: false,
            jobs_completed: 0,
            jobs_failed: 0,
        })
    }

    /// 替换停止信号，便于多个工作节点共用一个
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// 成功完成的作业数
    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed
    }

    /// 以WORK_FAIL结束的作业数
    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed
    }

    /// 注册处理函数并向已连接的服务器声明
    pub async fn register<H>(&mut self, function: impl Into<String>, handler: H) -> Result<()>
    where
        H: Handler + 'static,
    {
        self.register_inner(function.into(), handler, None).await
    }

    /// 注册带执行时限的处理函数(CAN_DO_TIMEOUT)
    pub async fn register_with_timeout<H>(
        &mut self,
        function: impl Into<String>,
        handler: H,
        timeout: Duration,
    ) -> Result<()>
    where
        H: Handler + 'static,
    {
        self.register_inner(function.into(), handler, Some(timeout)).await
    }

    async fn register_inner<H>(&mut self, function: String, handler: H, timeout: Option<Duration>) -> Result<()>
    where
        H: Handler + 'static,
    {
        self.registry.register(function.clone(), handler, timeout)?;
        let announced = self.pool.broadcast_registration(&function, timeout).await;
        debug!("Registered {} (announced to {} servers)", function, announced);
        Ok(())
    }

    /// 撤销处理函数，返回是否存在
    pub async fn unregister(&mut self, function: &str) -> bool {
        if !self.registry.unregister(function) {
            return false;
        }
        self.pool.broadcast_unregistration(function).await;
        true
    }

    /// 连接全部服务器，发送SET_CLIENT_ID并声明所有函数
    pub async fn connect(&mut self) -> Result<usize> {
        let connected = self.pool.connect_all().await?;
        self.started = true;
        for server in 0..self.pool.len() {
            let is_connected = self.pool.connection(server).map_or(false, |c| c.is_connected());
            if is_connected {
                self.agents[server] = Agent::Ready;
                self.backoffs[server].reset();
                self.identify(server).await;
            } else {
                self.backoffs[server].fail(Instant::now());
            }
        }
        self.sync_capabilities().await;
        Ok(connected)
    }

    /// 主循环，直到收到停止请求
    ///
    /// 单个连接断开不会终止循环：该连接被标记为失败，按退避节奏重连，
    /// 其余连接继续服务。
    pub async fn run_forever(&mut self) -> Result<()> {
        if !self.started {
            self.connect().await?;
        }
        info!("Worker started with {} servers", self.pool.connected_count());

        while !self.shutdown.is_shutdown() {
            self.restore_connections().await;
            self.sync_capabilities().await;

            if self.registry.is_empty() || !self.pool.has_connected() {
                self.idle().await;
                continue;
            }

            self.grab_ready().await;
            if let Some((server, outcome)) = self.next_frame().await {
                self.handle_frame(server, outcome).await;
            }
        }

        info!(
            "Worker stopped after {} completed and {} failed jobs",
            self.jobs_completed, self.jobs_failed
        );
        Ok(())
    }

    /// 断开全部连接
    pub fn close(&mut self) {
        self.pool.close_all();
    }

    async fn identify(&mut self, server: ServerId) {
        let Some(id) = self.config.client_id.clone() else { return };
        if let Err(e) = self.pool.send(server, &Packet::SetClientId { id }).await {
            self.connection_lost(server, &e);
        }
    }

    /// 重连到期的失败连接
    async fn restore_connections(&mut self) {
        let now = Instant::now();
        for server in 0..self.pool.len() {
            let is_connected = self.pool.connection(server).map_or(true, |c| c.is_connected());
            if is_connected || !self.backoffs[server].ready(now) {
                continue;
            }
            match self.pool.reconnect(server).await {
                Ok(()) => {
                    info!("Reconnected to job server {}", self.pool.address(server).unwrap_or("?"));
                    self.backoffs[server].reset();
                    self.agents[server] = Agent::Ready;
                    self.identify(server).await;
                }
                Err(e) => {
                    let delay = self.backoffs[server].fail(now);
                    debug!(
                        "Reconnect to {} failed ({}), next attempt in {:?}",
                        self.pool.address(server).unwrap_or("?"),
                        e,
                        delay
                    );
                }
            }
        }
    }

    /// 让每个连接的能力集合与注册表一致
    async fn sync_capabilities(&mut self) {
        let wanted = self.registry.snapshot();
        for (server, conn) in self.pool.connections_mut() {
            if !conn.is_connected() {
                continue;
            }
            for (function, timeout) in &wanted {
                if conn.capabilities().contains(function) {
                    continue;
                }
                if let Err(e) = conn.announce(function, *timeout).await {
                    warn!("Failed to announce {} to server #{}: {}", function, server, e);
                    break;
                }
            }

            let stale: Vec<String> = conn
                .capabilities()
                .iter()
                .filter(|name| !wanted.iter().any(|(function, _)| function == *name))
                .cloned()
                .collect();
            for function in stale {
                if let Err(e) = conn.withdraw(&function).await {
                    warn!("Failed to withdraw {} from server #{}: {}", function, server, e);
                    break;
                }
            }
        }
    }

    async fn grab_ready(&mut self) {
        let grab = if self.config.grab_unique {
            Packet::GrabJobUniq
        } else {
            Packet::GrabJob
        };
        for server in 0..self.pool.len() {
            let eligible = self
                .pool
                .connection(server)
                .map_or(false, |c| c.is_connected() && !c.capabilities().is_empty());
            if !eligible || self.agents[server] != Agent::Ready {
                continue;
            }
            match self.pool.send(server, &grab).await {
                Ok(()) => self.agents[server] = Agent::Grabbing,
                Err(e) => self.connection_lost(server, &e),
            }
        }
    }

    /// 在所有已连接的连接上等待下一帧，最多等待`idle_wait`
    async fn next_frame(&mut self) -> Option<(ServerId, std::result::Result<Packet, NetworkError>)> {
        let idle = self.config.idle_wait();
        let shutdown = self.shutdown.clone();
        let receives: Vec<_> = self
            .pool
            .connections_mut()
            .filter(|(_, conn)| conn.is_connected())
            .map(|(server, conn)| Box::pin(async move { (server, conn.receive(Some(idle)).await) }))
            .collect();
        if receives.is_empty() {
            return None;
        }

        tokio::select! {
            (frame, _, _) = select_all(receives) => Some(frame),
            _ = shutdown.wait() => None,
        }
    }

    async fn handle_frame(&mut self, server: ServerId, outcome: std::result::Result<Packet, NetworkError>) {
        let packet = match outcome {
            Ok(packet) => packet,
            Err(NetworkError::Timeout) => {
                // 休眠超过idle_wait后重新抢占，防止错过NOOP
                self.agents[server] = Agent::Ready;
                return;
            }
            Err(e) => {
                self.connection_lost(server, &e);
                return;
            }
        };

        match packet {
            Packet::Noop => self.agents[server] = Agent::Ready,
            Packet::NoJob => match self.pool.send(server, &Packet::PreSleep).await {
                Ok(()) => self.agents[server] = Agent::Sleeping,
                Err(e) => self.connection_lost(server, &e),
            },
            Packet::JobAssign {
                handle,
                function,
                payload,
            } => {
                self.agents[server] = Agent::Ready;
                self.execute(server, handle, function, None, payload).await;
            }
            Packet::JobAssignUniq {
                handle,
                function,
                unique,
                payload,
            } => {
                self.agents[server] = Agent::Ready;
                let unique = (!unique.is_empty()).then_some(unique);
                self.execute(server, handle, function, unique, payload).await;
            }
            Packet::Error { code, message } => {
                warn!("Job server #{} reported error {}: {}", server, code, message);
                self.agents[server] = Agent::Sleeping;
            }
            other => debug!("Ignoring {} from server #{}", other.name(), server),
        }
    }

    /// 执行一个作业并回报结果
    async fn execute(
        &mut self,
        server: ServerId,
        handle: String,
        function: String,
        unique: Option<String>,
        payload: Bytes,
    ) {
        let Some(registration) = self.registry.get(&function) else {
            let err = GearError::UnknownFunction(function);
            warn!("Rejecting job {}: {}", handle, err);
            self.jobs_failed += 1;
            self.report(server, Packet::WorkFail { handle }).await;
            return;
        };

        debug!("Executing {} ({}, {} bytes)", handle, function, payload.len());
        self.state = WorkerState::Executing;
        let started = Instant::now();

        let (tx, mut updates) = mpsc::unbounded_channel();
        let job = Job::new(handle.clone(), function, unique, payload, tx);
        let handler = Arc::clone(&registration.handler);
        let mut task = tokio::task::spawn_blocking(move || handler.handle(&job));

        let limit = registration.timeout;
        let expired = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        let joined = loop {
            tokio::select! {
                joined = &mut task => break Some(joined),
                Some(update) = updates.recv() => self.forward(server, &handle, update).await,
                _ = &mut expired => break None,
            }
        };
        while let Ok(update) = updates.try_recv() {
            self.forward(server, &handle, update).await;
        }

        let reply = match joined {
            Some(Ok(Ok(result))) => {
                debug!("Job {} completed in {:?}", handle, started.elapsed());
                self.jobs_completed += 1;
                Packet::WorkComplete {
                    handle,
                    payload: Bytes::from(result),
                }
            }
            Some(Ok(Err(e))) => {
                warn!("Handler for {} failed: {}", handle, e);
                self.jobs_failed += 1;
                // 有错误信息时以WORK_EXCEPTION回传
                if e.message().is_empty() {
                    Packet::WorkFail { handle }
                } else {
                    Packet::WorkException {
                        handle,
                        payload: Bytes::from(e.message().to_string()),
                    }
                }
            }
            Some(Err(e)) => {
                error!("Handler for {} panicked: {}", handle, e);
                self.jobs_failed += 1;
                Packet::WorkFail { handle }
            }
            None => {
                warn!("Handler for {} exceeded {:?}", handle, limit.unwrap_or_default());
                self.jobs_failed += 1;
                Packet::WorkFail { handle }
            }
        };
        self.report(server, reply).await;
        self.state = WorkerState::Idle;
    }

    async fn forward(&mut self, server: ServerId, handle: &str, update: JobUpdate) {
        let handle = handle.to_string();
        let packet = match update {
            JobUpdate::Status { numerator, denominator } => Packet::WorkStatus {
                handle,
                numerator,
                denominator,
            },
            JobUpdate::Data(payload) => Packet::WorkData { handle, payload },
            JobUpdate::Warning(payload) => Packet::WorkWarning { handle, payload },
        };
        self.report(server, packet).await;
    }

    /// 结果只回报给分配作业的连接
    async fn report(&mut self, server: ServerId, packet: Packet) {
        let is_connected = self.pool.connection(server).map_or(false, |c| c.is_connected());
        if !is_connected {
            warn!("Dropping {} for lost server #{}", packet.name(), server);
            return;
        }
        if let Err(e) = self.pool.send(server, &packet).await {
            self.connection_lost(server, &e);
        }
    }

    fn connection_lost(&mut self, server: ServerId, err: &NetworkError) {
        warn!(
            "Lost job server {}: {}",
            self.pool.address(server).unwrap_or("?"),
            err
        );
        self.pool.mark_failed(server);
        self.agents[server] = Agent::Ready;
        self.backoffs[server].fail(Instant::now());
    }

    /// 没有可服务的连接或函数时短暂等待
    async fn idle(&mut self) {
        let now = Instant::now();
        let mut wait = self.config.idle_wait();
        for backoff in &self.backoffs {
            if let Some(remaining) = backoff.remaining(now) {
                wait = wait.min(remaining.max(Duration::from_millis(1)));
            }
        }
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.wait() => {}
        }
    }
}
