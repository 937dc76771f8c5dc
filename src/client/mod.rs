//! 客户端API
//!
//! 客户端独占其创建的全部作业请求。同一连接上的帧由`Client`串行读取，
//! 并按`(server, handle)`分发给对应的请求。
//!
//! 超时只是客户端停止等待：服务器不会被通知放弃作业，
//! 作业可能在客户端放弃之后仍然完成。

mod job;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};

use crate::config::ClientConfig;
use crate::network::NetworkError;
use crate::pool::ServerPool;
use crate::proto::Packet;
use crate::{GearError, Result, ServerId};

pub use job::{generate_unique_id, JobId, JobRequest, JobState, JobStatus, Submission};

/// Gearman客户端
#[derive(Debug)]
pub struct Client {
    pool: ServerPool,
    config: ClientConfig,
    jobs: HashMap<JobId, JobRequest>,
    routes: HashMap<(ServerId, String), JobId>,
    status_pending: HashSet<JobId>,
    next_id: u64,
}

impl Client {
    /// 按配置创建连接池并连接
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let mut pool = ServerPool::new(config.servers.iter().cloned(), config.connect_timeout());
        pool.connect_all().await?;
        Ok(Self::with_pool(config, pool))
    }

    /// 使用外部构建的连接池
    pub fn with_pool(config: ClientConfig, pool: ServerPool) -> Self {
        Self {
            pool,
            config,
            jobs: HashMap::new(),
            routes: HashMap::new(),
            status_pending: HashSet::new(),
            next_id: 1,
        }
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 同步执行作业，直到终态或截止时间
    ///
    /// `deadline`为`None`时使用配置中的默认值。
    pub async fn do_job(
        &mut self,
        function: impl Into<String>,
        payload: impl Into<Bytes>,
        deadline: Option<Duration>,
    ) -> Result<Bytes> {
        let (id, failure) = self.dispatch(Submission::new(function, payload)).await?;
        if let Some(err) = failure {
            self.discard(id);
            return Err(err);
        }
        let deadline = deadline.or_else(|| self.config.default_deadline());
        self.wait(id, deadline).await
    }

    /// 提交后台作业，拿到handle后立即返回
    ///
    /// 提交失败不会报错，请求停留在`Unknown`。
    pub async fn submit_background(
        &mut self,
        function: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<JobId> {
        self.submit(Submission::new(function, payload).background()).await
    }

    /// 通用提交入口
    pub async fn submit(&mut self, submission: Submission) -> Result<JobId> {
        let (id, failure) = self.dispatch(submission).await?;
        if let Some(err) = failure {
            warn!("{} was not accepted by any job server: {}", id, err);
        }
        Ok(id)
    }

    /// 一次提交多个前台作业，所有作业可同时在不同服务器上执行
    pub async fn submit_many<I, F, P>(&mut self, jobs: I) -> Result<Vec<JobId>>
    where
        I: IntoIterator<Item = (F, P)>,
        F: Into<String>,
        P: Into<Bytes>,
    {
        let submissions: Vec<Submission> = jobs
            .into_iter()
            .map(|(function, payload)| Submission::new(function, payload))
            .collect();
        submissions.iter().try_for_each(validate)?;

        let mut ids = Vec::with_capacity(submissions.len());
        for submission in submissions {
            ids.push(self.submit(submission).await?);
        }
        Ok(ids)
    }

    async fn dispatch(&mut self, submission: Submission) -> Result<(JobId, Option<GearError>)> {
        validate(&submission)?;
        if !self.pool.has_connected() {
            return Err(GearError::NoServersAvailable);
        }

        let id = JobId(self.next_id);
        self.next_id += 1;
        let mut request = JobRequest::new(id, submission);
        let packet = submit_packet(&request);

        let mut strays = Vec::new();
        let outcome = self
            .pool
            .submit(&packet, self.config.response_timeout(), &mut strays)
            .await;
        let failure = match outcome {
            Ok((server, handle)) => {
                debug!("{} ({}) submitted as {}", id, request.function(), handle);
                self.routes.insert((server, handle.clone()), id);
                request.mark_submitted(server, handle);
                None
            }
            Err(GearError::NoServersAvailable) => return Err(GearError::NoServersAvailable),
            Err(e) => {
                request.mark_unsubmitted(e.to_string());
                Some(e)
            }
        };
        self.jobs.insert(id, request);

        for (server, packet) in strays {
            self.route(server, packet);
        }
        self.sweep_failed_servers();
        Ok((id, failure))
    }

    /// 等待作业到达终态
    ///
    /// 前台作业在报告终态后即被移除；后台作业保留到`discard`。
    pub async fn wait(&mut self, id: JobId, deadline: Option<Duration>) -> Result<Bytes> {
        let until = deadline.map(|d| Instant::now() + d);
        self.wait_until(id, until, deadline).await
    }

    /// 用同一截止时间等待多个作业
    pub async fn wait_all(&mut self, ids: &[JobId], deadline: Option<Duration>) -> Vec<Result<Bytes>> {
        let until = deadline.map(|d| Instant::now() + d);
        let servers: HashSet<ServerId> = ids
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|r| !r.is_finished())
            .filter_map(JobRequest::server)
            .collect();
        for server in servers {
            self.drain(server);
        }

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.wait_until(*id, until, deadline).await);
        }
        results
    }

    async fn wait_until(&mut self, id: JobId, until: Option<Instant>, deadline: Option<Duration>) -> Result<Bytes> {
        let interval = self.config.status_interval();

        loop {
            let request = self.jobs.get(&id).ok_or(GearError::UnknownJob(id))?;
            if request.is_finished() {
                break;
            }
            let Some(server) = request.server() else { break };
            let background = request.is_background();

            let mut wait_for = until.map(|u| u.saturating_duration_since(Instant::now()));
            if wait_for == Some(Duration::ZERO) {
                // 截止前已到达的帧仍然算数
                self.drain(server);
                if let Some(request) = self.jobs.get_mut(&id) {
                    if request.time_out() {
                        info!("Stopped waiting for {} after {:?}", id, deadline.unwrap_or_default());
                    }
                }
                break;
            }
            if background {
                self.request_status(id).await;
                wait_for = Some(wait_for.map_or(interval, |w| w.min(interval)));
            }

            match self.pool.receive(server, wait_for).await {
                Ok(packet) => self.route(server, packet),
                Err(NetworkError::Timeout) => continue,
                Err(e) => self.fail_server(server, &e),
            }
        }

        self.settle(id, deadline.unwrap_or_default())
    }

    /// 非阻塞查询作业状态
    ///
    /// 读取该作业所在连接上已就绪的帧；后台作业会附带发出一次GET_STATUS，
    /// 应答在之后的`poll`中生效。`poll`不会移除请求。
    pub async fn poll(&mut self, id: JobId) -> Result<JobState> {
        let request = self.jobs.get(&id).ok_or(GearError::UnknownJob(id))?;
        if request.is_finished() {
            return Ok(request.state());
        }
        let Some(server) = request.server() else {
            return Ok(request.state());
        };

        self.drain(server);
        let request = self.jobs.get(&id).ok_or(GearError::UnknownJob(id))?;
        if request.is_background() && !request.is_finished() {
            self.request_status(id).await;
        }
        self.jobs
            .get(&id)
            .map(JobRequest::state)
            .ok_or(GearError::UnknownJob(id))
    }

    /// 向服务器查询作业状态并等待应答
    pub async fn status(&mut self, id: JobId) -> Result<JobStatus> {
        let request = self.jobs.get(&id).ok_or(GearError::UnknownJob(id))?;
        let (server, handle) = match (request.server(), request.server_handle()) {
            (Some(server), Some(handle)) => (server, handle.to_string()),
            _ => {
                return Err(GearError::Connection(NetworkError::Unavailable(
                    request.failure().unwrap_or("job has no server handle").to_string(),
                )))
            }
        };

        if let Err(e) = self.pool.send(server, &Packet::GetStatus { handle: handle.clone() }).await {
            self.fail_server(server, &e);
            return Err(e.into());
        }

        let until = Instant::now() + self.config.response_timeout();
        loop {
            let remaining = until.saturating_duration_since(Instant::now());
            match self.pool.receive(server, Some(remaining)).await {
                Ok(Packet::StatusRes {
                    handle: reply,
                    known,
                    running,
                    numerator,
                    denominator,
                }) if reply == handle => {
                    let status = JobStatus {
                        known,
                        running,
                        numerator,
                        denominator,
                    };
                    self.status_pending.remove(&id);
                    if let Some(request) = self.jobs.get_mut(&id) {
                        apply_status(request, status);
                        if request.is_finished() {
                            self.routes.remove(&(server, handle));
                        }
                    }
                    return Ok(status);
                }
                Ok(other) => self.route(server, other),
                Err(NetworkError::Timeout) => return Err(NetworkError::Timeout.into()),
                Err(e) => {
                    self.fail_server(server, &e);
                    return Err(e.into());
                }
            }
        }
    }

    /// ECHO_REQ 往返
    pub async fn echo(&mut self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let server = self.pool.select().ok_or(GearError::NoServersAvailable)?;
        let payload = payload.into();
        if let Err(e) = self.pool.send(server, &Packet::EchoReq { payload }).await {
            self.fail_server(server, &e);
            return Err(e.into());
        }

        let until = Instant::now() + self.config.response_timeout();
        loop {
            let remaining = until.saturating_duration_since(Instant::now());
            match self.pool.receive(server, Some(remaining)).await {
                Ok(Packet::EchoRes { payload }) => return Ok(payload),
                Ok(other) => self.route(server, other),
                Err(NetworkError::Timeout) => return Err(NetworkError::Timeout.into()),
                Err(e) => {
                    self.fail_server(server, &e);
                    return Err(e.into());
                }
            }
        }
    }

    pub fn request(&self, id: JobId) -> Option<&JobRequest> {
        self.jobs.get(&id)
    }

    /// 全部仍被持有的请求
    pub fn requests(&self) -> impl Iterator<Item = &JobRequest> {
        self.jobs.values()
    }

    /// 尚未结束的请求
    pub fn outstanding(&self) -> impl Iterator<Item = &JobRequest> {
        self.jobs.values().filter(|r| !r.is_finished())
    }

    /// 丢弃请求，之后到达的相关帧将被忽略
    pub fn discard(&mut self, id: JobId) -> Option<JobRequest> {
        let request = self.jobs.remove(&id)?;
        if let (Some(server), Some(handle)) = (request.server(), request.server_handle()) {
            self.routes.remove(&(server, handle.to_string()));
        }
        self.status_pending.remove(&id);
        Some(request)
    }

    /// 重连失败的服务器，返回恢复的数量
    pub async fn reconnect(&mut self) -> usize {
        self.pool.reconnect_failed().await.len()
    }

    /// 断开全部连接，未完成的作业标记为失败
    pub fn close(&mut self) {
        self.pool.close_all();
        for request in self.jobs.values_mut() {
            request.fail("client closed");
        }
        self.routes.clear();
        self.status_pending.clear();
    }

    async fn request_status(&mut self, id: JobId) {
        if self.status_pending.contains(&id) {
            return;
        }
        let Some(request) = self.jobs.get(&id) else { return };
        let (Some(server), Some(handle)) = (request.server(), request.server_handle()) else {
            return;
        };
        let packet = Packet::GetStatus {
            handle: handle.to_string(),
        };
        match self.pool.send(server, &packet).await {
            Ok(()) => {
                self.status_pending.insert(id);
            }
            Err(e) => self.fail_server(server, &e),
        }
    }

    fn drain(&mut self, server: ServerId) {
        loop {
            match self.pool.try_receive(server) {
                Ok(Some(packet)) => self.route(server, packet),
                Ok(None) => break,
                Err(e) => {
                    self.fail_server(server, &e);
                    break;
                }
            }
        }
    }

    /// 按handle把帧分发给对应请求
    fn route(&mut self, server: ServerId, packet: Packet) {
        let handle = match packet.handle() {
            Some(handle) => handle.to_string(),
            None => {
                match &packet {
                    Packet::Error { code, message } => {
                        warn!("Job server #{} reported error {}: {}", server, code, message)
                    }
                    other => debug!("Ignoring unsolicited {} from server #{}", other.name(), server),
                }
                return;
            }
        };

        let key = (server, handle);
        let Some(&id) = self.routes.get(&key) else {
            debug!("{} for untracked handle {}", packet.name(), key.1);
            return;
        };
        let Some(request) = self.jobs.get_mut(&id) else {
            self.routes.remove(&key);
            return;
        };

        match packet {
            Packet::WorkStatus {
                numerator, denominator, ..
            } => {
                request.on_status(numerator, denominator);
            }
            Packet::WorkComplete { payload, .. } => {
                request.complete(payload);
            }
            Packet::WorkFail { .. } => {
                request.fail("worker reported failure");
            }
            Packet::WorkException { payload, .. } => {
                request.fail(format!("worker exception: {}", String::from_utf8_lossy(&payload)));
            }
            Packet::WorkData { payload, .. } => {
                request.on_data(payload);
            }
            Packet::WorkWarning { payload, .. } => {
                request.on_warning(payload);
            }
            Packet::StatusRes {
                known,
                running,
                numerator,
                denominator,
                ..
            } => {
                self.status_pending.remove(&id);
                apply_status(
                    request,
                    JobStatus {
                        known,
                        running,
                        numerator,
                        denominator,
                    },
                );
            }
            other => debug!("Ignoring {} for {}", other.name(), id),
        }

        if request.is_finished() {
            debug!("{} finished in state {:?}", id, request.state());
            self.routes.remove(&key);
            self.status_pending.remove(&id);
        }
    }

    fn fail_server(&mut self, server: ServerId, err: &NetworkError) {
        self.pool.mark_failed(server);
        let address = self.pool.address(server).unwrap_or("?").to_string();
        self.fail_jobs_on(server, format!("connection to {} lost: {}", address, err));
    }

    /// 提交过程中可能有连接失效，其上未结束的作业一并失败
    fn sweep_failed_servers(&mut self) {
        let failed: HashSet<ServerId> = self
            .jobs
            .values()
            .filter(|r| !r.is_finished())
            .filter_map(JobRequest::server)
            .filter(|s| self.pool.connection(*s).map_or(true, |c| !c.is_connected()))
            .collect();
        for server in failed {
            let address = self.pool.address(server).unwrap_or("?").to_string();
            self.fail_jobs_on(server, format!("connection to {} lost", address));
        }
    }

    fn fail_jobs_on(&mut self, server: ServerId, reason: String) {
        for request in self.jobs.values_mut().filter(|r| r.server() == Some(server)) {
            if request.fail(reason.clone()) {
                warn!("{} failed: {}", request.id(), reason);
                self.status_pending.remove(&request.id());
            }
        }
        self.routes.retain(|(s, _), _| *s != server);
    }

    fn settle(&mut self, id: JobId, deadline: Duration) -> Result<Bytes> {
        let request = self.jobs.get(&id).ok_or(GearError::UnknownJob(id))?;
        let handle = request.server_handle().unwrap_or_default().to_string();
        let outcome = match request.state() {
            JobState::Complete => Ok(request.result().cloned().unwrap_or_default()),
            JobState::Failed => Err(GearError::JobFailed {
                handle,
                reason: request.failure().unwrap_or("unknown failure").to_string(),
            }),
            JobState::Unknown => Err(GearError::Connection(NetworkError::Unavailable(
                request.failure().unwrap_or("no server handle").to_string(),
            ))),
            JobState::TimedOut | JobState::Submitted | JobState::Working => {
                Err(GearError::JobTimeout { handle, deadline })
            }
        };
        if !request.is_background() && request.is_finished() {
            self.discard(id);
        }
        outcome
    }
}

fn validate(submission: &Submission) -> Result<()> {
    if submission.function.is_empty() {
        return Err(GearError::InvalidArgument("function name must not be empty".into()));
    }
    if submission.function.contains('\0') {
        return Err(GearError::InvalidArgument(format!(
            "function name {:?} contains a NUL byte",
            submission.function
        )));
    }
    if let Some(unique) = &submission.unique {
        if unique.is_empty() || unique.contains('\0') {
            return Err(GearError::InvalidArgument(format!("invalid unique id {:?}", unique)));
        }
    }
    Ok(())
}

fn submit_packet(request: &JobRequest) -> Packet {
    let function = request.function().to_string();
    let unique = request.unique().to_string();
    let payload = request.payload().clone();
    if request.is_background() {
        Packet::SubmitJobBg {
            function,
            unique,
            payload,
        }
    } else {
        Packet::SubmitJob {
            function,
            unique,
            payload,
        }
    }
}

/// STATUS_RES 对请求的影响
///
/// 服务器不再认识的后台作业视为已完成(Gearman不回传后台作业结果)。
fn apply_status(request: &mut JobRequest, status: JobStatus) {
    if !status.known {
        if request.is_background() {
            request.complete(Bytes::new());
        } else {
            request.fail("job no longer known to the server");
        }
    } else if status.running {
        if status.denominator > 0 {
            request.on_status(status.numerator, status.denominator);
        } else {
            request.on_running();
        }
    }
}
