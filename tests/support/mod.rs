//! 测试用的进程内Gearman服务器
//!
//! 讲真实的二进制协议：排队作业、把结果转发给前台客户端、
//! 应答GET_STATUS/ECHO、支持PRE_SLEEP唤醒，以及强制关闭。
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use gear_pool::proto::{self, Magic, Packet};
use gear_pool::{ClientConfig, HandlerRegistry, ShutdownHandle, Worker, WorkerConfig};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type SessionId = u64;

pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// 测试用的客户端配置，缩短各项等待
pub fn client_config(servers: &[String]) -> ClientConfig {
    let mut config = ClientConfig::new(servers.iter().cloned());
    config.connect_timeout_ms = 1_000;
    config.response_timeout_ms = 2_000;
    config.status_interval_ms = 50;
    config
}

pub fn worker_config(servers: &[String]) -> WorkerConfig {
    let mut config = WorkerConfig::new(servers.iter().cloned());
    config.connect_timeout_ms = 1_000;
    config.idle_wait_ms = 50;
    config.reconnect_base_ms = 50;
    config.reconnect_max_ms = 200;
    config
}

/// 在后台运行一个工作节点
pub async fn spawn_worker(
    servers: &[String],
    registry: HandlerRegistry,
) -> (ShutdownHandle, JoinHandle<gear_pool::Result<()>>) {
    let mut worker = Worker::with_registry(worker_config(servers), registry).expect("worker config");
    worker.connect().await.expect("worker connect");
    let shutdown = worker.shutdown_handle();
    (shutdown, tokio::spawn(async move { worker.run_forever().await }))
}

/// 一个肯定没有服务监听的地址
pub fn unreachable_address() -> String {
    let port = portpicker::pick_unused_port().expect("no free port");
    format!("127.0.0.1:{}", port)
}

#[derive(Debug, Clone)]
struct JobRecord {
    function: String,
    unique: String,
    payload: bytes::Bytes,
    client: Option<SessionId>,
    worker: Option<SessionId>,
    numerator: u32,
    denominator: u32,
}

#[derive(Debug)]
struct Session {
    tx: mpsc::UnboundedSender<Packet>,
    abilities: HashSet<String>,
    sleeping: bool,
    client_id: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    next_session: SessionId,
    next_handle: u64,
    queue: VecDeque<String>,
    jobs: HashMap<String, JobRecord>,
    sessions: HashMap<SessionId, Session>,
    received: Vec<Packet>,
    drop_submissions: bool,
    drop_work_results: bool,
    ignore_abilities: bool,
}

impl State {
    fn send(&self, session: SessionId, packet: Packet) {
        if let Some(s) = self.sessions.get(&session) {
            let _ = s.tx.send(packet);
        }
    }

    fn wake_sleepers(&mut self, function: &str) {
        for session in self.sessions.values_mut() {
            if session.sleeping && session.abilities.contains(function) {
                session.sleeping = false;
                let _ = session.tx.send(Packet::Noop);
            }
        }
    }

    fn has_work_for(&self, session: SessionId) -> bool {
        let Some(s) = self.sessions.get(&session) else { return false };
        self.queue
            .iter()
            .filter_map(|h| self.jobs.get(h))
            .any(|job| s.abilities.contains(&job.function))
    }

    fn grab(&mut self, session: SessionId) -> Option<String> {
        let abilities = self.sessions.get(&session)?.abilities.clone();
        let position = self
            .queue
            .iter()
            .position(|h| {
                self.jobs
                    .get(h)
                    .map_or(false, |j| self.ignore_abilities || abilities.contains(&j.function))
            })?;
        let handle = self.queue.remove(position)?;
        if let Some(job) = self.jobs.get_mut(&handle) {
            job.worker = Some(session);
        }
        Some(handle)
    }

    fn forward(&self, handle: &str, packet: Packet) {
        if let Some(client) = self.jobs.get(handle).and_then(|j| j.client) {
            self.send(client, packet);
        }
    }

    fn handle(&mut self, session: SessionId, packet: Packet) {
        self.received.push(packet.clone());
        match packet {
            Packet::SubmitJob {
                function,
                unique,
                payload,
            }
            | Packet::SubmitJobBg {
                function,
                unique,
                payload,
            } if self.drop_submissions => {
                let _ = (function, unique, payload);
            }
            Packet::SubmitJob {
                function,
                unique,
                payload,
            } => self.submit(session, function, unique, payload, false),
            Packet::SubmitJobBg {
                function,
                unique,
                payload,
            } => self.submit(session, function, unique, payload, true),
            Packet::CanDo { function } | Packet::CanDoTimeout { function, .. } => {
                if let Some(s) = self.sessions.get_mut(&session) {
                    s.abilities.insert(function);
                }
            }
            Packet::CantDo { function } => {
                if let Some(s) = self.sessions.get_mut(&session) {
                    s.abilities.remove(&function);
                }
            }
            Packet::ResetAbilities => {
                if let Some(s) = self.sessions.get_mut(&session) {
                    s.abilities.clear();
                }
            }
            Packet::SetClientId { id } => {
                if let Some(s) = self.sessions.get_mut(&session) {
                    s.client_id = Some(id);
                }
            }
            Packet::PreSleep => {
                if self.has_work_for(session) {
                    self.send(session, Packet::Noop);
                } else if let Some(s) = self.sessions.get_mut(&session) {
                    s.sleeping = true;
                }
            }
            Packet::GrabJob => self.assign(session, false),
            Packet::GrabJobUniq => self.assign(session, true),
            Packet::WorkStatus {
                handle,
                numerator,
                denominator,
            } => {
                if let Some(job) = self.jobs.get_mut(&handle) {
                    job.numerator = numerator;
                    job.denominator = denominator;
                }
                self.forward(
                    &handle.clone(),
                    Packet::WorkStatus {
                        handle,
                        numerator,
                        denominator,
                    },
                );
            }
            Packet::WorkData { handle, payload } => {
                self.forward(&handle.clone(), Packet::WorkData { handle, payload })
            }
            Packet::WorkWarning { handle, payload } => {
                self.forward(&handle.clone(), Packet::WorkWarning { handle, payload })
            }
            Packet::WorkComplete { handle, payload } => {
                if !self.drop_work_results {
                    self.forward(&handle.clone(), Packet::WorkComplete { handle: handle.clone(), payload });
                }
                self.jobs.remove(&handle);
            }
            Packet::WorkFail { handle } => {
                if !self.drop_work_results {
                    self.forward(&handle.clone(), Packet::WorkFail { handle: handle.clone() });
                }
                self.jobs.remove(&handle);
            }
            Packet::WorkException { handle, payload } => {
                self.forward(&handle.clone(), Packet::WorkException { handle: handle.clone(), payload });
                self.jobs.remove(&handle);
            }
            Packet::GetStatus { handle } => {
                let reply = match self.jobs.get(&handle) {
                    Some(job) => Packet::StatusRes {
                        handle,
                        known: true,
                        running: job.worker.is_some(),
                        numerator: job.numerator,
                        denominator: job.denominator,
                    },
                    None => Packet::StatusRes {
                        handle,
                        known: false,
                        running: false,
                        numerator: 0,
                        denominator: 0,
                    },
                };
                self.send(session, reply);
            }
            Packet::EchoReq { payload } => self.send(session, Packet::EchoRes { payload }),
            other => self.send(
                session,
                Packet::Error {
                    code: "ERR_UNEXPECTED_PACKET".into(),
                    message: format!("unexpected {}", other.name()),
                },
            ),
        }
    }

    fn assign(&mut self, session: SessionId, with_unique: bool) {
        let reply = match self.grab(session).and_then(|h| self.jobs.get(&h).map(|j| (h, j.clone()))) {
            Some((handle, job)) if with_unique => Packet::JobAssignUniq {
                handle,
                function: job.function,
                unique: job.unique,
                payload: job.payload,
            },
            Some((handle, job)) => Packet::JobAssign {
                handle,
                function: job.function,
                payload: job.payload,
            },
            None => Packet::NoJob,
        };
        self.send(session, reply);
    }

    fn submit(&mut self, session: SessionId, function: String, unique: String, payload: bytes::Bytes, background: bool) {
        self.next_handle += 1;
        let handle = format!("H:fake:{}", self.next_handle);
        self.jobs.insert(
            handle.clone(),
            JobRecord {
                function: function.clone(),
                unique,
                payload,
                client: (!background).then_some(session),
                worker: None,
                numerator: 0,
                denominator: 0,
            },
        );
        self.queue.push_back(handle.clone());
        self.send(session, Packet::JobCreated { handle });
        self.wake_sleepers(&function);
    }

    fn disconnect(&mut self, session: SessionId) {
        self.sessions.remove(&session);
        let orphaned: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.worker == Some(session))
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in orphaned {
            if let Some(job) = self.jobs.get_mut(&handle) {
                job.worker = None;
                let function = job.function.clone();
                self.queue.push_front(handle);
                self.wake_sleepers(&function);
            }
        }
    }
}

/// 运行中的测试服务器，drop时关闭
pub struct FakeServer {
    address: String,
    state: Arc<Mutex<State>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    acceptor: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0").await
    }

    /// 在指定地址上启动，用于模拟服务器重启
    pub async fn start_on(address: &str) -> Self {
        let listener = TcpListener::bind(address).await.expect("bind fake server");
        let address = listener.local_addr().expect("local addr").to_string();
        let state = Arc::new(Mutex::new(State::default()));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let acceptor = {
            let state = state.clone();
            let tasks = tasks.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let handles = serve(stream, state.clone());
                    tasks.lock().extend(handles);
                }
            })
        };

        Self {
            address,
            state,
            tasks,
            acceptor,
        }
    }

    pub fn address(&self) -> String {
        self.address.clone()
    }

    /// 断开所有连接并停止监听
    pub fn shutdown(&self) {
        self.acceptor.abort();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// 不再应答提交(测试JOB_CREATED超时)
    pub fn set_drop_submissions(&self, drop: bool) {
        self.state.lock().drop_submissions = drop;
    }

    /// 不再转发作业结果(测试客户端超时)
    pub fn set_drop_work_results(&self, drop: bool) {
        self.state.lock().drop_work_results = drop;
    }

    /// 分配作业时不检查能力声明(模拟服务器持有过期的能力信息)
    pub fn set_ignore_abilities(&self, ignore: bool) {
        self.state.lock().ignore_abilities = ignore;
    }

    pub fn queued_jobs(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn known_jobs(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn abilities(&self) -> HashSet<String> {
        self.state
            .lock()
            .sessions
            .values()
            .flat_map(|s| s.abilities.iter().cloned())
            .collect()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .sessions
            .values()
            .filter_map(|s| s.client_id.clone())
            .collect()
    }

    /// 收到的指定类型帧数量
    pub fn received(&self, name: &str) -> usize {
        self.state.lock().received.iter().filter(|p| p.name() == name).count()
    }

    /// 轮询等待条件成立
    pub async fn wait_until<F>(&self, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut(&FakeServer) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }

    pub async fn wait_for_ability(&self, function: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, |server| server.abilities().contains(function)).await
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(stream: TcpStream, state: Arc<Mutex<State>>) -> [JoinHandle<()>; 2] {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

    let session = {
        let mut state = state.lock();
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            Session {
                tx,
                abilities: HashSet::new(),
                sleeping: false,
                client_id: None,
            },
        );
        id
    };

    let write_task = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let frame = proto::encode_to_bytes(Magic::Res, &packet);
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let read_task = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        'session: loop {
            loop {
                match proto::decode(&mut buf) {
                    Ok(Some((_, packet))) => state.lock().handle(session, packet),
                    Ok(None) => break,
                    Err(_) => break 'session,
                }
            }
            match reader.read_buf(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        state.lock().disconnect(session);
    });

    [read_task, write_task]
}
