//! 单个Job Server连接
//!
//! 每个连接持有写半部分，读半部分交给后台读取任务；
//! 读取任务解出的帧按到达顺序进入有界通道。

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::proto::{self, Magic, Packet, ProtocolError};

/// 入站帧队列容量
const QUEUE_CAPACITY: usize = 64;
/// 读缓冲初始大小
const BUFFER_SIZE: usize = 4096;

/// 网络通信错误类型
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("connecting to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },
    #[error("connection to {0} closed by peer")]
    Disconnected(String),
    #[error("no frame received before the deadline")]
    Timeout,
    #[error("not connected to {0}")]
    NotConnected(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("job was not accepted by any server: {0}")]
    Unavailable(String),
}

impl NetworkError {
    /// 链路本身已不可用(需重连)
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NetworkError::Timeout)
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

type Inbound = Result<Packet, ProtocolError>;

/// 到单个Job Server的连接
pub struct Connection {
    address: String,
    status: ConnectionStatus,
    connect_timeout: Duration,
    writer: Option<OwnedWriteHalf>,
    inbound: Option<mpsc::Receiver<Inbound>>,
    reader: Option<JoinHandle<()>>,
    capabilities: BTreeSet<String>,
}

impl Connection {
    /// 创建未连接的连接对象
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            status: ConnectionStatus::Disconnected,
            connect_timeout,
            writer: None,
            inbound: None,
            reader: None,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// 本连接上已声明的函数
    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    /// 建立连接
    ///
    /// 已有链路会先被丢弃。服务器不会跨连接记住能力声明，
    /// 因此能力集合在这里清空。
    pub async fn connect(&mut self) -> Result<(), NetworkError> {
        self.teardown();
        self.status = ConnectionStatus::Connecting;
        debug!("Connecting to job server {}", self.address);

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.status = ConnectionStatus::Failed;
                return Err(NetworkError::Io(e));
            }
            Err(_) => {
                self.status = ConnectionStatus::Failed;
                return Err(NetworkError::ConnectTimeout {
                    address: self.address.clone(),
                    timeout: self.connect_timeout,
                });
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        self.reader = Some(tokio::spawn(read_loop(read_half, tx, self.address.clone())));
        self.writer = Some(write_half);
        self.inbound = Some(rx);
        self.status = ConnectionStatus::Connected;
        info!("Connected to job server {}", self.address);
        Ok(())
    }

    /// 发送一帧
    pub async fn send(&mut self, packet: &Packet) -> Result<(), NetworkError> {
        let writer = match self.writer.as_mut() {
            Some(writer) if self.status == ConnectionStatus::Connected => writer,
            _ => return Err(NetworkError::NotConnected(self.address.clone())),
        };

        let mut buf = BytesMut::new();
        proto::encode(Magic::Req, packet, &mut buf);
        if let Err(e) = writer.write_all(&buf).await {
            warn!("Failed to send {} to {}: {}", packet.name(), self.address, e);
            self.mark_failed();
            return Err(NetworkError::Io(e));
        }
        debug!("Sent {} to {}", packet.name(), self.address);
        Ok(())
    }

    /// 接收一帧
    ///
    /// `deadline`为`None`时一直等待。截止时间到达返回`Timeout`，
    /// 对端关闭返回`Disconnected`，两者之外的错误都会把连接标记为`Failed`。
    pub async fn receive(&mut self, deadline: Option<Duration>) -> Result<Packet, NetworkError> {
        let inbound = match self.inbound.as_mut() {
            Some(inbound) if self.status == ConnectionStatus::Connected => inbound,
            _ => return Err(NetworkError::NotConnected(self.address.clone())),
        };

        let next = match deadline {
            Some(d) => match tokio::time::timeout(d, inbound.recv()).await {
                Ok(next) => next,
                Err(_) => return Err(NetworkError::Timeout),
            },
            None => inbound.recv().await,
        };
        self.accept(next)
    }

    /// 非阻塞接收，没有就绪帧时返回`Ok(None)`
    pub fn try_receive(&mut self) -> Result<Option<Packet>, NetworkError> {
        let inbound = match self.inbound.as_mut() {
            Some(inbound) if self.status == ConnectionStatus::Connected => inbound,
            _ => return Err(NetworkError::NotConnected(self.address.clone())),
        };

        match inbound.try_recv() {
            Ok(next) => self.accept(Some(next)).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => self.accept(None).map(Some),
        }
    }

    fn accept(&mut self, next: Option<Inbound>) -> Result<Packet, NetworkError> {
        match next {
            Some(Ok(packet)) => {
                debug!("Received {} from {}", packet.name(), self.address);
                Ok(packet)
            }
            Some(Err(e)) => {
                warn!("Protocol violation from {}: {}", self.address, e);
                self.mark_failed();
                Err(NetworkError::Protocol(e))
            }
            None => {
                warn!("Job server {} closed the connection", self.address);
                self.mark_failed();
                Err(NetworkError::Disconnected(self.address.clone()))
            }
        }
    }

    /// 声明可执行的函数(CAN_DO / CAN_DO_TIMEOUT)
    pub async fn announce(&mut self, function: &str, timeout: Option<Duration>) -> Result<(), NetworkError> {
        let packet = match timeout {
            Some(t) => Packet::CanDoTimeout {
                function: function.to_string(),
                timeout: t.as_secs().max(1).min(u64::from(u32::MAX)) as u32,
            },
            None => Packet::CanDo {
                function: function.to_string(),
            },
        };
        self.send(&packet).await?;
        self.capabilities.insert(function.to_string());
        Ok(())
    }

    /// 撤销函数声明(CANT_DO)
    pub async fn withdraw(&mut self, function: &str) -> Result<(), NetworkError> {
        self.send(&Packet::CantDo {
            function: function.to_string(),
        })
        .await?;
        self.capabilities.remove(function);
        Ok(())
    }

    /// 标记为失败，直到显式重连前不可再用
    pub fn mark_failed(&mut self) {
        self.teardown();
        self.status = ConnectionStatus::Failed;
    }

    /// 主动断开
    pub fn disconnect(&mut self) {
        self.teardown();
        self.status = ConnectionStatus::Disconnected;
    }

    fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        self.inbound = None;
        self.capabilities.clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("status", &self.status)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// 后台读取任务：解帧并按序投递，链路关闭或协议错误时结束
async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<Inbound>, address: String) {
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);
    loop {
        loop {
            match proto::decode(&mut buf) {
                Ok(Some((magic, packet))) => {
                    if magic != Magic::Res {
                        debug!("{} sent {} with request magic", address, packet.name());
                    }
                    if tx.send(Ok(packet)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Read side of {} reached EOF", address);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read from {}: {}", address, e);
                return;
            }
        }
    }
}
