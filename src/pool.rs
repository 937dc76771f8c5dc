//! Job Server 连接池
//!
//! 每个配置的地址对应一个连接。连接集合只由连接池自身修改。

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::balancer::RoundRobinSelector;
use crate::network::{Connection, ConnectionStatus, NetworkError};
use crate::proto::Packet;
use crate::{GearError, ServerId};

/// 提交过程中收到的、属于其他作业的帧
pub type StrayFrames = Vec<(ServerId, Packet)>;

/// 连接池管理结构体
#[derive(Debug)]
pub struct ServerPool {
    connections: Vec<Connection>,
    selector: RoundRobinSelector,
}

impl ServerPool {
    /// 按给定顺序创建连接池(尚未连接)
    pub fn new<I, S>(addresses: I, connect_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            connections: addresses
                .into_iter()
                .map(|addr| Connection::new(addr, connect_timeout))
                .collect(),
            selector: RoundRobinSelector::new(),
        }
    }

    /// 尝试连接全部服务器，只有全部失败时才返回错误
    pub async fn connect_all(&mut self) -> Result<usize, GearError> {
        let mut connected = 0;
        for conn in self.connections.iter_mut() {
            if conn.is_connected() {
                connected += 1;
                continue;
            }
            match conn.connect().await {
                Ok(()) => connected += 1,
                Err(e) => warn!("Job server {} unreachable: {}", conn.address(), e),
            }
        }
        if connected == 0 {
            return Err(GearError::NoServersAvailable);
        }
        info!("{} of {} job servers connected", connected, self.connections.len());
        Ok(connected)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_connected()).count()
    }

    pub fn has_connected(&self) -> bool {
        self.connections.iter().any(Connection::is_connected)
    }

    pub fn connection(&self, server: ServerId) -> Option<&Connection> {
        self.connections.get(server)
    }

    pub fn connections(&self) -> impl Iterator<Item = (ServerId, &Connection)> {
        self.connections.iter().enumerate()
    }

    pub(crate) fn connections_mut(&mut self) -> impl Iterator<Item = (ServerId, &mut Connection)> {
        self.connections.iter_mut().enumerate()
    }

    pub fn address(&self, server: ServerId) -> Option<&str> {
        self.connections.get(server).map(Connection::address)
    }

    pub fn status(&self, server: ServerId) -> Option<ConnectionStatus> {
        self.connections.get(server).map(Connection::status)
    }

    /// 轮询选出一个已连接的服务器
    pub fn select(&mut self) -> Option<ServerId> {
        let available = self.availability();
        self.selector.select(&available)
    }

    fn availability(&self) -> Vec<bool> {
        self.connections.iter().map(Connection::is_connected).collect()
    }

    fn conn_mut(&mut self, server: ServerId) -> Result<&mut Connection, NetworkError> {
        self.connections
            .get_mut(server)
            .ok_or_else(|| NetworkError::NotConnected(format!("server #{}", server)))
    }

    /// 提交作业并等待JOB_CREATED
    ///
    /// 选中的连接出现传输错误时，换下一个可用连接重试一次。
    /// 等待期间收到的其他帧放入`strays`交还调用方。
    pub async fn submit(
        &mut self,
        packet: &Packet,
        response_timeout: Duration,
        strays: &mut StrayFrames,
    ) -> Result<(ServerId, String), GearError> {
        let first = self.select().ok_or(GearError::NoServersAvailable)?;
        let err = match self.submit_on(first, packet, response_timeout, strays).await {
            Ok(handle) => return Ok((first, handle)),
            Err(GearError::Connection(e)) => e,
            Err(other) => return Err(other),
        };
        warn!(
            "Submission to {} failed ({}), retrying on next server",
            self.address(first).unwrap_or("?"),
            err
        );

        let available = self.availability();
        let second = match self.selector.select_excluding(&available, first) {
            Some(second) => second,
            None => return Err(GearError::Connection(err)),
        };
        let handle = self.submit_on(second, packet, response_timeout, strays).await?;
        Ok((second, handle))
    }

    async fn submit_on(
        &mut self,
        server: ServerId,
        packet: &Packet,
        response_timeout: Duration,
        strays: &mut StrayFrames,
    ) -> Result<String, GearError> {
        let conn = self.conn_mut(server)?;
        conn.send(packet).await?;

        let deadline = Instant::now() + response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match conn.receive(Some(remaining)).await {
                Ok(Packet::JobCreated { handle }) => {
                    debug!("Job {} created on {}", handle, conn.address());
                    return Ok(handle);
                }
                Ok(Packet::Error { code, message }) => {
                    return Err(GearError::ServerError { code, message });
                }
                Ok(other) => strays.push((server, other)),
                Err(NetworkError::Timeout) => {
                    // 迟到的JOB_CREATED会与后续提交错位
                    conn.mark_failed();
                    return Err(GearError::Connection(NetworkError::Timeout));
                }
                Err(e) => {
                    conn.mark_failed();
                    return Err(GearError::Connection(e));
                }
            }
        }
    }

    /// 向指定服务器发送一帧，传输错误会使该连接失效
    pub async fn send(&mut self, server: ServerId, packet: &Packet) -> Result<(), NetworkError> {
        self.conn_mut(server)?.send(packet).await
    }

    /// 从指定服务器接收一帧
    pub async fn receive(&mut self, server: ServerId, deadline: Option<Duration>) -> Result<Packet, NetworkError> {
        self.conn_mut(server)?.receive(deadline).await
    }

    /// 非阻塞地从指定服务器取一帧
    pub fn try_receive(&mut self, server: ServerId) -> Result<Option<Packet>, NetworkError> {
        self.conn_mut(server)?.try_receive()
    }

    /// 向所有已连接服务器发送，返回成功数
    pub async fn broadcast(&mut self, packet: &Packet) -> usize {
        let mut sent = 0;
        for conn in self.connections.iter_mut().filter(|c| c.is_connected()) {
            match conn.send(packet).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Broadcast of {} to {} failed: {}", packet.name(), conn.address(), e),
            }
        }
        sent
    }

    /// 向所有已连接服务器声明函数
    ///
    /// 重复声明对服务器无副作用。
    pub async fn broadcast_registration(&mut self, function: &str, timeout: Option<Duration>) -> usize {
        let mut sent = 0;
        for conn in self.connections.iter_mut().filter(|c| c.is_connected()) {
            match conn.announce(function, timeout).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to announce {} to {}: {}", function, conn.address(), e),
            }
        }
        sent
    }

    /// 向所有已连接服务器撤销函数
    pub async fn broadcast_unregistration(&mut self, function: &str) -> usize {
        let mut sent = 0;
        for conn in self.connections.iter_mut().filter(|c| c.is_connected()) {
            match conn.withdraw(function).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to withdraw {} from {}: {}", function, conn.address(), e),
            }
        }
        sent
    }

    /// 标记连接失败，直到显式重连前不再被选中
    pub fn mark_failed(&mut self, server: ServerId) {
        if let Some(conn) = self.connections.get_mut(server) {
            if conn.status() != ConnectionStatus::Failed {
                warn!("Marking job server {} as failed", conn.address());
            }
            conn.mark_failed();
        }
    }

    /// 重连指定服务器
    pub async fn reconnect(&mut self, server: ServerId) -> Result<(), NetworkError> {
        self.conn_mut(server)?.connect().await
    }

    /// 重连所有失败或断开的服务器，返回重连成功的下标
    pub async fn reconnect_failed(&mut self) -> Vec<ServerId> {
        let mut restored = Vec::new();
        for (server, conn) in self.connections.iter_mut().enumerate() {
            if conn.is_connected() {
                continue;
            }
            match conn.connect().await {
                Ok(()) => restored.push(server),
                Err(e) => debug!("Reconnect to {} failed: {}", conn.address(), e),
            }
        }
        restored
    }

    /// 断开全部连接
    pub fn close_all(&mut self) {
        for conn in self.connections.iter_mut() {
            conn.disconnect();
        }
    }
}
