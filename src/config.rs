//! 客户端与工作节点配置
//!
//! 可通过JSON加载，所有时间字段以毫秒表示。

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// gearmand 默认端口
pub const DEFAULT_PORT: u16 = 4730;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("无效的终端地址格式: {0}")]
    InvalidEndpoint(String),
    #[error("未配置任何Job Server")]
    NoServers,
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("配置解析失败: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 验证终端地址格式(host:port)
pub fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    let mut parts = endpoint.rsplitn(2, ':');
    let port = parts.next().unwrap_or_default();
    let host = parts.next().unwrap_or_default();
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(ConfigError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(())
}

fn validate_servers(servers: &[String]) -> Result<(), ConfigError> {
    if servers.is_empty() {
        return Err(ConfigError::NoServers);
    }
    servers.iter().try_for_each(|s| validate_endpoint(s))
}

fn default_servers() -> Vec<String> {
    vec![format!("127.0.0.1:{}", DEFAULT_PORT)]
}

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 有序的服务器地址列表
    pub servers: Vec<String>,
    pub connect_timeout_ms: u64,
    /// 等待JOB_CREATED等应答的时长
    pub response_timeout_ms: u64,
    /// `do_job`未指定截止时间时使用；`None`表示无限等待
    pub default_deadline_ms: Option<u64>,
    /// 等待后台作业时查询状态的间隔
    pub status_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            connect_timeout_ms: 3_000,
            response_timeout_ms: 5_000,
            default_deadline_ms: None,
            status_interval_ms: 200,
        }
    }
}

impl ClientConfig {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_server(mut self, addr: impl Into<String>) -> Self {
        self.servers.push(addr.into());
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_servers(&self.servers)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

/// 工作节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub servers: Vec<String>,
    /// 通过SET_CLIENT_ID上报的标识
    pub client_id: Option<String>,
    pub connect_timeout_ms: u64,
    /// 没有任何帧时的短暂等待，休眠连接在此之后重新抢占作业
    pub idle_wait_ms: u64,
    /// 重连退避的初始间隔
    pub reconnect_base_ms: u64,
    /// 重连退避的上限
    pub reconnect_max_ms: u64,
    /// 使用GRAB_JOB_UNIQ以便处理函数拿到unique id
    pub grab_unique: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            client_id: None,
            connect_timeout_ms: 3_000,
            idle_wait_ms: 500,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            grab_unique: true,
        }
    }
}

impl WorkerConfig {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_server(mut self, addr: impl Into<String>) -> Self {
        self.servers.push(addr.into());
        self
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_servers(&self.servers)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms))
    }
}
