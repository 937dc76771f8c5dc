//! GearPool 核心库入口
//!
//! Gearman风格的作业分发核心：多服务器客户端、作业请求状态机、
//! 以及工作节点(drone)的注册与执行循环。不包含Job Server本身。
//!
//! ```no_run
//! use gear_pool::{Client, ClientConfig};
//! use std::time::Duration;
//!
//! # async fn demo() -> gear_pool::Result<()> {
//! let mut client = Client::connect(ClientConfig::new(["127.0.0.1:4730"])).await?;
//! let result = client
//!     .do_job("ToUpper", "arbitrary binary data", Some(Duration::from_secs(5)))
//!     .await?;
//! assert_eq!(&result[..], b"ARBITRARY BINARY DATA");
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod client;
pub mod config;
pub mod drone;
pub mod engine;
pub mod network;
pub mod pool;
pub mod proto;

use std::time::Duration;

/// 服务器在连接池中的下标
pub type ServerId = usize;

/// 通用错误类型
#[derive(thiserror::Error, Debug)]
pub enum GearError {
    #[error("网络通信错误: {0}")]
    Connection(#[from] NetworkError),

    #[error("没有可用的Job Server")]
    NoServersAvailable,

    #[error("作业{handle}执行失败: {reason}")]
    JobFailed { handle: String, reason: String },

    #[error("作业{handle}在{deadline:?}内未完成")]
    JobTimeout { handle: String, deadline: Duration },

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("未注册的函数: {0}")]
    UnknownFunction(String),

    #[error("函数已注册: {0}")]
    DuplicateRegistration(String),

    #[error("Job Server返回错误 {code}: {message}")]
    ServerError { code: String, message: String },

    #[error("未知的作业请求: {0}")]
    UnknownJob(JobId),

    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, GearError>;

// 公开导出模块的公共接口
pub use client::{Client, JobId, JobRequest, JobState, JobStatus, Submission};
pub use config::{ClientConfig, ConfigError, WorkerConfig};
pub use drone::{Handler, HandlerError, HandlerRegistry, HandlerResult, Job, ShutdownHandle, Worker, WorkerState};
pub use engine::WorkerEngine;
pub use network::{Connection, ConnectionStatus, NetworkError};
pub use pool::ServerPool;
