//! 作业处理函数及其注册表

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;

use super::job::Job;
use crate::{GearError, Result};

/// 处理函数报告的失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

pub type HandlerResult = std::result::Result<Vec<u8>, HandlerError>;

/// 作业处理trait
///
/// 在阻塞线程池上执行，可以同步地做任意计算或I/O。
pub trait Handler: Send + Sync {
    fn handle(&self, job: &Job) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&Job) -> HandlerResult + Send + Sync,
{
    fn handle(&self, job: &Job) -> HandlerResult {
        self(job)
    }
}

/// 已注册的处理函数
#[derive(Clone)]
pub struct Registration {
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) timeout: Option<Duration>,
}

impl Registration {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("timeout", &self.timeout).finish()
    }
}

/// 函数名到处理函数的映射，可在多个工作节点间共享
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<RwLock<HashMap<String, Registration>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理函数，同名函数已存在时报错
    pub fn register<H>(&self, function: impl Into<String>, handler: H, timeout: Option<Duration>) -> Result<()>
    where
        H: Handler + 'static,
    {
        let function = function.into();
        if function.is_empty() || function.contains('\0') {
            return Err(GearError::InvalidArgument(format!("invalid function name {:?}", function)));
        }

        let mut map = self.inner.write();
        if map.contains_key(&function) {
            return Err(GearError::DuplicateRegistration(function));
        }
        map.insert(
            function,
            Registration {
                handler: Arc::new(handler),
                timeout,
            },
        );
        Ok(())
    }

    /// 移除处理函数，返回是否存在
    pub fn unregister(&self, function: &str) -> bool {
        self.inner.write().remove(function).is_some()
    }

    pub fn get(&self, function: &str) -> Option<Registration> {
        self.inner.read().get(function).cloned()
    }

    pub fn contains(&self, function: &str) -> bool {
        self.inner.read().contains_key(function)
    }

    /// 当前注册的函数名及超时
    pub fn snapshot(&self) -> Vec<(String, Option<Duration>)> {
        self.inner
            .read()
            .iter()
            .map(|(name, reg)| (name.clone(), reg.timeout))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("functions", &names).finish()
    }
}
