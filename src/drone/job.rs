//! 工作节点侧的作业上下文

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

/// 处理过程中发往服务器的中间更新
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobUpdate {
    Status { numerator: u32, denominator: u32 },
    Data(Bytes),
    Warning(Bytes),
}

/// 交给处理函数的作业
#[derive(Debug)]
pub struct Job {
    handle: String,
    function: String,
    unique: Option<String>,
    payload: Bytes,
    updates: Option<UnboundedSender<JobUpdate>>,
}

impl Job {
    pub(crate) fn new(
        handle: String,
        function: String,
        unique: Option<String>,
        payload: Bytes,
        updates: UnboundedSender<JobUpdate>,
    ) -> Self {
        Self {
            handle,
            function,
            unique,
            payload,
            updates: Some(updates),
        }
    }

    /// 不连接服务器的作业，便于直接测试处理函数
    pub fn detached(function: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            handle: String::new(),
            function: function.into(),
            unique: None,
            payload: payload.into(),
            updates: None,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// 仅在GRAB_JOB_UNIQ分配的作业上存在
    pub fn unique(&self) -> Option<&str> {
        self.unique.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// 上报进度(WORK_STATUS)
    pub fn send_status(&self, numerator: u32, denominator: u32) {
        self.push(JobUpdate::Status { numerator, denominator });
    }

    /// 上报部分结果(WORK_DATA)
    pub fn send_data(&self, chunk: impl Into<Bytes>) {
        self.push(JobUpdate::Data(chunk.into()));
    }

    /// WORK_WARNING
    pub fn send_warning(&self, message: impl Into<Bytes>) {
        self.push(JobUpdate::Warning(message.into()));
    }

    fn push(&self, update: JobUpdate) {
        if let Some(updates) = &self.updates {
            // 作业已结束时接收端已关闭
            let _ = updates.send(update);
        }
    }
}
