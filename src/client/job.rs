//! 客户端作业请求及其状态机

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use uuid::Uuid;

use crate::ServerId;

/// 客户端内部的作业标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// 生成作业的unique id
pub fn generate_unique_id() -> String {
    Uuid::new_v4().to_string()
}

/// 作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Unknown,
    Submitted,
    Working,
    Complete,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed | JobState::TimedOut)
    }
}

/// GET_STATUS 的应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    pub known: bool,
    pub running: bool,
    pub numerator: u32,
    pub denominator: u32,
}

/// 待提交的作业描述
#[derive(Debug, Clone)]
pub struct Submission {
    pub(crate) function: String,
    pub(crate) payload: Bytes,
    pub(crate) unique: Option<String>,
    pub(crate) background: bool,
}

impl Submission {
    pub fn new(function: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            function: function.into(),
            payload: payload.into(),
            unique: None,
            background: false,
        }
    }

    /// 指定unique id，相同unique的作业会被服务器合并
    pub fn unique(mut self, unique: impl Into<String>) -> Self {
        self.unique = Some(unique.into());
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn is_background(&self) -> bool {
        self.background
    }
}

/// 单个已提交作业的生命周期记录
///
/// `result`当且仅当状态为`Complete`时存在；状态只向前推进。
#[derive(Debug, Clone)]
pub struct JobRequest {
    id: JobId,
    unique: String,
    function: String,
    payload: Bytes,
    background: bool,
    state: JobState,
    attempted: bool,
    server: Option<ServerId>,
    handle: Option<String>,
    result: Option<Bytes>,
    failure: Option<String>,
    progress: Option<(u32, u32)>,
    data: Vec<Bytes>,
    warnings: Vec<Bytes>,
    submitted_at: Option<Instant>,
}

impl JobRequest {
    pub(crate) fn new(id: JobId, submission: Submission) -> Self {
        Self {
            id,
            unique: submission.unique.unwrap_or_else(generate_unique_id),
            function: submission.function,
            payload: submission.payload,
            background: submission.background,
            state: JobState::Unknown,
            attempted: false,
            server: None,
            handle: None,
            result: None,
            failure: None,
            progress: None,
            data: Vec::new(),
            warnings: Vec::new(),
            submitted_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn unique(&self) -> &str {
        &self.unique
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn server(&self) -> Option<ServerId> {
        self.server
    }

    pub fn server_handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub fn result(&self) -> Option<&Bytes> {
        self.result.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// 最近一次WORK_STATUS报告的进度
    pub fn progress(&self) -> Option<(u32, u32)> {
        self.progress
    }

    /// WORK_DATA 分片
    pub fn data(&self) -> &[Bytes] {
        &self.data
    }

    pub fn warnings(&self) -> &[Bytes] {
        &self.warnings
    }

    pub fn submitted_at(&self) -> Option<Instant> {
        self.submitted_at
    }

    /// 已到达终态；从未拿到handle的提交也算作结束(状态保持`Unknown`)
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal() || (self.state == JobState::Unknown && self.attempted)
    }

    /// UNKNOWN -> SUBMITTED
    pub(crate) fn mark_submitted(&mut self, server: ServerId, handle: String) -> bool {
        if self.state != JobState::Unknown || self.attempted {
            return false;
        }
        self.attempted = true;
        self.state = JobState::Submitted;
        self.server = Some(server);
        self.handle = Some(handle);
        self.submitted_at = Some(Instant::now());
        true
    }

    /// 提交未拿到handle，状态停在UNKNOWN
    pub(crate) fn mark_unsubmitted(&mut self, reason: impl Into<String>) {
        if self.state == JobState::Unknown {
            self.attempted = true;
            self.failure = Some(reason.into());
        }
    }

    /// SUBMITTED -> WORKING，WORKING时只更新进度
    pub(crate) fn on_status(&mut self, numerator: u32, denominator: u32) -> bool {
        match self.state {
            JobState::Submitted | JobState::Working => {
                self.state = JobState::Working;
                self.progress = Some((numerator, denominator));
                true
            }
            _ => false,
        }
    }

    /// 服务器报告作业仍在运行(无进度信息)
    pub(crate) fn on_running(&mut self) -> bool {
        if self.state == JobState::Submitted {
            self.state = JobState::Working;
            return true;
        }
        false
    }

    pub(crate) fn on_data(&mut self, chunk: Bytes) -> bool {
        if self.is_live() {
            self.data.push(chunk);
            return true;
        }
        false
    }

    pub(crate) fn on_warning(&mut self, chunk: Bytes) -> bool {
        if self.is_live() {
            self.warnings.push(chunk);
            return true;
        }
        false
    }

    /// SUBMITTED/WORKING -> COMPLETE
    pub(crate) fn complete(&mut self, result: Bytes) -> bool {
        if !self.is_live() {
            return false;
        }
        self.state = JobState::Complete;
        self.result = Some(result);
        true
    }

    /// SUBMITTED/WORKING -> FAILED
    pub(crate) fn fail(&mut self, reason: impl Into<String>) -> bool {
        if !self.is_live() {
            return false;
        }
        self.state = JobState::Failed;
        self.failure = Some(reason.into());
        true
    }

    /// SUBMITTED/WORKING -> TIMED_OUT，只是本地停止等待
    pub(crate) fn time_out(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        self.state = JobState::TimedOut;
        true
    }

    fn is_live(&self) -> bool {
        matches!(self.state, JobState::Submitted | JobState::Working)
    }
}
