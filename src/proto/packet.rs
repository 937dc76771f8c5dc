//! Gearman 数据包定义
//!
//! 每个变体对应一种数据包类型，参数按协议顺序排列。
//! 最后一个参数为不透明数据，可以包含NUL字节。

use bytes::Bytes;

/// 帧方向标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    /// `\0REQ` - 发往服务器
    Req,
    /// `\0RES` - 来自服务器
    Res,
}

impl Magic {
    pub const REQ: [u8; 4] = *b"\0REQ";
    pub const RES: [u8; 4] = *b"\0RES";

    pub fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Magic::Req => &Self::REQ,
            Magic::Res => &Self::RES,
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        match raw {
            b"\0REQ" => Some(Magic::Req),
            b"\0RES" => Some(Magic::Res),
            _ => None,
        }
    }
}

pub const CAN_DO: u32 = 1;
pub const CANT_DO: u32 = 2;
pub const RESET_ABILITIES: u32 = 3;
pub const PRE_SLEEP: u32 = 4;
pub const NOOP: u32 = 6;
pub const SUBMIT_JOB: u32 = 7;
pub const JOB_CREATED: u32 = 8;
pub const GRAB_JOB: u32 = 9;
pub const NO_JOB: u32 = 10;
pub const JOB_ASSIGN: u32 = 11;
pub const WORK_STATUS: u32 = 12;
pub const WORK_COMPLETE: u32 = 13;
pub const WORK_FAIL: u32 = 14;
pub const GET_STATUS: u32 = 15;
pub const ECHO_REQ: u32 = 16;
pub const ECHO_RES: u32 = 17;
pub const SUBMIT_JOB_BG: u32 = 18;
pub const ERROR: u32 = 19;
pub const STATUS_RES: u32 = 20;
pub const SET_CLIENT_ID: u32 = 22;
pub const CAN_DO_TIMEOUT: u32 = 23;
pub const WORK_EXCEPTION: u32 = 25;
pub const WORK_DATA: u32 = 28;
pub const WORK_WARNING: u32 = 29;
pub const GRAB_JOB_UNIQ: u32 = 30;
pub const JOB_ASSIGN_UNIQ: u32 = 31;

/// 协议数据包
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    CanDo { function: String },
    CanDoTimeout { function: String, timeout: u32 },
    CantDo { function: String },
    ResetAbilities,
    PreSleep,
    Noop,
    SubmitJob { function: String, unique: String, payload: Bytes },
    SubmitJobBg { function: String, unique: String, payload: Bytes },
    JobCreated { handle: String },
    GrabJob,
    GrabJobUniq,
    NoJob,
    JobAssign { handle: String, function: String, payload: Bytes },
    JobAssignUniq { handle: String, function: String, unique: String, payload: Bytes },
    WorkStatus { handle: String, numerator: u32, denominator: u32 },
    WorkComplete { handle: String, payload: Bytes },
    WorkFail { handle: String },
    WorkException { handle: String, payload: Bytes },
    WorkData { handle: String, payload: Bytes },
    WorkWarning { handle: String, payload: Bytes },
    GetStatus { handle: String },
    StatusRes { handle: String, known: bool, running: bool, numerator: u32, denominator: u32 },
    EchoReq { payload: Bytes },
    EchoRes { payload: Bytes },
    SetClientId { id: String },
    Error { code: String, message: String },
}

impl Packet {
    /// 数据包类型编号
    pub fn code(&self) -> u32 {
        match self {
            Packet::CanDo { .. } => CAN_DO,
            Packet::CanDoTimeout { .. } => CAN_DO_TIMEOUT,
            Packet::CantDo { .. } => CANT_DO,
            Packet::ResetAbilities => RESET_ABILITIES,
            Packet::PreSleep => PRE_SLEEP,
            Packet::Noop => NOOP,
            Packet::SubmitJob { .. } => SUBMIT_JOB,
            Packet::SubmitJobBg { .. } => SUBMIT_JOB_BG,
            Packet::JobCreated { .. } => JOB_CREATED,
            Packet::GrabJob => GRAB_JOB,
            Packet::GrabJobUniq => GRAB_JOB_UNIQ,
            Packet::NoJob => NO_JOB,
            Packet::JobAssign { .. } => JOB_ASSIGN,
            Packet::JobAssignUniq { .. } => JOB_ASSIGN_UNIQ,
            Packet::WorkStatus { .. } => WORK_STATUS,
            Packet::WorkComplete { .. } => WORK_COMPLETE,
            Packet::WorkFail { .. } => WORK_FAIL,
            Packet::WorkException { .. } => WORK_EXCEPTION,
            Packet::WorkData { .. } => WORK_DATA,
            Packet::WorkWarning { .. } => WORK_WARNING,
            Packet::GetStatus { .. } => GET_STATUS,
            Packet::StatusRes { .. } => STATUS_RES,
            Packet::EchoReq { .. } => ECHO_REQ,
            Packet::EchoRes { .. } => ECHO_RES,
            Packet::SetClientId { .. } => SET_CLIENT_ID,
            Packet::Error { .. } => ERROR,
        }
    }

    /// 协议中的数据包名称，用于日志
    pub fn name(&self) -> &'static str {
        match self {
            Packet::CanDo { .. } => "CAN_DO",
            Packet::CanDoTimeout { .. } => "CAN_DO_TIMEOUT",
            Packet::CantDo { .. } => "CANT_DO",
            Packet::ResetAbilities => "RESET_ABILITIES",
            Packet::PreSleep => "PRE_SLEEP",
            Packet::Noop => "NOOP",
            Packet::SubmitJob { .. } => "SUBMIT_JOB",
            Packet::SubmitJobBg { .. } => "SUBMIT_JOB_BG",
            Packet::JobCreated { .. } => "JOB_CREATED",
            Packet::GrabJob => "GRAB_JOB",
            Packet::GrabJobUniq => "GRAB_JOB_UNIQ",
            Packet::NoJob => "NO_JOB",
            Packet::JobAssign { .. } => "JOB_ASSIGN",
            Packet::JobAssignUniq { .. } => "JOB_ASSIGN_UNIQ",
            Packet::WorkStatus { .. } => "WORK_STATUS",
            Packet::WorkComplete { .. } => "WORK_COMPLETE",
            Packet::WorkFail { .. } => "WORK_FAIL",
            Packet::WorkException { .. } => "WORK_EXCEPTION",
            Packet::WorkData { .. } => "WORK_DATA",
            Packet::WorkWarning { .. } => "WORK_WARNING",
            Packet::GetStatus { .. } => "GET_STATUS",
            Packet::StatusRes { .. } => "STATUS_RES",
            Packet::EchoReq { .. } => "ECHO_REQ",
            Packet::EchoRes { .. } => "ECHO_RES",
            Packet::SetClientId { .. } => "SET_CLIENT_ID",
            Packet::Error { .. } => "ERROR",
        }
    }

    /// 数据包引用的作业句柄(如有)
    pub fn handle(&self) -> Option<&str> {
        match self {
            Packet::JobCreated { handle }
            | Packet::JobAssign { handle, .. }
            | Packet::JobAssignUniq { handle, .. }
            | Packet::WorkStatus { handle, .. }
            | Packet::WorkComplete { handle, .. }
            | Packet::WorkFail { handle }
            | Packet::WorkException { handle, .. }
            | Packet::WorkData { handle, .. }
            | Packet::WorkWarning { handle, .. }
            | Packet::GetStatus { handle }
            | Packet::StatusRes { handle, .. } => Some(handle),
            _ => None,
        }
    }
}
