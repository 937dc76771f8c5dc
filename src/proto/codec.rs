//! 帧编解码
//!
//! 帧格式: 4字节magic + 4字节类型(大端) + 4字节长度(大端) + 参数区。
//! 参数之间以单个NUL字节分隔。

use std::borrow::Cow;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::packet::*;

/// 帧头长度
pub const HEADER_LEN: usize = 12;

/// 单帧参数区上限
pub const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// 协议解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad frame magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u32),
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("{packet} expects {expected} arguments, got {found}")]
    MissingArguments {
        packet: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("text argument of {packet} is not valid UTF-8")]
    InvalidUtf8 { packet: &'static str },
    #[error("malformed number {value:?} in {packet}")]
    InvalidNumber { packet: &'static str, value: String },
}

/// 将数据包编码追加到`dst`
pub fn encode(magic: Magic, packet: &Packet, dst: &mut BytesMut) {
    let args = arguments(packet);
    let size = args.iter().map(|a| a.len()).sum::<usize>() + args.len().saturating_sub(1);

    dst.reserve(HEADER_LEN + size);
    dst.put_slice(magic.as_bytes());
    dst.put_u32(packet.code());
    dst.put_u32(size as u32);
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            dst.put_u8(0);
        }
        dst.put_slice(arg);
    }
}

/// 编码为独立的字节块
pub fn encode_to_bytes(magic: Magic, packet: &Packet) -> Bytes {
    let mut buf = BytesMut::new();
    encode(magic, packet, &mut buf);
    buf.freeze()
}

/// 从缓冲区解出一帧
///
/// 缓冲区数据不足一帧时返回`Ok(None)`且不消耗任何字节；
/// 成功时恰好消耗一帧。
pub fn decode(src: &mut BytesMut) -> Result<Option<(Magic, Packet)>, ProtocolError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    let magic = match Magic::from_bytes(&src[..4]) {
        Some(magic) => magic,
        None => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&src[..4]);
            return Err(ProtocolError::BadMagic(raw));
        }
    };

    let mut header = &src[4..HEADER_LEN];
    let code = header.get_u32();
    let size = header.get_u32() as usize;
    if size > MAX_PACKET_SIZE {
        return Err(ProtocolError::TooLarge {
            size,
            limit: MAX_PACKET_SIZE,
        });
    }

    if src.len() < HEADER_LEN + size {
        src.reserve(HEADER_LEN + size - src.len());
        return Ok(None);
    }

    src.advance(HEADER_LEN);
    let body = src.split_to(size).freeze();
    let packet = parse(code, body)?;
    Ok(Some((magic, packet)))
}

fn arguments(packet: &Packet) -> Vec<Cow<'_, [u8]>> {
    fn b(s: &str) -> Cow<'_, [u8]> {
        Cow::Borrowed(s.as_bytes())
    }
    fn n(v: u32) -> Cow<'static, [u8]> {
        Cow::Owned(v.to_string().into_bytes())
    }
    fn flag(v: bool) -> Cow<'static, [u8]> {
        Cow::Borrowed(if v { &b"1"[..] } else { &b"0"[..] })
    }

    match packet {
        Packet::ResetAbilities
        | Packet::PreSleep
        | Packet::Noop
        | Packet::GrabJob
        | Packet::GrabJobUniq
        | Packet::NoJob => Vec::new(),
        Packet::CanDo { function } | Packet::CantDo { function } => vec![b(function)],
        Packet::CanDoTimeout { function, timeout } => vec![b(function), n(*timeout)],
        Packet::SubmitJob {
            function,
            unique,
            payload,
        }
        | Packet::SubmitJobBg {
            function,
            unique,
            payload,
        } => vec![b(function), b(unique), Cow::Borrowed(&payload[..])],
        Packet::JobCreated { handle } | Packet::WorkFail { handle } | Packet::GetStatus { handle } => {
            vec![b(handle)]
        }
        Packet::JobAssign {
            handle,
            function,
            payload,
        } => vec![b(handle), b(function), Cow::Borrowed(&payload[..])],
        Packet::JobAssignUniq {
            handle,
            function,
            unique,
            payload,
        } => vec![b(handle), b(function), b(unique), Cow::Borrowed(&payload[..])],
        Packet::WorkStatus {
            handle,
            numerator,
            denominator,
        } => vec![b(handle), n(*numerator), n(*denominator)],
        Packet::WorkComplete { handle, payload }
        | Packet::WorkException { handle, payload }
        | Packet::WorkData { handle, payload }
        | Packet::WorkWarning { handle, payload } => vec![b(handle), Cow::Borrowed(&payload[..])],
        Packet::StatusRes {
            handle,
            known,
            running,
            numerator,
            denominator,
        } => vec![
            b(handle),
            flag(*known),
            flag(*running),
            n(*numerator),
            n(*denominator),
        ],
        Packet::EchoReq { payload } | Packet::EchoRes { payload } => vec![Cow::Borrowed(&payload[..])],
        Packet::SetClientId { id } => vec![b(id)],
        Packet::Error { code, message } => vec![b(code), b(message)],
    }
}

/// 类型编号对应的名称与参数个数
fn arity(code: u32) -> Option<(&'static str, usize)> {
    let entry = match code {
        CAN_DO => ("CAN_DO", 1),
        CANT_DO => ("CANT_DO", 1),
        RESET_ABILITIES => ("RESET_ABILITIES", 0),
        PRE_SLEEP => ("PRE_SLEEP", 0),
        NOOP => ("NOOP", 0),
        SUBMIT_JOB => ("SUBMIT_JOB", 3),
        JOB_CREATED => ("JOB_CREATED", 1),
        GRAB_JOB => ("GRAB_JOB", 0),
        NO_JOB => ("NO_JOB", 0),
        JOB_ASSIGN => ("JOB_ASSIGN", 3),
        WORK_STATUS => ("WORK_STATUS", 3),
        WORK_COMPLETE => ("WORK_COMPLETE", 2),
        WORK_FAIL => ("WORK_FAIL", 1),
        GET_STATUS => ("GET_STATUS", 1),
        ECHO_REQ => ("ECHO_REQ", 1),
        ECHO_RES => ("ECHO_RES", 1),
        SUBMIT_JOB_BG => ("SUBMIT_JOB_BG", 3),
        ERROR => ("ERROR", 2),
        STATUS_RES => ("STATUS_RES", 5),
        SET_CLIENT_ID => ("SET_CLIENT_ID", 1),
        CAN_DO_TIMEOUT => ("CAN_DO_TIMEOUT", 2),
        WORK_EXCEPTION => ("WORK_EXCEPTION", 2),
        WORK_DATA => ("WORK_DATA", 2),
        WORK_WARNING => ("WORK_WARNING", 2),
        GRAB_JOB_UNIQ => ("GRAB_JOB_UNIQ", 0),
        JOB_ASSIGN_UNIQ => ("JOB_ASSIGN_UNIQ", 4),
        _ => return None,
    };
    Some(entry)
}

/// 按NUL切分参数，最后一个参数保留剩余全部字节
fn split_args(body: Bytes, count: usize, packet: &'static str) -> Result<Vec<Bytes>, ProtocolError> {
    let mut args = Vec::with_capacity(count);
    if count == 0 {
        return Ok(args);
    }

    let mut rest = body;
    while args.len() + 1 < count {
        match rest.iter().position(|b| *b == 0) {
            Some(pos) => {
                args.push(rest.slice(..pos));
                rest = rest.slice(pos + 1..);
            }
            None => {
                return Err(ProtocolError::MissingArguments {
                    packet,
                    expected: count,
                    found: args.len() + 1,
                })
            }
        }
    }
    args.push(rest);
    Ok(args)
}

fn text(raw: Bytes, packet: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { packet })
}

fn number(raw: Bytes, packet: &'static str) -> Result<u32, ProtocolError> {
    std::str::from_utf8(&raw)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .ok_or_else(|| ProtocolError::InvalidNumber {
            packet,
            value: String::from_utf8_lossy(&raw).into_owned(),
        })
}

fn flag(raw: Bytes, packet: &'static str) -> Result<bool, ProtocolError> {
    number(raw, packet).map(|v| v != 0)
}

fn parse(code: u32, body: Bytes) -> Result<Packet, ProtocolError> {
    let (name, count) = arity(code).ok_or(ProtocolError::UnknownPacketType(code))?;
    let mut args = split_args(body, count, name)?.into_iter();
    let mut next = || args.next().unwrap_or_default();

    let packet = match code {
        CAN_DO => Packet::CanDo {
            function: text(next(), name)?,
        },
        CANT_DO => Packet::CantDo {
            function: text(next(), name)?,
        },
        CAN_DO_TIMEOUT => Packet::CanDoTimeout {
            function: text(next(), name)?,
            timeout: number(next(), name)?,
        },
        RESET_ABILITIES => Packet::ResetAbilities,
        PRE_SLEEP => Packet::PreSleep,
        NOOP => Packet::Noop,
        GRAB_JOB => Packet::GrabJob,
        GRAB_JOB_UNIQ => Packet::GrabJobUniq,
        NO_JOB => Packet::NoJob,
        SUBMIT_JOB => Packet::SubmitJob {
            function: text(next(), name)?,
            unique: text(next(), name)?,
            payload: next(),
        },
        SUBMIT_JOB_BG => Packet::SubmitJobBg {
            function: text(next(), name)?,
            unique: text(next(), name)?,
            payload: next(),
        },
        JOB_CREATED => Packet::JobCreated {
            handle: text(next(), name)?,
        },
        JOB_ASSIGN => Packet::JobAssign {
            handle: text(next(), name)?,
            function: text(next(), name)?,
            payload: next(),
        },
        JOB_ASSIGN_UNIQ => Packet::JobAssignUniq {
            handle: text(next(), name)?,
            function: text(next(), name)?,
            unique: text(next(), name)?,
            payload: next(),
        },
        WORK_STATUS => Packet::WorkStatus {
            handle: text(next(), name)?,
            numerator: number(next(), name)?,
            denominator: number(next(), name)?,
        },
        WORK_COMPLETE => Packet::WorkComplete {
            handle: text(next(), name)?,
            payload: next(),
        },
        WORK_FAIL => Packet::WorkFail {
            handle: text(next(), name)?,
        },
        WORK_EXCEPTION => Packet::WorkException {
            handle: text(next(), name)?,
            payload: next(),
        },
        WORK_DATA => Packet::WorkData {
            handle: text(next(), name)?,
            payload: next(),
        },
        WORK_WARNING => Packet::WorkWarning {
            handle: text(next(), name)?,
            payload: next(),
        },
        GET_STATUS => Packet::GetStatus {
            handle: text(next(), name)?,
        },
        STATUS_RES => Packet::StatusRes {
            handle: text(next(), name)?,
            known: flag(next(), name)?,
            running: flag(next(), name)?,
            numerator: number(next(), name)?,
            denominator: number(next(), name)?,
        },
        ECHO_REQ => Packet::EchoReq { payload: next() },
        ECHO_RES => Packet::EchoRes { payload: next() },
        SET_CLIENT_ID => Packet::SetClientId {
            id: text(next(), name)?,
        },
        ERROR => Packet::Error {
            code: text(next(), name)?,
            message: String::from_utf8_lossy(&next()).into_owned(),
        },
        other => return Err(ProtocolError::UnknownPacketType(other)),
    };
    Ok(packet)
}
