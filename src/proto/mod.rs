//! Gearman 二进制协议
//!
//! 字节布局需与gearmand完全一致。

pub mod codec;
pub mod packet;

pub use codec::{decode, encode, encode_to_bytes, ProtocolError, HEADER_LEN, MAX_PACKET_SIZE};
pub use packet::{Magic, Packet};
