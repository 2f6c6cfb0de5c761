//! 点对点消息传输协议库
//!
//! 包含:
//! - 数据包类型定义 (Packet, PacketKind)
//! - 传输层抽象 (Transport trait)
//! - 帧编解码与重组 (Codec)
//! - 连接封装，含心跳检测 (Connection)

mod packet;
mod constants;
mod transport;
mod codec;
mod connection;
mod event;
mod error;

pub use packet::{Packet, PacketKind};
pub use constants::*;
pub use transport::{Transport, TransportListener, TransportConfig, TcpTransport, TcpListener};
pub use codec::{decode_body, encode_body, encode_frame, FrameAssembler, FrameReader, FrameWriter};
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use event::{ConnectionEvent, DisconnectReason};
pub use error::{ProtocolError, Result};
