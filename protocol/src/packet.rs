//! 数据包类型定义

use serde::{Deserialize, Serialize};

/// 数据包类型标签
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// 心跳请求
    Ping,
    /// 心跳响应
    Pong,
    /// 主动断开通知
    Disconnect,
    /// 文本消息
    Message,
}

/// 应用层数据包
///
/// 控制类数据包（Ping/Pong/Disconnect）的 payload 为空，
/// Message 的 payload 为 UTF-8 文本字节。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl Packet {
    /// 创建指定类型、空 payload 的数据包
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    pub fn ping() -> Self {
        Self::new(PacketKind::Ping)
    }

    pub fn pong() -> Self {
        Self::new(PacketKind::Pong)
    }

    pub fn disconnect() -> Self {
        Self::new(PacketKind::Disconnect)
    }

    /// 创建文本消息
    pub fn message(text: &str) -> Self {
        Self {
            kind: PacketKind::Message,
            payload: text.as_bytes().to_vec(),
        }
    }

    /// Message 的文本内容（非法 UTF-8 会被替换）
    pub fn text(&self) -> Option<String> {
        match self.kind {
            PacketKind::Message => Some(String::from_utf8_lossy(&self.payload).into_owned()),
            _ => None,
        }
    }
}
