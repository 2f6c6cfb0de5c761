//! 连接事件定义

use std::fmt;

/// 断开原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// 本地或对端主动断开
    Terminate,
    /// 套接字错误或心跳超时
    Unreachable,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Terminate => write!(f, "Graceful exit"),
            DisconnectReason::Unreachable => write!(f, "Host unreachable"),
        }
    }
}

/// 连接生命周期通知
///
/// 由连接内部的异步任务产生，按发生顺序排队，
/// 持有者在自己的 tick 中通过 `Connection::poll_event` 取出。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// TCP 连接建立成功（仅客户端）
    Connected,
    /// TCP 连接失败（仅客户端）
    Refused,
    /// 连接断开，每个连接至多一次
    Disconnected(DisconnectReason),
}
