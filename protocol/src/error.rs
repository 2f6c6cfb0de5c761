//! 错误类型定义

use thiserror::Error;

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 包体编解码错误（截断或未知类型标签）
    #[error("Codec error: {0}")]
    Serialization(#[from] bincode::Error),

    /// 帧大小超过接收缓冲区
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,

    /// 地址解析失败
    #[error("Could not resolve address {0}")]
    Unresolved(String),
}

impl ProtocolError {
    /// 是否仅影响单个帧（流仍然对齐，可以继续接收）
    pub fn is_frame_local(&self) -> bool {
        matches!(self, ProtocolError::Serialization(_))
    }
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;
