//! 协议常量定义

use std::time::Duration;

/// 帧头大小: 4 字节小端长度
pub const HEADER_SIZE: usize = 4;

/// 接收缓冲区默认容量
pub const RECEIVE_BUFFER_SIZE: usize = 4096;

/// 默认监听/连接地址
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// 默认端口
pub const DEFAULT_PORT: u16 = 7777;

/// 心跳超时（毫秒）- 同时也是 Ping 间隔
pub const HEARTBEAT_TIMEOUT_MS: u64 = 1000;

/// 复查间隔比心跳超时短的部分（毫秒）
pub const HEARTBEAT_RECHECK_SLACK_MS: u64 = 100;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 服务端在接受连接后发送的问候消息
pub const GREETING: &str = "Greeting!";

/// 心跳超时 Duration
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

/// 复查间隔差值 Duration
pub const HEARTBEAT_RECHECK_SLACK: Duration = Duration::from_millis(HEARTBEAT_RECHECK_SLACK_MS);

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);
