//! 点对点消息服务端
//!
//! 接受对端连接，为每个连接分配编号，并在持有者的 tick 中分发收到的数据包。

mod server;

pub use server::{PeerServer, ServerConfig, ServerEvent};
