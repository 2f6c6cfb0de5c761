//! 点对点消息客户端
//!
//! 管理到服务端的单条连接，在持有者的 tick 中输出状态与收到的消息。

mod client;

pub use client::{ClientEvent, PeerClient};
