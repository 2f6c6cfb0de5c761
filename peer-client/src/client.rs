//! 客户端核心实现

use std::time::Duration;

use protocol::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, DisconnectReason, PacketKind,
};
use tracing::{debug, info};

/// `update` 产生的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// 连接成功
    Connected,
    /// 连接被拒绝
    Refused,
    /// 连接断开
    Disconnected(DisconnectReason),
    /// 收到服务端消息
    Message(String),
}

/// 客户端
///
/// 只持有一条到服务端的连接。所有方法都不阻塞，
/// 需要在 Tokio 运行时中调用 `connect`。
pub struct PeerClient {
    config: ConnectionConfig,
    connection: Option<Connection>,
}

impl PeerClient {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            connection: None,
        }
    }

    /// 发起连接，已有未断开的连接时什么也不做
    pub fn connect(&mut self, host: &str, port: u16) {
        if let Some(connection) = &self.connection {
            if connection.state() != ConnectionState::Disconnected {
                debug!("Connect ignored: connection already in use");
                return;
            }
        }

        let mut connection = Connection::new(self.config.clone());
        connection.connect(host, port);
        info!("[Client]: Try connect to {}:{}", host, port);
        self.connection = Some(connection);
    }

    /// 发送文本消息
    pub fn send_message(&self, text: &str) {
        if let Some(connection) = &self.connection {
            connection.send_message(text);
        }
    }

    /// 通知服务端本端要离开，由服务端关闭连接
    pub fn disconnect(&self) {
        if let Some(connection) = &self.connection {
            connection.send_disconnect_signal();
        }
    }

    /// 立即在本地断开
    pub fn shutdown(&self) {
        if let Some(connection) = &self.connection {
            connection.disconnect(DisconnectReason::Terminate);
        }
    }

    /// 输出所有连接状态变化，并在每个 tick 处理一个待处理数据包
    pub fn update(&mut self) -> Vec<ClientEvent> {
        let Some(connection) = self.connection.as_mut() else {
            return Vec::new();
        };
        let mut events = Vec::new();

        while let Some(event) = connection.poll_event() {
            let event = match event {
                ConnectionEvent::Connected => {
                    info!("[Client]: Connection accepted");
                    ClientEvent::Connected
                }
                ConnectionEvent::Refused => {
                    info!("[Client]: Connection refused");
                    ClientEvent::Refused
                }
                ConnectionEvent::Disconnected(reason) => {
                    info!("[Client]: Disconnected (Reason: {})", reason);
                    ClientEvent::Disconnected(reason)
                }
            };
            events.push(event);
        }

        if let Some(packet) = connection.retrieve_next_packet() {
            match packet.kind {
                PacketKind::Message => {
                    let text = packet.text().unwrap_or_default();
                    info!("[Server]: {}", text);
                    events.push(ClientEvent::Message(text));
                }
                PacketKind::Disconnect => {
                    info!("[Client]: Server requested disconnect");
                    connection.disconnect(DisconnectReason::Terminate);
                }
                PacketKind::Ping | PacketKind::Pong => {}
            }
        }

        events
    }

    /// 等待连接的后台任务全部退出，断开前排队的数据包随之写出
    pub async fn wait_closed(&self) {
        if let Some(connection) = &self.connection {
            connection.closed().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_active())
    }

    /// 最近一次心跳往返时间
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.connection.as_ref().and_then(|c| c.round_trip_time())
    }
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}
