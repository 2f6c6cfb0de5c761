//! 服务端核心实现

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use protocol::{
    Connection, ConnectionConfig, ConnectionEvent, DisconnectReason, PacketKind, TcpListener,
    TransportListener, DEFAULT_HOST, DEFAULT_PORT, GREETING,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// 服务端配置
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// 监听地址，格式为 "host:port"
    pub bind_addr: String,
    /// 每个接受的连接使用的配置
    pub connection: ConnectionConfig,
    /// 接受连接后发送的问候消息
    pub greeting: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT),
            connection: ConnectionConfig::default(),
            greeting: GREETING.to_string(),
        }
    }
}

/// `update` 产生的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// 新连接加入名册
    Joined { id: u32 },
    /// 收到文本消息
    Message { id: u32, text: String },
    /// 连接离开名册
    Left { id: u32, reason: DisconnectReason },
}

/// 连接编号分配器，从 1 开始单调递增，不复用
struct IdentityAllocator {
    next: AtomicU32,
}

impl IdentityAllocator {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// 分配下一个编号，编号用尽后返回 None
    fn next(&self) -> Option<u32> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .ok()
    }
}

/// 服务端
///
/// 接受循环在后台任务中运行，新连接通过通道交给持有者；
/// 名册只在持有者调用 `update` 的上下文中修改。
pub struct PeerServer {
    config: ServerConfig,
    roster: HashMap<u32, Connection>,
    accepted: Option<mpsc::UnboundedReceiver<Connection>>,
    shutdown: CancellationToken,
    /// 接受循环以及关闭中的连接
    tasks: TaskTracker,
    local_addr: Option<SocketAddr>,
}

impl PeerServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            roster: HashMap::new(),
            accepted: None,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            local_addr: None,
        }
    }

    /// 绑定、监听并启动接受循环，返回实际监听地址
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        if self.shutdown.is_cancelled() {
            anyhow::bail!("server has been shut down");
        }
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        info!("Server listening on {}", addr);

        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        self.tasks.spawn(accept_loop(
            listener,
            accepted_tx,
            self.config.connection.clone(),
            self.config.greeting.clone(),
            self.shutdown.clone(),
        ));

        self.accepted = Some(accepted_rx);
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// 处理新连接与各连接的待处理数据包，不阻塞
    pub fn update(&mut self) -> Vec<ServerEvent> {
        let mut events = self.admit_new_connections();

        let mut departed = Vec::new();
        for (&id, connection) in self.roster.iter_mut() {
            // 对端发来的 Disconnect 决定离开原因，即使套接字随后出错
            let mut left = None;
            while let Some(packet) = connection.retrieve_next_packet() {
                match packet.kind {
                    PacketKind::Message => {
                        let text = packet.text().unwrap_or_default();
                        info!("[Client {}]: {}", id, text);
                        events.push(ServerEvent::Message { id, text });
                    }
                    PacketKind::Disconnect => {
                        connection.disconnect(DisconnectReason::Terminate);
                        left = Some(DisconnectReason::Terminate);
                    }
                    PacketKind::Ping | PacketKind::Pong => {}
                }
            }

            while let Some(event) = connection.poll_event() {
                if let ConnectionEvent::Disconnected(reason) = event {
                    left.get_or_insert(reason);
                }
            }

            if let Some(reason) = left {
                departed.push((id, reason));
            }
        }

        for (id, reason) in departed {
            self.roster.remove(&id);
            info!("Client {} disconnected ({})", id, reason);
            events.push(ServerEvent::Left { id, reason });
        }

        events
    }

    /// 关闭监听套接字，并通知、断开所有在线连接
    pub fn shutdown(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        self.admit_new_connections();
        for connection in self.roster.values() {
            connection.send_disconnect_signal();
            connection.disconnect(DisconnectReason::Terminate);
            self.tasks.spawn(connection.closed());
        }
        self.roster.clear();
        self.accepted = None;
        self.tasks.close();

        info!("Server shutdown");
    }

    /// 等待接受循环退出，以及关闭时的断开通知全部写出
    pub async fn wait_closed(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// 将接受循环交来的新连接加入名册
    fn admit_new_connections(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        let Some(accepted) = self.accepted.as_mut() else {
            return events;
        };
        while let Ok(connection) = accepted.try_recv() {
            if let Some(id) = connection.id() {
                self.roster.insert(id, connection);
                events.push(ServerEvent::Joined { id });
            }
        }
        events
    }

    /// 实际监听地址，未启动时为 None
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// 名册中的连接数
    pub fn connection_count(&self) -> usize {
        self.roster.len()
    }

    /// 名册中的连接编号（升序）
    pub fn connection_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.roster.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Drop for PeerServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 接受循环：分配编号、启动连接、发送问候，然后交给持有者
async fn accept_loop(
    listener: TcpListener,
    accepted: mpsc::UnboundedSender<Connection>,
    config: ConnectionConfig,
    greeting: String,
    shutdown: CancellationToken,
) {
    let ids = IdentityAllocator::new();

    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => result,
        };

        match result {
            Ok((transport, addr)) => {
                let Some(id) = ids.next() else {
                    warn!("Connection identities exhausted, rejecting {}", addr);
                    continue;
                };
                let mut connection = Connection::accepted(transport, id, config.clone());
                connection.begin_receive();
                connection.send_message(&greeting);
                info!("Client {} connected from {}", id, addr);

                if accepted.send(connection).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }

    debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{encode_frame, FrameAssembler, Packet, HEADER_SIZE};
    use std::io::Read;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::{sleep, timeout, Instant};

    fn test_config(heartbeat_ms: u64) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            connection: ConnectionConfig {
                heartbeat_timeout: Duration::from_millis(heartbeat_ms),
                ..ConnectionConfig::default()
            },
            greeting: GREETING.to_string(),
        }
    }

    fn client_for(addr: SocketAddr, heartbeat_ms: u64) -> Connection {
        let mut client = Connection::new(ConnectionConfig {
            heartbeat_timeout: Duration::from_millis(heartbeat_ms),
            ..ConnectionConfig::default()
        });
        client.connect(&addr.ip().to_string(), addr.port());
        client
    }

    /// 反复 update 直到收集到的事件满足条件
    async fn pump_until<F>(server: &mut PeerServer, mut done: F) -> Vec<ServerEvent>
    where
        F: FnMut(&PeerServer, &[ServerEvent]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut events = Vec::new();
        loop {
            events.extend(server.update());
            if done(&*server, &events[..]) {
                return events;
            }
            assert!(Instant::now() < deadline, "condition not met: {:?}", events);
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_identity_allocator_is_monotonic() {
        let ids = IdentityAllocator::new();
        let allocated: Vec<u32> = (0..100).filter_map(|_| ids.next()).collect();
        assert_eq!(allocated, (1..=100).collect::<Vec<u32>>());
    }

    #[test]
    fn test_identity_allocator_never_wraps() {
        let ids = IdentityAllocator {
            next: AtomicU32::new(u32::MAX - 1),
        };
        assert_eq!(ids.next(), Some(u32::MAX - 1));
        assert_eq!(ids.next(), None);
        assert_eq!(ids.next(), None);
    }

    #[tokio::test]
    async fn test_identities_unique_and_increasing() {
        let mut server = PeerServer::new(test_config(5_000));
        let addr = server.start().await.unwrap();

        let clients: Vec<Connection> = (0..5).map(|_| client_for(addr, 5_000)).collect();

        let events = pump_until(&mut server, |s, _| s.connection_count() == clients.len()).await;

        assert_eq!(server.connection_ids(), vec![1, 2, 3, 4, 5]);
        let joined: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Joined { id } => Some(*id),
                _ => None,
            })
            .collect();
        assert!(joined.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_greeting_and_message_dispatch() {
        let mut server = PeerServer::new(test_config(5_000));
        let addr = server.start().await.unwrap();

        let mut client = client_for(addr, 5_000);
        let greeting = timeout(Duration::from_secs(3), client.next_packet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(greeting, Packet::message(GREETING));

        client.send_message("hello");
        let events = pump_until(&mut server, |_, events| {
            events.iter().any(|e| matches!(e, ServerEvent::Message { .. }))
        })
        .await;

        assert!(events.contains(&ServerEvent::Joined { id: 1 }));
        assert!(events.contains(&ServerEvent::Message {
            id: 1,
            text: "hello".to_string()
        }));
        assert_eq!(server.connection_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_disconnect_signal_removes_connection() {
        let mut server = PeerServer::new(test_config(5_000));
        let addr = server.start().await.unwrap();

        let client = client_for(addr, 5_000);
        pump_until(&mut server, |s, _| s.connection_count() == 1).await;

        client.send_disconnect_signal();
        let events = pump_until(&mut server, |s, _| s.connection_count() == 0).await;

        assert!(events.contains(&ServerEvent::Left {
            id: 1,
            reason: DisconnectReason::Terminate
        }));
    }

    #[tokio::test]
    async fn test_disconnect_before_reset_counts_as_terminate() {
        let mut server = PeerServer::new(test_config(5_000));
        let addr = server.start().await.unwrap();

        let mut peer = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut bytes = encode_frame(&Packet::message("last words")).unwrap();
        bytes.extend(encode_frame(&Packet::disconnect()).unwrap());
        peer.write_all(&bytes).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        // 以 RST 关闭，服务端读端随之报错
        peer.set_linger(Some(Duration::ZERO)).unwrap();
        drop(peer);
        sleep(Duration::from_millis(100)).await;

        let events = pump_until(&mut server, |_, events| {
            events.iter().any(|e| matches!(e, ServerEvent::Left { .. }))
        })
        .await;

        assert!(events.contains(&ServerEvent::Message {
            id: 1,
            text: "last words".to_string()
        }));
        assert!(events.contains(&ServerEvent::Left {
            id: 1,
            reason: DisconnectReason::Terminate
        }));
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_connection_is_removed() {
        let mut server = PeerServer::new(test_config(200));
        let addr = server.start().await.unwrap();

        let client = client_for(addr, 5_000);
        pump_until(&mut server, |s, _| s.connection_count() == 1).await;

        drop(client);
        let events = pump_until(&mut server, |s, _| s.connection_count() == 0).await;

        assert!(events.contains(&ServerEvent::Left {
            id: 1,
            reason: DisconnectReason::Unreachable
        }));
    }

    #[tokio::test]
    async fn test_shutdown_notifies_peers_and_stops_accepting() {
        let mut server = PeerServer::new(test_config(5_000));
        let addr = server.start().await.unwrap();

        let mut client = client_for(addr, 5_000);
        pump_until(&mut server, |s, _| s.connection_count() == 1).await;

        server.shutdown();
        server.shutdown();
        assert_eq!(server.connection_count(), 0);

        let mut kinds = Vec::new();
        while let Ok(Some(packet)) = timeout(Duration::from_secs(3), client.next_packet()).await {
            kinds.push(packet.kind);
            if packet.kind == PacketKind::Disconnect {
                break;
            }
        }
        assert_eq!(kinds.last(), Some(&PacketKind::Disconnect));

        sleep(Duration::from_millis(100)).await;
        let mut late = client_for(addr, 5_000);
        let event = timeout(Duration::from_secs(3), late.next_event()).await.unwrap();
        assert_eq!(event, Some(ConnectionEvent::Refused));

        assert!(server.start().await.is_err());
    }

    #[test]
    fn test_shutdown_announcement_flushed_before_runtime_exit() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut server = PeerServer::new(test_config(5_000));
        let addr = runtime.block_on(server.start()).unwrap();
        let mut peer = std::net::TcpStream::connect(addr).unwrap();

        runtime.block_on(async {
            pump_until(&mut server, |s, _| s.connection_count() == 1).await;
            server.shutdown();
            timeout(Duration::from_secs(3), server.wait_closed())
                .await
                .unwrap();
        });
        drop(server);
        drop(runtime);

        peer.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let mut bytes = Vec::new();
        peer.read_to_end(&mut bytes).unwrap();

        let mut assembler = FrameAssembler::new(bytes.len().max(HEADER_SIZE));
        assembler.extend(&bytes);
        let mut kinds = Vec::new();
        while let Some(packet) = assembler.next_frame().unwrap() {
            kinds.push(packet.kind);
        }
        assert_eq!(kinds.last(), Some(&PacketKind::Disconnect));
    }
}
