//! 连接封装
//!
//! 每个连接在激活后运行三个异步任务：
//! - 接收任务独占 `FrameReader`，负责重组帧并按类型分发；
//! - 发送任务独占 `FrameWriter`，从通道取出数据包逐帧写出；
//! - 心跳任务定期发送 Ping，并在一个窗口内没有收到 Pong 时判定对端不可达。
//!
//! 三个任务共享同一个 `CancellationToken`，断开时一起停止，
//! 并登记在同一个 `TaskTracker` 上，持有者可以等待它们全部退出。
//! 应用数据包和生命周期事件通过通道交给持有者，持有者在自己的 tick 中取出。

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::ProtocolError;
use crate::event::{ConnectionEvent, DisconnectReason};
use crate::packet::{Packet, PacketKind};
use crate::transport::{TcpTransport, Transport, TransportConfig};
use crate::{HEARTBEAT_RECHECK_SLACK, HEARTBEAT_TIMEOUT, RECEIVE_BUFFER_SIZE};

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// 尚无 RTT 样本
const NO_SAMPLE: u64 = u64::MAX;

/// 连接配置
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// 心跳间隔，同时也是存活判定窗口
    pub heartbeat_timeout: Duration,
    /// 接收缓冲区容量，单帧不能超过它
    pub receive_buffer_size: usize,
    /// 传输层配置
    pub transport: TransportConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            receive_buffer_size: RECEIVE_BUFFER_SIZE,
            transport: TransportConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// 首次检查之后的复查间隔，比心跳间隔短 100ms
    pub fn recheck_interval(&self) -> Duration {
        self.heartbeat_timeout
            .saturating_sub(HEARTBEAT_RECHECK_SLACK)
            .max(Duration::from_millis(1))
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// TCP 握手进行中（仅客户端）
    Connecting = 0,
    /// 可以收发
    Active = 1,
    /// 终止状态
    Disconnected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// 连接各任务共享的状态
struct Shared {
    id: Option<u32>,
    config: ConnectionConfig,
    state: AtomicU8,
    /// 由持有者主动断开，之后不再交付任何数据包
    closed_locally: AtomicBool,
    /// 时间基准，Ping 时间戳以相对它的微秒数保存
    epoch: Instant,
    last_ping_at_us: AtomicU64,
    rtt_us: AtomicU64,
    outbound: mpsc::UnboundedSender<Packet>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// 原子地完成一次状态迁移，只有一个调用者会成功
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn name(&self) -> String {
        match self.id {
            Some(id) => format!("connection {}", id),
            None => "client connection".to_string(),
        }
    }

    /// 仅在 Active 状态下排队发送
    fn send(&self, packet: Packet) {
        if !self.is_active() {
            return;
        }
        let _ = self.outbound.send(packet);
    }

    fn ping(&self) {
        if !self.is_active() {
            return;
        }
        self.last_ping_at_us
            .store(self.epoch.elapsed().as_micros() as u64, Ordering::SeqCst);
        self.send(Packet::ping());
    }

    /// 记录一次 Pong，返回距离最近一次 Ping 的时间
    fn record_pong(&self) -> Duration {
        let now = self.epoch.elapsed().as_micros() as u64;
        let sent = self.last_ping_at_us.load(Ordering::SeqCst);
        let rtt = now.saturating_sub(sent);
        self.rtt_us.store(rtt, Ordering::SeqCst);
        Duration::from_micros(rtt)
    }

    fn disconnect(&self, reason: DisconnectReason) -> bool {
        let was_active = self.transition(ConnectionState::Active, ConnectionState::Disconnected);
        if !was_active
            && !self.transition(ConnectionState::Connecting, ConnectionState::Disconnected)
        {
            return false;
        }

        self.cancel.cancel();
        info!("{} disconnected ({})", self.name(), reason);
        self.emit(ConnectionEvent::Disconnected(reason));
        true
    }
}

/// 尚未启动的收发资源
struct Startup {
    outbound: mpsc::UnboundedReceiver<Packet>,
    inbound: mpsc::UnboundedSender<Packet>,
    /// 服务端 accept 得到的读写端；客户端在拨号成功后才有
    stream: Option<(BoxedReader, BoxedWriter)>,
}

/// 一条对端连接
///
/// 客户端通过 [`Connection::new`] 创建后调用 [`Connection::connect`]；
/// 服务端通过 [`Connection::accepted`] 包装已接受的套接字后调用
/// [`Connection::begin_receive`]。两者都需要在 Tokio 运行时中调用。
pub struct Connection {
    shared: Arc<Shared>,
    startup: Option<Startup>,
    inbound: mpsc::UnboundedReceiver<Packet>,
    pending: VecDeque<Packet>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Connection {
    fn with_state(
        id: Option<u32>,
        config: ConnectionConfig,
        state: ConnectionState,
        stream: Option<(BoxedReader, BoxedWriter)>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            id,
            config,
            state: AtomicU8::new(state as u8),
            closed_locally: AtomicBool::new(false),
            epoch: Instant::now(),
            last_ping_at_us: AtomicU64::new(0),
            rtt_us: AtomicU64::new(NO_SAMPLE),
            outbound: outbound_tx,
            events: event_tx,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        Self {
            shared,
            startup: Some(Startup {
                outbound: outbound_rx,
                inbound: inbound_tx,
                stream,
            }),
            inbound: inbound_rx,
            pending: VecDeque::new(),
            events: event_rx,
        }
    }

    /// 创建一个尚未连接的客户端连接
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_state(None, config, ConnectionState::Connecting, None)
    }

    /// 包装服务端已接受的连接，直接处于 Active 状态
    pub fn accepted<T: Transport>(transport: T, id: u32, config: ConnectionConfig) -> Self {
        let (reader, writer) = transport.split();
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self::with_state(Some(id), config, ConnectionState::Active, Some((reader, writer)))
    }

    /// 异步连接到 `host:port`，不等待结果
    ///
    /// 结果以 `Connected` 或 `Refused` 事件通知。已经发起过连接时什么也不做。
    pub fn connect(&mut self, host: &str, port: u16) {
        let startup = match self.startup.take() {
            Some(startup)
                if startup.stream.is_none()
                    && self.shared.state() == ConnectionState::Connecting =>
            {
                startup
            }
            other => {
                self.startup = other;
                debug!("{}: connect ignored, already started", self.shared.name());
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        let host = host.to_string();
        self.shared.tasks.spawn(async move {
            let result = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                result = TcpTransport::connect(&host, port, &shared.config.transport) => result,
            };

            match result {
                Ok(transport) => {
                    // 拨号期间可能已被本地断开
                    if !shared.transition(ConnectionState::Connecting, ConnectionState::Active) {
                        return;
                    }
                    info!("Connected to {}:{}", host, port);
                    shared.emit(ConnectionEvent::Connected);

                    let (reader, writer) = transport.split();
                    spawn_io(
                        shared,
                        startup.outbound,
                        startup.inbound,
                        Box::new(reader),
                        Box::new(writer),
                    );
                }
                Err(e) => {
                    if shared.transition(ConnectionState::Connecting, ConnectionState::Disconnected)
                    {
                        info!("Connection to {}:{} refused: {}", host, port, e);
                        shared.cancel.cancel();
                        shared.emit(ConnectionEvent::Refused);
                    }
                }
            }
        });
    }

    /// 启动服务端连接的接收循环与心跳
    ///
    /// 客户端连接在拨号成功后自动启动，调用它没有效果。
    pub fn begin_receive(&mut self) {
        if !self.shared.is_active() {
            return;
        }
        match self.startup.take() {
            Some(Startup {
                outbound,
                inbound,
                stream: Some((reader, writer)),
            }) => spawn_io(Arc::clone(&self.shared), outbound, inbound, reader, writer),
            other => self.startup = other,
        }
    }

    /// 发送数据包，未处于 Active 状态时什么也不做
    ///
    /// 写失败不会立即断开连接，由后续的接收错误或心跳超时发现。
    pub fn send(&self, packet: Packet) {
        self.shared.send(packet);
    }

    /// 发送文本消息
    pub fn send_message(&self, text: &str) {
        self.send(Packet::message(text));
    }

    /// 通知对端本端即将退出
    pub fn send_disconnect_signal(&self) {
        self.send(Packet::disconnect());
    }

    /// 断开连接，重复调用无效
    ///
    /// 之后不再交付任何数据包，包括已经收到但尚未取出的。
    pub fn disconnect(&self, reason: DisconnectReason) {
        self.shared.closed_locally.store(true, Ordering::SeqCst);
        self.shared.disconnect(reason);
    }

    /// 是否有待处理的应用数据包
    ///
    /// 本地断开后始终返回 false。因对端故障或心跳超时断开时，
    /// 断开前已收到的数据包仍可取出，取完为止。
    pub fn has_pending_packet(&mut self) -> bool {
        if self.shared.closed_locally.load(Ordering::SeqCst) {
            self.pending.clear();
            return false;
        }
        while let Ok(packet) = self.inbound.try_recv() {
            self.pending.push_back(packet);
        }
        !self.pending.is_empty()
    }

    /// 按接收顺序取出下一个应用数据包
    pub fn retrieve_next_packet(&mut self) -> Option<Packet> {
        if self.has_pending_packet() {
            self.pending.pop_front()
        } else {
            None
        }
    }

    /// 等待下一个应用数据包，连接断开且没有剩余数据包时返回 None
    pub async fn next_packet(&mut self) -> Option<Packet> {
        if self.has_pending_packet() {
            return self.pending.pop_front();
        }
        if self.shared.closed_locally.load(Ordering::SeqCst) {
            return None;
        }

        let cancel = self.shared.cancel.clone();
        tokio::select! {
            biased;
            packet = self.inbound.recv() => {
                packet.filter(|_| !self.shared.closed_locally.load(Ordering::SeqCst))
            }
            _ = cancel.cancelled() => {
                if self.has_pending_packet() {
                    self.pending.pop_front()
                } else {
                    None
                }
            }
        }
    }

    /// 停止接受新任务，返回在连接的全部后台任务退出时完成的 future
    ///
    /// 断开后等待它，可以确保断开前排队的数据包已经写出。
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let tasks = self.shared.tasks.clone();
        tasks.close();
        async move { tasks.wait().await }
    }

    /// 取出一个已发生的生命周期事件（不阻塞）
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.try_recv().ok()
    }

    /// 等待下一个生命周期事件
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// 服务端分配的编号，客户端连接为 None
    pub fn id(&self) -> Option<u32> {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// 最近一次 Ping/Pong 往返时间
    pub fn round_trip_time(&self) -> Option<Duration> {
        match self.shared.rtt_us.load(Ordering::SeqCst) {
            NO_SAMPLE => None,
            us => Some(Duration::from_micros(us)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // 停止后台任务，不产生事件
        self.shared.cancel.cancel();
    }
}

/// 启动发送、接收和心跳任务
fn spawn_io(
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Packet>,
    inbound: mpsc::UnboundedSender<Packet>,
    reader: BoxedReader,
    writer: BoxedWriter,
) {
    let (pong_tx, pong_rx) = mpsc::unbounded_channel();
    let capacity = shared.config.receive_buffer_size;
    let tasks = shared.tasks.clone();

    tasks.spawn(send_loop(
        FrameWriter::new(writer),
        outbound,
        shared.cancel.clone(),
    ));
    tasks.spawn(receive_loop(
        FrameReader::new(reader, capacity),
        Arc::clone(&shared),
        inbound,
        pong_tx,
    ));
    tasks.spawn(heartbeat_loop(shared, pong_rx));
}

async fn send_loop(
    mut writer: FrameWriter<BoxedWriter>,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            // 优先写出已排队的帧，断开前排队的数据也能送达
            biased;
            packet = outbound.recv() => {
                let Some(packet) = packet else { break };
                match writer.write_frame(&packet).await {
                    Ok(()) => {}
                    Err(e) if e.is_frame_local() => warn!("Dropping unencodable packet: {}", e),
                    Err(e) => {
                        debug!("Send failed: {}", e);
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    let _ = writer.shutdown().await;
}

async fn receive_loop(
    mut reader: FrameReader<BoxedReader>,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Packet>,
    pongs: mpsc::UnboundedSender<Duration>,
) {
    loop {
        let result = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            result = reader.read_frame() => result,
        };

        // 断开之后完成的读取一律丢弃
        if !shared.is_active() {
            return;
        }

        match result {
            Ok(packet) => match packet.kind {
                PacketKind::Ping => shared.send(Packet::pong()),
                PacketKind::Pong => {
                    let rtt = shared.record_pong();
                    debug!("{}: ping = {} ms", shared.name(), rtt.as_millis());
                    let _ = pongs.send(rtt);
                }
                PacketKind::Disconnect | PacketKind::Message => {
                    let _ = inbound.send(packet);
                }
            },
            Err(e) if e.is_frame_local() => {
                warn!("{}: dropping malformed frame: {}", shared.name(), e);
            }
            Err(ProtocolError::ConnectionClosed) => {
                // 对端关闭了写方向，交给心跳判定
                debug!("{}: peer closed its write half", shared.name());
                shared.cancel.cancelled().await;
                return;
            }
            Err(e) => {
                warn!("{}: receive failed: {}", shared.name(), e);
                shared.disconnect(DisconnectReason::Unreachable);
                return;
            }
        }
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, mut pongs: mpsc::UnboundedReceiver<Duration>) {
    shared.ping();

    let first_check = tokio::time::Instant::now() + shared.config.heartbeat_timeout;
    let mut checker = interval_at(first_check, shared.config.recheck_interval());
    checker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = checker.tick() => {}
        }

        if pongs.try_recv().is_err() {
            warn!("{}: no pong since last check", shared.name());
            shared.disconnect(DisconnectReason::Unreachable);
            return;
        }
        shared.ping();
    }
}
