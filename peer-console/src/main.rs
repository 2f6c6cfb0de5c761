//! 点对点消息控制台
//!
//! 以 host / client / server 三种模式之一运行。
//! 空行发送 "Ping"，其它输入原样发送，`quit`、EOF 或 Ctrl+C 退出。

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use peer_client::PeerClient;
use peer_server::{PeerServer, ServerConfig};
use protocol::{ConnectionConfig, DEFAULT_HOST, DEFAULT_PORT, HEARTBEAT_TIMEOUT_MS};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// 持有者 tick 间隔
const TICK_INTERVAL: Duration = Duration::from_millis(16);

/// 退出前等待断开通知写出的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// 空行时发送的消息
const DEFAULT_MESSAGE: &str = "Ping";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// 同一进程内同时运行服务端和客户端
    Host,
    /// 只运行客户端
    Client,
    /// 只运行服务端
    Server,
}

/// Minimal peer messaging over raw TCP
#[derive(Parser, Debug)]
#[command(name = "peer")]
#[command(version)]
#[command(about = "Minimal peer messaging over raw TCP", long_about = None)]
struct Cli {
    /// Run mode
    #[arg(value_enum)]
    mode: Mode,

    /// Address to listen on or connect to
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on or connect to
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Heartbeat interval and liveness window in milliseconds
    #[arg(long, default_value_t = HEARTBEAT_TIMEOUT_MS)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("peer_console=debug".parse()?)
                .add_directive("peer_server=debug".parse()?)
                .add_directive("peer_client=debug".parse()?)
                .add_directive("protocol=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let connection = ConnectionConfig {
        heartbeat_timeout: Duration::from_millis(cli.timeout_ms),
        ..ConnectionConfig::default()
    };

    let mut server = match cli.mode {
        Mode::Host | Mode::Server => {
            let mut server = PeerServer::new(ServerConfig {
                bind_addr: format!("{}:{}", cli.host, cli.port),
                connection: connection.clone(),
                ..ServerConfig::default()
            });
            server.start().await?;
            Some(server)
        }
        Mode::Client => None,
    };

    let mut client = match cli.mode {
        Mode::Host | Mode::Client => {
            let mut client = PeerClient::new(connection);
            client.connect(&cli.host, cli.port);
            Some(client)
        }
        Mode::Server => None,
    };

    info!("Running in {:?} mode", cli.mode);
    run(&mut server, &mut client).await?;

    if let Some(server) = server.as_mut() {
        server.shutdown();
    }
    if let Some(client) = client.as_mut() {
        client.disconnect();
        client.shutdown();
        client.update();
    }

    // 运行时退出前让发送任务把断开通知写出
    let drain = async {
        if let Some(server) = &server {
            server.wait_closed().await;
        }
        if let Some(client) = &client {
            client.wait_closed().await;
        }
    };
    if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Timed out waiting for connections to close");
    }

    Ok(())
}

/// tick 循环，直到用户退出
async fn run(server: &mut Option<PeerServer>, client: &mut Option<PeerClient>) -> Result<()> {
    let mut ticker = interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(server) = server.as_mut() {
                    server.update();
                }
                if let Some(client) = client.as_mut() {
                    client.update();
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Input closed");
                    break;
                };
                match line.trim() {
                    "quit" | "exit" => break,
                    "" => send(client.as_ref(), DEFAULT_MESSAGE),
                    text => send(client.as_ref(), text),
                }
            }

            // 监听 Ctrl+C 信号
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

fn send(client: Option<&PeerClient>, text: &str) {
    match client {
        Some(client) => client.send_message(text),
        None => debug!("No outbound connection in server mode, input ignored"),
    }
}
