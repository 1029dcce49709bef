pub mod listener;
pub mod tcp;
pub mod udp;

use crate::config::{Config, Protocol};
use crate::health::HealthEvent;
use crate::metrics::MetricsCollector;
use crate::reload::{ReloadError, ReloadManager, ShutdownReport};
use crate::router::SelectError;
use crate::stats::StatsSnapshot;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::info;

pub use listener::ListenerRegistry;

/// 代理服务器 - 引擎对外入口
///
/// `start` 绑定所有前端并启动初始拓扑的健康检查，`reload` 是唯一的变更入口，
/// `shutdown` 停止接收新连接并在超时内排空现有连接。
pub struct ProxyServer {
    reload_manager: Arc<ReloadManager>,
    metrics_collector: Arc<MetricsCollector>,
    start_time: Instant,
}

impl ProxyServer {
    pub fn new() -> Result<Self> {
        let metrics_collector = Arc::new(MetricsCollector::new()?);
        Ok(Self::with_reload_manager(
            Arc::new(ReloadManager::new(metrics_collector.clone())),
            metrics_collector,
        ))
    }

    pub fn with_reload_manager(
        reload_manager: Arc<ReloadManager>,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            reload_manager,
            metrics_collector,
            start_time: Instant::now(),
        }
    }

    /// 启动代理服务器
    pub async fn start(&self, config: Config) -> Result<u64, ReloadError> {
        if self.reload_manager.live().load().generation() != 0 {
            return Err(ReloadError::AlreadyStarted);
        }

        info!("Starting load balancer...");
        let generation = self.reload_manager.apply(config).await?;
        info!(
            "Load balancer started with {} frontends",
            self.reload_manager.live().load().frontends().len()
        );
        Ok(generation)
    }

    /// 重新加载配置，失败时当前拓扑保持不变
    pub async fn reload(&self, config: Config) -> Result<u64, ReloadError> {
        self.reload_manager.apply(config).await
    }

    /// 获取统计快照
    pub async fn get_stats(&self) -> StatsSnapshot {
        StatsSnapshot::capture(&self.reload_manager, self.start_time.elapsed()).await
    }

    /// 优雅关闭
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.reload_manager.shutdown(timeout).await
    }

    pub fn local_addr(&self, frontend: &str) -> Option<SocketAddr> {
        self.reload_manager
            .live()
            .load()
            .frontend(frontend)
            .map(|f| f.local_addr)
    }

    pub fn subscribe_health_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.reload_manager.subscribe_health_events()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics_collector
    }

    pub fn reload_manager(&self) -> &Arc<ReloadManager> {
        &self.reload_manager
    }

    /// 导出Prometheus指标，导出前刷新服务器仪表
    pub fn export_metrics(&self) -> Result<String> {
        self.metrics_collector
            .observe_topology(&self.reload_manager.live().load());
        self.metrics_collector.export_metrics()
    }
}

/// 连接信息
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub protocol: Protocol,
    pub frontend: String,
    pub client_addr: SocketAddr,
    pub server_addr: Option<SocketAddr>,
    pub generation: u64,
    pub start_time: Instant,
}

impl ConnectionInfo {
    pub fn new(protocol: Protocol, frontend: &str, client_addr: SocketAddr, generation: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            protocol,
            frontend: frontend.to_string(),
            client_addr,
            server_addr: None,
            generation,
            start_time: Instant::now(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// 中继活动记录 - 记录最后活动时间与双向字节数
#[derive(Debug)]
pub(crate) struct Activity {
    started: Instant,
    last_millis: AtomicU64,
    client_to_server: AtomicU64,
    server_to_client: AtomicU64,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            last_millis: AtomicU64::new(0),
            client_to_server: AtomicU64::new(0),
            server_to_client: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(now, Ordering::Relaxed);
    }

    pub(crate) fn record_upstream(&self, bytes: usize) {
        self.client_to_server
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn record_downstream(&self, bytes: usize) {
        self.server_to_client
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Time since the last byte moved in either direction.
    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    pub(crate) fn bytes(&self) -> (u64, u64) {
        (
            self.client_to_server.load(Ordering::Relaxed),
            self.server_to_client.load(Ordering::Relaxed),
        )
    }
}

/// 代理错误类型
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Select(#[from] SelectError),

    #[error("dial to server '{server}' ({address}) in backend '{backend}' failed: {source}")]
    DialFailed {
        backend: String,
        server: String,
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("backend '{0}' is not part of the topology")]
    UnknownBackend(String),

    #[error("connection idle for {0:?}")]
    IdleTimeout(Duration),

    #[error("connection force-closed after drain timeout")]
    ForceClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// 拒绝原因标签
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::Select(SelectError::NoEligibleServer(_)) => "no_eligible_server",
            ProxyError::Select(SelectError::AllServersBusy(_)) => "all_servers_busy",
            ProxyError::DialFailed { .. } => "dial_failed",
            ProxyError::UnknownBackend(_) => "unknown_backend",
            ProxyError::IdleTimeout(_) => "idle_timeout",
            ProxyError::ForceClosed => "force_closed",
            ProxyError::Io(_) => "io",
        }
    }
}

/// 代理结果
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    async fn tcp_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr
    }

    async fn udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    fn config(tcp_port: u16, udp_port: u16, check: &str) -> Config {
        Config::from_toml_str(&format!(
            r#"
[stats]
enabled = false
bind = "127.0.0.1:0"

[[frontends]]
name = "web"
bind_address = "127.0.0.1"
port = 0
protocol = "tcp"
backend = "web"

[[frontends]]
name = "dns"
bind_address = "127.0.0.1"
port = 0
protocol = "udp"
backend = "dns"

[[backends]]
name = "web"
protocol = "tcp"

[backends.check]
{check}

[[backends.servers]]
name = "echo"
address = "127.0.0.1"
port = {tcp_port}

[[backends]]
name = "dns"
protocol = "udp"

[[backends.servers]]
name = "echo"
address = "127.0.0.1"
port = {udp_port}
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_tcp_stream_round_trip() {
        let server = ProxyServer::new().unwrap();
        let tcp = tcp_echo().await;
        let udp = udp_echo().await;
        server
            .start(config(tcp.port(), udp.port(), "initial_state = \"up\""))
            .await
            .unwrap();

        let frontend = server.local_addr("web").unwrap();
        let mut client = TcpStream::connect(frontend).await.unwrap();

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let (mut read, mut write) = client.split();
        let writer = async {
            write.write_all(&payload).await.unwrap();
            write.shutdown().await.unwrap();
        };
        let mut echoed = Vec::new();
        let reader = read.read_to_end(&mut echoed);
        let (_, read_result) = tokio::join!(writer, reader);
        read_result.unwrap();
        assert_eq!(echoed, payload);

        let stats = server.get_stats().await;
        assert_eq!(stats.frontends[0].accepted, 1);

        let report = server.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.force_closed, 0);
    }

    #[tokio::test]
    async fn test_tcp_rejects_without_eligible_server() {
        let server = ProxyServer::new().unwrap();
        let tcp = tcp_echo().await;
        let udp = udp_echo().await;
        server
            .start(config(tcp.port(), udp.port(), "interval_ms = 60000"))
            .await
            .unwrap();

        let frontend = server.local_addr("web").unwrap();
        let mut client = TcpStream::connect(frontend).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("rejection must not hang");
        // RST 或 EOF
        assert!(matches!(read, Ok(0) | Err(_)));

        let stats = server.get_stats().await;
        assert_eq!(stats.frontends[0].rejected, 1);
        assert_eq!(stats.backends[0].servers[0].state, HealthState::Down);

        server.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_udp_datagram_round_trip() {
        let server = ProxyServer::new().unwrap();
        let tcp = tcp_echo().await;
        let udp = udp_echo().await;
        server
            .start(config(tcp.port(), udp.port(), "enabled = false"))
            .await
            .unwrap();

        let frontend = server.local_addr("dns").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];

        for message in [&b"query-1"[..], b"query-2"] {
            client.send_to(message, frontend).await.unwrap();
            let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], message);
            assert_eq!(from, frontend);
        }

        let stats = server.get_stats().await;
        let dns = stats.frontends.iter().find(|f| f.name == "dns").unwrap();
        // 同一客户端复用会话
        assert_eq!(dns.accepted, 1);

        server.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = ProxyServer::new().unwrap();
        let tcp = tcp_echo().await;
        let udp = udp_echo().await;
        let config = config(tcp.port(), udp.port(), "enabled = false");
        server.start(config.clone()).await.unwrap();
        assert!(matches!(
            server.start(config).await,
            Err(ReloadError::AlreadyStarted)
        ));
        server.shutdown(Duration::from_millis(100)).await;
    }
}
