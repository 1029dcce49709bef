use super::listener::{AcceptBackoff, AcceptorContext};
use super::{Activity, ConnectionInfo, ProxyError};
use crate::config::Protocol;
use crate::metrics::MetricsCollector;
use crate::router::RoutingContext;
use crate::topology::{GenerationGuard, ListenerId, Server, ServerLease, Topology};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

const MAX_DATAGRAM: usize = 65_535;

/// UDP会话 - 客户端地址固定到一个服务器
struct UdpSession {
    id: String,
    server: Arc<Server>,
    backend: Arc<UdpSocket>,
    activity: Arc<Activity>,
    reply_task: JoinHandle<()>,
}

type SessionMap = Arc<RwLock<HashMap<SocketAddr, UdpSession>>>;

/// UDP接收循环，直到收到停止信号
///
/// 已建立的会话在停止后继续转发回包，直到空闲超时或所属代被强制关闭。
pub(crate) async fn run_acceptor(
    socket: Arc<UdpSocket>,
    id: ListenerId,
    mut stop: watch::Receiver<bool>,
    context: AcceptorContext,
) {
    let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    let mut backoff = AcceptBackoff::new();

    loop {
        let received = tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        match received {
            Ok((len, client_addr)) => {
                backoff.reset();
                handle_datagram(
                    &socket,
                    &sessions,
                    &context,
                    id,
                    client_addr,
                    &buffer[..len],
                )
                .await;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                error!(
                    "Failed to receive UDP datagram on listener {:?}: {}, retrying in {:?}",
                    id, e, delay
                );
                tokio::select! {
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    debug!("UDP acceptor for listener {:?} stopped", id);
}

/// 处理单个数据包
async fn handle_datagram(
    socket: &Arc<UdpSocket>,
    sessions: &SessionMap,
    context: &AcceptorContext,
    id: ListenerId,
    client_addr: SocketAddr,
    data: &[u8],
) {
    let topology = context.live.load();
    let Some(index) = topology.frontend_index(id) else {
        debug!("No route for listener {:?}, dropping datagram from {}", id, client_addr);
        return;
    };
    let frontend = &topology.frontends()[index];

    // 复用现有会话
    {
        let sessions = sessions.read().await;
        if let Some(session) = sessions.get(&client_addr) {
            if session.server.is_eligible() {
                match session.backend.send(data).await {
                    Ok(_) => {
                        session.activity.record_upstream(data.len());
                        context
                            .metrics
                            .record_udp_datagram(&frontend.name, "client_to_server", data.len());
                    }
                    Err(e) => debug!(
                        "[{}] Failed to forward datagram to {}: {}",
                        session.id,
                        session.server.address(),
                        e
                    ),
                }
                return;
            }
        }
    }

    // 固定的服务器不再可用，重新路由
    if let Some(stale) = sessions.write().await.remove(&client_addr) {
        debug!(
            "[{}] Evicting session of {} pinned to ineligible server {}/{}",
            stale.id,
            client_addr,
            stale.server.backend(),
            stale.server.name()
        );
        stale.reply_task.abort();
        context.metrics.udp_session_closed(&frontend.name);
    }

    match open_session(socket, sessions, &topology, index, client_addr, data, &context.metrics)
        .await
    {
        Ok(()) => {}
        Err(e) => {
            debug!(
                "Dropping datagram from {} on frontend '{}': {}",
                client_addr, frontend.name, e
            );
            frontend.record_rejected();
            context.metrics.record_rejection(&frontend.name, e.reason());
        }
    }
}

async fn open_session(
    socket: &Arc<UdpSocket>,
    sessions: &SessionMap,
    topology: &Arc<Topology>,
    frontend_index: usize,
    client_addr: SocketAddr,
    data: &[u8],
    metrics: &Arc<MetricsCollector>,
) -> Result<(), ProxyError> {
    let frontend = &topology.frontends()[frontend_index];
    let pool = topology
        .pool(&frontend.backend)
        .ok_or_else(|| ProxyError::UnknownBackend(frontend.backend.clone()))?;

    let key = pool.key_extractor().and_then(|extractor| extractor.extract(data));
    let selection = pool.select(&RoutingContext::new(client_addr, Protocol::Udp).with_key(key), &[])?;
    let server = selection.server().clone();

    let backend = match connect_backend(server.address()).await {
        Ok(backend) => Arc::new(backend),
        Err(source) => {
            server.record_dial_failure();
            metrics.record_dial_failure(server.backend(), server.name());
            return Err(ProxyError::DialFailed {
                backend: server.backend().to_string(),
                server: server.name().to_string(),
                address: server.address(),
                source,
            });
        }
    };

    backend.send(data).await?;

    let info = ConnectionInfo::new(Protocol::Udp, &frontend.name, client_addr, topology.generation());
    debug!(
        "[{}] New UDP session {} -> {}/{} ({})",
        info.id,
        client_addr,
        server.backend(),
        server.name(),
        server.address()
    );

    frontend.record_accepted();
    metrics.record_connection(&frontend.name);
    metrics.udp_session_opened(&frontend.name);
    metrics.record_udp_datagram(&frontend.name, "client_to_server", data.len());

    let activity = Arc::new(Activity::new());
    activity.record_upstream(data.len());

    let reply = ReplyTask {
        info: info.clone(),
        frontend_socket: socket.clone(),
        backend: backend.clone(),
        activity: activity.clone(),
        sessions: sessions.clone(),
        metrics: metrics.clone(),
        guard: topology.enter(),
        lease: selection.lease,
    };

    sessions.write().await.insert(
        client_addr,
        UdpSession {
            id: info.id,
            server,
            backend,
            activity,
            reply_task: tokio::spawn(reply.run()),
        },
    );

    Ok(())
}

/// 为会话创建连接到服务器的本地套接字
async fn connect_backend(server: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(server).await?;
    Ok(socket)
}

/// 会话回包任务，持有服务器连接计数与所属代
struct ReplyTask {
    info: ConnectionInfo,
    frontend_socket: Arc<UdpSocket>,
    backend: Arc<UdpSocket>,
    activity: Arc<Activity>,
    sessions: SessionMap,
    metrics: Arc<MetricsCollector>,
    guard: GenerationGuard,
    lease: ServerLease,
}

impl ReplyTask {
    async fn run(self) {
        let idle_window = self.guard.topology().settings().udp_session_idle();
        let mut closed = self.guard.closed();
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        let reason = loop {
            let remaining = idle_window.saturating_sub(self.activity.idle_for());
            if remaining.is_zero() {
                break "idle";
            }

            let received = tokio::select! {
                received = timeout(remaining, self.backend.recv(&mut buffer)) => received,
                _ = closed.wait_for(|closed| *closed) => break "force-closed",
            };

            match received {
                Ok(Ok(n)) => {
                    self.activity.record_downstream(n);
                    self.metrics
                        .record_udp_datagram(&self.info.frontend, "server_to_client", n);
                    if let Err(e) = self
                        .frontend_socket
                        .send_to(&buffer[..n], self.info.client_addr)
                        .await
                    {
                        warn!(
                            "[{}] Failed to send reply to {}: {}",
                            self.info.id, self.info.client_addr, e
                        );
                    }
                }
                Ok(Err(e)) => {
                    debug!(
                        "[{}] Receive from {} failed: {}",
                        self.info.id,
                        self.lease.address(),
                        e
                    );
                    break "backend error";
                }
                // 重新计算剩余空闲时间
                Err(_) => continue,
            }
        };

        let (up, down) = self.activity.bytes();
        debug!(
            "[{}] UDP session {} closed ({}) after {:?}: sent {} bytes, received {} bytes",
            self.info.id,
            self.info.client_addr,
            reason,
            self.info.duration(),
            up,
            down
        );

        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&self.info.client_addr)
            .is_some_and(|s| s.id == self.info.id)
        {
            sessions.remove(&self.info.client_addr);
            self.metrics.udp_session_closed(&self.info.frontend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, HealthState};
    use crate::topology::{ListenerBinding, LiveTopology};
    use std::time::Duration;

    async fn echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    async fn setup(first: u16, second: u16, idle_secs: u64) -> (Arc<UdpSocket>, SessionMap, AcceptorContext) {
        let config = Config::from_toml_str(&format!(
            r#"
[engine]
udp_session_idle_secs = {idle_secs}

[[frontends]]
name = "vpn"
bind_address = "127.0.0.1"
port = 0
protocol = "udp"
backend = "vpn"

[[backends]]
name = "vpn"
protocol = "udp"

[backends.check]
enabled = true
port = 1
initial_state = "up"

[[backends.servers]]
name = "gw1"
address = "127.0.0.1"
port = {first}

[[backends.servers]]
name = "gw2"
address = "127.0.0.1"
port = {second}
"#
        ))
        .unwrap();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let bindings = HashMap::from([(
            "vpn".to_string(),
            ListenerBinding {
                id: ListenerId(1),
                local_addr: socket.local_addr().unwrap(),
            },
        )]);
        let topology = Topology::build(&config, 1, &bindings, None).await.unwrap();
        let context = AcceptorContext {
            live: Arc::new(LiveTopology::new(topology)),
            metrics: Arc::new(MetricsCollector::new().unwrap()),
        };
        (socket, Arc::new(RwLock::new(HashMap::new())), context)
    }

    #[tokio::test]
    async fn test_session_pinned_to_one_server() {
        let (socket, sessions, context) = setup(echo().await.port(), echo().await.port(), 30).await;
        let client: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        for _ in 0..3 {
            handle_datagram(&socket, &sessions, &context, ListenerId(1), client, b"ping").await;
        }

        let sessions_guard = sessions.read().await;
        assert_eq!(sessions_guard.len(), 1);
        assert_eq!(sessions_guard[&client].server.name(), "gw1");
        assert_eq!(sessions_guard[&client].server.active_connections(), 1);
        assert_eq!(context.live.load().frontends()[0].accepted(), 1);
    }

    #[tokio::test]
    async fn test_session_evicted_when_server_goes_down() {
        let (socket, sessions, context) = setup(echo().await.port(), echo().await.port(), 30).await;
        let client: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        handle_datagram(&socket, &sessions, &context, ListenerId(1), client, b"hello").await;
        let pinned = sessions.read().await[&client].server.clone();
        pinned.set_health_state(HealthState::Down);

        handle_datagram(&socket, &sessions, &context, ListenerId(1), client, b"again").await;
        let current = sessions.read().await[&client].server.clone();
        assert_ne!(current.name(), pinned.name());

        // 被驱逐会话的连接计数已归还
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pinned.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_datagram_dropped_without_eligible_server() {
        let (socket, sessions, context) = setup(echo().await.port(), echo().await.port(), 30).await;
        for server in context.live.load().pool("vpn").unwrap().servers() {
            server.set_health_state(HealthState::Down);
        }

        let client: SocketAddr = "127.0.0.1:40003".parse().unwrap();
        handle_datagram(&socket, &sessions, &context, ListenerId(1), client, b"lost").await;

        assert!(sessions.read().await.is_empty());
        assert_eq!(context.live.load().frontends()[0].rejected(), 1);
    }

    #[tokio::test]
    async fn test_idle_session_expires() {
        let (socket, sessions, context) = setup(echo().await.port(), echo().await.port(), 1).await;
        let client: SocketAddr = "127.0.0.1:40004".parse().unwrap();

        handle_datagram(&socket, &sessions, &context, ListenerId(1), client, b"once").await;
        let server = sessions.read().await[&client].server.clone();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(sessions.read().await.is_empty());
        assert_eq!(server.active_connections(), 0);
        assert_eq!(context.live.load().active_connections(), 0);
    }
}
