//! Bound frontend sockets and the acceptor tasks that serve them.
//!
//! Sockets outlive topology generations: a reload first prepares the sockets
//! the new config needs (reusing or adopting existing ones, binding the rest)
//! and only commits the change after the new topology is live. Acceptors find
//! their route by [`ListenerId`] in whatever topology is live at accept time.

use crate::config::{Config, Protocol};
use crate::metrics::MetricsCollector;
use crate::reload::ReloadError;
use crate::topology::{ListenerBinding, ListenerId, LiveTopology};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// 已绑定的前端套接字
#[derive(Debug, Clone)]
pub enum BoundSocket {
    Tcp(Arc<TcpListener>),
    Udp(Arc<UdpSocket>),
}

impl BoundSocket {
    async fn bind(protocol: Protocol, addr: SocketAddr) -> std::io::Result<Self> {
        Ok(match protocol {
            Protocol::Tcp => BoundSocket::Tcp(Arc::new(TcpListener::bind(addr).await?)),
            Protocol::Udp => BoundSocket::Udp(Arc::new(UdpSocket::bind(addr).await?)),
        })
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            BoundSocket::Tcp(listener) => listener.local_addr(),
            BoundSocket::Udp(socket) => socket.local_addr(),
        }
    }
}

/// 接收任务共享的上下文
#[derive(Clone)]
pub(crate) struct AcceptorContext {
    pub live: Arc<LiveTopology>,
    pub metrics: Arc<MetricsCollector>,
}

/// Exponential backoff for a failing accept loop.
#[derive(Debug)]
pub(crate) struct AcceptBackoff {
    current: Duration,
}

impl AcceptBackoff {
    pub(crate) fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

struct ListenerEntry {
    id: ListenerId,
    frontend: String,
    protocol: Protocol,
    configured: SocketAddr,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum Source {
    Existing,
    New(BoundSocket),
}

struct Assignment {
    frontend: String,
    protocol: Protocol,
    configured: SocketAddr,
    binding: ListenerBinding,
    source: Source,
}

/// 一次重载准备好的监听器，提交前丢弃会关闭新绑定的套接字
pub struct PreparedListeners {
    assignments: Vec<Assignment>,
}

impl PreparedListeners {
    pub fn bindings(&self) -> HashMap<String, ListenerBinding> {
        self.assignments
            .iter()
            .map(|a| (a.frontend.clone(), a.binding))
            .collect()
    }

    pub fn new_binds(&self) -> usize {
        self.assignments
            .iter()
            .filter(|a| matches!(a.source, Source::New(_)))
            .count()
    }
}

/// 监听器注册表
pub struct ListenerRegistry {
    context: AcceptorContext,
    next_id: AtomicU64,
    entries: Mutex<Vec<ListenerEntry>>,
}

impl ListenerRegistry {
    pub(crate) fn new(context: AcceptorContext) -> Self {
        Self {
            context,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Resolves the socket for every frontend in `config`.
    ///
    /// A frontend keeps its socket when name, protocol and bind address are
    /// unchanged. A renamed frontend adopts the socket already bound to its
    /// protocol and address. Everything else is bound here, so a bind failure
    /// aborts the reload before anything live changes.
    pub async fn prepare(&self, config: &Config) -> Result<PreparedListeners, ReloadError> {
        let entries = self.entries.lock().await;
        let mut claimed = HashSet::new();
        let mut assignments = Vec::with_capacity(config.frontends.len());

        for frontend in &config.frontends {
            let configured = frontend.bind_addr()?;

            let same = entries.iter().find(|e| {
                e.frontend == frontend.name
                    && e.protocol == frontend.protocol
                    && e.configured == configured
            });
            let existing = same.or_else(|| {
                (configured.port() != 0)
                    .then(|| {
                        entries.iter().find(|e| {
                            !claimed.contains(&e.id)
                                && e.protocol == frontend.protocol
                                && e.configured == configured
                        })
                    })
                    .flatten()
            });

            if let Some(entry) = existing.filter(|e| !claimed.contains(&e.id)) {
                if entry.frontend != frontend.name {
                    info!(
                        "Frontend '{}' adopts {} listener {} from '{}'",
                        frontend.name, entry.protocol, entry.local_addr, entry.frontend
                    );
                }
                claimed.insert(entry.id);
                assignments.push(Assignment {
                    frontend: frontend.name.clone(),
                    protocol: frontend.protocol,
                    configured,
                    binding: ListenerBinding {
                        id: entry.id,
                        local_addr: entry.local_addr,
                    },
                    source: Source::Existing,
                });
                continue;
            }

            let socket = BoundSocket::bind(frontend.protocol, configured)
                .await
                .map_err(|source| ReloadError::Bind {
                    frontend: frontend.name.clone(),
                    addr: configured,
                    source,
                })?;
            let local_addr = socket.local_addr().map_err(|source| ReloadError::Bind {
                frontend: frontend.name.clone(),
                addr: configured,
                source,
            })?;
            let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
            debug!(
                "Bound {} listener {} for frontend '{}'",
                frontend.protocol, local_addr, frontend.name
            );

            assignments.push(Assignment {
                frontend: frontend.name.clone(),
                protocol: frontend.protocol,
                configured,
                binding: ListenerBinding { id, local_addr },
                source: Source::New(socket),
            });
        }

        Ok(PreparedListeners { assignments })
    }

    /// Starts acceptors for new sockets and stops the ones no frontend claimed.
    /// Called right after the new topology went live.
    pub async fn commit(&self, prepared: PreparedListeners) {
        let mut entries = self.entries.lock().await;
        let mut previous: HashMap<ListenerId, ListenerEntry> =
            entries.drain(..).map(|e| (e.id, e)).collect();

        for assignment in prepared.assignments {
            match assignment.source {
                Source::Existing => {
                    if let Some(mut entry) = previous.remove(&assignment.binding.id) {
                        entry.frontend = assignment.frontend;
                        entries.push(entry);
                    }
                }
                Source::New(socket) => {
                    let (stop, stop_rx) = watch::channel(false);
                    let id = assignment.binding.id;
                    let context = self.context.clone();
                    let task = match socket {
                        BoundSocket::Tcp(listener) => {
                            tokio::spawn(super::tcp::run_acceptor(listener, id, stop_rx, context))
                        }
                        BoundSocket::Udp(socket) => {
                            tokio::spawn(super::udp::run_acceptor(socket, id, stop_rx, context))
                        }
                    };
                    info!(
                        "Frontend '{}' listening on {} ({})",
                        assignment.frontend, assignment.binding.local_addr, assignment.protocol
                    );
                    entries.push(ListenerEntry {
                        id,
                        frontend: assignment.frontend,
                        protocol: assignment.protocol,
                        configured: assignment.configured,
                        local_addr: assignment.binding.local_addr,
                        stop,
                        task,
                    });
                }
            }
        }

        for (_, entry) in previous {
            info!(
                "Closing {} listener {} of removed frontend '{}'",
                entry.protocol, entry.local_addr, entry.frontend
            );
            entry.stop.send_replace(true);
        }
    }

    /// 停止所有接收任务
    pub async fn stop_all(&self) {
        let entries: Vec<ListenerEntry> = self.entries.lock().await.drain(..).collect();
        for entry in &entries {
            entry.stop.send_replace(true);
        }
        for entry in entries {
            if let Err(e) = entry.task.await {
                warn!("Acceptor for '{}' ended abnormally: {}", entry.frontend, e);
            }
        }
        info!("All listeners stopped");
    }

    pub async fn local_addr(&self, frontend: &str) -> Option<SocketAddr> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.frontend == frontend)
            .map(|e| e.local_addr)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::topology::Topology;

    fn registry() -> ListenerRegistry {
        ListenerRegistry::new(AcceptorContext {
            live: Arc::new(LiveTopology::new(Topology::empty())),
            metrics: Arc::new(MetricsCollector::new().unwrap()),
        })
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = AcceptBackoff::new();
        let delays: Vec<Duration> = (0..8).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[7], Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_BACKOFF);
    }

    #[tokio::test]
    async fn test_unchanged_frontends_keep_their_sockets() {
        let registry = registry();
        let config = Config::from_toml_str(SAMPLE).unwrap();

        let first = registry.prepare(&config).await.unwrap();
        assert_eq!(first.new_binds(), 2);
        let first_bindings = first.bindings();
        registry.commit(first).await;

        let second = registry.prepare(&config).await.unwrap();
        assert_eq!(second.new_binds(), 0);
        assert_eq!(
            second.bindings()["mysql"].local_addr,
            first_bindings["mysql"].local_addr
        );
        assert_eq!(second.bindings()["vpn"].id, first_bindings["vpn"].id);
        registry.commit(second).await;
        assert_eq!(registry.len().await, 2);

        registry.stop_all().await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_renamed_frontend_adopts_socket() {
        let registry = registry();
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.frontends[0].port = port;
        let first = registry.prepare(&config).await.unwrap();
        registry.commit(first).await;
        let original = registry.local_addr("mysql").await.unwrap();

        config.frontends[0].name = "db".to_string();
        let second = registry.prepare(&config).await.unwrap();
        assert_eq!(second.new_binds(), 0);
        registry.commit(second).await;

        assert_eq!(registry.local_addr("db").await, Some(original));
        assert_eq!(registry.local_addr("mysql").await, None);
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_prepare() {
        let registry = registry();
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.frontends[0].port = occupied.local_addr().unwrap().port();

        let result = registry.prepare(&config).await;
        assert!(matches!(result, Err(ReloadError::Bind { .. })));
        assert_eq!(registry.len().await, 0);
    }
}
