//! One immutable generation of the Frontend -> Backend -> Server graph.
//!
//! A `Topology` is built once per reload and published through
//! [`LiveTopology`]. Every connection holds a [`GenerationGuard`] for the
//! generation that routed it, so a retiring generation stays alive (and can be
//! drained under its own settings) until its last connection closes.

pub mod server;

pub use server::{CarriedState, Server, ServerLease};

use crate::config::{Config, ConfigError, EngineSettings, Protocol};
use crate::router::BackendPool;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

/// How long force-closed connections get to unwind after a drain timeout.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// 监听器标识，跨代保持不变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// 前端在某一代拓扑中绑定的监听器
#[derive(Debug, Clone, Copy)]
pub struct ListenerBinding {
    pub id: ListenerId,
    pub local_addr: SocketAddr,
}

/// 前端路由
#[derive(Debug)]
pub struct FrontendRoute {
    pub name: String,
    pub protocol: Protocol,
    pub local_addr: SocketAddr,
    pub backend: String,
    pub listener: ListenerId,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl FrontendRoute {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    Forced { remaining: usize },
}

#[derive(Debug)]
struct ConnectionTracker {
    active: AtomicUsize,
    idle: Notify,
    force_close: watch::Sender<bool>,
}

impl ConnectionTracker {
    fn new() -> Self {
        let (force_close, _) = watch::channel(false);
        Self {
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            force_close,
        }
    }
}

/// 一代完整且不可变的拓扑
#[derive(Debug)]
pub struct Topology {
    generation: u64,
    config: Config,
    frontends: Vec<FrontendRoute>,
    pools: HashMap<String, Arc<BackendPool>>,
    tracker: ConnectionTracker,
}

impl Topology {
    /// 启动前使用的空拓扑
    pub fn empty() -> Self {
        Self {
            generation: 0,
            config: Config::default(),
            frontends: Vec::new(),
            pools: HashMap::new(),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Builds a new generation from a validated config.
    ///
    /// Servers whose `(backend, name, address)` identity already exists in
    /// `previous` inherit its health state and counters. Frontends without a
    /// binding are skipped.
    pub async fn build(
        config: &Config,
        generation: u64,
        bindings: &HashMap<String, ListenerBinding>,
        previous: Option<&Topology>,
    ) -> Result<Self, ConfigError> {
        let mut pools = HashMap::new();

        for backend in &config.backends {
            let mut servers = Vec::with_capacity(backend.servers.len());
            for server_config in &backend.servers {
                let address =
                    resolve(&server_config.address, server_config.port)
                        .await
                        .ok_or_else(|| ConfigError::Resolve {
                            backend: backend.name.clone(),
                            server: server_config.name.clone(),
                            address: server_config.address.clone(),
                        })?;

                let mut server = Server::new(
                    &backend.name,
                    &server_config.name,
                    address,
                    server_config.weight,
                    backend.effective_check(server_config),
                );

                let carried = previous
                    .and_then(|p| p.pool(&backend.name))
                    .and_then(|p| p.server(&server_config.name))
                    .filter(|old| server.inherits_from(old))
                    .map(|old| old.carried_state());
                if let Some(carried) = carried {
                    debug!(
                        "Server '{}/{}' keeps state {} from generation {}",
                        backend.name,
                        server_config.name,
                        carried.state,
                        previous.map(|p| p.generation).unwrap_or_default()
                    );
                    server = server.with_carried_state(carried);
                }

                servers.push(Arc::new(server));
            }

            pools.insert(
                backend.name.clone(),
                Arc::new(BackendPool::new(backend, servers)),
            );
        }

        let frontends = config
            .frontends
            .iter()
            .filter_map(|frontend| {
                let binding = bindings.get(&frontend.name)?;
                Some(FrontendRoute {
                    name: frontend.name.clone(),
                    protocol: frontend.protocol,
                    local_addr: binding.local_addr,
                    backend: frontend.backend.clone(),
                    listener: binding.id,
                    accepted: AtomicU64::new(0),
                    rejected: AtomicU64::new(0),
                })
            })
            .collect();

        Ok(Self {
            generation,
            config: config.clone(),
            frontends,
            pools,
            tracker: ConnectionTracker::new(),
        })
    }

    /// Re-reads carried state from `previous` once its health checks have
    /// stopped, picking up transitions that happened after `build`.
    pub fn refresh_carried_state(&self, previous: &Topology) {
        for pool in self.pools.values() {
            let Some(old_pool) = previous.pool(pool.name()) else {
                continue;
            };
            for server in pool.servers() {
                if let Some(old) = old_pool
                    .server(server.name())
                    .filter(|old| server.inherits_from(old))
                {
                    server.restore_state(old.carried_state());
                }
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.config.engine
    }

    pub fn frontends(&self) -> &[FrontendRoute] {
        &self.frontends
    }

    pub fn frontend(&self, name: &str) -> Option<&FrontendRoute> {
        self.frontends.iter().find(|f| f.name == name)
    }

    pub fn frontend_index(&self, listener: ListenerId) -> Option<usize> {
        self.frontends.iter().position(|f| f.listener == listener)
    }

    pub fn pool(&self, name: &str) -> Option<&Arc<BackendPool>> {
        self.pools.get(name)
    }

    /// 按配置顺序返回所有后端池
    pub fn pools(&self) -> impl Iterator<Item = &Arc<BackendPool>> {
        self.config
            .backends
            .iter()
            .filter_map(|backend| self.pools.get(&backend.name))
    }

    /// Registers a connection against this generation.
    pub fn enter(self: &Arc<Self>) -> GenerationGuard {
        self.tracker.active.fetch_add(1, Ordering::AcqRel);
        GenerationGuard {
            topology: self.clone(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active.load(Ordering::Acquire)
    }

    pub fn force_close(&self) {
        self.tracker.force_close.send_replace(true);
    }

    pub fn is_force_closed(&self) -> bool {
        *self.tracker.force_close.borrow()
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.tracker.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_connections() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// 等待本代连接自然结束，超时后强制关闭剩余连接
    pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
        if tokio::time::timeout(timeout, self.wait_idle()).await.is_ok() {
            info!("Generation {} drained", self.generation);
            return DrainOutcome::Drained;
        }

        let remaining = self.active_connections();
        warn!(
            "Generation {} drain timeout after {:?}, force-closing {} connections",
            self.generation, timeout, remaining
        );
        self.force_close();

        if tokio::time::timeout(FORCE_CLOSE_GRACE, self.wait_idle())
            .await
            .is_err()
        {
            warn!(
                "Generation {} still has {} connections after force-close",
                self.generation,
                self.active_connections()
            );
        }

        DrainOutcome::Forced { remaining }
    }
}

async fn resolve(address: &str, port: u16) -> Option<SocketAddr> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }

    match lookup_host((address, port)).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            warn!("Failed to resolve {}:{}: {}", address, port, e);
            None
        }
    }
}

/// 连接所属的代，连接结束时释放
#[derive(Debug)]
pub struct GenerationGuard {
    topology: Arc<Topology>,
}

impl GenerationGuard {
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Resolves once this generation is force-closed.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.topology.tracker.force_close.subscribe()
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        let tracker = &self.topology.tracker;
        if tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracker.idle.notify_waiters();
        }
    }
}

/// 当前生效的拓扑，读路径无锁
#[derive(Debug)]
pub struct LiveTopology {
    current: ArcSwap<Topology>,
}

impl LiveTopology {
    pub fn new(initial: Topology) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn load(&self) -> Arc<Topology> {
        self.current.load_full()
    }

    /// Publishes `next` and returns the generation it replaced.
    pub fn swap(&self, next: Arc<Topology>) -> Arc<Topology> {
        self.current.swap(next)
    }
}
