use crate::config::{CheckConfig, HealthState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// 后端服务器运行时状态
///
/// 健康字段只由该服务器的健康检查任务写入；连接计数在热路径上通过原子操作维护。
#[derive(Debug)]
pub struct Server {
    name: String,
    backend: String,
    address: SocketAddr,
    weight: u32,
    check: CheckConfig,
    up: AtomicBool,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    check_failures: AtomicU64,
    dial_failures: AtomicU64,
}

/// 继承自上一代拓扑的健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarriedState {
    pub state: HealthState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Server {
    pub fn new(
        backend: impl Into<String>,
        name: impl Into<String>,
        address: SocketAddr,
        weight: u32,
        check: CheckConfig,
    ) -> Self {
        // 未启用检查的服务器始终可选
        let up = !check.enabled || check.initial_state == HealthState::Up;
        Self {
            name: name.into(),
            backend: backend.into(),
            address,
            weight: weight.max(1),
            check,
            up: AtomicBool::new(up),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            active_connections: AtomicUsize::new(0),
            total_connections: AtomicU64::new(0),
            check_failures: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
        }
    }

    /// Seeds health from the previous generation. Only meaningful before the
    /// server's check task starts.
    pub fn with_carried_state(self, carried: CarriedState) -> Self {
        self.restore_state(carried);
        self
    }

    /// Overwrites health and counters with `carried`. No-op without checks.
    pub(crate) fn restore_state(&self, carried: CarriedState) {
        if self.check.enabled {
            self.up
                .store(carried.state == HealthState::Up, Ordering::Release);
            self.consecutive_successes
                .store(carried.consecutive_successes, Ordering::Relaxed);
            self.consecutive_failures
                .store(carried.consecutive_failures, Ordering::Relaxed);
        }
    }

    /// 判断 `previous` 的健康状态能否被本服务器继承
    ///
    /// 身份（后端、名称、地址）相同，且双方都启用检查、判定参数一致。
    pub fn inherits_from(&self, previous: &Server) -> bool {
        let (old, new) = (&previous.check, &self.check);
        self.backend == previous.backend
            && self.name == previous.name
            && self.address == previous.address
            && old.enabled
            && new.enabled
            && old.rise == new.rise
            && old.fall == new.fall
            && old.port == new.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// 健康检查探测的地址
    pub fn check_address(&self) -> SocketAddr {
        match self.check.port {
            Some(port) => SocketAddr::new(self.address.ip(), port),
            None => self.address,
        }
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn check_config(&self) -> &CheckConfig {
        &self.check
    }

    pub fn health_state(&self) -> HealthState {
        if self.up.load(Ordering::Acquire) {
            HealthState::Up
        } else {
            HealthState::Down
        }
    }

    pub(crate) fn set_health_state(&self, state: HealthState) {
        self.up.store(state == HealthState::Up, Ordering::Release);
    }

    /// 可被路由选中：状态为UP，或未启用主动检查
    pub fn is_eligible(&self) -> bool {
        !self.check.enabled || self.up.load(Ordering::Acquire)
    }

    pub fn carried_state(&self) -> CarriedState {
        CarriedState {
            state: self.health_state(),
            consecutive_successes: self.consecutive_successes(),
            consecutive_failures: self.consecutive_failures(),
        }
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// 记录一次成功探测，返回新的连续成功次数
    pub(crate) fn record_check_success(&self) -> u32 {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let next = self.consecutive_successes().saturating_add(1);
        self.consecutive_successes.store(next, Ordering::Relaxed);
        next
    }

    /// 记录一次失败探测，返回新的连续失败次数
    pub(crate) fn record_check_failure(&self) -> u32 {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.check_failures.fetch_add(1, Ordering::Relaxed);
        let next = self.consecutive_failures().saturating_add(1);
        self.consecutive_failures.store(next, Ordering::Relaxed);
        next
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn check_failures(&self) -> u64 {
        self.check_failures.load(Ordering::Relaxed)
    }

    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Reserves a connection slot, refusing when `max` slots are taken.
    pub fn try_acquire(self: &Arc<Self>, max: Option<usize>) -> Option<ServerLease> {
        let reserved = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match max {
                Some(limit) if current >= limit => None,
                _ => Some(current + 1),
            });

        reserved.ok().map(|_| {
            self.total_connections.fetch_add(1, Ordering::Relaxed);
            ServerLease {
                server: self.clone(),
            }
        })
    }

    pub fn is_at_capacity(&self, max: Option<usize>) -> bool {
        max.is_some_and(|limit| self.active_connections() >= limit)
    }
}

/// 连接占用凭证，释放时归还连接计数
#[derive(Debug)]
pub struct ServerLease {
    server: Arc<Server>,
}

impl ServerLease {
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn address(&self) -> SocketAddr {
        self.server.address
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        self.server.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(check: CheckConfig) -> Arc<Server> {
        Arc::new(Server::new(
            "mysql",
            "w1",
            "127.0.0.1:3306".parse().unwrap(),
            1,
            check,
        ))
    }

    #[test]
    fn test_initial_state() {
        let down = server(CheckConfig::default());
        assert_eq!(down.health_state(), HealthState::Down);
        assert!(!down.is_eligible());

        let up = server(CheckConfig {
            initial_state: HealthState::Up,
            ..CheckConfig::default()
        });
        assert!(up.is_eligible());

        let unchecked = server(CheckConfig {
            enabled: false,
            ..CheckConfig::default()
        });
        assert!(unchecked.is_eligible());
        unchecked.set_health_state(HealthState::Down);
        assert!(unchecked.is_eligible());
    }

    #[test]
    fn test_lease_accounting() {
        let server = server(CheckConfig::default());

        let first = server.try_acquire(Some(2)).unwrap();
        let second = server.try_acquire(Some(2)).unwrap();
        assert!(server.try_acquire(Some(2)).is_none());
        assert!(server.is_at_capacity(Some(2)));
        assert_eq!(server.active_connections(), 2);

        drop(first);
        assert_eq!(server.active_connections(), 1);
        let _third = server.try_acquire(Some(2)).unwrap();
        drop(second);

        assert_eq!(server.active_connections(), 1);
        assert_eq!(server.total_connections(), 3);
    }

    #[test]
    fn test_carried_state_ignored_without_checks() {
        let carried = CarriedState {
            state: HealthState::Down,
            consecutive_successes: 0,
            consecutive_failures: 4,
        };

        let checked = Server::new(
            "b",
            "s",
            "127.0.0.1:1".parse().unwrap(),
            1,
            CheckConfig {
                initial_state: HealthState::Up,
                ..CheckConfig::default()
            },
        )
        .with_carried_state(carried);
        assert_eq!(checked.health_state(), HealthState::Down);
        assert_eq!(checked.consecutive_failures(), 4);

        let unchecked = Server::new(
            "b",
            "s",
            "127.0.0.1:1".parse().unwrap(),
            1,
            CheckConfig::default_for(crate::config::Protocol::Udp),
        )
        .with_carried_state(carried);
        assert!(unchecked.is_eligible());
        assert_eq!(unchecked.consecutive_failures(), 0);
    }
}
