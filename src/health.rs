use crate::config::HealthState;
use crate::metrics::MetricsCollector;
use crate::topology::{Server, Topology};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 单次探测失败，只影响连续计数
#[derive(Debug, thiserror::Error)]
pub enum HealthCheckFailure {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe failed: {0}")]
    Io(#[from] std::io::Error),
}

/// 健康探测方式
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probes `address`, returning the observed round-trip time.
    async fn probe(
        &self,
        address: SocketAddr,
        timeout: Duration,
    ) -> Result<Duration, HealthCheckFailure>;
}

/// TCP连接探测
#[derive(Debug, Default)]
pub struct TcpConnectProbe;

#[async_trait]
impl HealthProbe for TcpConnectProbe {
    async fn probe(
        &self,
        address: SocketAddr,
        limit: Duration,
    ) -> Result<Duration, HealthCheckFailure> {
        let start_time = Instant::now();

        match timeout(limit, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => Ok(start_time.elapsed()),
            Ok(Err(e)) => Err(HealthCheckFailure::Io(e)),
            Err(_) => Err(HealthCheckFailure::Timeout(limit)),
        }
    }
}

/// 状态转换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
    pub consecutive: u32,
}

/// 健康状态变化事件
#[derive(Debug, Clone, Serialize)]
pub struct HealthEvent {
    pub generation: u64,
    pub backend: String,
    pub server: String,
    pub address: SocketAddr,
    pub from: HealthState,
    pub to: HealthState,
    pub consecutive: u32,
}

/// Applies one probe result to `server` and returns the transition it caused.
///
/// DOWN becomes UP once `rise` consecutive probes succeed and UP becomes DOWN
/// once `fall` consecutive probes fail. Anything in between only moves the
/// counters.
pub fn apply_probe(server: &Server, success: bool) -> Option<Transition> {
    let check = server.check_config();
    let from = server.health_state();

    let (consecutive, to) = if success {
        let successes = server.record_check_success();
        (successes, (from == HealthState::Down && successes >= check.rise).then_some(HealthState::Up))
    } else {
        let failures = server.record_check_failure();
        (failures, (from == HealthState::Up && failures >= check.fall).then_some(HealthState::Down))
    };

    to.map(|to| {
        server.set_health_state(to);
        Transition {
            from,
            to,
            consecutive,
        }
    })
}

/// 健康检查器 - 为每个启用检查的服务器启动独立任务
pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    events: broadcast::Sender<HealthEvent>,
    metrics: Arc<MetricsCollector>,
}

impl HealthChecker {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self::with_probe(Arc::new(TcpConnectProbe), metrics)
    }

    pub fn with_probe(probe: Arc<dyn HealthProbe>, metrics: Arc<MetricsCollector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            probe,
            events,
            metrics,
        }
    }

    /// 订阅健康状态变化事件
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// 为拓扑中每个启用检查的服务器启动检查任务
    pub fn spawn_all(&self, topology: &Topology) -> HealthCheckSet {
        let mut handles = Vec::new();

        for pool in topology.pools() {
            for server in pool.servers() {
                if !server.check_config().enabled {
                    continue;
                }

                let task = CheckTask {
                    server: server.clone(),
                    generation: topology.generation(),
                    probe: self.probe.clone(),
                    events: self.events.clone(),
                    metrics: self.metrics.clone(),
                };
                handles.push(tokio::spawn(task.run()));
            }
        }

        info!(
            "Started {} health check tasks for generation {}",
            handles.len(),
            topology.generation()
        );

        HealthCheckSet {
            generation: topology.generation(),
            handles,
        }
    }
}

struct CheckTask {
    server: Arc<Server>,
    generation: u64,
    probe: Arc<dyn HealthProbe>,
    events: broadcast::Sender<HealthEvent>,
    metrics: Arc<MetricsCollector>,
}

impl CheckTask {
    async fn run(self) {
        let check = self.server.check_config().clone();
        let address = self.server.check_address();

        // 首次探测分散在一个周期内
        let jitter = rand::thread_rng().gen_range(0..check.interval_ms.max(1));
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let mut ticker = tokio::time::interval(check.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let result = match timeout(check.timeout(), self.probe.probe(address, check.timeout()))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(HealthCheckFailure::Timeout(check.timeout())),
            };

            match &result {
                Ok(rtt) => debug!(
                    "Health check succeeded for {}/{} at {} ({:?})",
                    self.server.backend(),
                    self.server.name(),
                    address,
                    rtt
                ),
                Err(e) => {
                    debug!(
                        "Health check failed for {}/{} at {}: {}",
                        self.server.backend(),
                        self.server.name(),
                        address,
                        e
                    );
                    self.metrics
                        .record_check_failure(self.server.backend(), self.server.name());
                }
            }

            if let Some(transition) = apply_probe(&self.server, result.is_ok()) {
                self.publish(transition);
            }
        }
    }

    fn publish(&self, transition: Transition) {
        match transition.to {
            HealthState::Up => info!(
                "Server '{}/{}' is UP after {} successful checks",
                self.server.backend(),
                self.server.name(),
                transition.consecutive
            ),
            HealthState::Down => warn!(
                "Server '{}/{}' is DOWN after {} failed checks",
                self.server.backend(),
                self.server.name(),
                transition.consecutive
            ),
        }

        self.metrics.record_health_transition(
            self.server.backend(),
            self.server.name(),
            transition.to,
        );

        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(HealthEvent {
            generation: self.generation,
            backend: self.server.backend().to_string(),
            server: self.server.name().to_string(),
            address: self.server.address(),
            from: transition.from,
            to: transition.to,
            consecutive: transition.consecutive,
        });
    }
}

/// 一代拓扑的检查任务集合，丢弃时取消全部任务
#[derive(Debug)]
pub struct HealthCheckSet {
    generation: u64,
    handles: Vec<JoinHandle<()>>,
}

impl HealthCheckSet {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancels every task and waits until none of them can touch a server.
    pub async fn stop(mut self) {
        let handles = std::mem::take(&mut self.handles);
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            // 取消后返回 JoinError::Cancelled
            let _ = handle.await;
        }
        debug!(
            "Stopped health check tasks of generation {}",
            self.generation
        );
    }
}

impl Drop for HealthCheckSet {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        for handle in &self.handles {
            handle.abort();
        }
        debug!(
            "Cancelled {} health check tasks of generation {}",
            self.handles.len(),
            self.generation
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckConfig, Config, Protocol};
    use crate::router::{RoutingContext, SelectError};
    use crate::topology::ListenerBinding;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn server(rise: u32, fall: u32, initial: HealthState) -> Server {
        Server::new(
            "mysql",
            "w1",
            "127.0.0.1:3306".parse().unwrap(),
            1,
            CheckConfig {
                rise,
                fall,
                initial_state: initial,
                ..CheckConfig::default()
            },
        )
    }

    /// 按地址返回预设结果的探测器
    #[derive(Default)]
    struct ScriptedProbe {
        failing: Mutex<HashSet<SocketAddr>>,
    }

    impl ScriptedProbe {
        fn fail(&self, address: SocketAddr) {
            self.failing.lock().unwrap().insert(address);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(
            &self,
            address: SocketAddr,
            _timeout: Duration,
        ) -> Result<Duration, HealthCheckFailure> {
            if self.failing.lock().unwrap().contains(&address) {
                Err(HealthCheckFailure::Io(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                )))
            } else {
                Ok(Duration::from_millis(1))
            }
        }
    }

    #[test]
    fn test_rise_threshold() {
        let server = server(2, 3, HealthState::Down);

        assert_eq!(apply_probe(&server, true), None);
        assert_eq!(server.health_state(), HealthState::Down);

        let transition = apply_probe(&server, true).unwrap();
        assert_eq!(transition.from, HealthState::Down);
        assert_eq!(transition.to, HealthState::Up);
        assert_eq!(transition.consecutive, 2);
        assert!(server.is_eligible());

        // 已是UP，继续成功不再转换
        assert_eq!(apply_probe(&server, true), None);
    }

    #[test]
    fn test_fall_threshold() {
        let server = server(2, 3, HealthState::Up);

        assert_eq!(apply_probe(&server, false), None);
        assert_eq!(apply_probe(&server, false), None);
        assert_eq!(server.health_state(), HealthState::Up);

        let transition = apply_probe(&server, false).unwrap();
        assert_eq!(transition.to, HealthState::Down);
        assert_eq!(server.check_failures(), 3);
        assert!(!server.is_eligible());
    }

    #[test]
    fn test_mixed_results_never_flip() {
        let server = server(3, 3, HealthState::Up);

        for success in [false, false, true, false, false, true, false, false] {
            assert_eq!(apply_probe(&server, success), None);
        }
        assert_eq!(server.health_state(), HealthState::Up);
        assert_eq!(server.consecutive_failures(), 2);

        let down = server;
        down.set_health_state(HealthState::Down);
        for success in [true, true, false, true, true, false] {
            assert_eq!(apply_probe(&down, success), None);
        }
        assert_eq!(down.health_state(), HealthState::Down);
    }

    #[test]
    fn test_flapping_backend_never_routes_while_down() {
        let config = Config::from_toml_str(
            r#"
[[backends]]
name = "cache"
protocol = "tcp"

[backends.check]
rise = 1
fall = 1
initial_state = "up"

[[backends.servers]]
name = "c1"
address = "127.0.0.1"
port = 6379
"#,
        )
        .unwrap();
        let backend = &config.backends[0];
        let server = Arc::new(Server::new(
            "cache",
            "c1",
            "127.0.0.1:6379".parse().unwrap(),
            1,
            backend.effective_check(&backend.servers[0]),
        ));
        let pool = crate::router::BackendPool::new(backend, vec![server.clone()]);
        let context = RoutingContext::new("10.1.1.1:5555".parse().unwrap(), Protocol::Tcp);

        for round in 0..6 {
            let success = round % 2 == 1;
            assert!(apply_probe(&server, success).is_some());
            let selected = pool.select(&context, &[]);
            if success {
                assert!(selected.is_ok());
            } else {
                assert_eq!(
                    selected.unwrap_err(),
                    SelectError::NoEligibleServer("cache".to_string())
                );
            }
        }
    }

    #[tokio::test]
    async fn test_tcp_connect_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap();

        let probe = TcpConnectProbe;
        assert!(probe.probe(open, Duration::from_secs(1)).await.is_ok());

        drop(listener);
        assert!(probe.probe(open, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_server_leaves_eligible_set() {
        let config = Config::from_toml_str(
            r#"
[[backends]]
name = "mysql"
protocol = "tcp"
balance = "least_conn"

[backends.check]
interval_ms = 20
timeout_ms = 10
rise = 2
fall = 3
initial_state = "up"

[[backends.servers]]
name = "w1"
address = "127.0.0.1"
port = 3306

[[backends.servers]]
name = "w2"
address = "127.0.0.1"
port = 3307

[[backends.servers]]
name = "w3"
address = "127.0.0.1"
port = 3308
"#,
        )
        .unwrap();
        let bindings: HashMap<String, ListenerBinding> = HashMap::new();
        let topology = Topology::build(&config, 1, &bindings, None).await.unwrap();

        let probe = Arc::new(ScriptedProbe::default());
        probe.fail("127.0.0.1:3306".parse().unwrap());
        let checker =
            HealthChecker::with_probe(probe.clone(), Arc::new(MetricsCollector::new().unwrap()));
        let mut events = checker.subscribe();
        let checks = checker.spawn_all(&topology);
        assert_eq!(checks.len(), 3);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.server, "w1");
        assert_eq!(event.to, HealthState::Down);
        assert_eq!(event.consecutive, 3);

        let pool = topology.pool("mysql").unwrap();
        assert_eq!(pool.eligible_count(), 2);
        let context = RoutingContext::new("10.0.0.1:1000".parse().unwrap(), Protocol::Tcp);
        for _ in 0..10 {
            let selection = pool.select(&context, &[]).unwrap();
            assert_ne!(selection.server().name(), "w1");
        }

        drop(checks);
    }

    #[tokio::test]
    async fn test_stop_freezes_server_state() {
        let config = Config::from_toml_str(
            r#"
[[backends]]
name = "cache"
protocol = "tcp"

[backends.check]
interval_ms = 5
timeout_ms = 5
rise = 1
fall = 1
initial_state = "up"

[[backends.servers]]
name = "c1"
address = "127.0.0.1"
port = 6379
"#,
        )
        .unwrap();
        let topology = Topology::build(&config, 1, &HashMap::new(), None)
            .await
            .unwrap();

        let probe = Arc::new(ScriptedProbe::default());
        probe.fail("127.0.0.1:6379".parse().unwrap());
        let checker =
            HealthChecker::with_probe(probe, Arc::new(MetricsCollector::new().unwrap()));
        let checks = checker.spawn_all(&topology);
        checks.stop().await;

        let server = topology.pool("cache").unwrap().server("c1").unwrap();
        let frozen = server.carried_state();
        let failures = server.check_failures();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.carried_state(), frozen);
        assert_eq!(server.check_failures(), failures);
    }
}
