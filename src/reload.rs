use crate::config::{Config, ConfigError};
use crate::health::{HealthCheckSet, HealthChecker, HealthEvent};
use crate::metrics::MetricsCollector;
use crate::proxy::listener::{AcceptorContext, ListenerRegistry, PreparedListeners};
use crate::topology::{DrainOutcome, LiveTopology, Topology};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// 重载状态机
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReloadState {
    Idle,
    Building { generation: u64 },
    Swapping { generation: u64 },
    /// 旧代仍有连接在排空
    Draining { generations: Vec<u64> },
}

/// 重载错误，出错时当前拓扑保持不变
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind frontend '{frontend}' on {addr}: {source}")]
    Bind {
        frontend: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("engine already started")]
    AlreadyStarted,
}

/// 关闭结果
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub generations: Vec<u64>,
    pub force_closed: usize,
    pub elapsed: Duration,
}

/// 重载管理器 - 唯一可以替换当前拓扑的组件
pub struct ReloadManager {
    live: Arc<LiveTopology>,
    listeners: ListenerRegistry,
    health_checker: HealthChecker,
    metrics_collector: Arc<MetricsCollector>,
    /// 串行化重载，同时持有当前代的检查任务
    checks: Mutex<Option<HealthCheckSet>>,
    phase: RwLock<ReloadState>,
    retiring: Arc<Mutex<Vec<Arc<Topology>>>>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

impl ReloadManager {
    pub fn new(metrics_collector: Arc<MetricsCollector>) -> Self {
        Self::with_health_checker(
            HealthChecker::new(metrics_collector.clone()),
            metrics_collector,
        )
    }

    pub fn with_health_checker(
        health_checker: HealthChecker,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        let live = Arc::new(LiveTopology::new(Topology::empty()));
        let listeners = ListenerRegistry::new(AcceptorContext {
            live: live.clone(),
            metrics: metrics_collector.clone(),
        });

        Self {
            live,
            listeners,
            health_checker,
            metrics_collector,
            checks: Mutex::new(None),
            phase: RwLock::new(ReloadState::Idle),
            retiring: Arc::new(Mutex::new(Vec::new())),
            next_generation: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn live(&self) -> &Arc<LiveTopology> {
        &self.live
    }

    pub fn subscribe_health_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.health_checker.subscribe()
    }

    /// 当前状态；空闲时若仍有旧代在排空则报告 Draining
    pub async fn state(&self) -> ReloadState {
        let phase = self.phase.read().await.clone();
        if phase != ReloadState::Idle {
            return phase;
        }

        let generations = self.retiring_generations().await;
        if generations.is_empty() {
            ReloadState::Idle
        } else {
            ReloadState::Draining { generations }
        }
    }

    pub async fn retiring(&self) -> Vec<Arc<Topology>> {
        self.retiring.lock().await.clone()
    }

    async fn retiring_generations(&self) -> Vec<u64> {
        self.retiring
            .lock()
            .await
            .iter()
            .map(|t| t.generation())
            .collect()
    }

    /// Builds a topology from `config` and makes it live.
    ///
    /// Validation, listener binds and name resolution all happen before the
    /// swap; any failure there leaves the live topology untouched.
    pub async fn apply(&self, config: Config) -> Result<u64, ReloadError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ReloadError::ShuttingDown);
        }
        let mut checks = self.checks.lock().await;
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ReloadError::ShuttingDown);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        info!("Building topology generation {}", generation);
        self.set_phase(ReloadState::Building { generation }).await;

        let (prepared, topology) = match self.build(&config, generation).await {
            Ok(built) => built,
            Err(e) => {
                error!("Reload to generation {} failed: {}", generation, e);
                self.set_phase(ReloadState::Idle).await;
                self.metrics_collector.record_reload("error");
                return Err(e);
            }
        };

        // 旧代检查停止后状态不再变化，再同步构建期间发生的状态转换
        if let Some(old_checks) = checks.take() {
            old_checks.stop().await;
        }
        topology.refresh_carried_state(&self.live.load());

        let topology = Arc::new(topology);
        *checks = Some(self.health_checker.spawn_all(&topology));

        self.set_phase(ReloadState::Swapping { generation }).await;
        let previous = self.live.swap(topology.clone());
        self.metrics_collector
            .topology_generation
            .set(generation as i64);
        self.listeners.commit(prepared).await;

        self.retire(previous).await;
        self.set_phase(ReloadState::Idle).await;
        self.metrics_collector.record_reload("ok");

        info!(
            "Generation {} is live ({} frontends, {} backends) after {:?}",
            generation,
            topology.frontends().len(),
            topology.config().backends.len(),
            started.elapsed()
        );
        Ok(generation)
    }

    async fn build(
        &self,
        config: &Config,
        generation: u64,
    ) -> Result<(PreparedListeners, Topology), ReloadError> {
        config.validate()?;
        let prepared = self.listeners.prepare(config).await?;
        let current = self.live.load();
        let topology =
            Topology::build(config, generation, &prepared.bindings(), Some(&current)).await?;
        Ok((prepared, topology))
    }

    async fn set_phase(&self, state: ReloadState) {
        *self.phase.write().await = state;
    }

    /// 在后台排空旧代，超时使用旧代自己的设置
    async fn retire(&self, previous: Arc<Topology>) {
        if previous.generation() == 0 {
            return;
        }

        let drain_timeout = previous.settings().drain_timeout();
        info!(
            "Draining generation {} ({} active connections, timeout {:?})",
            previous.generation(),
            previous.active_connections(),
            drain_timeout
        );
        self.retiring.lock().await.push(previous.clone());

        let retiring = self.retiring.clone();
        let metrics = self.metrics_collector.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            if let DrainOutcome::Forced { remaining } = previous.drain(drain_timeout).await {
                warn!(
                    "Generation {} force-closed {} connections",
                    previous.generation(),
                    remaining
                );
            }
            metrics.record_drain(started.elapsed());
            retiring.lock().await.retain(|t| !Arc::ptr_eq(t, &previous));
        });
    }

    /// Stops every listener and health check, then drains all generations
    /// within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        self.shutting_down.store(true, Ordering::Release);
        let mut checks = self.checks.lock().await;
        info!("Shutting down (drain timeout {:?})", timeout);

        self.listeners.stop_all().await;
        if let Some(current) = checks.take() {
            current.stop().await;
        }

        let mut topologies = vec![self.live.load()];
        topologies.extend(self.retiring.lock().await.iter().cloned());

        let generations: Vec<u64> = topologies.iter().map(|t| t.generation()).collect();
        let mut drains = JoinSet::new();
        for topology in topologies {
            drains.spawn(async move { topology.drain(timeout).await });
        }

        let mut force_closed = 0;
        while let Some(outcome) = drains.join_next().await {
            match outcome {
                Ok(DrainOutcome::Forced { remaining }) => force_closed += remaining,
                Ok(DrainOutcome::Drained) => {}
                Err(e) => error!("Drain task failed: {}", e),
            }
        }

        let report = ShutdownReport {
            generations,
            force_closed,
            elapsed: started.elapsed(),
        };
        info!(
            "Shutdown complete in {:?}, {} connections force-closed",
            report.elapsed, report.force_closed
        );
        report
    }
}
