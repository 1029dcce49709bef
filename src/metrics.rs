use crate::config::HealthState;
use crate::topology::Topology;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::time::Duration;

/// 监控指标收集器
///
/// 计数器在事件发生时更新；服务器级别的仪表在导出前由 [`observe_topology`]
/// 从当前拓扑刷新，已被移除的服务器不会残留在输出中。
///
/// [`observe_topology`]: MetricsCollector::observe_topology
pub struct MetricsCollector {
    registry: Registry,

    // 连接指标
    pub connections_total: IntCounterVec,
    pub connections_rejected: IntCounterVec,
    pub connection_duration: HistogramVec,
    pub bytes_relayed: IntCounterVec,

    // 服务器指标
    pub server_up: IntGaugeVec,
    pub server_active_connections: IntGaugeVec,
    pub dial_failures: IntCounterVec,
    pub check_failures: IntCounterVec,
    pub health_transitions: IntCounterVec,

    // UDP指标
    pub udp_datagrams: IntCounterVec,
    pub udp_sessions: IntGaugeVec,

    // 重载指标
    pub reloads_total: IntCounterVec,
    pub topology_generation: IntGauge,
    pub drain_duration: Histogram,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounterVec::new(
            Opts::new("lb_connections_total", "Connections accepted per frontend"),
            &["frontend"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_rejected = IntCounterVec::new(
            Opts::new(
                "lb_connections_rejected_total",
                "Connections or datagrams refused per frontend",
            ),
            &["frontend", "reason"],
        )?;
        registry.register(Box::new(connections_rejected.clone()))?;

        let connection_duration = HistogramVec::new(
            HistogramOpts::new(
                "lb_connection_duration_seconds",
                "Proxied TCP connection lifetime in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0]),
            &["frontend"],
        )?;
        registry.register(Box::new(connection_duration.clone()))?;

        let bytes_relayed = IntCounterVec::new(
            Opts::new("lb_bytes_relayed_total", "Bytes relayed per frontend"),
            &["frontend", "direction"],
        )?;
        registry.register(Box::new(bytes_relayed.clone()))?;

        let server_up = IntGaugeVec::new(
            Opts::new(
                "lb_server_up",
                "Server eligibility in the live topology (1 = eligible, 0 = down)",
            ),
            &["backend", "server"],
        )?;
        registry.register(Box::new(server_up.clone()))?;

        let server_active_connections = IntGaugeVec::new(
            Opts::new(
                "lb_server_active_connections",
                "Active connections per server in the live topology",
            ),
            &["backend", "server"],
        )?;
        registry.register(Box::new(server_active_connections.clone()))?;

        let dial_failures = IntCounterVec::new(
            Opts::new("lb_dial_failures_total", "Failed dials per server"),
            &["backend", "server"],
        )?;
        registry.register(Box::new(dial_failures.clone()))?;

        let check_failures = IntCounterVec::new(
            Opts::new("lb_check_failures_total", "Failed health probes per server"),
            &["backend", "server"],
        )?;
        registry.register(Box::new(check_failures.clone()))?;

        let health_transitions = IntCounterVec::new(
            Opts::new("lb_health_transitions_total", "Health state transitions"),
            &["backend", "server", "to"],
        )?;
        registry.register(Box::new(health_transitions.clone()))?;

        let udp_datagrams = IntCounterVec::new(
            Opts::new("lb_udp_datagrams_total", "UDP datagrams relayed"),
            &["frontend", "direction"],
        )?;
        registry.register(Box::new(udp_datagrams.clone()))?;

        let udp_sessions = IntGaugeVec::new(
            Opts::new("lb_udp_sessions", "Open UDP sessions per frontend"),
            &["frontend"],
        )?;
        registry.register(Box::new(udp_sessions.clone()))?;

        let reloads_total = IntCounterVec::new(
            Opts::new("lb_reloads_total", "Reload attempts by result"),
            &["result"],
        )?;
        registry.register(Box::new(reloads_total.clone()))?;

        let topology_generation =
            IntGauge::new("lb_topology_generation", "Generation of the live topology")?;
        registry.register(Box::new(topology_generation.clone()))?;

        let drain_duration = Histogram::with_opts(
            HistogramOpts::new(
                "lb_drain_duration_seconds",
                "Time taken to drain a retired topology",
            )
            .buckets(vec![0.01, 0.1, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(drain_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_rejected,
            connection_duration,
            bytes_relayed,
            server_up,
            server_active_connections,
            dial_failures,
            check_failures,
            health_transitions,
            udp_datagrams,
            udp_sessions,
            reloads_total,
            topology_generation,
            drain_duration,
        })
    }

    /// 获取Prometheus注册表
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_connection(&self, frontend: &str) {
        self.connections_total.with_label_values(&[frontend]).inc();
    }

    pub fn record_rejection(&self, frontend: &str, reason: &str) {
        self.connections_rejected
            .with_label_values(&[frontend, reason])
            .inc();
    }

    /// 记录连接关闭
    pub fn record_connection_closed(
        &self,
        frontend: &str,
        duration: Duration,
        client_to_server: u64,
        server_to_client: u64,
    ) {
        self.connection_duration
            .with_label_values(&[frontend])
            .observe(duration.as_secs_f64());
        self.bytes_relayed
            .with_label_values(&[frontend, "client_to_server"])
            .inc_by(client_to_server);
        self.bytes_relayed
            .with_label_values(&[frontend, "server_to_client"])
            .inc_by(server_to_client);
    }

    pub fn record_dial_failure(&self, backend: &str, server: &str) {
        self.dial_failures
            .with_label_values(&[backend, server])
            .inc();
    }

    pub fn record_check_failure(&self, backend: &str, server: &str) {
        self.check_failures
            .with_label_values(&[backend, server])
            .inc();
    }

    pub fn record_health_transition(&self, backend: &str, server: &str, to: HealthState) {
        let to = match to {
            HealthState::Up => "up",
            HealthState::Down => "down",
        };
        self.health_transitions
            .with_label_values(&[backend, server, to])
            .inc();
    }

    pub fn record_udp_datagram(&self, frontend: &str, direction: &str, bytes: usize) {
        self.udp_datagrams
            .with_label_values(&[frontend, direction])
            .inc();
        self.bytes_relayed
            .with_label_values(&[frontend, direction])
            .inc_by(bytes as u64);
    }

    pub fn udp_session_opened(&self, frontend: &str) {
        self.udp_sessions.with_label_values(&[frontend]).inc();
    }

    pub fn udp_session_closed(&self, frontend: &str) {
        self.udp_sessions.with_label_values(&[frontend]).dec();
    }

    pub fn record_reload(&self, result: &str) {
        self.reloads_total.with_label_values(&[result]).inc();
    }

    pub fn record_drain(&self, duration: Duration) {
        self.drain_duration.observe(duration.as_secs_f64());
    }

    /// 从当前拓扑刷新服务器仪表
    pub fn observe_topology(&self, topology: &Topology) {
        self.topology_generation.set(topology.generation() as i64);
        self.server_up.reset();
        self.server_active_connections.reset();

        for pool in topology.pools() {
            for server in pool.servers() {
                let labels = [pool.name(), server.name()];
                self.server_up
                    .with_label_values(&labels)
                    .set(i64::from(server.is_eligible()));
                self.server_active_connections
                    .with_label_values(&labels)
                    .set(server.active_connections() as i64);
            }
        }
    }

    /// 导出指标为Prometheus格式
    pub fn export_metrics(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_series() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_connection("mysql");
        metrics.record_rejection("mysql", "no_eligible_server");
        metrics.record_health_transition("mysql", "w1", HealthState::Down);
        metrics.record_reload("ok");

        let output = metrics.export_metrics().unwrap();
        assert!(output.contains("lb_connections_total{frontend=\"mysql\"} 1"));
        assert!(output.contains("reason=\"no_eligible_server\""));
        assert!(output.contains("lb_health_transitions_total"));
        assert!(output.contains("lb_reloads_total{result=\"ok\"} 1"));
    }

    #[test]
    fn test_observe_empty_topology() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.observe_topology(&Topology::empty());
        let output = metrics.export_metrics().unwrap();
        assert!(output.contains("lb_topology_generation 0"));
    }
}
