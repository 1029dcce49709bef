//! Read-only view of the engine for monitoring.
//!
//! A snapshot walks the live topology without taking any lock: every value
//! read is an atomic load on a `Server` or `FrontendRoute`.

use crate::config::{BalanceAlgorithm, HealthState, Protocol};
use crate::proxy::ProxyServer;
use crate::reload::{ReloadManager, ReloadState};
use crate::topology::Topology;
use anyhow::{Context, Result};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};
use warp::Filter;
use warp::http::StatusCode;

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub generation: u64,
    pub reload_state: ReloadState,
    pub uptime_secs: u64,
    pub frontends: Vec<FrontendStats>,
    pub backends: Vec<BackendStats>,
    pub retiring: Vec<RetiringStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrontendStats {
    pub name: String,
    pub protocol: Protocol,
    pub local_addr: SocketAddr,
    pub backend: String,
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub name: String,
    pub protocol: Protocol,
    pub algorithm: BalanceAlgorithm,
    pub eligible_servers: usize,
    pub active_connections: usize,
    pub servers: Vec<ServerStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub name: String,
    pub address: SocketAddr,
    pub weight: u32,
    pub state: HealthState,
    pub check_enabled: bool,
    pub eligible: bool,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub active_connections: usize,
    pub total_connections: u64,
    pub check_failures: u64,
    pub dial_failures: u64,
}

/// 正在排空的旧代
#[derive(Debug, Clone, Serialize)]
pub struct RetiringStats {
    pub generation: u64,
    pub active_connections: usize,
}

impl StatsSnapshot {
    pub async fn capture(manager: &ReloadManager, uptime: Duration) -> Self {
        let topology = manager.live().load();
        let retiring = manager
            .retiring()
            .await
            .iter()
            .map(|t| RetiringStats {
                generation: t.generation(),
                active_connections: t.active_connections(),
            })
            .collect();

        Self {
            reload_state: manager.state().await,
            uptime_secs: uptime.as_secs(),
            retiring,
            ..Self::of_topology(&topology)
        }
    }

    /// 只包含拓扑本身的快照
    pub fn of_topology(topology: &Topology) -> Self {
        let frontends = topology
            .frontends()
            .iter()
            .map(|f| FrontendStats {
                name: f.name.clone(),
                protocol: f.protocol,
                local_addr: f.local_addr,
                backend: f.backend.clone(),
                accepted: f.accepted(),
                rejected: f.rejected(),
            })
            .collect();

        let backends = topology
            .pools()
            .map(|pool| {
                let servers: Vec<ServerStats> = pool
                    .servers()
                    .iter()
                    .map(|s| ServerStats {
                        name: s.name().to_string(),
                        address: s.address(),
                        weight: s.weight(),
                        state: s.health_state(),
                        check_enabled: s.check_config().enabled,
                        eligible: s.is_eligible(),
                        consecutive_successes: s.consecutive_successes(),
                        consecutive_failures: s.consecutive_failures(),
                        active_connections: s.active_connections(),
                        total_connections: s.total_connections(),
                        check_failures: s.check_failures(),
                        dial_failures: s.dial_failures(),
                    })
                    .collect();

                BackendStats {
                    name: pool.name().to_string(),
                    protocol: pool.protocol(),
                    algorithm: pool.algorithm(),
                    eligible_servers: servers.iter().filter(|s| s.eligible).count(),
                    active_connections: servers.iter().map(|s| s.active_connections).sum(),
                    servers,
                }
            })
            .collect();

        Self {
            generation: topology.generation(),
            reload_state: ReloadState::Idle,
            uptime_secs: 0,
            frontends,
            backends,
            retiring: Vec::new(),
        }
    }
}

fn with_server(
    server: Arc<ProxyServer>,
) -> impl Filter<Extract = (Arc<ProxyServer>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// `GET /stats` and `GET /metrics`.
pub fn routes(
    server: Arc<ProxyServer>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let stats = warp::path("stats")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(stats_handler);

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server))
        .and_then(metrics_handler);

    stats.or(metrics)
}

async fn stats_handler(server: Arc<ProxyServer>) -> Result<impl warp::Reply, Infallible> {
    let snapshot = server.get_stats().await;
    let (body, status) = match serde_json::to_string_pretty(&snapshot) {
        Ok(body) => (body, StatusCode::OK),
        Err(e) => {
            error!("Failed to serialize stats snapshot: {}", e);
            (e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    Ok(warp::reply::with_header(
        warp::reply::with_status(body, status),
        "content-type",
        "application/json",
    ))
}

async fn metrics_handler(server: Arc<ProxyServer>) -> Result<impl warp::Reply, Infallible> {
    let reply = match server.export_metrics() {
        Ok(text) => warp::reply::with_status(text, StatusCode::OK),
        Err(e) => {
            error!("Failed to export metrics: {}", e);
            warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    Ok(warp::reply::with_header(
        reply,
        "content-type",
        "text/plain; version=0.0.4",
    ))
}

/// 启动统计HTTP服务，返回实际绑定地址
pub fn serve(
    addr: SocketAddr,
    server: Arc<ProxyServer>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let (bound, running) = warp::serve(routes(server))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .with_context(|| format!("Failed to bind stats endpoint on {}", addr))?;

    info!("Stats endpoint listening on http://{}/stats", bound);
    Ok((bound, tokio::spawn(running)))
}
