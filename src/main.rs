use clap::{Arg, Command};
use l4_balancer::{
    ConfigManager, ProxyServer,
    logging::setup_logging,
    shutdown::{SignalAction, SignalListener},
    stats,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, oneshot};
use tracing::{error, info, warn};

// 版本信息常量
const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_TIME: &str = env!("BUILD_TIME");
const GIT_HASH: &str = env!("GIT_HASH");
const GIT_BRANCH: &str = env!("GIT_BRANCH");
const RUST_VERSION: &str = env!("RUST_VERSION");
const TARGET_ARCH: &str = env!("TARGET_ARCH");
const BUILD_PROFILE: &str = env!("BUILD_PROFILE");

fn get_version_info() -> String {
    format!(
        "L4 Balancer v{}\n\
        Build Information:\n\
        ├─ Build Time: {}\n\
        ├─ Git Hash: {}\n\
        ├─ Git Branch: {}\n\
        ├─ Rust Version: {}\n\
        ├─ Target Architecture: {}\n\
        └─ Build Profile: {}",
        VERSION, BUILD_TIME, GIT_HASH, GIT_BRANCH, RUST_VERSION, TARGET_ARCH, BUILD_PROFILE
    )
}

fn build_cli() -> Command {
    Command::new("l4-balancer")
        .version(VERSION)
        .about("A TCP/UDP load balancer with active health checks and hot reload")
        .long_about(
            "L4 Balancer forwards TCP connections and UDP datagrams from frontends to weighted\n\
            backend pools. Servers are probed in the background, failed servers are taken out\n\
            of rotation, and SIGHUP swaps in a new configuration without dropping connections.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Specify configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("Validate the configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("version-info")
                .long("version-info")
                .help("Show detailed version and build information")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Override log level (trace, debug, info, warn, error)"),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    if matches.get_flag("version-info") {
        println!("{}", get_version_info());
        return Ok(());
    }

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| "config.toml".to_string());
    let config_manager = ConfigManager::new(config_path);
    let config = config_manager.load().await?;

    if matches.get_flag("check") {
        println!(
            "Configuration OK: {} frontends, {} backends",
            config.frontends.len(),
            config.backends.len()
        );
        return Ok(());
    }

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.logging.level.clone());
    setup_logging(&log_level, config.logging.format)?;

    info!("Starting L4 Balancer v{}", VERSION);
    info!("Build: {} ({})", GIT_HASH, BUILD_TIME);
    info!("Branch: {} | Profile: {}", GIT_BRANCH, BUILD_PROFILE);
    info!(
        "Configuration loaded from {:?}: {} frontends, {} backends",
        config_manager.path(),
        config.frontends.len(),
        config.backends.len()
    );
    info!("Process ID: {}", std::process::id());

    let server = Arc::new(ProxyServer::new()?);
    let generation = server.start(config.clone()).await?;
    info!("Topology generation {} is live", generation);

    let stats_config = config.stats.clone();
    let mut shutdown_timeout = config.engine.shutdown_timeout();
    config_manager.mark_applied(config).await;

    let (stats_stop_tx, stats_stop_rx) = oneshot::channel::<()>();
    let stats_task = if stats_config.enabled {
        let (_, handle) = stats::serve(stats_config.bind, server.clone(), async move {
            let _ = stats_stop_rx.await;
        })?;
        Some(handle)
    } else {
        None
    };

    let signals = SignalListener::new();
    let mut signal_rx = signals.subscribe();
    signals.install()?;

    info!("Signal handling enabled:");
    info!("  - SIGINT / SIGTERM: Graceful shutdown");
    info!("  - SIGQUIT: Immediate shutdown");
    info!("  - SIGHUP: Configuration reload");

    let report = loop {
        let signal = match signal_rx.recv().await {
            Ok(signal) => signal,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Skipped {} queued signals", skipped);
                continue;
            }
            Err(RecvError::Closed) => break server.shutdown(shutdown_timeout).await,
        };

        match signal.action() {
            SignalAction::Reload => {
                info!("{} received, reloading configuration", signal);
                let config = match config_manager.load().await {
                    Ok(config) => config,
                    Err(e) => {
                        error!("Reload aborted, keeping current topology: {:#}", e);
                        continue;
                    }
                };
                for section in config_manager.restart_required(&config).await {
                    warn!(
                        "[{}] changed in {:?}, the new settings take effect after a restart",
                        section,
                        config_manager.path()
                    );
                }
                let next_timeout = config.engine.shutdown_timeout();
                match server.reload(config.clone()).await {
                    Ok(generation) => {
                        info!("Reload complete, generation {} is live", generation);
                        shutdown_timeout = next_timeout;
                        config_manager.mark_applied(config).await;
                    }
                    Err(e) => error!("Reload failed, keeping current topology: {}", e),
                }
            }
            SignalAction::Shutdown { graceful } => {
                let timeout = if graceful {
                    shutdown_timeout
                } else {
                    Duration::ZERO
                };
                info!("{} received, shutting down (drain timeout {:?})", signal, timeout);
                break server.shutdown(timeout).await;
            }
        }
    };

    let _ = stats_stop_tx.send(());
    if let Some(handle) = stats_task {
        if let Err(e) = handle.await {
            warn!("Stats endpoint task ended abnormally: {}", e);
        }
    }

    if report.force_closed > 0 {
        warn!(
            "Shutdown forced {} connections closed after {:?}",
            report.force_closed, report.elapsed
        );
    } else {
        info!(
            "All connections drained in {:?} across generations {:?}",
            report.elapsed, report.generations
        );
    }

    info!("L4 Balancer shutdown complete");
    Ok(())
}
