pub mod config;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod reload;
pub mod router;
pub mod shutdown;
pub mod stats;
pub mod topology;

pub use config::{Config, ConfigError, ConfigManager};
pub use health::{HealthCheckFailure, HealthChecker, HealthEvent, HealthProbe};
pub use metrics::MetricsCollector;
pub use proxy::{ProxyError, ProxyServer};
pub use reload::{ReloadError, ReloadManager, ReloadState, ShutdownReport};
pub use router::{BackendPool, RoutingContext, SelectError};
pub use stats::StatsSnapshot;
pub use topology::{LiveTopology, Server, Topology};
