use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::info;

pub const MAX_WEIGHT: u32 = 256;

/// 前端、后端与服务器名称的格式
static NAME_PATTERN: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").ok());

/// 完整的负载均衡配置模型
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub frontends: Vec<FrontendConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceAlgorithm {
    RoundRobin,
    LeastConn,
    SourceHash,
    UriHash,
}

impl fmt::Display for BalanceAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BalanceAlgorithm::RoundRobin => "round_robin",
            BalanceAlgorithm::LeastConn => "least_conn",
            BalanceAlgorithm::SourceHash => "source_hash",
            BalanceAlgorithm::UriHash => "uri_hash",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Up,
    Down,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Up => write!(f, "UP"),
            HealthState::Down => write!(f, "DOWN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendConfig {
    pub name: String,
    pub bind_address: String,
    pub port: u16,
    pub protocol: Protocol,
    pub backend: String,
}

impl FrontendConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress {
                frontend: self.name.clone(),
                address: self.bind_address.clone(),
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub protocol: Protocol,
    #[serde(default = "default_balance")]
    pub balance: BalanceAlgorithm,
    #[serde(default)]
    pub max_conns_per_server: Option<usize>,
    /// 服务器未单独配置时使用的检查参数
    #[serde(default)]
    pub check: Option<CheckConfig>,
    /// uri_hash 的键提取方式
    #[serde(default)]
    pub hash_key: Option<KeyExtractor>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl BackendConfig {
    /// 计算服务器最终生效的检查配置
    pub fn effective_check(&self, server: &ServerConfig) -> CheckConfig {
        server
            .check
            .clone()
            .or_else(|| self.check.clone())
            .unwrap_or_else(|| CheckConfig::default_for(self.protocol))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub check: Option<CheckConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_check_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_check_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_rise")]
    pub rise: u32,
    #[serde(default = "default_fall")]
    pub fall: u32,
    #[serde(default = "default_initial_state")]
    pub initial_state: HealthState,
    /// 探测端口，缺省时使用服务端口
    #[serde(default)]
    pub port: Option<u16>,
}

impl CheckConfig {
    pub fn default_for(protocol: Protocol) -> Self {
        Self {
            enabled: protocol == Protocol::Tcp,
            ..Self::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_check_interval(),
            timeout_ms: default_check_timeout(),
            rise: default_rise(),
            fall: default_fall(),
            initial_state: default_initial_state(),
            port: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyExtractor {
    /// Request URI from the first line of a TCP stream, query stripped.
    RequestLine,
    /// First `length` bytes of the stream or datagram.
    PayloadPrefix { length: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_udp_session_idle")]
    pub udp_session_idle_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_key_peek_timeout")]
    pub key_peek_timeout_ms: u64,
}

impl EngineSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn udp_session_idle(&self) -> Duration {
        Duration::from_secs(self.udp_session_idle_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn key_peek_timeout(&self) -> Duration {
        Duration::from_millis(self.key_peek_timeout_ms)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            udp_session_idle_secs: default_udp_session_idle(),
            drain_timeout_secs: default_drain_timeout(),
            shutdown_timeout_secs: default_drain_timeout(),
            buffer_size: default_buffer_size(),
            key_peek_timeout_ms: default_key_peek_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([127, 0, 0, 1], 8404)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

fn default_balance() -> BalanceAlgorithm {
    BalanceAlgorithm::RoundRobin
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> u64 {
    2000
}

fn default_check_timeout() -> u64 {
    1000
}

fn default_rise() -> u32 {
    2
}

fn default_fall() -> u32 {
    3
}

fn default_initial_state() -> HealthState {
    HealthState::Down
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_udp_session_idle() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_key_peek_timeout() -> u64 {
    500
}

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },

    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("frontend '{frontend}' has invalid bind address '{address}'")]
    InvalidBindAddress { frontend: String, address: String },

    #[error("frontend '{frontend}' binds {protocol} {addr} which is already bound by another frontend")]
    DuplicateBind {
        frontend: String,
        protocol: Protocol,
        addr: SocketAddr,
    },

    #[error("frontend '{frontend}' references unknown backend '{backend}'")]
    UnknownBackend { frontend: String, backend: String },

    #[error("frontend '{frontend}' is {frontend_protocol} but backend '{backend}' is {backend_protocol}")]
    ProtocolMismatch {
        frontend: String,
        frontend_protocol: Protocol,
        backend: String,
        backend_protocol: Protocol,
    },

    #[error("backend '{0}' has no servers")]
    NoServers(String),

    #[error("server '{backend}/{server}' has invalid port 0")]
    InvalidServerPort { backend: String, server: String },

    #[error("server '{backend}/{server}' weight must be between 1 and 256")]
    WeightOutOfRange { backend: String, server: String },

    #[error("backend '{0}' sets max_conns_per_server to 0")]
    ZeroMaxConns(String),

    #[error("server '{backend}/{server}' has invalid check: {reason}")]
    InvalidCheck {
        backend: String,
        server: String,
        reason: &'static str,
    },

    #[error("server '{backend}/{server}' enables active checks on udp without a check port")]
    UdpCheckWithoutPort { backend: String, server: String },

    #[error("backend '{0}' uses uri_hash without a hash_key extractor")]
    MissingKeyExtractor(String),

    #[error("backend '{backend}' key extractor is not usable with {protocol}")]
    ExtractorProtocol { backend: String, protocol: Protocol },

    #[error("engine setting '{0}' must be greater than zero")]
    InvalidSetting(&'static str),

    #[error("failed to resolve server '{backend}/{server}' address '{address}'")]
    Resolve {
        backend: String,
        server: String,
        address: String,
    },
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let settings = &self.engine;
        if settings.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting("connect_timeout_ms"));
        }
        if settings.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting("idle_timeout_secs"));
        }
        if settings.udp_session_idle_secs == 0 {
            return Err(ConfigError::InvalidSetting("udp_session_idle_secs"));
        }
        if settings.buffer_size == 0 {
            return Err(ConfigError::InvalidSetting("buffer_size"));
        }

        let mut backend_names = HashSet::new();
        for backend in &self.backends {
            check_name("backend", &backend.name)?;
            if !backend_names.insert(backend.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "backend",
                    name: backend.name.clone(),
                });
            }
            validate_backend(backend)?;
        }

        let mut frontend_names = HashSet::new();
        let mut binds = HashSet::new();
        for frontend in &self.frontends {
            check_name("frontend", &frontend.name)?;
            if !frontend_names.insert(frontend.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "frontend",
                    name: frontend.name.clone(),
                });
            }

            let addr = frontend.bind_addr()?;
            // 端口0由系统分配，不会冲突
            if addr.port() != 0 && !binds.insert((frontend.protocol, addr)) {
                return Err(ConfigError::DuplicateBind {
                    frontend: frontend.name.clone(),
                    protocol: frontend.protocol,
                    addr,
                });
            }

            let backend =
                self.backend(&frontend.backend)
                    .ok_or_else(|| ConfigError::UnknownBackend {
                        frontend: frontend.name.clone(),
                        backend: frontend.backend.clone(),
                    })?;
            if backend.protocol != frontend.protocol {
                return Err(ConfigError::ProtocolMismatch {
                    frontend: frontend.name.clone(),
                    frontend_protocol: frontend.protocol,
                    backend: backend.name.clone(),
                    backend_protocol: backend.protocol,
                });
            }
        }

        Ok(())
    }
}

fn check_name(kind: &'static str, name: &str) -> Result<(), ConfigError> {
    if NAME_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
    {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

fn validate_backend(backend: &BackendConfig) -> Result<(), ConfigError> {
    if backend.servers.is_empty() {
        return Err(ConfigError::NoServers(backend.name.clone()));
    }
    if backend.max_conns_per_server == Some(0) {
        return Err(ConfigError::ZeroMaxConns(backend.name.clone()));
    }

    match (&backend.hash_key, backend.balance) {
        (None, BalanceAlgorithm::UriHash) => {
            return Err(ConfigError::MissingKeyExtractor(backend.name.clone()));
        }
        (Some(KeyExtractor::RequestLine), _) if backend.protocol == Protocol::Udp => {
            return Err(ConfigError::ExtractorProtocol {
                backend: backend.name.clone(),
                protocol: backend.protocol,
            });
        }
        (Some(KeyExtractor::PayloadPrefix { length: 0 }), _) => {
            return Err(ConfigError::ExtractorProtocol {
                backend: backend.name.clone(),
                protocol: backend.protocol,
            });
        }
        _ => {}
    }

    let mut server_names = HashSet::new();
    for server in &backend.servers {
        check_name("server", &server.name)?;
        if !server_names.insert(server.name.as_str()) {
            return Err(ConfigError::Duplicate {
                kind: "server",
                name: format!("{}/{}", backend.name, server.name),
            });
        }
        if server.port == 0 {
            return Err(ConfigError::InvalidServerPort {
                backend: backend.name.clone(),
                server: server.name.clone(),
            });
        }
        if server.weight == 0 || server.weight > MAX_WEIGHT {
            return Err(ConfigError::WeightOutOfRange {
                backend: backend.name.clone(),
                server: server.name.clone(),
            });
        }

        let check = backend.effective_check(server);
        if !check.enabled {
            continue;
        }
        let invalid = |reason| ConfigError::InvalidCheck {
            backend: backend.name.clone(),
            server: server.name.clone(),
            reason,
        };
        if check.interval_ms == 0 {
            return Err(invalid("interval must be greater than zero"));
        }
        if check.timeout_ms == 0 {
            return Err(invalid("timeout must be greater than zero"));
        }
        if check.rise == 0 || check.fall == 0 {
            return Err(invalid("rise and fall must be at least 1"));
        }
        if check.port == Some(0) {
            return Err(invalid("check port must not be 0"));
        }
        if backend.protocol == Protocol::Udp && check.port.is_none() {
            return Err(ConfigError::UdpCheckWithoutPort {
                backend: backend.name.clone(),
                server: server.name.clone(),
            });
        }
    }

    Ok(())
}

/// 配置管理器 - 记录配置文件路径与最近一次成功应用的配置
pub struct ConfigManager {
    file_path: PathBuf,
    applied: RwLock<Option<Config>>,
}

impl ConfigManager {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            applied: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// 读取并校验配置文件，不改变已应用的配置
    pub async fn load(&self) -> Result<Config> {
        let content = fs::read_to_string(&self.file_path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", self.file_path))?;

        let config = Config::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", self.file_path))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", self.file_path))?;

        info!("Configuration loaded from {:?}", self.file_path);
        Ok(config)
    }

    pub async fn mark_applied(&self, config: Config) {
        *self.applied.write().await = Some(config);
    }

    pub async fn applied(&self) -> Option<Config> {
        self.applied.read().await.clone()
    }

    /// 与已应用配置相比，重载无法生效、需要重启的配置段
    pub async fn restart_required(&self, next: &Config) -> Vec<&'static str> {
        let applied = self.applied.read().await;
        let Some(applied) = applied.as_ref() else {
            return Vec::new();
        };

        let mut sections = Vec::new();
        if applied.stats != next.stats {
            sections.push("stats");
        }
        if applied.logging != next.logging {
            sections.push("logging");
        }
        sections
    }
}
