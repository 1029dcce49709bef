use super::algorithms::Balancer;
use super::{RoutingContext, SelectError};
use crate::config::{BalanceAlgorithm, BackendConfig, KeyExtractor, Protocol};
use crate::topology::{Server, ServerLease};
use std::sync::Arc;
use tracing::debug;

/// 后端服务器池 - 持有一个后端的服务器列表与选择算法
#[derive(Debug)]
pub struct BackendPool {
    name: String,
    protocol: Protocol,
    algorithm: BalanceAlgorithm,
    servers: Vec<Arc<Server>>,
    balancer: Balancer,
    max_conns_per_server: Option<usize>,
    hash_key: Option<KeyExtractor>,
}

/// 一次成功的选择
#[derive(Debug)]
pub struct Selection {
    pub index: usize,
    pub lease: ServerLease,
}

impl Selection {
    pub fn server(&self) -> &Arc<Server> {
        self.lease.server()
    }
}

impl BackendPool {
    pub fn new(config: &BackendConfig, servers: Vec<Arc<Server>>) -> Self {
        let balancer = Balancer::new(config.balance, &servers);
        Self {
            name: config.name.clone(),
            protocol: config.protocol,
            algorithm: config.balance,
            servers,
            balancer,
            max_conns_per_server: config.max_conns_per_server,
            hash_key: config.hash_key.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn algorithm(&self) -> BalanceAlgorithm {
        self.algorithm
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn server(&self, name: &str) -> Option<&Arc<Server>> {
        self.servers.iter().find(|s| s.name() == name)
    }

    pub fn max_conns_per_server(&self) -> Option<usize> {
        self.max_conns_per_server
    }

    /// Key extractor, only present when the algorithm consumes a key.
    pub fn key_extractor(&self) -> Option<&KeyExtractor> {
        match self.algorithm {
            BalanceAlgorithm::UriHash => self.hash_key.as_ref(),
            _ => None,
        }
    }

    pub fn eligible_count(&self) -> usize {
        self.servers.iter().filter(|s| s.is_eligible()).count()
    }

    /// 选择一个服务器并占用一个连接槽位
    ///
    /// `exclude` 中的下标只对本次选择生效（用于拨号失败后的重选），
    /// 不会改变服务器的健康状态。
    pub fn select(
        &self,
        context: &RoutingContext,
        exclude: &[usize],
    ) -> Result<Selection, SelectError> {
        let mut blocked = vec![false; self.servers.len()];
        for index in exclude {
            if let Some(slot) = blocked.get_mut(*index) {
                *slot = true;
            }
        }

        let mut saw_busy = false;
        loop {
            let mut mask = Vec::with_capacity(self.servers.len());
            let mut any_eligible = false;
            for (index, server) in self.servers.iter().enumerate() {
                let eligible = !blocked[index] && server.is_eligible();
                any_eligible |= eligible;
                let full = eligible && server.is_at_capacity(self.max_conns_per_server);
                saw_busy |= full;
                mask.push(eligible && !full);
            }

            if !any_eligible {
                return Err(if saw_busy {
                    SelectError::AllServersBusy(self.name.clone())
                } else {
                    SelectError::NoEligibleServer(self.name.clone())
                });
            }

            let Some(index) = self.balancer.pick(&self.servers, &mask, context) else {
                return Err(SelectError::AllServersBusy(self.name.clone()));
            };

            match self.servers[index].try_acquire(self.max_conns_per_server) {
                Some(lease) => {
                    debug!(
                        "Backend '{}' selected server '{}' ({}) for {}",
                        self.name,
                        self.servers[index].name(),
                        self.servers[index].address(),
                        context.client_addr
                    );
                    return Ok(Selection { index, lease });
                }
                None => {
                    // 并发占满，本次排除后重选
                    blocked[index] = true;
                    saw_busy = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckConfig, HealthState, ServerConfig};

    fn backend(algorithm: BalanceAlgorithm, protocol: Protocol, count: usize) -> BackendConfig {
        BackendConfig {
            name: "pool".to_string(),
            protocol,
            balance: algorithm,
            max_conns_per_server: None,
            check: None,
            hash_key: None,
            servers: (0..count)
                .map(|i| ServerConfig {
                    name: format!("s{}", i + 1),
                    address: "127.0.0.1".to_string(),
                    port: 9000 + i as u16,
                    weight: 1,
                    check: None,
                })
                .collect(),
        }
    }

    fn pool(config: &BackendConfig, initial: HealthState) -> BackendPool {
        let servers = config
            .servers
            .iter()
            .map(|s| {
                let check = CheckConfig {
                    initial_state: initial,
                    ..config.effective_check(s)
                };
                Arc::new(Server::new(
                    &config.name,
                    &s.name,
                    format!("{}:{}", s.address, s.port).parse().unwrap(),
                    s.weight,
                    check,
                ))
            })
            .collect();
        BackendPool::new(config, servers)
    }

    fn context() -> RoutingContext {
        RoutingContext::new("10.0.0.1:40000".parse().unwrap(), Protocol::Tcp)
    }

    #[test]
    fn test_never_selects_down_server() {
        let config = backend(BalanceAlgorithm::RoundRobin, Protocol::Tcp, 3);
        let pool = pool(&config, HealthState::Up);
        pool.servers()[1].set_health_state(HealthState::Down);

        for _ in 0..20 {
            let selection = pool.select(&context(), &[]).unwrap();
            assert_ne!(selection.server().name(), "s2");
        }
    }

    #[test]
    fn test_no_eligible_server() {
        let config = backend(BalanceAlgorithm::LeastConn, Protocol::Tcp, 2);
        let pool = pool(&config, HealthState::Down);

        assert_eq!(
            pool.select(&context(), &[]).unwrap_err(),
            SelectError::NoEligibleServer("pool".to_string())
        );
        assert_eq!(pool.eligible_count(), 0);
    }

    #[test]
    fn test_last_server_going_down_rejects_subsequent_selects() {
        let config = backend(BalanceAlgorithm::SourceHash, Protocol::Tcp, 1);
        let pool = pool(&config, HealthState::Up);
        assert!(pool.select(&context(), &[]).is_ok());

        pool.servers()[0].set_health_state(HealthState::Down);
        for _ in 0..5 {
            assert!(matches!(
                pool.select(&context(), &[]),
                Err(SelectError::NoEligibleServer(_))
            ));
        }
    }

    #[test]
    fn test_exclude_is_per_call() {
        let config = backend(BalanceAlgorithm::RoundRobin, Protocol::Tcp, 2);
        let pool = pool(&config, HealthState::Up);

        for _ in 0..4 {
            let selection = pool.select(&context(), &[0]).unwrap();
            assert_eq!(selection.index, 1);
        }
        assert!(matches!(
            pool.select(&context(), &[0, 1]),
            Err(SelectError::NoEligibleServer(_))
        ));
        // 排除不影响健康状态
        assert!(pool.servers()[0].is_eligible());
    }

    #[test]
    fn test_max_conns_per_server() {
        let mut config = backend(BalanceAlgorithm::RoundRobin, Protocol::Tcp, 2);
        config.max_conns_per_server = Some(1);
        let pool = pool(&config, HealthState::Up);

        let first = pool.select(&context(), &[]).unwrap();
        let second = pool.select(&context(), &[]).unwrap();
        assert_ne!(first.index, second.index);
        assert_eq!(
            pool.select(&context(), &[]).unwrap_err(),
            SelectError::AllServersBusy("pool".to_string())
        );

        drop(first);
        assert!(pool.select(&context(), &[]).is_ok());
    }

    #[test]
    fn test_unchecked_udp_servers_always_eligible() {
        let config = backend(BalanceAlgorithm::RoundRobin, Protocol::Udp, 3);
        let pool = pool(&config, HealthState::Down);
        let udp = RoutingContext::new("10.0.0.9:5000".parse().unwrap(), Protocol::Udp);

        let names: Vec<String> = (0..6)
            .map(|_| pool.select(&udp, &[]).unwrap().server().name().to_string())
            .collect();
        assert_eq!(names, vec!["s1", "s2", "s3", "s1", "s2", "s3"]);
    }

    #[test]
    fn test_least_conn_counts_leases() {
        let config = backend(BalanceAlgorithm::LeastConn, Protocol::Tcp, 3);
        let pool = pool(&config, HealthState::Up);

        let held: Vec<Selection> = (0..3).map(|_| pool.select(&context(), &[]).unwrap()).collect();
        let mut indexes: Vec<usize> = held.iter().map(|s| s.index).collect();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[test]
    fn test_uri_hash_falls_back_without_key() {
        let mut config = backend(BalanceAlgorithm::UriHash, Protocol::Tcp, 3);
        config.hash_key = Some(KeyExtractor::RequestLine);
        let pool = pool(&config, HealthState::Up);
        assert!(pool.key_extractor().is_some());

        let keyed = context().with_key(Some(b"/a/b".to_vec()));
        let first = pool.select(&keyed, &[]).unwrap().index;
        for _ in 0..5 {
            assert_eq!(pool.select(&keyed, &[]).unwrap().index, first);
        }

        let picks: Vec<usize> = (0..3)
            .map(|_| pool.select(&context(), &[]).unwrap().index)
            .collect();
        assert_eq!(picks, vec![0, 1, 2]);
    }
}
