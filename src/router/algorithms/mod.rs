pub mod hash;
pub mod least_conn;
pub mod round_robin;

pub use hash::HashBalancer;
pub use least_conn::LeastConn;
pub use round_robin::RoundRobin;

use super::RoutingContext;
use crate::config::BalanceAlgorithm;
use crate::topology::Server;
use std::sync::Arc;

/// 负载均衡算法，在构建拓扑时确定
#[derive(Debug)]
pub enum Balancer {
    RoundRobin(RoundRobin),
    LeastConn(LeastConn),
    SourceHash(HashBalancer),
    UriHash {
        hash: HashBalancer,
        /// 无法提取键时使用
        fallback: RoundRobin,
    },
}

impl Balancer {
    pub fn new(algorithm: BalanceAlgorithm, servers: &[Arc<Server>]) -> Self {
        let weights: Vec<u32> = servers.iter().map(|s| s.weight()).collect();
        match algorithm {
            BalanceAlgorithm::RoundRobin => Balancer::RoundRobin(RoundRobin::new(&weights)),
            BalanceAlgorithm::LeastConn => Balancer::LeastConn(LeastConn::new()),
            BalanceAlgorithm::SourceHash => Balancer::SourceHash(HashBalancer::new(&weights)),
            BalanceAlgorithm::UriHash => Balancer::UriHash {
                hash: HashBalancer::new(&weights),
                fallback: RoundRobin::new(&weights),
            },
        }
    }

    /// Picks a server index among those set in `mask`.
    pub fn pick(
        &self,
        servers: &[Arc<Server>],
        mask: &[bool],
        context: &RoutingContext,
    ) -> Option<usize> {
        match self {
            Balancer::RoundRobin(rr) => rr.pick(mask),
            Balancer::LeastConn(lc) => lc.pick(servers, mask),
            Balancer::SourceHash(hash) => hash.pick(mask, &context.client_ip()),
            Balancer::UriHash { hash, fallback } => match &context.key {
                Some(key) => hash.pick(mask, key.as_slice()),
                None => fallback.pick(mask),
            },
        }
    }
}

/// Builds a smooth weighted schedule (nginx style): every server appears
/// `weight` times and heavy servers are spread out instead of clustered.
pub fn weighted_schedule(weights: &[u32]) -> Vec<usize> {
    let total: i64 = weights.iter().map(|w| i64::from(*w)).sum();
    let mut current = vec![0i64; weights.len()];
    let mut schedule = Vec::with_capacity(total as usize);

    for _ in 0..total {
        let mut best = 0;
        for (i, weight) in weights.iter().enumerate() {
            current[i] += i64::from(*weight);
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total;
        schedule.push(best);
    }

    schedule
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_schedule_is_smooth() {
        assert_eq!(weighted_schedule(&[1, 1, 1]), vec![0, 1, 2]);

        let schedule = weighted_schedule(&[5, 1, 1]);
        assert_eq!(schedule.len(), 7);
        assert_eq!(schedule.iter().filter(|i| **i == 0).count(), 5);
        // 权重大的服务器不会连续出现五次
        assert_eq!(schedule, vec![0, 0, 1, 0, 2, 0, 0]);
    }
}
