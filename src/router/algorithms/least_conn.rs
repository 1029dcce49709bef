use crate::topology::Server;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 最少连接 - 选择 活跃连接数/权重 最小的服务器，相同负载时按轮询顺序打破平局
#[derive(Debug, Default)]
pub struct LeastConn {
    counter: AtomicUsize,
}

impl LeastConn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pick(&self, servers: &[Arc<Server>], mask: &[bool]) -> Option<usize> {
        let count = servers.len().min(mask.len());
        if count == 0 {
            return None;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed) % count;
        let mut best: Option<(usize, u64, u64)> = None;

        for offset in 0..count {
            let index = (start + offset) % count;
            if !mask[index] {
                continue;
            }

            let active = servers[index].active_connections() as u64;
            let weight = u64::from(servers[index].weight());
            // active/weight 比较，交叉相乘避免浮点
            let better = match best {
                None => true,
                Some((_, best_active, best_weight)) => active * best_weight < best_active * weight,
            };
            if better {
                best = Some((index, active, weight));
            }
        }

        best.map(|(index, _, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckConfig;

    fn servers(weights: &[u32]) -> Vec<Arc<Server>> {
        weights
            .iter()
            .enumerate()
            .map(|(i, weight)| {
                Arc::new(Server::new(
                    "pool",
                    format!("backend{}", i + 1),
                    format!("127.0.0.1:{}", 8001 + i).parse().unwrap(),
                    *weight,
                    CheckConfig::default(),
                ))
            })
            .collect()
    }

    #[test]
    fn test_least_connections_selection() {
        let servers = servers(&[1, 1, 1]);
        let mut held = Vec::new();
        for (index, count) in [(0usize, 5), (1, 2), (2, 8)] {
            for _ in 0..count {
                held.push(servers[index].try_acquire(None).unwrap());
            }
        }

        let lc = LeastConn::new();
        for _ in 0..3 {
            assert_eq!(lc.pick(&servers, &[true, true, true]), Some(1));
        }
    }

    #[test]
    fn test_equal_connections_rotate() {
        let servers = servers(&[1, 1, 1]);
        let lc = LeastConn::new();
        let mask = [true, true, true];

        let picks: Vec<usize> = (0..3).filter_map(|_| lc.pick(&servers, &mask)).collect();
        assert_eq!(picks, vec![0, 1, 2]);
    }

    #[test]
    fn test_skip_masked_backends() {
        let servers = servers(&[1, 1, 1]);
        let _busy: Vec<_> = (0..3)
            .map(|_| servers[1].try_acquire(None).unwrap())
            .collect();

        let lc = LeastConn::new();
        // backend1 连接最少但不可用
        assert_eq!(lc.pick(&servers, &[false, true, true]), Some(2));
        assert_eq!(lc.pick(&servers, &[false, true, false]), Some(1));
        assert_eq!(lc.pick(&servers, &[false, false, false]), None);
    }

    #[test]
    fn test_weight_scales_load() {
        let servers = servers(&[1, 4]);
        let _a = servers[0].try_acquire(None).unwrap();
        let _b: Vec<_> = (0..3).map(|_| servers[1].try_acquire(None).unwrap()).collect();

        // 1/1 > 3/4
        let lc = LeastConn::new();
        assert_eq!(lc.pick(&servers, &[true, true]), Some(1));
    }
}
