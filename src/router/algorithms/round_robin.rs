use super::weighted_schedule;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 加权轮询 - 在可用服务器上按平滑加权顺序轮流选择
#[derive(Debug)]
pub struct RoundRobin {
    schedule: Vec<usize>,
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new(weights: &[u32]) -> Self {
        Self {
            schedule: weighted_schedule(weights),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn pick(&self, mask: &[bool]) -> Option<usize> {
        // 只在可用子集上轮转
        let eligible = self
            .schedule
            .iter()
            .filter(|index| mask.get(**index).copied().unwrap_or(false))
            .count();
        if eligible == 0 {
            return None;
        }

        let position = self.counter.fetch_add(1, Ordering::Relaxed) % eligible;
        self.schedule
            .iter()
            .copied()
            .filter(|index| mask.get(*index).copied().unwrap_or(false))
            .nth(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_selection() {
        let rr = RoundRobin::new(&[1, 1, 1]);
        let mask = [true, true, true];

        let picks: Vec<usize> = (0..4).filter_map(|_| rr.pick(&mask)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_skip_unhealthy_backends() {
        let rr = RoundRobin::new(&[1, 1, 1]);
        let mask = [true, false, true];

        let picks: Vec<usize> = (0..3).filter_map(|_| rr.pick(&mask)).collect();
        assert_eq!(picks, vec![0, 2, 0]);
    }

    #[test]
    fn test_weight_is_honored() {
        let rr = RoundRobin::new(&[3, 1]);
        let mask = [true, true];

        let picks: Vec<usize> = (0..8).filter_map(|_| rr.pick(&mask)).collect();
        assert_eq!(picks.iter().filter(|i| **i == 0).count(), 6);
        assert_eq!(picks.iter().filter(|i| **i == 1).count(), 2);
    }

    #[test]
    fn test_empty_mask() {
        let rr = RoundRobin::new(&[1, 1]);
        assert_eq!(rr.pick(&[false, false]), None);
        assert_eq!(rr.pick(&[]), None);
    }
}
