use super::weighted_schedule;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// 哈希选择 - 将键稳定地映射到可用服务器集合
///
/// 映射只依赖可用集合本身，集合不变时同一键总是落到同一服务器；
/// 集合变化时按新集合重新分布。
#[derive(Debug)]
pub struct HashBalancer {
    schedule: Vec<usize>,
}

impl HashBalancer {
    pub fn new(weights: &[u32]) -> Self {
        let mut schedule = weighted_schedule(weights);
        // 按服务器分组，便于权重按比例占据哈希空间
        schedule.sort_unstable();
        Self { schedule }
    }

    pub fn pick<K: Hash + ?Sized>(&self, mask: &[bool], key: &K) -> Option<usize> {
        let eligible: Vec<usize> = self
            .schedule
            .iter()
            .copied()
            .filter(|index| mask.get(*index).copied().unwrap_or(false))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let position = (hash_key(key) % eligible.len() as u64) as usize;
        Some(eligible[position])
    }
}

fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
