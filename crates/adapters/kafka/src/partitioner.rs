//! 客户端分区选择
//!
//! rskafka 只提供单分区客户端，由这里决定每条记录写入哪个分区。

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use murmur2::{KAFKA_SEED, murmur2};

use crate::config::Balancer;

/// 分区选择器
#[derive(Debug)]
pub struct Partitioner {
    balancer: Balancer,
    consistent: bool,
    next: AtomicUsize,
    /// topic → 每个分区累计写入的字节数
    written: Mutex<HashMap<String, Vec<u64>>>,
}

fn to_positive(hash: u32) -> u32 {
    hash & 0x7fff_ffff
}

impl Partitioner {
    /// `balancer` 为空时使用 murmur2
    pub fn new(balancer: Option<Balancer>, consistent: bool) -> Self {
        Self {
            balancer: balancer.unwrap_or(Balancer::Murmur2),
            consistent,
            next: AtomicUsize::new(0),
            written: Mutex::new(HashMap::new()),
        }
    }

    /// 在 `[0, partition_count)` 中选择分区
    pub fn partition(&self, topic: &str, key: Option<&[u8]>, size: usize, partition_count: usize) -> i32 {
        if partition_count <= 1 {
            return 0;
        }

        let index = match self.balancer {
            Balancer::LeastBytes => self.least_bytes(topic, size, partition_count),
            Balancer::Murmur2 | Balancer::Crc32 => match key {
                Some(key) => self.hash(key) as usize % partition_count,
                None if self.consistent => self.hash(&[]) as usize % partition_count,
                None => self.next.fetch_add(1, Ordering::Relaxed) % partition_count,
            },
        };
        index as i32
    }

    fn hash(&self, key: &[u8]) -> u32 {
        match self.balancer {
            Balancer::Crc32 => crc32fast::hash(key),
            _ => to_positive(murmur2(key, KAFKA_SEED)),
        }
    }

    fn least_bytes(&self, topic: &str, size: usize, partition_count: usize) -> usize {
        let mut written = self
            .written
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let counters = written.entry(topic.to_string()).or_default();
        counters.resize(partition_count.max(counters.len()), 0);

        let index = counters[..partition_count]
            .iter()
            .enumerate()
            .min_by_key(|(_, bytes)| **bytes)
            .map_or(0, |(i, _)| i);
        counters[index] += size as u64;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_partition() {
        let partitioner = Partitioner::new(Some(Balancer::Crc32), false);
        // crc32("123456789") = 0xCBF43926 = 3421780262
        assert_eq!(partitioner.partition("t", Some(b"123456789"), 1, 10), 2);
    }

    #[test]
    fn test_murmur2_is_deterministic() {
        let partitioner = Partitioner::new(None, false);
        let first = partitioner.partition("t", Some(b"order-42"), 1, 12);
        for _ in 0..10 {
            assert_eq!(partitioner.partition("t", Some(b"order-42"), 1, 12), first);
        }
        assert!((0..12).contains(&first));
    }

    #[test]
    fn test_keyless_round_robin() {
        let partitioner = Partitioner::new(Some(Balancer::Murmur2), false);
        let picks: Vec<i32> = (0..6).map(|_| partitioner.partition("t", None, 1, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_keyless_consistent() {
        let partitioner = Partitioner::new(Some(Balancer::Crc32), true);
        let first = partitioner.partition("t", None, 1, 7);
        assert!((0..6).all(|_| partitioner.partition("t", None, 1, 7) == first));
    }

    #[test]
    fn test_least_bytes() {
        let partitioner = Partitioner::new(Some(Balancer::LeastBytes), false);
        assert_eq!(partitioner.partition("t", None, 100, 3), 0);
        assert_eq!(partitioner.partition("t", None, 10, 3), 1);
        assert_eq!(partitioner.partition("t", None, 10, 3), 2);
        assert_eq!(partitioner.partition("t", None, 10, 3), 1);
        // 其他 topic 单独计数
        assert_eq!(partitioner.partition("other", None, 10, 3), 0);
    }

    #[test]
    fn test_single_partition() {
        let partitioner = Partitioner::new(Some(Balancer::LeastBytes), false);
        assert_eq!(partitioner.partition("t", Some(b"k"), 5, 1), 0);
        assert_eq!(partitioner.partition("t", Some(b"k"), 5, 0), 0);
    }
}
