//! tree block 缓存实现（基于 lru crate）

use crate::ctree::ExtentBuffer;
use alloc::sync::Arc;
use core::num::NonZeroUsize;
use lru::LruCache;

/// 默认缓存块数量
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// 缓存统计信息
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// 总访问次数
    pub total_accesses: u64,
    /// 缓存命中次数
    pub hits: u64,
    /// 缓存未命中次数
    pub misses: u64,
    /// 失效次数
    pub invalidations: u64,
}

impl CacheStats {
    /// 计算命中率
    pub fn hit_rate(&self) -> f64 {
        if self.total_accesses == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_accesses as f64
        }
    }
}

/// tree block 缓存
pub struct TreeBlockCache {
    /// LRU缓存核心
    cache: LruCache<u64, Arc<ExtentBuffer>>,

    /// 统计信息
    stats: CacheStats,
}

impl TreeBlockCache {
    /// 创建新的缓存，容量为 0 时返回 None
    pub fn new(capacity: usize) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            cache: LruCache::new(capacity),
            stats: CacheStats::default(),
        })
    }

    /// 查找并提升为最近使用
    pub fn get(&mut self, bytenr: u64) -> Option<Arc<ExtentBuffer>> {
        self.stats.total_accesses += 1;
        match self.cache.get(&bytenr) {
            Some(eb) => {
                self.stats.hits += 1;
                log::trace!("[CACHE] tree block {:#x} HIT", bytenr);
                Some(eb.clone())
            }
            None => {
                self.stats.misses += 1;
                log::trace!("[CACHE] tree block {:#x} MISS", bytenr);
                None
            }
        }
    }

    /// 插入，满时自动驱逐最久未使用的块
    pub fn insert(&mut self, bytenr: u64, eb: Arc<ExtentBuffer>) {
        if let Some((evicted, _)) = self.cache.push(bytenr, eb) {
            if evicted != bytenr {
                log::debug!("[CACHE] Evicted tree block {:#x}", evicted);
            }
        }
    }

    /// 使一个块失效
    pub fn invalidate(&mut self, bytenr: u64) {
        if self.cache.pop(&bytenr).is_some() {
            self.stats.invalidations += 1;
        }
    }

    /// 清空缓存
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// 当前缓存块数量
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// 缓存是否为空
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// 缓存容量
    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// 统计信息
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctree::LeafBuilder;

    fn leaf(bytenr: u64) -> Arc<ExtentBuffer> {
        let data = LeafBuilder::new(bytenr, 4096, 5, 1).finish();
        Arc::new(ExtentBuffer::from_bytes(data, bytenr, true).unwrap())
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        assert!(TreeBlockCache::new(0).is_none());
    }

    #[test]
    fn test_hit_and_miss_stats() {
        let mut cache = TreeBlockCache::new(4).unwrap();
        assert!(cache.get(4096).is_none());
        cache.insert(4096, leaf(4096));
        assert!(cache.get(4096).is_some());
        assert_eq!(cache.stats().total_accesses, 2);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().hit_rate(), 0.5);
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = TreeBlockCache::new(2).unwrap();
        cache.insert(4096, leaf(4096));
        cache.insert(8192, leaf(8192));
        // 访问 4096 使其成为 MRU
        assert!(cache.get(4096).is_some());
        cache.insert(12288, leaf(12288));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(4096).is_some());
        assert!(cache.get(8192).is_none());
    }

    #[test]
    fn test_invalidate() {
        let mut cache = TreeBlockCache::new(2).unwrap();
        cache.insert(4096, leaf(4096));
        cache.invalidate(4096);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().invalidations, 1);
    }
}
