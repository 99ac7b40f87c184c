//! tree block 缓存模块
//!
//! 缓存已解析、已校验的 tree block（[`ExtentBuffer`](crate::ctree::ExtentBuffer)）。
//!
//! # 设计原理
//!
//! 1. **数据结构**：使用 `lru::LruCache<u64, Arc<ExtentBuffer>>`，key 为 bytenr
//! 2. **只读共享**：tree block 采用 COW，缓存中的块永不原地修改，因此直接共享 `Arc`
//! 3. **失效**：写入某个地址时使对应缓存块失效
//!
//! # 使用示例
//!
//! ```rust,ignore
//! use btrfs_backref::cache::TreeBlockCache;
//!
//! let mut cache = TreeBlockCache::new(256).unwrap();
//! if let Some(eb) = cache.get(bytenr) {
//!     // 命中
//! }
//! ```

mod block_cache;

pub use block_cache::{CacheStats, TreeBlockCache, DEFAULT_CACHE_SIZE};
