//! 文件系统配置与统计

use crate::{
    cache::DEFAULT_CACHE_SIZE,
    consts::*,
    error::{Error, ErrorKind, Result},
};
use core::sync::atomic::{AtomicU64, Ordering};

/// 文件系统配置
#[derive(Debug, Clone, Copy)]
pub struct FsConfig {
    /// tree block 大小
    pub nodesize: u32,
    /// 扇区大小
    pub sectorsize: u32,
    /// tree block 的 extent item 使用 METADATA_ITEM（level 放在 key offset）
    pub skinny_metadata: bool,
    /// tree block 缓存大小（块数），0 表示不缓存
    pub tree_cache_blocks: usize,
    /// 读取 tree block 时校验 header 校验和
    pub verify_checksums: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            nodesize: BTRFS_DEFAULT_NODESIZE,
            sectorsize: BTRFS_DEFAULT_SECTORSIZE,
            skinny_metadata: true,
            tree_cache_blocks: DEFAULT_CACHE_SIZE,
            verify_checksums: true,
        }
    }
}

impl FsConfig {
    /// 检查配置
    pub fn validate(&self) -> Result<()> {
        if !self.sectorsize.is_power_of_two() || !self.nodesize.is_power_of_two() {
            return Err(Error::new(ErrorKind::InvalidInput, "Sizes must be powers of two"));
        }
        if self.nodesize < self.sectorsize {
            return Err(Error::new(ErrorKind::InvalidInput, "nodesize smaller than sectorsize"));
        }
        if (self.nodesize as usize) < BTRFS_HEADER_SIZE + BTRFS_ITEM_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "nodesize too small"));
        }
        Ok(())
    }

    /// 搜索 tree block 的 extent item 时使用的 key 类型
    pub fn metadata_key_type(&self) -> u8 {
        if self.skinny_metadata {
            BTRFS_METADATA_ITEM_KEY
        } else {
            BTRFS_EXTENT_ITEM_KEY
        }
    }
}

/// backref 引擎统计
#[derive(Debug, Default)]
pub struct FsStats {
    walker_calls: AtomicU64,
    tree_block_reads: AtomicU64,
}

impl FsStats {
    pub(crate) fn inc_walker_calls(&self) {
        self.walker_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_tree_block_reads(&self) {
        self.tree_block_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// find_parent_nodes 调用次数
    pub fn walker_calls(&self) -> u64 {
        self.walker_calls.load(Ordering::Relaxed)
    }

    /// tree block 读取次数（含缓存命中）
    pub fn tree_block_reads(&self) -> u64 {
        self.tree_block_reads.load(Ordering::Relaxed)
    }
}
