//! btrfs_backref: btrfs extent 反向引用解析
//!
//! 给定一个 extent 的逻辑地址，找出引用它的所有叶子、inode 位置和 tree root。
//! 提供：
//! - **快照一致**的遍历（commit root、最新 root 或 tree mod seq 时间点）
//! - 磁盘 backref（inline / keyed）与未落盘的 delayed ref 合并
//! - 共享检测的**提前退出**
//!
//! # 示例
//!
//! ```rust,ignore
//! use btrfs_backref::{backref, FsConfig, FsInfo, BTRFS_SEQ_LAST};
//!
//! let fs = FsInfo::new(device, FsConfig::default())?;
//! // ... 注册 root ...
//!
//! let roots = backref::find_all_roots(&fs, None, bytenr, BTRFS_SEQ_LAST, false)?;
//! for root in roots.values() {
//!     println!("referenced by tree {}", root);
//! }
//!
//! let shared = backref::check_shared(&fs, 5, 257, bytenr)?;
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`block`] - 块设备抽象
//! - [`types`] - 磁盘数据结构
//! - [`ctree`] - tree block、路径搜索与 root 注册表
//! - [`delayed_ref`] - 事务中排队的引用变更
//! - [`transaction`] - 事务与 tree mod seq
//! - [`fs`] - 文件系统上下文
//! - [`backref`] - 反向引用解析

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 块设备抽象
pub mod block;

/// 常量定义
pub mod consts;

/// 数据结构定义
pub mod types;

/// tree block 缓存
pub mod cache;

/// B-tree 读取
pub mod ctree;

/// Delayed ref
pub mod delayed_ref;

/// Transaction 与 tree mod seq
pub mod transaction;

/// 文件系统上下文
pub mod fs;

/// 反向引用解析
pub mod backref;

/// CRC32C 校验和计算
pub(crate) mod crc;

#[cfg(test)]
pub(crate) mod test_utils;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 块设备
pub use block::{BlockDev, BlockDevice};

// 常量
pub use consts::BTRFS_SEQ_LAST;

// 磁盘结构
pub use types::{ExtentFlags, Key};

// Tree
pub use ctree::{ExtentBuffer, RootNode, TreeView};

// FileSystem
pub use fs::{FsConfig, FsInfo, FsStats};

// Cache
pub use cache::{CacheStats, DEFAULT_CACHE_SIZE};

// Transaction
pub use transaction::{SeqElem, TransHandle};

// Backref
pub use backref::{
    check_shared, find_all_leafs, find_all_roots, find_parent_nodes, iterate_extent_inodes,
    ExtentInodeElem, FindOutcome, LeafList, ShareCheck, Ulist, WalkRequest,
};
