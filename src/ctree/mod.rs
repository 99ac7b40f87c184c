//! B-tree 只读访问
//!
//! - [`ExtentBuffer`] - 已校验的 tree block
//! - [`Path`] - 搜索路径（search / next_leaf / next_item / previous_extent_item）
//! - [`RootRegistry`] - 各 tree 的 commit / latest / 历史 root
//! - [`LeafBuilder`] / [`NodeBuilder`] - tree block 编码

mod builder;
mod extent_buffer;
mod path;
mod root;

pub use builder::{LeafBuilder, NodeBuilder};
pub use extent_buffer::ExtentBuffer;
pub use path::Path;
pub use root::{RootNode, RootRegistry, TreeView};

use crate::error::Result;
use alloc::sync::Arc;

/// tree block 读取接口
///
/// 实现者负责检查读到的块 level 和 generation 与父指针一致
pub trait TreeBlockReader {
    /// 读取 `bytenr` 处期望 level 为 `level`、generation 为 `generation` 的块
    fn read_tree_block(&self, bytenr: u64, level: u8, generation: u64) -> Result<Arc<ExtentBuffer>>;
}
