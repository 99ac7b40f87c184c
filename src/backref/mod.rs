//! Extent back-reference 解析
//!
//! 给定一个 extent 地址，找出所有引用它的 tree（root）、叶子以及
//! (inode, 文件偏移) 位置。
//!
//! # 流程
//!
//! 1. [`find_parent_nodes`] 在 extent tree 中定位 extent item，收集 inline、
//!    keyed 以及 delayed 三种来源的引用，放入 [`PreftreeSet`]
//! 2. 读块补全 missing-keys 引用的搜索 key，再在所属 tree 的指定快照中
//!    搜索，把 indirect 引用解析为 direct 引用
//! 3. 遍历 direct 树输出 root 和叶子
//!
//! 闭包驱动（[`find_all_roots`]、[`check_shared`] 等）把找到的叶子重新作为
//! extent 输入，迭代地求出引用的传递闭包。
//!
//! # 共享检测
//!
//! 传入 [`ShareCheck`] 时，一旦证明 extent 被多个独立所有者引用就提前返回
//! [`FindOutcome::Shared`]。

mod collect;
mod iterate;
mod prelim;
mod resolve;
mod ulist;
mod walk;

pub use iterate::{
    check_shared, extent_from_logical, find_all_leafs, find_all_roots, find_all_roots_safe,
    iterate_extent_inodes, iterate_inodes_from_logical, InodeContainer, TreeBackrefIter,
};
pub use prelim::{update_share_count, ExtentInodeElem, PrelimRef, Preftree, PreftreeSet};
pub use ulist::{Ulist, UlistNode};
pub use walk::{find_parent_nodes, LeafList, WalkRequest};

/// 共享检测上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareCheck {
    /// 调用者的 root，0 表示不按 root 过滤
    pub root_objectid: u64,
    /// 调用者的 inode，0 表示不按 inode 过滤
    pub inum: u64,
    /// 当前为正的独立引用数
    pub share_count: i32,
}

impl ShareCheck {
    /// 创建
    pub fn new(root_objectid: u64, inum: u64) -> Self {
        Self { root_objectid, inum, share_count: 0 }
    }

    /// share_count > 1 即为共享
    pub fn is_shared(&self) -> bool {
        self.share_count > 1
    }

    /// `root` 与过滤 root 不同
    pub fn rejects_root(&self, root: u64) -> bool {
        self.root_objectid != 0 && root != self.root_objectid
    }

    /// `inum` 与过滤 inode 不同
    pub fn rejects_inode(&self, inum: u64) -> bool {
        self.inum != 0 && inum != self.inum
    }
}

/// [`find_parent_nodes`] 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindOutcome {
    /// 遍历完成
    Found,
    /// extent 在该快照中没有引用
    NoRefs,
    /// 已证明共享（仅在传入 ShareCheck 时）
    Shared,
}

/// 内部步骤的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Walk {
    Done,
    Shared,
}
