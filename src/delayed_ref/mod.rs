//! Delayed reference（延迟引用）
//!
//! 运行中的事务把尚未写入 extent tree 的引用增减记录在内存中：
//!
//! - [`DelayedRefRoot`] - 每个事务一个，bytenr → head 的映射
//! - [`DelayedRefHead`] - 每个 extent 一个，`mutex` 串行化使用者，
//!   `lock` 只在读写 pending 列表时短暂持有
//! - [`DelayedRefNode`] - 一次引用变更，带 tree mod seq
//!
//! backref 遍历在 head 的 `mutex` 下通过 `lock` 快照 pending 列表，
//! 跳过 seq 大于快照边界的节点。

use crate::{
    error::Result,
    types::{ExtentFlags, Key},
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use parking_lot::{Mutex, MutexGuard};

/// 引用变更动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedAction {
    /// 增加引用
    AddRef,
    /// 删除引用
    DropRef,
    /// 新分配的 extent
    AddExtent,
    /// 只更新 head（extent op）
    UpdateHead,
}

/// 引用的 backref 形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedRefKind {
    /// tree block，由 root 引用
    TreeBlock {
        /// root id
        root: u64,
        /// 被引用块的 level
        level: u8,
    },
    /// tree block，由 parent 块引用
    SharedBlock {
        /// parent 地址
        parent: u64,
        /// 被引用块的 level
        level: u8,
    },
    /// 数据，由 (root, inode, offset) 引用
    ExtentData {
        /// root id
        root: u64,
        /// inode 号
        objectid: u64,
        /// 文件位置 - extent 内偏移
        offset: u64,
    },
    /// 数据，由 parent 叶子引用
    SharedData {
        /// parent 地址
        parent: u64,
    },
}

/// 一次 delayed 引用变更
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayedRefNode {
    /// 排队时取得的 tree mod seq
    pub seq: u64,
    /// 动作
    pub action: DelayedAction,
    /// 引用数变化量（总为正，方向由 action 决定）
    pub ref_mod: i32,
    /// backref 形式
    pub kind: DelayedRefKind,
}

/// head 上附带的 extent 更新
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentOp {
    /// tree block 新的第一个 key
    pub key: Option<Key>,
    /// 新的 extent 标志
    pub flags: Option<ExtentFlags>,
}

/// 受 head `lock` 保护的状态
#[derive(Debug, Default)]
pub struct HeadRefs {
    refs: Vec<DelayedRefNode>,
    extent_op: Option<ExtentOp>,
}

impl HeadRefs {
    /// pending 节点（按排队顺序）
    pub fn refs(&self) -> &[DelayedRefNode] {
        &self.refs
    }

    /// extent op
    pub fn extent_op(&self) -> Option<&ExtentOp> {
        self.extent_op.as_ref()
    }
}

/// 一个 extent 的 delayed ref head
#[derive(Debug)]
pub struct DelayedRefHead {
    bytenr: u64,
    num_bytes: u64,
    is_data: bool,
    /// 串行化 head 的使用者，可能长时间持有
    mutex: Mutex<()>,
    /// 保护 pending 列表
    lock: Mutex<HeadRefs>,
}

impl DelayedRefHead {
    /// 创建空 head
    pub fn new(bytenr: u64, num_bytes: u64, is_data: bool) -> Self {
        Self {
            bytenr,
            num_bytes,
            is_data,
            mutex: Mutex::new(()),
            lock: Mutex::new(HeadRefs::default()),
        }
    }

    /// extent 地址
    pub fn bytenr(&self) -> u64 {
        self.bytenr
    }

    /// extent 大小
    pub fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    /// 是否为数据 extent
    pub fn is_data(&self) -> bool {
        self.is_data
    }

    /// 尝试获取 head mutex，不阻塞
    pub fn try_lock_mutex(&self) -> Option<MutexGuard<'_, ()>> {
        self.mutex.try_lock()
    }

    /// 获取 head mutex，可能阻塞
    pub fn lock_mutex(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock()
    }

    /// 获取 pending 列表锁
    pub fn lock(&self) -> MutexGuard<'_, HeadRefs> {
        self.lock.lock()
    }

    /// 追加一个节点
    pub fn add_node(&self, node: DelayedRefNode) -> Result<()> {
        let mut refs = self.lock.lock();
        refs.refs.try_reserve(1)?;
        refs.refs.push(node);
        Ok(())
    }

    /// 设置或合并 extent op
    pub fn set_extent_op(&self, op: ExtentOp) {
        let mut refs = self.lock.lock();
        let merged = match refs.extent_op {
            Some(old) => ExtentOp { key: op.key.or(old.key), flags: op.flags.or(old.flags) },
            None => op,
        };
        refs.extent_op = Some(merged);
    }
}

/// 一个事务的全部 delayed ref head
#[derive(Debug, Default)]
pub struct DelayedRefRoot {
    heads: Mutex<BTreeMap<u64, Arc<DelayedRefHead>>>,
}

impl DelayedRefRoot {
    /// 创建空集合
    pub fn new() -> Self {
        Self::default()
    }

    /// 查找 head
    pub fn find_head(&self, bytenr: u64) -> Option<Arc<DelayedRefHead>> {
        self.heads.lock().get(&bytenr).cloned()
    }

    /// 查找或创建 head
    pub fn head_or_insert(&self, bytenr: u64, num_bytes: u64, is_data: bool) -> Arc<DelayedRefHead> {
        self.heads
            .lock()
            .entry(bytenr)
            .or_insert_with(|| Arc::new(DelayedRefHead::new(bytenr, num_bytes, is_data)))
            .clone()
    }

    /// 排队一个节点，返回所属 head
    pub fn queue(
        &self,
        bytenr: u64,
        num_bytes: u64,
        is_data: bool,
        node: DelayedRefNode,
    ) -> Result<Arc<DelayedRefHead>> {
        let head = self.head_or_insert(bytenr, num_bytes, is_data);
        head.add_node(node)?;
        log::trace!(
            "[DELAYED] queued {:?} x{} {:?} for {:#x} at seq {}",
            node.action,
            node.ref_mod,
            node.kind,
            bytenr,
            node.seq
        );
        Ok(head)
    }

    /// head 数量
    pub fn num_heads(&self) -> usize {
        self.heads.lock().len()
    }

    /// 丢弃所有 head
    pub fn clear(&self) {
        self.heads.lock().clear();
    }
}
