//! 子树 root 注册表
//!
//! 记录每个 tree 的 root 节点。tree block 采用 COW，旧 root 下的所有块
//! 在被替换后保持不变，因此按 seq 保存被替换的旧 root 即可重建历史视图。
//!
//! 三种视图：
//!
//! - [`TreeView::Commit`] - 上次提交时的 root
//! - [`TreeView::Latest`] - 当前（运行中事务内）的 root
//! - [`TreeView::Seq`] - 某个 tree mod seq 时刻的 root

use crate::error::{Error, ErrorKind, Result};
use alloc::{collections::BTreeMap, vec::Vec};
use parking_lot::RwLock;

/// tree root 节点位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootNode {
    /// root 块地址
    pub bytenr: u64,
    /// root 块 level
    pub level: u8,
    /// root 块 generation
    pub generation: u64,
}

impl RootNode {
    /// 创建
    pub const fn new(bytenr: u64, level: u8, generation: u64) -> Self {
        Self { bytenr, level, generation }
    }
}

/// 搜索使用的 tree 视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeView {
    /// 已提交的 root
    Commit,
    /// 最新 root
    Latest,
    /// 给定 seq 时刻的 root
    Seq(u64),
}

#[derive(Debug, Clone)]
struct RootEntry {
    /// 已提交 root，事务中新建的 tree 尚无
    commit: Option<RootNode>,
    latest: RootNode,
    /// (替换发生时的 seq, 被替换的 root)，seq 递增
    history: Vec<(u64, RootNode)>,
    /// tree 正在被删除
    deleting: bool,
}

/// root 注册表
#[derive(Debug, Default)]
pub struct RootRegistry {
    roots: RwLock<BTreeMap<u64, RootEntry>>,
}

impl RootRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个已提交的 tree
    pub fn insert_committed(&self, root_id: u64, node: RootNode) {
        self.roots.write().insert(
            root_id,
            RootEntry { commit: Some(node), latest: node, history: Vec::new(), deleting: false },
        );
    }

    /// 在运行中事务里新建 tree（提交前没有 commit root）
    pub fn insert_uncommitted(&self, root_id: u64, node: RootNode) {
        self.roots.write().insert(
            root_id,
            RootEntry { commit: None, latest: node, history: Vec::new(), deleting: false },
        );
    }

    /// COW 更新 tree 的 root
    ///
    /// `seq` 为本次修改取得的 tree mod seq，持有更小 seq 的读者看到旧 root
    pub fn update_root(&self, root_id: u64, node: RootNode, seq: u64) -> Result<()> {
        let mut roots = self.roots.write();
        let entry = roots
            .get_mut(&root_id)
            .ok_or(Error::new(ErrorKind::NotFound, "Unknown tree root"))?;
        if let Some(&(last, _)) = entry.history.last() {
            if seq < last {
                return Err(Error::new(ErrorKind::InvalidInput, "Root update seq went backwards"));
            }
        }
        let old = entry.latest;
        entry.history.try_reserve(1)?;
        entry.history.push((seq, old));
        entry.latest = node;
        log::debug!(
            "[TREE] root {} moved {:#x} -> {:#x} at seq {}",
            root_id,
            old.bytenr,
            node.bytenr,
            seq
        );
        Ok(())
    }

    /// 标记 tree 正在删除
    pub fn set_deleting(&self, root_id: u64, deleting: bool) -> Result<()> {
        let mut roots = self.roots.write();
        let entry = roots
            .get_mut(&root_id)
            .ok_or(Error::new(ErrorKind::NotFound, "Unknown tree root"))?;
        entry.deleting = deleting;
        Ok(())
    }

    /// tree 是否正在删除；未知 tree 返回 false
    pub fn is_deleting(&self, root_id: u64) -> bool {
        self.roots.read().get(&root_id).map_or(false, |e| e.deleting)
    }

    /// 按视图查找 root
    ///
    /// 未知 tree、或者该视图下 tree 不存在时返回 `ErrorKind::NotFound`
    pub fn lookup(&self, root_id: u64, view: TreeView) -> Result<RootNode> {
        let roots = self.roots.read();
        let entry = roots
            .get(&root_id)
            .ok_or(Error::new(ErrorKind::NotFound, "Unknown tree root"))?;
        match view {
            TreeView::Commit => {
                entry.commit.ok_or(Error::new(ErrorKind::NotFound, "Tree has no commit root"))
            }
            TreeView::Latest => Ok(entry.latest),
            TreeView::Seq(seq) => Ok(entry
                .history
                .iter()
                .find(|(changed, _)| *changed > seq)
                .map_or(entry.latest, |(_, old)| *old)),
        }
    }

    /// 事务提交：所有 latest 成为 commit root
    pub fn commit_all(&self) {
        for entry in self.roots.write().values_mut() {
            entry.commit = Some(entry.latest);
        }
    }

    /// 丢弃不再被任何读者需要的历史
    ///
    /// `min_seq` 为当前最小的活跃读者 seq，None 表示没有读者
    pub fn prune_history(&self, min_seq: Option<u64>) -> usize {
        let mut pruned = 0;
        for entry in self.roots.write().values_mut() {
            let before = entry.history.len();
            match min_seq {
                Some(min) => entry.history.retain(|(changed, _)| *changed > min),
                None => entry.history.clear(),
            }
            pruned += before - entry.history.len();
        }
        if pruned > 0 {
            log::trace!("[TREE] pruned {} historical roots", pruned);
        }
        pruned
    }
}
