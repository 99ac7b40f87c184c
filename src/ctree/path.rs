//! 只读 B-tree 搜索路径
//!
//! `Path` 记录从 root 到目标位置每一层的块和 slot。所有移动（next_leaf、
//! prev_leaf）都沿路径向上再向下，因此始终停留在搜索时使用的同一个
//! root 视图中。

use super::{ExtentBuffer, RootNode, TreeBlockReader};
use crate::{
    consts::*,
    error::{Error, ErrorKind, Result},
    types::Key,
};
use alloc::sync::Arc;

/// 搜索路径
#[derive(Debug, Default)]
pub struct Path {
    /// 每层的块，nodes[0] 为叶子
    pub nodes: [Option<Arc<ExtentBuffer>>; BTRFS_MAX_LEVEL],
    /// 每层的 slot
    pub slots: [usize; BTRFS_MAX_LEVEL],
    /// 搜索停止的最低层
    pub lowest_level: u8,
}

impl Path {
    /// 创建空路径
    pub fn new() -> Self {
        Self::default()
    }

    /// 释放路径持有的所有块
    pub fn release(&mut self) {
        for node in self.nodes.iter_mut() {
            *node = None;
        }
        self.slots = [0; BTRFS_MAX_LEVEL];
    }

    /// 当前叶子
    pub fn leaf(&self) -> Option<&Arc<ExtentBuffer>> {
        self.nodes[0].as_ref()
    }

    /// 叶子 slot
    pub fn slot(&self) -> usize {
        self.slots[0]
    }

    /// 当前叶子 slot 处的 key，slot 越界时返回 None
    pub fn current_key(&self) -> Option<Key> {
        let leaf = self.leaf()?;
        if self.slots[0] < leaf.nritems() {
            Some(leaf.item_key(self.slots[0]))
        } else {
            None
        }
    }

    /// 从 `root` 开始搜索 `key`
    ///
    /// 搜索在 `lowest_level` 停止（root 本身更低时到叶子为止）。叶子层 slot 为第一个 >= key 的位置；
    /// 内部节点 slot 为覆盖 key 的子指针。返回是否精确命中。
    pub fn search<R: TreeBlockReader + ?Sized>(
        &mut self,
        reader: &R,
        root: RootNode,
        key: &Key,
    ) -> Result<bool> {
        self.release();

        // root 低于 lowest_level 时一直下降到叶子
        let mut eb = reader.read_tree_block(root.bytenr, root.level, root.generation)?;
        loop {
            let level = eb.level() as usize;
            let (found, slot) = eb.bin_search(key);

            if level == 0 {
                self.slots[0] = slot;
                self.nodes[0] = Some(eb);
                return Ok(found);
            }

            let dec = !found && slot > 0;
            let slot = if dec { slot - 1 } else { slot };
            self.slots[level] = slot;
            self.nodes[level] = Some(eb.clone());

            if level == self.lowest_level as usize {
                if dec {
                    self.slots[level] += 1;
                }
                return Ok(found);
            }

            let child = eb.node_blockptr(slot);
            let generation = eb.node_ptr_generation(slot);
            eb = reader.read_tree_block(child, (level - 1) as u8, generation)?;
        }
    }

    /// 从 `level` 层的当前 slot 下降到叶子，每层取第一个（`rightmost` 时取最后一个）子指针
    fn descend<R: TreeBlockReader + ?Sized>(
        &mut self,
        reader: &R,
        mut level: usize,
        rightmost: bool,
    ) -> Result<()> {
        while level > 0 {
            let node = match &self.nodes[level] {
                Some(node) => node.clone(),
                None => return Err(Error::new(ErrorKind::InvalidState, "Path has a hole")),
            };
            let slot = self.slots[level];
            let child = reader.read_tree_block(
                node.node_blockptr(slot),
                (level - 1) as u8,
                node.node_ptr_generation(slot),
            )?;
            level -= 1;
            self.slots[level] = if rightmost && level > 0 {
                child.nritems().saturating_sub(1)
            } else if rightmost {
                child.nritems()
            } else {
                0
            };
            self.nodes[level] = Some(child);
        }
        Ok(())
    }

    /// 移动到下一个叶子，slot 置 0
    ///
    /// 没有更多叶子时返回 false，路径保持不变
    pub fn next_leaf<R: TreeBlockReader + ?Sized>(&mut self, reader: &R) -> Result<bool> {
        let mut level = 1;
        loop {
            let node = match self.nodes.get(level) {
                Some(Some(node)) => node,
                _ => return Ok(false),
            };
            if self.slots[level] + 1 < node.nritems() {
                self.slots[level] += 1;
                break;
            }
            level += 1;
        }
        self.descend(reader, level, false)?;
        Ok(true)
    }

    /// 移动到上一个叶子，slot 置为 nritems
    ///
    /// 没有更早的叶子时返回 false
    pub fn prev_leaf<R: TreeBlockReader + ?Sized>(&mut self, reader: &R) -> Result<bool> {
        let mut level = 1;
        loop {
            match self.nodes.get(level) {
                Some(Some(_)) => {}
                _ => return Ok(false),
            }
            if self.slots[level] > 0 {
                self.slots[level] -= 1;
                break;
            }
            level += 1;
        }
        self.descend(reader, level, true)?;
        Ok(true)
    }

    /// 移动到下一个 item，必要时跨叶子
    ///
    /// 到达树尾时返回 false
    pub fn next_item<R: TreeBlockReader + ?Sized>(&mut self, reader: &R) -> Result<bool> {
        let nritems = match self.leaf() {
            Some(leaf) => leaf.nritems(),
            None => return Err(Error::new(ErrorKind::InvalidState, "Path has no leaf")),
        };
        self.slots[0] += 1;
        if self.slots[0] >= nritems {
            return self.next_leaf(reader);
        }
        Ok(true)
    }

    /// 向前查找 extent item 或 metadata item，objectid 不小于 `min_objectid`
    ///
    /// 找到时路径指向该 item 并返回 true
    pub fn previous_extent_item<R: TreeBlockReader + ?Sized>(
        &mut self,
        reader: &R,
        min_objectid: u64,
    ) -> Result<bool> {
        loop {
            if self.slots[0] == 0 {
                if !self.prev_leaf(reader)? {
                    return Ok(false);
                }
            } else {
                self.slots[0] -= 1;
            }

            let leaf = match self.leaf() {
                Some(leaf) => leaf.clone(),
                None => return Err(Error::new(ErrorKind::InvalidState, "Path has no leaf")),
            };
            let nritems = leaf.nritems();
            if nritems == 0 {
                return Ok(false);
            }
            if self.slots[0] == nritems {
                self.slots[0] -= 1;
            }
            let key = leaf.item_key(self.slots[0]);
            if key.objectid < min_objectid {
                return Ok(false);
            }
            if key.item_type == BTRFS_EXTENT_ITEM_KEY || key.item_type == BTRFS_METADATA_ITEM_KEY {
                return Ok(true);
            }
            if key.objectid == min_objectid && key.item_type < BTRFS_EXTENT_ITEM_KEY {
                return Ok(false);
            }
        }
    }
}
