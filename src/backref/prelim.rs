//! prelim ref 与三棵合并树
//!
//! 一个 [`PrelimRef`] 是某个 extent 的候选引用。[`PreftreeSet`] 持有三棵
//! 按 `(level, root_id, key.type, key.objectid, key.offset, parent)` 排序的树：
//!
//! - `direct` - parent 已知
//! - `indirect` - root + 搜索 key 已知
//! - `indirect_missing_keys` - root + level 已知，key 需要读块获得
//!
//! 插入时与相等的已有项合并：count 相加，inode 列表拼接。

use super::ShareCheck;
use crate::{error::Result, types::Key};
use alloc::{collections::BTreeMap, vec::Vec};

/// (inode, 文件偏移) 对
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentInodeElem {
    /// inode 号
    pub inum: u64,
    /// 文件偏移
    pub offset: u64,
}

/// 候选引用
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrelimRef {
    /// 所属 tree，direct ref 为 0
    pub root_id: u64,
    /// 重新定位引用者的搜索 key
    pub key_for_search: Key,
    /// 引用所在的 level（0 为数据）
    pub level: u8,
    /// 引用次数，合并 delayed drop 时可暂时为负
    pub count: i32,
    /// 引用者块地址，未解析时为 0
    pub parent: u64,
    /// 被查找的 extent 地址
    pub wanted_disk_byte: u64,
    /// 扫描叶子时得到的位置信息
    pub inode_list: Vec<ExtentInodeElem>,
}

/// 合并树的排序键
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PrefKey {
    level: u8,
    root_id: u64,
    key_type: u8,
    key_objectid: u64,
    key_offset: u64,
    parent: u64,
}

impl PrefKey {
    fn of(r: &PrelimRef) -> Self {
        Self {
            level: r.level,
            root_id: r.root_id,
            key_type: r.key_for_search.item_type,
            key_objectid: r.key_for_search.objectid,
            key_offset: r.key_for_search.offset,
            parent: r.parent,
        }
    }
}

/// 按 count 的变化更新 share_count
///
/// 新建项视为 old == 0
pub fn update_share_count(sc: Option<&mut ShareCheck>, old: i32, new: i32) {
    let sc = match sc {
        Some(sc) => sc,
        None => return,
    };
    if old == 0 && new < 1 {
        return;
    }
    if old > 0 && new < 1 {
        sc.share_count -= 1;
    } else if old < 1 && new > 0 {
        sc.share_count += 1;
    }
}

/// 一棵合并树
#[derive(Debug, Default)]
pub struct Preftree {
    refs: BTreeMap<PrefKey, PrelimRef>,
}

impl Preftree {
    /// 创建空树
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入并与相等项合并
    pub fn insert(&mut self, mut newref: PrelimRef, sc: Option<&mut ShareCheck>) -> Result<()> {
        use alloc::collections::btree_map::Entry;

        match self.refs.entry(PrefKey::of(&newref)) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                existing.inode_list.try_reserve(newref.inode_list.len())?;
                existing.inode_list.append(&mut newref.inode_list);
                let old = existing.count;
                existing.count += newref.count;
                update_share_count(sc, old, existing.count);
                log::trace!(
                    "[BACKREF] merged ref root={} parent={:#x} level={} count {} -> {}",
                    existing.root_id,
                    existing.parent,
                    existing.level,
                    old,
                    existing.count
                );
            }
            Entry::Vacant(slot) => {
                update_share_count(sc, 0, newref.count);
                log::trace!(
                    "[BACKREF] new ref root={} parent={:#x} level={} count={}",
                    newref.root_id,
                    newref.parent,
                    newref.level,
                    newref.count
                );
                slot.insert(newref);
            }
        }
        Ok(())
    }

    /// 取出排序最前的项
    pub fn pop_first(&mut self) -> Option<PrelimRef> {
        self.refs.pop_first().map(|(_, r)| r)
    }

    /// 按排序遍历
    pub fn iter(&self) -> impl Iterator<Item = &PrelimRef> {
        self.refs.values()
    }

    /// 按排序可变遍历
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PrelimRef> {
        self.refs.values_mut()
    }

    /// 是否有 parent 为 `bytenr` 的 shared data ref
    pub fn has_shared_data_parent(&self, bytenr: u64) -> bool {
        let target = PrefKey {
            level: 0,
            root_id: 0,
            key_type: 0,
            key_objectid: 0,
            key_offset: 0,
            parent: bytenr,
        };
        self.refs.contains_key(&target)
    }

    /// 项数
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// 释放全部项
    pub fn release(&mut self) {
        self.refs.clear();
    }
}

/// 三棵合并树
#[derive(Debug, Default)]
pub struct PreftreeSet {
    /// parent 已知
    pub direct: Preftree,
    /// root + key 已知
    pub indirect: Preftree,
    /// root + level 已知，key 待读取
    pub indirect_missing_keys: Preftree,
}

impl PreftreeSet {
    /// 创建
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加 direct ref
    pub fn add_direct_ref(
        &mut self,
        level: u8,
        parent: u64,
        wanted_disk_byte: u64,
        count: i32,
        sc: Option<&mut ShareCheck>,
    ) -> Result<()> {
        let r = PrelimRef { level, parent, wanted_disk_byte, count, ..Default::default() };
        self.direct.insert(r, sc)
    }

    /// 添加 indirect ref；`key` 为 None 时进入 missing-keys 树
    pub fn add_indirect_ref(
        &mut self,
        root_id: u64,
        key: Option<Key>,
        level: u8,
        wanted_disk_byte: u64,
        count: i32,
        sc: Option<&mut ShareCheck>,
    ) -> Result<()> {
        let r = PrelimRef {
            root_id,
            key_for_search: key.unwrap_or_default(),
            level,
            wanted_disk_byte,
            count,
            ..Default::default()
        };
        match key {
            Some(_) => self.indirect.insert(r, sc),
            None => self.indirect_missing_keys.insert(r, sc),
        }
    }

    /// 释放三棵树
    pub fn release(&mut self) {
        self.direct.release();
        self.indirect.release();
        self.indirect_missing_keys.release();
    }
}
