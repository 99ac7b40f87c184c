//! indirect ref 解析
//!
//! missing-keys ref 先读块取得第一个 key，然后所有 indirect ref 在所属 tree
//! 的快照中搜索，找到的块成为 direct ref 的 parent。
//!
//! level 0 的数据 ref 需要从搜索位置向后扫描叶子，逐个比较文件 extent 指向的
//! 磁盘地址，最多找到 `total_refs` 个匹配为止。

use super::{
    walk::Walker, ExtentInodeElem, Preftree, PreftreeSet, PrelimRef, ShareCheck, Ulist, Walk,
};
use crate::{
    block::BlockDevice,
    consts::*,
    ctree::{ExtentBuffer, Path, TreeBlockReader, TreeView},
    error::{Error, ErrorKind, Result},
    types::{FileExtentItem, Key},
};
use alloc::{vec, vec::Vec};

type Parents = Ulist<Vec<ExtentInodeElem>>;

fn append_elems(old: &mut Vec<ExtentInodeElem>, mut new: Vec<ExtentInodeElem>) -> Result<()> {
    old.try_reserve(new.len())?;
    old.append(&mut new);
    Ok(())
}

/// 文件 extent 是否覆盖 `extent_item_pos`
///
/// 覆盖时返回 (inode, 文件偏移)。压缩、加密或 `ignore_offset` 时不比较范围，
/// 偏移取 key offset。
pub(crate) fn check_extent_in_eb(
    key: &Key,
    fi: &FileExtentItem,
    extent_item_pos: u64,
    ignore_offset: bool,
) -> Option<ExtentInodeElem> {
    let mut offset = 0;
    if !ignore_offset && fi.is_plain() {
        let data_offset = fi.offset;
        let data_len = fi.num_bytes;
        if extent_item_pos < data_offset || extent_item_pos >= data_offset + data_len {
            return None;
        }
        offset = extent_item_pos - data_offset;
    }
    Some(ExtentInodeElem { inum: key.objectid, offset: key.offset + offset })
}

/// 扫描整个叶子，收集指向 `wanted_disk_byte` 的文件 extent 位置
pub(crate) fn find_extent_in_eb(
    eb: &ExtentBuffer,
    wanted_disk_byte: u64,
    extent_item_pos: u64,
    ignore_offset: bool,
) -> Result<Vec<ExtentInodeElem>> {
    let mut elems = Vec::new();
    for slot in 0..eb.nritems() {
        let key = eb.item_key(slot);
        if key.item_type != BTRFS_EXTENT_DATA_KEY {
            continue;
        }
        let fi = FileExtentItem::parse(eb.item_data(slot));
        if fi.is_inline() || fi.disk_bytenr != wanted_disk_byte {
            continue;
        }
        if let Some(elem) = check_extent_in_eb(&key, &fi, extent_item_pos, ignore_offset) {
            elems.try_reserve(1)?;
            elems.push(elem);
        }
    }
    Ok(elems)
}

impl<D: BlockDevice> Walker<'_, D> {
    /// 读块补全 missing-keys ref 的搜索 key，移入 indirect 树
    pub(crate) fn add_missing_keys(&self, preftrees: &mut PreftreeSet) -> Result<()> {
        while let Some(mut r) = preftrees.indirect_missing_keys.pop_first() {
            assert!(r.parent == 0, "missing-key ref already has a parent");
            assert!(r.key_for_search.is_zero(), "missing-key ref already has a key");
            assert!(r.wanted_disk_byte != 0 && r.level > 0, "missing-key ref without a block");

            let eb = self.fs.read_tree_block(r.wanted_disk_byte, r.level - 1, 0)?;
            if let Some(key) = eb.first_key() {
                r.key_for_search = key;
            }
            log::trace!(
                "[BACKREF] block {:#x} of root {} starts at {:?}",
                r.wanted_disk_byte,
                r.root_id,
                r.key_for_search
            );
            preftrees.indirect.insert(r, None)?;
        }
        Ok(())
    }

    /// 逐个弹出 indirect ref 并解析
    ///
    /// 找不到的 ref 以 parent 0 移入 direct 树；多个 parent 时为其余 parent 复制 ref。
    /// `sc` 过滤 root 不符时立即返回 [`Walk::Shared`]。
    pub(crate) fn resolve_indirect_refs(
        &self,
        preftrees: &mut PreftreeSet,
        total_refs: i64,
        sc: Option<&mut ShareCheck>,
    ) -> Result<Walk> {
        while let Some(mut r) = preftrees.indirect.pop_first() {
            assert!(r.parent == 0, "direct ref found in indirect tree");
            if r.count == 0 {
                continue;
            }
            if sc.as_deref().map_or(false, |sc| sc.rejects_root(r.root_id)) {
                return Ok(Walk::Shared);
            }

            let parents = match self.resolve_indirect_ref(&r, &preftrees.direct, total_refs) {
                Ok(parents) => parents,
                Err(e) if e.is_not_found() => {
                    preftrees.direct.insert(r, None)?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut nodes = parents.into_nodes().into_iter();
            if let Some(first) = nodes.next() {
                for extra in nodes {
                    let dup = PrelimRef { parent: extra.val, inode_list: extra.aux, ..r.clone() };
                    preftrees.direct.insert(dup, None)?;
                }
                r.parent = first.val;
                r.inode_list = first.aux;
            }
            preftrees.direct.insert(r, None)?;
        }
        Ok(Walk::Done)
    }

    /// 在 ref 所属 tree 的快照中定位引用者
    ///
    /// # 错误
    ///
    /// - `ErrorKind::NotFound` - tree 已删除或不存在，或 tree 高度说明 ref 的
    ///   目标在该快照中不存在
    pub(crate) fn resolve_indirect_ref(
        &self,
        r: &PrelimRef,
        direct: &Preftree,
        total_refs: i64,
    ) -> Result<Parents> {
        let level = r.level;
        if level as usize >= BTRFS_MAX_LEVEL {
            return Err(Error::new(ErrorKind::Corrupted, "Backref level out of range"));
        }

        let view = self.tree_view();
        let roots = self.fs.roots();
        if view != TreeView::Commit && roots.is_deleting(r.root_id) {
            log::warn!("[BACKREF] root {} is being deleted", r.root_id);
            return Err(Error::new(ErrorKind::NotFound, "Tree is being deleted"));
        }
        let root = roots.lookup(r.root_id, view)?;
        if root.level + 1 == level {
            return Err(Error::new(ErrorKind::NotFound, "Tree is lower than backref level"));
        }

        // clone 时 file_pos - extent_offset 可能下溢
        let mut search_key = r.key_for_search;
        if search_key.item_type == BTRFS_EXTENT_DATA_KEY && search_key.offset >= BTRFS_MAX_FILE_OFFSET {
            search_key.offset = 0;
        }

        let mut path = Path::new();
        path.lowest_level = level;
        path.search(self.fs, root, &search_key)?;

        let mut found_level = level as usize;
        while path.nodes[found_level].is_none() {
            if found_level == 0 {
                log::warn!("[BACKREF] search in root {} produced an empty path", r.root_id);
                return Ok(Ulist::new());
            }
            found_level -= 1;
        }

        let parents = self.add_all_parents(&mut path, r, found_level, direct, total_refs)?;
        log::debug!(
            "[BACKREF] root {} level {} key {:?}: {} parents",
            r.root_id,
            level,
            r.key_for_search,
            parents.len()
        );
        Ok(parents)
    }

    fn add_all_parents(
        &self,
        path: &mut Path,
        r: &PrelimRef,
        level: usize,
        direct: &Preftree,
        total_refs: i64,
    ) -> Result<Parents> {
        let mut parents = Parents::new();

        if level != 0 {
            if let Some(eb) = &path.nodes[level] {
                parents.add(eb.start(), Vec::new())?;
            }
            return Ok(parents);
        }

        // 已作为 shared data parent 记录的叶子和别的 tree 的叶子会重复计数
        let skip_leaf = |eb: &ExtentBuffer| {
            direct.has_shared_data_parent(eb.start()) || eb.owner() != r.root_id
        };

        let start_here = match path.leaf() {
            Some(leaf) => path.slot() < leaf.nritems() && !skip_leaf(leaf),
            None => return Ok(parents),
        };
        let mut more = start_here || path.next_leaf(self.fs)?;

        let mut count = 0i64;
        while more && count < total_refs {
            let leaf = match path.leaf() {
                Some(leaf) => leaf.clone(),
                None => break,
            };
            let slot = path.slot();
            if slot >= leaf.nritems() {
                more = path.next_leaf(self.fs)?;
                continue;
            }

            let key = leaf.item_key(slot);
            if key.objectid != r.key_for_search.objectid || key.item_type != BTRFS_EXTENT_DATA_KEY {
                break;
            }
            if slot == 0 && skip_leaf(&leaf) {
                more = path.next_leaf(self.fs)?;
                continue;
            }

            let fi = FileExtentItem::parse(leaf.item_data(slot));
            if !fi.is_inline()
                && fi.disk_bytenr == r.wanted_disk_byte
                && key.offset.wrapping_sub(fi.offset) == r.key_for_search.offset
            {
                count += 1;
                let elems = match self.req.extent_item_pos {
                    Some(pos) => check_extent_in_eb(&key, &fi, pos, self.req.ignore_offset)
                        .map(|elem| vec![elem]),
                    None => Some(Vec::new()),
                };
                if let Some(elems) = elems {
                    log::trace!("[BACKREF] leaf {:#x} slot {} matches", leaf.start(), slot);
                    parents.add_merge(leaf.start(), elems, append_elems)?;
                }
            }
            more = path.next_item(self.fs)?;
        }
        Ok(parents)
    }
}
