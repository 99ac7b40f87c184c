//! 单个 extent 的引用遍历（`find_parent_nodes`）
//!
//! 流程：
//!
//! 1. 在 extent tree 中搜索 `(bytenr, type, u64::MAX)`，落在 extent item 之后
//! 2. 有事务且不是最新视图时，锁住 delayed ref head 收集 delayed ref；
//!    head mutex 被占用时先释放路径，等待后重新搜索
//! 3. 后退一格，命中 extent item 时收集 inline 与 keyed ref
//! 4. 释放路径，补全 missing keys，解析 indirect ref
//! 5. 遍历 direct 树输出 root 与叶子
//!
//! 三棵合并树在任何退出路径上都会被释放。

use super::{
    collect::{add_delayed_refs, add_inline_refs, add_keyed_refs},
    resolve::find_extent_in_eb,
    ExtentInodeElem, FindOutcome, PreftreeSet, ShareCheck, Ulist, Walk,
};
use crate::{
    block::BlockDevice,
    consts::*,
    ctree::{Path, TreeBlockReader, TreeView},
    error::{Error, ErrorKind, Result},
    fs::FsInfo,
    transaction::TransHandle,
    types::Key,
};
use alloc::vec::Vec;

/// 叶子地址 → 该叶子中的 (inode, offset) 列表
pub type LeafList = Ulist<Vec<ExtentInodeElem>>;

/// 一次遍历的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkRequest {
    /// extent 地址
    pub bytenr: u64,
    /// 快照 seq，[`BTRFS_SEQ_LAST`] 表示最新
    ///
    /// [`BTRFS_SEQ_LAST`] 不读取 delayed ref；排队中的 drop 只在其后注册的 seq 下可见
    pub time_seq: u64,
    /// 需要位置信息时，extent 内的字节偏移
    pub extent_item_pos: Option<u64>,
    /// 不按 `extent_item_pos` 过滤位置
    pub ignore_offset: bool,
}

impl WalkRequest {
    /// 创建，不收集位置信息
    pub fn new(bytenr: u64, time_seq: u64) -> Self {
        Self { bytenr, time_seq, extent_item_pos: None, ignore_offset: false }
    }

    /// 收集 extent 内偏移 `pos` 处的位置信息
    pub fn with_extent_item_pos(mut self, pos: u64) -> Self {
        self.extent_item_pos = Some(pos);
        self
    }

    /// 设置 ignore_offset
    pub fn with_ignore_offset(mut self, ignore_offset: bool) -> Self {
        self.ignore_offset = ignore_offset;
        self
    }
}

/// 遍历上下文
pub(crate) struct Walker<'a, D: BlockDevice> {
    pub(crate) fs: &'a FsInfo<D>,
    pub(crate) trans: Option<&'a TransHandle<'a>>,
    pub(crate) req: WalkRequest,
}

impl<'a, D: BlockDevice> Walker<'a, D> {
    pub(crate) fn new(fs: &'a FsInfo<D>, trans: Option<&'a TransHandle<'a>>, req: WalkRequest) -> Self {
        Self { fs, trans, req }
    }

    /// 解析 indirect ref 时各 tree 使用的视图
    pub(crate) fn tree_view(&self) -> TreeView {
        match self.trans {
            None => TreeView::Commit,
            Some(_) if self.req.time_seq == BTRFS_SEQ_LAST => TreeView::Latest,
            Some(_) => TreeView::Seq(self.req.time_seq),
        }
    }

    fn extent_view(&self) -> TreeView {
        if self.trans.is_some() {
            TreeView::Latest
        } else {
            TreeView::Commit
        }
    }

    /// 收集三种来源的引用并解析为 direct ref
    pub(crate) fn collect_and_resolve(
        &self,
        preftrees: &mut PreftreeSet,
        total_refs: &mut i64,
        mut sc: Option<&mut ShareCheck>,
    ) -> Result<Walk> {
        let fs = self.fs;
        let bytenr = self.req.bytenr;
        let key = Key::new(bytenr, fs.config().metadata_key_type(), u64::MAX);
        let extent_root = fs.extent_root(self.extent_view())?;
        let mut path = Path::new();

        loop {
            if path.search(fs, extent_root, &key)? {
                log::error!("[BACKREF] extent search key for {:#x} matched an item", bytenr);
                return Err(Error::new(ErrorKind::Corrupted, "Extent item with offset u64::MAX"));
            }

            let trans = match self.trans {
                Some(trans) if self.req.time_seq != BTRFS_SEQ_LAST => trans,
                _ => break,
            };
            let head = match trans.delayed_refs().find_head(bytenr) {
                Some(head) => head,
                None => break,
            };
            let guard = head.try_lock_mutex();
            if guard.is_none() {
                // 不持有路径等待 head
                path.release();
                drop(head.lock_mutex());
                log::trace!("[BACKREF] head {:#x} contended, searching again", bytenr);
                continue;
            }
            let walk = add_delayed_refs(&head, self.req.time_seq, preftrees, total_refs, sc.as_deref_mut());
            drop(guard);
            if walk? == Walk::Shared {
                return Ok(Walk::Shared);
            }
            break;
        }

        if path.slot() > 0 {
            path.slots[0] -= 1;
            let leaf = path.leaf().cloned();
            if let Some(leaf) = leaf {
                let found = leaf.item_key(path.slot());
                if found.objectid == bytenr
                    && (found.item_type == BTRFS_EXTENT_ITEM_KEY
                        || found.item_type == BTRFS_METADATA_ITEM_KEY)
                {
                    let (walk, info_level) = add_inline_refs(
                        &leaf,
                        path.slot(),
                        bytenr,
                        preftrees,
                        total_refs,
                        sc.as_deref_mut(),
                    )?;
                    if walk == Walk::Shared {
                        return Ok(Walk::Shared);
                    }
                    let walk =
                        add_keyed_refs(fs, &mut path, bytenr, info_level, preftrees, sc.as_deref_mut())?;
                    if walk == Walk::Shared {
                        return Ok(Walk::Shared);
                    }
                }
            }
        }
        path.release();

        self.add_missing_keys(preftrees)?;
        if !preftrees.indirect_missing_keys.is_empty() {
            log::warn!(
                "[BACKREF] {} refs of {:#x} still miss their key",
                preftrees.indirect_missing_keys.len(),
                bytenr
            );
        }

        self.resolve_indirect_refs(preftrees, *total_refs, sc)
    }

    /// 遍历 direct 树输出 root 与叶子
    pub(crate) fn emit(
        &self,
        preftrees: &mut PreftreeSet,
        leaves: &mut LeafList,
        mut roots: Option<&mut Ulist>,
        sc: Option<&ShareCheck>,
    ) -> Result<Walk> {
        for r in preftrees.direct.iter_mut() {
            if r.count <= 0 {
                continue;
            }
            if r.root_id != 0 && r.parent == 0 {
                if let Some(roots) = roots.as_deref_mut() {
                    if sc.map_or(false, |sc| sc.rejects_root(r.root_id)) {
                        return Ok(Walk::Shared);
                    }
                    roots.add(r.root_id, ())?;
                }
            }
            if r.parent == 0 {
                continue;
            }

            if let Some(pos) = self.req.extent_item_pos {
                if r.inode_list.is_empty() && r.level == 0 {
                    let eb = self.fs.read_tree_block(r.parent, 0, 0)?;
                    r.inode_list = find_extent_in_eb(&eb, self.req.bytenr, pos, self.req.ignore_offset)?;
                }
            }
            let list = core::mem::take(&mut r.inode_list);
            leaves.add_merge(r.parent, list, |old, mut new| {
                old.try_reserve(new.len())?;
                old.append(&mut new);
                Ok(())
            })?;
        }
        Ok(Walk::Done)
    }
}

/// 查找引用 `req.bytenr` 的所有叶子与 root
///
/// - `trans` 为 None 时只使用已提交的数据
/// - 叶子加入 `leaves`，带位置信息时同一叶子的列表会合并
/// - `roots` 为 Some 时加入 root id
/// - 传入 `sc` 时证明共享即返回 [`FindOutcome::Shared`]
///
/// # 错误
///
/// 读块失败、extent tree 不存在等硬错误。extent 没有引用不是错误，
/// 返回 [`FindOutcome::NoRefs`]。
pub fn find_parent_nodes<D: BlockDevice>(
    fs: &FsInfo<D>,
    trans: Option<&TransHandle<'_>>,
    req: &WalkRequest,
    leaves: &mut LeafList,
    roots: Option<&mut Ulist>,
    mut sc: Option<&mut ShareCheck>,
) -> Result<FindOutcome> {
    fs.stats().inc_walker_calls();
    let walker = Walker::new(fs, trans, *req);
    let mut preftrees = PreftreeSet::new();
    let mut total_refs = 0i64;

    let result = walker
        .collect_and_resolve(&mut preftrees, &mut total_refs, sc.as_deref_mut())
        .and_then(|walk| match walk {
            Walk::Shared => Ok(Walk::Shared),
            Walk::Done => walker.emit(&mut preftrees, leaves, roots, sc.as_deref()),
        });
    preftrees.release();

    let outcome = match result? {
        Walk::Shared => FindOutcome::Shared,
        Walk::Done if total_refs == 0 => FindOutcome::NoRefs,
        Walk::Done => FindOutcome::Found,
    };
    log::debug!(
        "[BACKREF] walked {:#x} at seq {}: {:?}, total_refs={}, leaves={}",
        req.bytenr,
        req.time_seq,
        outcome,
        total_refs,
        leaves.len()
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ctree::RootNode,
        delayed_ref::{DelayedAction, DelayedRefKind},
        fs::FsConfig,
        test_utils::*,
        types::{ExtentDataRef, InlineRef},
    };
    use alloc::vec;

    #[test]
    fn test_direct_tree_after_resolution() {
        let t = shared_and_keyed_scenario();
        let walker = Walker::new(&t.fs, None, WalkRequest::new(0x1000, BTRFS_SEQ_LAST));
        let mut preftrees = PreftreeSet::new();
        let mut total_refs = 0;
        let walk = walker.collect_and_resolve(&mut preftrees, &mut total_refs, None).unwrap();

        assert_eq!(walk, Walk::Done);
        assert_eq!(total_refs, 3);
        assert!(preftrees.indirect.is_empty());
        let direct: Vec<(u64, i32)> = preftrees.direct.iter().map(|r| (r.parent, r.count)).collect();
        assert_eq!(direct.len(), 2);
        assert!(direct.contains(&(0x2000, 2)));
        assert!(direct.contains(&(0x3000, 1)));
    }

    #[test]
    fn test_find_parent_nodes_outputs_leaves() {
        let t = shared_and_keyed_scenario();
        let mut leaves = LeafList::new();
        let mut roots = Ulist::new();
        let outcome = find_parent_nodes(
            &t.fs,
            None,
            &WalkRequest::new(0x1000, BTRFS_SEQ_LAST),
            &mut leaves,
            Some(&mut roots),
            None,
        )
        .unwrap();

        assert_eq!(outcome, FindOutcome::Found);
        let mut found: Vec<u64> = leaves.values().collect();
        found.sort_unstable();
        assert_eq!(found, vec![0x2000, 0x3000]);
        assert!(roots.is_empty());
        assert_eq!(t.fs.stats().walker_calls(), 1);
    }

    #[test]
    fn test_positions_collected_per_leaf() {
        let t = shared_and_keyed_scenario();
        let mut leaves = LeafList::new();
        let req = WalkRequest::new(0x1000, BTRFS_SEQ_LAST).with_extent_item_pos(100);
        find_parent_nodes(&t.fs, None, &req, &mut leaves, None, None).unwrap();

        // 0x2000 通过 shared data ref 找到，需要重新扫描叶子
        let elems = leaves.aux(0x2000).unwrap();
        assert_eq!(
            elems,
            &vec![ExtentInodeElem { inum: 255, offset: 100 }, ExtentInodeElem { inum: 255, offset: 4196 }]
        );
        assert_eq!(leaves.aux(0x3000).unwrap(), &vec![ExtentInodeElem { inum: 256, offset: 100 }]);
    }

    #[test]
    fn test_tree_block_extent_yields_root() {
        let t = shared_and_keyed_scenario();
        let mut leaves = LeafList::new();
        let mut roots = Ulist::new();
        let outcome = find_parent_nodes(
            &t.fs,
            None,
            &WalkRequest::new(0x5000, BTRFS_SEQ_LAST),
            &mut leaves,
            Some(&mut roots),
            None,
        )
        .unwrap();
        assert_eq!(outcome, FindOutcome::Found);
        assert!(leaves.is_empty());
        assert_eq!(roots.values().collect::<Vec<_>>(), vec![BTRFS_FS_TREE_OBJECTID]);
    }

    #[test]
    fn test_unknown_extent_has_no_refs() {
        let t = shared_and_keyed_scenario();
        let mut leaves = LeafList::new();
        let outcome = find_parent_nodes(
            &t.fs,
            None,
            &WalkRequest::new(0x9000, BTRFS_SEQ_LAST),
            &mut leaves,
            None,
            None,
        )
        .unwrap();
        assert_eq!(outcome, FindOutcome::NoRefs);
        assert!(leaves.is_empty());
    }

    #[test]
    fn test_snapshot_isolation() {
        let t = single_ref_scenario();
        let trans = t.fs.start_transaction().unwrap();
        let before = t.fs.tree_mod_seq().register_reader();
        trans
            .add_delayed_ref(
                0x1000,
                4096,
                DelayedAction::DropRef,
                1,
                DelayedRefKind::ExtentData { root: 5, objectid: 256, offset: 0 },
            )
            .unwrap();
        let after = t.fs.tree_mod_seq().register_reader();

        let mut leaves = LeafList::new();
        let req = WalkRequest::new(0x1000, before.seq());
        let outcome = find_parent_nodes(&t.fs, Some(&trans), &req, &mut leaves, None, None).unwrap();
        assert_eq!(outcome, FindOutcome::Found);
        assert_eq!(leaves.values().collect::<Vec<_>>(), vec![0x3000]);

        let mut leaves = LeafList::new();
        let req = WalkRequest::new(0x1000, after.seq());
        let outcome = find_parent_nodes(&t.fs, Some(&trans), &req, &mut leaves, None, None).unwrap();
        assert_eq!(outcome, FindOutcome::NoRefs);
        assert!(leaves.is_empty());

        // 最新视图不读取 delayed ref
        let mut leaves = LeafList::new();
        let req = WalkRequest::new(0x1000, BTRFS_SEQ_LAST);
        find_parent_nodes(&t.fs, Some(&trans), &req, &mut leaves, None, None).unwrap();
        assert_eq!(leaves.len(), 1);
    }

    #[test]
    fn test_head_contention_retries_search() {
        use std::sync::{
            atomic::{AtomicBool, Ordering},
            mpsc,
        };
        use std::time::Duration;

        let t = single_ref_scenario();
        let trans = t.fs.start_transaction().unwrap();
        trans
            .add_delayed_ref(0x1000, 4096, DelayedAction::AddRef, 1, DelayedRefKind::SharedData { parent: 0x7000 })
            .unwrap();
        let reader = t.fs.tree_mod_seq().register_reader();
        let head = trans.delayed_refs().find_head(0x1000).unwrap();
        let released = AtomicBool::new(false);

        std::thread::scope(|s| {
            let (locked_tx, locked_rx) = mpsc::channel();
            let (head, released_flag) = (&head, &released);
            s.spawn(move || {
                let guard = head.lock_mutex();
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(100));
                released_flag.store(true, Ordering::SeqCst);
                drop(guard);
            });
            locked_rx.recv().unwrap();

            let walker = Walker::new(&t.fs, Some(&trans), WalkRequest::new(0x1000, reader.seq()));
            let mut preftrees = PreftreeSet::new();
            let mut total_refs = 0;
            let walk = walker.collect_and_resolve(&mut preftrees, &mut total_refs, None).unwrap();
            assert!(released.load(Ordering::SeqCst));

            assert_eq!(walk, Walk::Done);
            // delayed ref 只收集一次
            assert_eq!(total_refs, 2);
            let direct: Vec<(u64, i32)> = preftrees.direct.iter().map(|r| (r.parent, r.count)).collect();
            assert_eq!(direct.len(), 2);
            assert!(direct.contains(&(0x7000, 1)));
            assert!(direct.contains(&(0x3000, 1)));
        });

        let mut leaves = LeafList::new();
        let req = WalkRequest::new(0x1000, reader.seq());
        find_parent_nodes(&t.fs, Some(&trans), &req, &mut leaves, None, None).unwrap();
        let mut found: Vec<u64> = leaves.values().collect();
        found.sort_unstable();
        assert_eq!(found, vec![0x3000, 0x7000]);
    }

    #[test]
    fn test_seq_view_uses_replaced_root() {
        let t = single_ref_scenario();
        let trans = t.fs.start_transaction().unwrap();
        let before = t.fs.tree_mod_seq().register_reader();

        // COW 后的 tree 5 不再引用 0x1000
        t.leaf(0x8000, BTRFS_FS_TREE_OBJECTID, vec![(data_key(256, 0), file_extent(0x9000, 4096, 0, 4096))]);
        t.fs.update_root(BTRFS_FS_TREE_OBJECTID, RootNode::new(0x8000, 0, TEST_GENERATION)).unwrap();
        let after = t.fs.tree_mod_seq().register_reader();

        let mut leaves = LeafList::new();
        let req = WalkRequest::new(0x1000, before.seq());
        find_parent_nodes(&t.fs, Some(&trans), &req, &mut leaves, None, None).unwrap();
        assert_eq!(leaves.values().collect::<Vec<_>>(), vec![0x3000]);

        let mut leaves = LeafList::new();
        let mut roots = Ulist::new();
        let req = WalkRequest::new(0x1000, after.seq());
        let outcome = find_parent_nodes(&t.fs, Some(&trans), &req, &mut leaves, Some(&mut roots), None).unwrap();
        assert_eq!(outcome, FindOutcome::Found);
        assert!(leaves.is_empty());
        assert_eq!(roots.values().collect::<Vec<_>>(), vec![BTRFS_FS_TREE_OBJECTID]);

        // 没有事务时仍是 commit root
        let mut leaves = LeafList::new();
        let req = WalkRequest::new(0x1000, BTRFS_SEQ_LAST);
        find_parent_nodes(&t.fs, None, &req, &mut leaves, None, None).unwrap();
        assert_eq!(leaves.values().collect::<Vec<_>>(), vec![0x3000]);
    }

    #[test]
    fn test_non_skinny_extent_items() {
        let t = TestFs::with_config(FsConfig {
            nodesize: 4096,
            tree_cache_blocks: 16,
            skinny_metadata: false,
            ..FsConfig::default()
        });
        t.leaf(0x3000, BTRFS_FS_TREE_OBJECTID, vec![(data_key(256, 0), file_extent(0x1000, 4096, 0, 4096))]);
        t.root(BTRFS_FS_TREE_OBJECTID, 0x3000, 0);
        let dref = ExtentDataRef { root: BTRFS_FS_TREE_OBJECTID, objectid: 256, offset: 0, count: 1 };
        t.extent_tree(
            0x10000,
            vec![
                (data_extent_key(0x1000, 4096), data_extent_item(1, &[InlineRef::ExtentData(dref)])),
                (
                    data_extent_key(0x3000, 4096),
                    tree_block_extent_item(
                        1,
                        data_key(256, 0),
                        0,
                        &[InlineRef::TreeBlock { root: BTRFS_FS_TREE_OBJECTID }],
                    ),
                ),
            ],
        );

        let mut leaves = LeafList::new();
        let mut roots = Ulist::new();
        let req = WalkRequest::new(0x1000, BTRFS_SEQ_LAST);
        find_parent_nodes(&t.fs, None, &req, &mut leaves, Some(&mut roots), None).unwrap();
        assert_eq!(leaves.values().collect::<Vec<_>>(), vec![0x3000]);

        let req = WalkRequest::new(0x3000, BTRFS_SEQ_LAST);
        let outcome = find_parent_nodes(&t.fs, None, &req, &mut leaves, Some(&mut roots), None).unwrap();
        assert_eq!(outcome, FindOutcome::Found);
        assert_eq!(roots.values().collect::<Vec<_>>(), vec![BTRFS_FS_TREE_OBJECTID]);
    }

    #[test]
    fn test_root_filter_reports_shared() {
        let t = shared_and_keyed_scenario();
        let mut leaves = LeafList::new();
        let mut roots = Ulist::new();
        let mut sc = ShareCheck::new(7, 0);
        let outcome = find_parent_nodes(
            &t.fs,
            None,
            &WalkRequest::new(0x5000, BTRFS_SEQ_LAST),
            &mut leaves,
            Some(&mut roots),
            Some(&mut sc),
        )
        .unwrap();
        assert_eq!(outcome, FindOutcome::Shared);
    }

    #[test]
    fn test_missing_extent_tree_is_error() {
        let t = TestFs::new();
        let mut leaves = LeafList::new();
        let err = find_parent_nodes(
            &t.fs,
            None,
            &WalkRequest::new(0x1000, BTRFS_SEQ_LAST),
            &mut leaves,
            None,
            None,
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_request_builders() {
        let req = WalkRequest::new(0x1000, 7).with_extent_item_pos(12).with_ignore_offset(true);
        assert_eq!(req.extent_item_pos, Some(12));
        assert!(req.ignore_offset);
        assert_eq!(WalkRequest::new(0x1000, 7).extent_item_pos, None);
    }
}
