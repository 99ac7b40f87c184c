//! 闭包驱动与逻辑地址查询
//!
//! [`find_all_roots_safe`] 和 [`check_shared`] 把每次遍历得到的叶子追加到
//! 工作队列，再把队列中的块当作 extent 继续遍历，直到没有新的块为止。
//! 单个块的 NotFound（块在两次访问之间被删除）不会中断闭包。

use super::{
    find_parent_nodes, FindOutcome, LeafList, ShareCheck, Ulist, WalkRequest,
};
use crate::{
    block::BlockDevice,
    consts::*,
    ctree::{Path, TreeView},
    error::{Error, ErrorKind, Result},
    fs::FsInfo,
    transaction::{SeqElem, TransHandle},
    types::{ExtentFlags, ExtentItem, InlineRef, Key, TreeBlockInfo},
};
use alloc::vec::Vec;

/// 单次遍历，NotFound 视为没有结果
fn walk_tolerant<D: BlockDevice>(
    fs: &FsInfo<D>,
    trans: Option<&TransHandle<'_>>,
    req: &WalkRequest,
    leaves: &mut LeafList,
    roots: Option<&mut Ulist>,
    sc: Option<&mut ShareCheck>,
) -> Result<FindOutcome> {
    match find_parent_nodes(fs, trans, req, leaves, roots, sc) {
        Err(e) if e.is_not_found() => Ok(FindOutcome::NoRefs),
        other => other,
    }
}

/// 闭包开始前确认 extent tree 存在
///
/// 之后遍历中的 NotFound 只代表单个块已消失，缺少 extent tree 则是配置错误
fn require_extent_root<D: BlockDevice>(fs: &FsInfo<D>, trans: Option<&TransHandle<'_>>) -> Result<()> {
    let view = if trans.is_some() { TreeView::Latest } else { TreeView::Commit };
    fs.extent_root(view).map(|_| ())
}

/// 引用 `bytenr` 的所有叶子
///
/// `extent_item_pos` 为 Some 时每个叶子附带 (inode, offset) 列表
pub fn find_all_leafs<D: BlockDevice>(
    fs: &FsInfo<D>,
    trans: Option<&TransHandle<'_>>,
    bytenr: u64,
    time_seq: u64,
    extent_item_pos: Option<u64>,
    ignore_offset: bool,
) -> Result<LeafList> {
    let mut req = WalkRequest::new(bytenr, time_seq).with_ignore_offset(ignore_offset);
    req.extent_item_pos = extent_item_pos;
    require_extent_root(fs, trans)?;
    let mut leaves = LeafList::new();
    walk_tolerant(fs, trans, &req, &mut leaves, None, None)?;
    Ok(leaves)
}

/// 引用 `bytenr` 的所有 tree（传递闭包）
///
/// 调用者负责 commit root 的一致性（持有 `commit_root_sem` 或传入事务）
pub fn find_all_roots_safe<D: BlockDevice>(
    fs: &FsInfo<D>,
    trans: Option<&TransHandle<'_>>,
    bytenr: u64,
    time_seq: u64,
    ignore_offset: bool,
) -> Result<Ulist> {
    require_extent_root(fs, trans)?;
    let mut worklist = LeafList::new();
    let mut roots = Ulist::new();
    let mut bytenr = bytenr;
    let mut idx = 0;

    loop {
        let req = WalkRequest::new(bytenr, time_seq).with_ignore_offset(ignore_offset);
        walk_tolerant(fs, trans, &req, &mut worklist, Some(&mut roots), None)?;
        match worklist.get(idx) {
            Some(node) => bytenr = node.val,
            None => break,
        }
        idx += 1;
    }
    log::debug!("[BACKREF] closure visited {} blocks, {} roots", worklist.len(), roots.len());
    Ok(roots)
}

/// [`find_all_roots_safe`]，没有事务时持有 commit root 读锁
pub fn find_all_roots<D: BlockDevice>(
    fs: &FsInfo<D>,
    trans: Option<&TransHandle<'_>>,
    bytenr: u64,
    time_seq: u64,
    ignore_offset: bool,
) -> Result<Ulist> {
    let _guard = match trans {
        None => Some(fs.commit_root_sem().read()),
        Some(_) => None,
    };
    find_all_roots_safe(fs, trans, bytenr, time_seq, ignore_offset)
}

/// 加入运行中的事务；没有时返回 None
fn join_running<D: BlockDevice>(fs: &FsInfo<D>) -> Result<Option<TransHandle<'_>>> {
    match fs.join_transaction_nostart() {
        Ok(trans) => Ok(Some(trans)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// extent 是否被 (root, inum) 之外的所有者引用
///
/// 有运行中的事务时在注册的 seq 快照上检查（包括 delayed ref），
/// 否则在 commit root 读锁下检查已提交的数据。
pub fn check_shared<D: BlockDevice>(fs: &FsInfo<D>, root: u64, inum: u64, bytenr: u64) -> Result<bool> {
    let trans = join_running(fs)?;
    let elem = trans.as_ref().map(|_| fs.tree_mod_seq().register_reader());
    let _guard = match trans {
        None => Some(fs.commit_root_sem().read()),
        Some(_) => None,
    };
    let time_seq = elem.as_ref().map_or(0, SeqElem::seq);
    require_extent_root(fs, trans.as_ref())?;

    let mut sc = ShareCheck::new(root, inum);
    let mut worklist = LeafList::new();
    let mut roots = Ulist::new();
    let mut cur = bytenr;
    let mut idx = 0;

    let shared = loop {
        let req = WalkRequest::new(cur, time_seq);
        let outcome =
            walk_tolerant(fs, trans.as_ref(), &req, &mut worklist, Some(&mut roots), Some(&mut sc))?;
        if outcome == FindOutcome::Shared {
            break true;
        }
        match worklist.get(idx) {
            Some(node) => cur = node.val,
            None => break false,
        }
        idx += 1;
        sc.share_count = 0;
    };
    log::debug!(
        "[BACKREF] extent {:#x} of root {} inode {} shared: {}",
        bytenr,
        root,
        inum,
        shared
    );
    Ok(shared)
}

/// 对引用 extent 内偏移 `extent_item_pos` 的每个 (inode, offset, root) 调用 `visit`
///
/// `visit` 返回非零时停止并返回该值。`search_commit_root` 为 false 时
/// 加入运行中的事务（如果有）。
pub fn iterate_extent_inodes<D, F>(
    fs: &FsInfo<D>,
    extent_bytenr: u64,
    extent_item_pos: u64,
    search_commit_root: bool,
    mut visit: F,
    ignore_offset: bool,
) -> Result<i32>
where
    D: BlockDevice,
    F: FnMut(u64, u64, u64) -> i32,
{
    let trans = if search_commit_root { None } else { join_running(fs)? };
    let elem = trans.as_ref().map(|_| fs.tree_mod_seq().register_reader());
    let _guard = match trans {
        None => Some(fs.commit_root_sem().read()),
        Some(_) => None,
    };
    let time_seq = elem.as_ref().map_or(0, SeqElem::seq);

    let leaves = find_all_leafs(
        fs,
        trans.as_ref(),
        extent_bytenr,
        time_seq,
        Some(extent_item_pos),
        ignore_offset,
    )?;

    for leaf in leaves.iter() {
        // 已持有读锁，这里不能用 find_all_roots
        let roots = find_all_roots_safe(fs, trans.as_ref(), leaf.val, time_seq, ignore_offset)?;
        for root in roots.values() {
            for ie in &leaf.aux {
                log::trace!(
                    "[BACKREF] extent {:#x}: inode {} offset {} root {}",
                    extent_bytenr,
                    ie.inum,
                    ie.offset,
                    root
                );
                let ret = visit(ie.inum, ie.offset, root);
                if ret != 0 {
                    return Ok(ret);
                }
            }
        }
    }
    Ok(0)
}

/// 查找包含逻辑地址 `logical` 的 extent item
///
/// 返回 item 的 key 与类型标志（[`ExtentFlags::DATA`] 或 [`ExtentFlags::TREE_BLOCK`]）
///
/// # 错误
///
/// - `ErrorKind::NotFound` - 没有 extent 覆盖该地址
/// - `ErrorKind::Corrupted` - extent item 两种标志都没有
pub fn extent_from_logical<D: BlockDevice>(
    fs: &FsInfo<D>,
    logical: u64,
    search_commit_root: bool,
) -> Result<(Key, ExtentFlags)> {
    let view = if search_commit_root { TreeView::Commit } else { TreeView::Latest };
    let extent_root = fs.extent_root(view)?;
    let key = Key::new(logical, fs.config().metadata_key_type(), u64::MAX);

    let mut path = Path::new();
    path.search(fs, extent_root, &key)?;
    if !path.previous_extent_item(fs, 0)? {
        return Err(Error::new(ErrorKind::NotFound, "No extent item before address"));
    }
    let leaf = match path.leaf() {
        Some(leaf) => leaf.clone(),
        None => return Err(Error::new(ErrorKind::InvalidState, "Path has no leaf")),
    };
    let found = leaf.item_key(path.slot());
    let size = if found.item_type == BTRFS_METADATA_ITEM_KEY {
        fs.nodesize() as u64
    } else {
        found.offset
    };
    if found.objectid > logical || found.objectid + size <= logical {
        return Err(Error::new(ErrorKind::NotFound, "Address not inside an extent"));
    }

    let flags = ExtentItem::parse(leaf.item_data(path.slot())).flags;
    log::debug!("[BACKREF] logical {:#x} is in {:?} flags {:?}", logical, found, flags);
    if flags.contains(ExtentFlags::TREE_BLOCK) {
        Ok((found, ExtentFlags::TREE_BLOCK))
    } else if flags.contains(ExtentFlags::DATA) {
        Ok((found, ExtentFlags::DATA))
    } else {
        Err(Error::new(ErrorKind::Corrupted, "Extent item without DATA or TREE_BLOCK flag"))
    }
}

/// 对逻辑地址 `logical` 所在数据 extent 的每个引用位置调用 `visit`
///
/// # 错误
///
/// - `ErrorKind::InvalidInput` - 地址落在 tree block 中
pub fn iterate_inodes_from_logical<D, F>(
    fs: &FsInfo<D>,
    logical: u64,
    search_commit_root: bool,
    visit: F,
    ignore_offset: bool,
) -> Result<i32>
where
    D: BlockDevice,
    F: FnMut(u64, u64, u64) -> i32,
{
    let (key, flags) = extent_from_logical(fs, logical, search_commit_root)?;
    if flags.contains(ExtentFlags::TREE_BLOCK) {
        return Err(Error::new(ErrorKind::InvalidInput, "Address is inside a tree block"));
    }
    let extent_item_pos = logical - key.objectid;
    iterate_extent_inodes(fs, key.objectid, extent_item_pos, search_commit_root, visit, ignore_offset)
}

/// LOGICAL_INO 结果缓冲
///
/// 容量为 `total_bytes`，其中 16 字节为头部。每个结果占 24 字节，
/// 装不下的结果只计入 `elem_missed` / `bytes_missing`。
#[derive(Debug, Clone)]
pub struct InodeContainer {
    bytes_left: u32,
    bytes_missing: u32,
    elem_cnt: u32,
    elem_missed: u32,
    val: Vec<u64>,
}

/// 结果缓冲头部大小
const INODE_CONTAINER_HEADER: u32 = 16;

impl InodeContainer {
    /// 创建容量为 `total_bytes` 的缓冲
    pub fn new(total_bytes: u32) -> Result<Self> {
        let (bytes_left, bytes_missing) = if total_bytes >= INODE_CONTAINER_HEADER {
            (total_bytes - INODE_CONTAINER_HEADER, 0)
        } else {
            (0, INODE_CONTAINER_HEADER - total_bytes)
        };
        let mut val = Vec::new();
        val.try_reserve((bytes_left / 8) as usize)?;
        Ok(Self { bytes_left, bytes_missing, elem_cnt: 0, elem_missed: 0, val })
    }

    /// 记录一个结果，可直接作为 [`iterate_extent_inodes`] 的 visitor
    pub fn visit(&mut self, inum: u64, offset: u64, root: u64) -> i32 {
        let c = BTRFS_INODE_ELEM_BYTES as u32;
        if self.bytes_left >= c {
            self.bytes_left -= c;
            self.val.extend_from_slice(&[inum, offset, root]);
            self.elem_cnt += 3;
        } else {
            self.bytes_missing += c - self.bytes_left;
            self.bytes_left = 0;
            self.elem_missed += 3;
        }
        0
    }

    /// 剩余字节
    pub fn bytes_left(&self) -> u32 {
        self.bytes_left
    }

    /// 放下全部结果还缺的字节
    pub fn bytes_missing(&self) -> u32 {
        self.bytes_missing
    }

    /// 已记录的 u64 个数
    pub fn elem_cnt(&self) -> u32 {
        self.elem_cnt
    }

    /// 丢弃的 u64 个数
    pub fn elem_missed(&self) -> u32 {
        self.elem_missed
    }

    /// 扁平的 [inum, offset, root, ...]
    pub fn values(&self) -> &[u64] {
        &self.val
    }

    /// 按 (inum, offset, root) 遍历
    pub fn entries(&self) -> impl Iterator<Item = (u64, u64, u64)> + '_ {
        self.val.chunks_exact(3).map(|c| (c[0], c[1], c[2]))
    }
}

/// tree block extent item 中 inline tree ref 的迭代器
///
/// 产出 (root 或 parent, level)
#[derive(Debug, Clone)]
pub struct TreeBackrefIter<'a> {
    data: &'a [u8],
    pos: usize,
    level: u8,
}

impl<'a> TreeBackrefIter<'a> {
    /// 从 extent item 的 key 和数据创建
    ///
    /// # 错误
    ///
    /// - `ErrorKind::InvalidInput` - 不是 tree block 的 extent item
    /// - `ErrorKind::NotFound` - 没有 inline ref
    pub fn new(key: Key, data: &'a [u8]) -> Result<Self> {
        let ei = ExtentItem::parse(data);
        if !ei.flags.contains(ExtentFlags::TREE_BLOCK) {
            return Err(Error::new(ErrorKind::InvalidInput, "Not a tree block extent item"));
        }
        let mut pos = BTRFS_EXTENT_ITEM_SIZE;
        let level = if key.item_type == BTRFS_METADATA_ITEM_KEY {
            key.offset as u8
        } else {
            let info = TreeBlockInfo::parse(&data[pos..]);
            pos += BTRFS_TREE_BLOCK_INFO_SIZE;
            info.level
        };
        if pos >= data.len() {
            return Err(Error::new(ErrorKind::NotFound, "Extent item has no inline refs"));
        }
        Ok(Self { data, pos, level })
    }
}

impl Iterator for TreeBackrefIter<'_> {
    type Item = (u64, u8);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.data.len() {
            let (iref, size) = InlineRef::parse(&self.data[self.pos..]);
            self.pos += size;
            match iref {
                InlineRef::TreeBlock { root: v } | InlineRef::SharedBlock { parent: v } => {
                    return Some((v, self.level));
                }
                _ => {}
            }
        }
        None
    }
}
