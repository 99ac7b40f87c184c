//! 引用收集：inline、keyed 与 delayed 三种来源
//!
//! 三个来源使用同一套映射：
//!
//! | 来源记录            | 进入的树                | level     |
//! |---------------------|-------------------------|-----------|
//! | shared block ref    | direct                  | level + 1 |
//! | shared data ref     | direct                  | 0         |
//! | tree block ref      | indirect_missing_keys   | level + 1 |
//! | extent data ref     | indirect                | 0         |

use super::{PreftreeSet, ShareCheck, Walk};
use crate::{
    consts::*,
    ctree::{ExtentBuffer, Path, TreeBlockReader},
    delayed_ref::{DelayedAction, DelayedRefHead, DelayedRefKind},
    error::Result,
    types::{shared_data_ref_count, ExtentDataRef, ExtentFlags, ExtentItem, InlineRef, Key, TreeBlockInfo},
};

fn data_key(dref: &ExtentDataRef) -> Key {
    Key::new(dref.objectid, BTRFS_EXTENT_DATA_KEY, dref.offset)
}

fn rejects_inode(sc: &Option<&mut ShareCheck>, inum: u64) -> bool {
    sc.as_deref().map_or(false, |sc| sc.rejects_inode(inum))
}

/// 收集 extent item 内的 inline ref
///
/// `total_refs` 加上 item 记录的引用数。返回 tree block 的 level（数据为 0）。
/// 过滤 inode 不符时继续扫描，结束时返回 [`Walk::Shared`]。
pub(crate) fn add_inline_refs(
    leaf: &ExtentBuffer,
    slot: usize,
    bytenr: u64,
    preftrees: &mut PreftreeSet,
    total_refs: &mut i64,
    mut sc: Option<&mut ShareCheck>,
) -> Result<(Walk, u8)> {
    let key = leaf.item_key(slot);
    let data = leaf.item_data(slot);
    let ei = ExtentItem::parse(data);
    *total_refs += ei.refs as i64;

    let mut ptr = BTRFS_EXTENT_ITEM_SIZE;
    let mut info_level = 0u8;
    if key.item_type == BTRFS_EXTENT_ITEM_KEY && ei.flags.contains(ExtentFlags::TREE_BLOCK) {
        assert!(
            data.len() >= ptr + BTRFS_TREE_BLOCK_INFO_SIZE,
            "corrupt extent item: tree block info truncated"
        );
        info_level = TreeBlockInfo::parse(&data[ptr..]).level;
        ptr += BTRFS_TREE_BLOCK_INFO_SIZE;
    } else if key.item_type == BTRFS_METADATA_ITEM_KEY {
        info_level = key.offset as u8;
    } else {
        assert!(
            ei.flags.contains(ExtentFlags::DATA),
            "corrupt extent item: data extent without DATA flag"
        );
    }

    let mut found_shared = false;
    while ptr < data.len() {
        let (iref, size) = InlineRef::parse(&data[ptr..]);
        ptr += size;
        match iref {
            InlineRef::SharedBlock { parent } => {
                preftrees.add_direct_ref(info_level + 1, parent, bytenr, 1, None)?;
            }
            InlineRef::SharedData { parent, count } => {
                preftrees.add_direct_ref(0, parent, bytenr, count as i32, sc.as_deref_mut())?;
            }
            InlineRef::TreeBlock { root } => {
                preftrees.add_indirect_ref(root, None, info_level + 1, bytenr, 1, None)?;
            }
            InlineRef::ExtentData(dref) => {
                if rejects_inode(&sc, dref.objectid) {
                    found_shared = true;
                    continue;
                }
                preftrees.add_indirect_ref(
                    dref.root,
                    Some(data_key(&dref)),
                    0,
                    bytenr,
                    dref.count as i32,
                    sc.as_deref_mut(),
                )?;
            }
        }
    }

    let walk = if found_shared { Walk::Shared } else { Walk::Done };
    Ok((walk, info_level))
}

/// 收集紧跟 extent item 之后、objectid 相同的 keyed ref
///
/// `path` 指向 extent item。
pub(crate) fn add_keyed_refs<R: TreeBlockReader + ?Sized>(
    reader: &R,
    path: &mut Path,
    bytenr: u64,
    info_level: u8,
    preftrees: &mut PreftreeSet,
    mut sc: Option<&mut ShareCheck>,
) -> Result<Walk> {
    while path.next_item(reader)? {
        let leaf = match path.leaf() {
            Some(leaf) => leaf.clone(),
            None => break,
        };
        let slot = path.slot();
        let key = leaf.item_key(slot);

        if key.objectid != bytenr {
            break;
        }
        if key.item_type < BTRFS_TREE_BLOCK_REF_KEY {
            continue;
        }
        if key.item_type > BTRFS_SHARED_DATA_REF_KEY {
            break;
        }

        log::trace!("[BACKREF] keyed ref {:?} for {:#x}", key, bytenr);
        match key.item_type {
            BTRFS_SHARED_BLOCK_REF_KEY => {
                preftrees.add_direct_ref(info_level + 1, key.offset, bytenr, 1, None)?;
            }
            BTRFS_SHARED_DATA_REF_KEY => {
                let count = shared_data_ref_count(leaf.item_data(slot));
                preftrees.add_direct_ref(0, key.offset, bytenr, count as i32, sc.as_deref_mut())?;
            }
            BTRFS_TREE_BLOCK_REF_KEY => {
                preftrees.add_indirect_ref(key.offset, None, info_level + 1, bytenr, 1, None)?;
            }
            BTRFS_EXTENT_DATA_REF_KEY => {
                let dref = ExtentDataRef::parse(leaf.item_data(slot));
                if rejects_inode(&sc, dref.objectid) {
                    return Ok(Walk::Shared);
                }
                preftrees.add_indirect_ref(
                    dref.root,
                    Some(data_key(&dref)),
                    0,
                    bytenr,
                    dref.count as i32,
                    sc.as_deref_mut(),
                )?;
            }
            other => {
                log::warn!("[BACKREF] unexpected keyed ref type {} for {:#x}", other, bytenr);
            }
        }
    }
    Ok(Walk::Done)
}

/// 收集 head 上 seq 不大于 `time_seq` 的 delayed ref
///
/// 调用者须持有 head 的 mutex。
pub(crate) fn add_delayed_refs(
    head: &DelayedRefHead,
    time_seq: u64,
    preftrees: &mut PreftreeSet,
    total_refs: &mut i64,
    mut sc: Option<&mut ShareCheck>,
) -> Result<Walk> {
    let refs = head.lock();
    let op_key = refs.extent_op().and_then(|op| op.key);
    let bytenr = head.bytenr();

    for node in refs.refs() {
        if node.seq > time_seq {
            continue;
        }
        let count = match node.action {
            DelayedAction::AddRef => node.ref_mod,
            DelayedAction::DropRef => -node.ref_mod,
            other => {
                log::warn!(
                    "[DELAYED] unexpected action {:?} on head {:#x} seq {}",
                    other,
                    bytenr,
                    node.seq
                );
                continue;
            }
        };
        *total_refs += count as i64;

        match node.kind {
            DelayedRefKind::TreeBlock { root, level } => {
                preftrees.add_indirect_ref(root, op_key, level + 1, bytenr, count, sc.as_deref_mut())?;
            }
            DelayedRefKind::SharedBlock { parent, level } => {
                preftrees.add_direct_ref(level + 1, parent, bytenr, count, sc.as_deref_mut())?;
            }
            DelayedRefKind::ExtentData { root, objectid, offset } => {
                if rejects_inode(&sc, objectid) {
                    return Ok(Walk::Shared);
                }
                let key = Key::new(objectid, BTRFS_EXTENT_DATA_KEY, offset);
                preftrees.add_indirect_ref(root, Some(key), 0, bytenr, count, sc.as_deref_mut())?;
            }
            DelayedRefKind::SharedData { parent } => {
                preftrees.add_direct_ref(0, parent, bytenr, count, sc.as_deref_mut())?;
            }
        }
    }

    if sc.as_deref().map_or(false, ShareCheck::is_shared) {
        return Ok(Walk::Shared);
    }
    Ok(Walk::Done)
}
