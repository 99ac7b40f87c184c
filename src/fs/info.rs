//! 文件系统全局状态

use super::{FsConfig, FsStats};
use crate::{
    block::{BlockDev, BlockDevice},
    consts::*,
    ctree::{ExtentBuffer, RootNode, RootRegistry, TreeBlockReader, TreeView},
    error::{Error, ErrorKind, Result},
    transaction::{TransHandle, Transaction, TransactionState, TreeModSeq},
};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::{Mutex, MutexGuard, RwLock};

/// 文件系统全局状态
///
/// backref 引擎的所有协作者都挂在这里：设备与 tree block 缓存、root 注册表、
/// 运行中事务、`commit_root_sem`、tree mod seq。
///
/// # 示例
///
/// ```rust,ignore
/// use btrfs_backref::{FsConfig, FsInfo};
///
/// let fs = FsInfo::new(device, FsConfig::default())?;
/// fs.roots().insert_committed(BTRFS_EXTENT_TREE_OBJECTID, extent_root);
/// let roots = btrfs_backref::backref::find_all_roots(&fs, None, bytenr, BTRFS_SEQ_LAST, false)?;
/// ```
pub struct FsInfo<D: BlockDevice> {
    config: FsConfig,
    bdev: Mutex<BlockDev<D>>,
    roots: RootRegistry,
    /// 读者持有期间 commit root 不会被替换
    commit_root_sem: RwLock<()>,
    tree_mod_seq: TreeModSeq,
    running_trans: Mutex<Option<Arc<Transaction>>>,
    /// 最后提交的 generation
    generation: AtomicU64,
    stats: FsStats,
}

impl<D: BlockDevice> FsInfo<D> {
    /// 创建
    ///
    /// # 错误
    ///
    /// - `ErrorKind::InvalidInput` - 配置无效，或设备扇区大小不整除 nodesize
    pub fn new(device: D, config: FsConfig) -> Result<Self> {
        config.validate()?;
        if config.nodesize % device.sector_size() != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Device sector size does not divide nodesize",
            ));
        }
        let bdev = BlockDev::new_with_cache(device, config.tree_cache_blocks)?;
        log::debug!(
            "[TREE] fs opened: nodesize={} sectorsize={} skinny={} cache={}",
            config.nodesize,
            config.sectorsize,
            config.skinny_metadata,
            config.tree_cache_blocks
        );
        Ok(Self {
            config,
            bdev: Mutex::new(bdev),
            roots: RootRegistry::new(),
            commit_root_sem: RwLock::new(()),
            tree_mod_seq: TreeModSeq::new(),
            running_trans: Mutex::new(None),
            generation: AtomicU64::new(0),
            stats: FsStats::default(),
        })
    }

    /// 配置
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// nodesize
    pub fn nodesize(&self) -> u32 {
        self.config.nodesize
    }

    /// root 注册表
    pub fn roots(&self) -> &RootRegistry {
        &self.roots
    }

    /// commit root 读写锁
    pub fn commit_root_sem(&self) -> &RwLock<()> {
        &self.commit_root_sem
    }

    /// tree mod seq
    pub fn tree_mod_seq(&self) -> &TreeModSeq {
        &self.tree_mod_seq
    }

    /// 统计
    pub fn stats(&self) -> &FsStats {
        &self.stats
    }

    /// 最后提交的 generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// 设置 generation（挂载已有镜像时使用）
    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    /// 锁定块设备
    pub fn bdev(&self) -> MutexGuard<'_, BlockDev<D>> {
        self.bdev.lock()
    }

    /// 写入一个编码好的 tree block
    pub fn write_tree_block(&self, bytenr: u64, data: &[u8]) -> Result<()> {
        if data.len() != self.config.nodesize as usize {
            return Err(Error::new(ErrorKind::InvalidInput, "Tree block size mismatch"));
        }
        self.bdev.lock().write_tree_block(bytenr, data)
    }

    /// extent tree 的 root
    pub fn extent_root(&self, view: TreeView) -> Result<RootNode> {
        self.roots.lookup(BTRFS_EXTENT_TREE_OBJECTID, view)
    }

    /// COW 更新一个 tree 的 root，返回本次变更的 seq
    pub fn update_root(&self, root_id: u64, node: RootNode) -> Result<u64> {
        let seq = self.tree_mod_seq.next_seq();
        self.roots.update_root(root_id, node, seq)?;
        Ok(seq)
    }

    /// 回收不再被任何 seq 读者需要的 root 历史
    pub fn prune_tree_mod_log(&self) -> usize {
        self.roots.prune_history(self.tree_mod_seq.lowest_reader())
    }

    /// 开始或加入运行中的事务
    pub fn start_transaction(&self) -> Result<TransHandle<'_>> {
        let mut running = self.running_trans.lock();
        if let Some(trans) = running.as_ref() {
            if trans.state() == TransactionState::Running {
                return TransHandle::new(trans.clone(), &self.tree_mod_seq);
            }
            return Err(Error::new(ErrorKind::Busy, "Transaction is committing"));
        }
        let trans = Arc::new(Transaction::new(self.generation() + 1));
        log::debug!("[DELAYED] started transaction {}", trans.transid());
        *running = Some(trans.clone());
        TransHandle::new(trans, &self.tree_mod_seq)
    }

    /// 只加入已运行的事务，不新建
    ///
    /// # 错误
    ///
    /// - `ErrorKind::NotFound` - 没有运行中的事务
    pub fn join_transaction_nostart(&self) -> Result<TransHandle<'_>> {
        let running = self.running_trans.lock();
        match running.as_ref() {
            Some(trans) if trans.state() == TransactionState::Running => {
                TransHandle::new(trans.clone(), &self.tree_mod_seq)
            }
            _ => Err(Error::new(ErrorKind::NotFound, "No running transaction")),
        }
    }

    /// 提交事务
    ///
    /// 在 commit root 写锁下把各 tree 的当前 root 提升为 commit root，
    /// 并丢弃该事务的 delayed ref。
    pub fn commit_transaction(&self, handle: TransHandle<'_>) -> Result<()> {
        let trans = handle.transaction().clone();
        drop(handle);

        {
            let mut running = self.running_trans.lock();
            match running.as_ref() {
                Some(cur) if Arc::ptr_eq(cur, &trans) => {}
                _ => return Err(Error::new(ErrorKind::InvalidState, "Transaction is not running")),
            }
            if trans.state() != TransactionState::Running {
                return Err(Error::new(ErrorKind::InvalidState, "Transaction already committing"));
            }
            trans.set_state(TransactionState::Committing);

            let _guard = self.commit_root_sem.write();
            self.roots.commit_all();
            trans.delayed_refs().clear();
            self.generation.store(trans.transid(), Ordering::SeqCst);
            *running = None;
        }

        trans.set_state(TransactionState::Completed);
        let pruned = self.prune_tree_mod_log();
        log::debug!(
            "[DELAYED] committed transaction {} ({} historical roots pruned)",
            trans.transid(),
            pruned
        );
        Ok(())
    }
}

impl<D: BlockDevice> TreeBlockReader for FsInfo<D> {
    /// 读取并检查 level / generation
    ///
    /// - level 不符为 `Corrupted`
    /// - 期望 generation 非零且不符为 `Stale`
    fn read_tree_block(&self, bytenr: u64, level: u8, generation: u64) -> Result<Arc<ExtentBuffer>> {
        self.stats.inc_tree_block_reads();
        let eb = self.bdev.lock().read_tree_block(
            bytenr,
            self.config.nodesize,
            self.config.verify_checksums,
        )?;
        if eb.level() != level {
            log::error!(
                "[TREE] block {:#x} level {} but parent expects {}",
                bytenr,
                eb.level(),
                level
            );
            return Err(Error::new(ErrorKind::Corrupted, "Tree block level mismatch"));
        }
        if generation != 0 && eb.generation() != generation {
            log::error!(
                "[TREE] block {:#x} generation {} but parent expects {}",
                bytenr,
                eb.generation(),
                generation
            );
            return Err(Error::new(ErrorKind::Stale, "Tree block generation mismatch"));
        }
        Ok(eb)
    }
}
