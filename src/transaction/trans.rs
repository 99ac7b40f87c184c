//! 运行中事务与事务句柄

use super::TreeModSeq;
use crate::{
    delayed_ref::{DelayedAction, DelayedRefHead, DelayedRefKind, DelayedRefNode, DelayedRefRoot, ExtentOp},
    error::{Error, ErrorKind, Result},
};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;

/// 事务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// 运行中，可以加入
    Running,
    /// 正在提交
    Committing,
    /// 已提交
    Completed,
}

/// 运行中的事务
#[derive(Debug)]
pub struct Transaction {
    transid: u64,
    state: Mutex<TransactionState>,
    delayed_refs: DelayedRefRoot,
    num_writers: AtomicUsize,
}

impl Transaction {
    /// 创建事务
    pub fn new(transid: u64) -> Self {
        Self {
            transid,
            state: Mutex::new(TransactionState::Running),
            delayed_refs: DelayedRefRoot::new(),
            num_writers: AtomicUsize::new(0),
        }
    }

    /// 事务 id（提交后成为 generation）
    pub fn transid(&self) -> u64 {
        self.transid
    }

    /// 当前状态
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// delayed ref 集合
    pub fn delayed_refs(&self) -> &DelayedRefRoot {
        &self.delayed_refs
    }

    /// 持有句柄的数量
    pub fn num_writers(&self) -> usize {
        self.num_writers.load(Ordering::SeqCst)
    }
}

/// 事务句柄，drop 时结束使用
#[derive(Debug)]
pub struct TransHandle<'a> {
    trans: Arc<Transaction>,
    tree_mod_seq: &'a TreeModSeq,
}

impl<'a> TransHandle<'a> {
    pub(crate) fn new(trans: Arc<Transaction>, tree_mod_seq: &'a TreeModSeq) -> Result<Self> {
        if trans.state() != TransactionState::Running {
            return Err(Error::new(ErrorKind::InvalidState, "Transaction is not running"));
        }
        trans.num_writers.fetch_add(1, Ordering::SeqCst);
        Ok(Self { trans, tree_mod_seq })
    }

    /// 所属事务
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.trans
    }

    /// 事务 id
    pub fn transid(&self) -> u64 {
        self.trans.transid
    }

    /// 事务的 delayed ref 集合
    pub fn delayed_refs(&self) -> &DelayedRefRoot {
        &self.trans.delayed_refs
    }

    /// 排队一个引用变更，节点获得新的 tree mod seq
    ///
    /// 返回节点的 seq
    pub fn add_delayed_ref(
        &self,
        bytenr: u64,
        num_bytes: u64,
        action: DelayedAction,
        ref_mod: i32,
        kind: DelayedRefKind,
    ) -> Result<u64> {
        if ref_mod <= 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "ref_mod must be positive"));
        }
        let is_data = matches!(
            kind,
            DelayedRefKind::ExtentData { .. } | DelayedRefKind::SharedData { .. }
        );
        let seq = self.tree_mod_seq.next_seq();
        let node = DelayedRefNode { seq, action, ref_mod, kind };
        self.trans.delayed_refs.queue(bytenr, num_bytes, is_data, node)?;
        Ok(seq)
    }

    /// 为 tree block 的 head 设置 extent op
    pub fn set_extent_op(&self, bytenr: u64, num_bytes: u64, op: ExtentOp) -> Arc<DelayedRefHead> {
        let head = self.trans.delayed_refs.head_or_insert(bytenr, num_bytes, false);
        head.set_extent_op(op);
        head
    }
}

impl Drop for TransHandle<'_> {
    fn drop(&mut self) {
        self.trans.num_writers.fetch_sub(1, Ordering::SeqCst);
    }
}
