//! tree mod seq 跟踪
//!
//! 单调递增的序号划定快照边界：delayed ref 节点和 root 替换都带 seq，
//! 读者注册一个 seq 后只看见不晚于它的变更。注册中的读者阻止历史被回收。

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;

/// seq 计数器和读者集合
#[derive(Debug, Default)]
pub struct TreeModSeq {
    counter: AtomicU64,
    /// seq → 注册次数
    readers: Mutex<BTreeMap<u64, usize>>,
}

impl TreeModSeq {
    /// 创建，计数从 0 开始
    pub fn new() -> Self {
        Self::default()
    }

    /// 取下一个 seq
    pub fn next_seq(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 最近分配的 seq
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// 注册读者，返回 RAII guard
    pub fn register_reader(&self) -> SeqElem<'_> {
        let mut readers = self.readers.lock();
        let seq = self.next_seq();
        *readers.entry(seq).or_insert(0) += 1;
        log::trace!("[DELAYED] registered tree mod seq reader {}", seq);
        SeqElem { owner: self, seq }
    }

    fn unregister(&self, seq: u64) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&seq);
            }
        }
    }

    /// 最小的活跃读者 seq
    pub fn lowest_reader(&self) -> Option<u64> {
        self.readers.lock().keys().next().copied()
    }

    /// 活跃读者数量
    pub fn reader_count(&self) -> usize {
        self.readers.lock().values().sum()
    }
}

/// 已注册的 seq 读者，drop 时注销
#[derive(Debug)]
pub struct SeqElem<'a> {
    owner: &'a TreeModSeq,
    seq: u64,
}

impl SeqElem<'_> {
    /// 快照 seq
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for SeqElem<'_> {
    fn drop(&mut self) {
        self.owner.unregister(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_monotonic() {
        let tms = TreeModSeq::new();
        let a = tms.next_seq();
        let b = tms.next_seq();
        assert!(b > a);
        assert_eq!(tms.current(), b);
    }

    #[test]
    fn test_reader_registration_is_scoped() {
        let tms = TreeModSeq::new();
        assert_eq!(tms.lowest_reader(), None);
        {
            let first = tms.register_reader();
            let second = tms.register_reader();
            assert!(second.seq() > first.seq());
            assert_eq!(tms.lowest_reader(), Some(first.seq()));
            assert_eq!(tms.reader_count(), 2);
            drop(first);
            assert_eq!(tms.lowest_reader(), Some(second.seq()));
        }
        assert_eq!(tms.reader_count(), 0);
        assert_eq!(tms.lowest_reader(), None);
    }

    #[test]
    fn test_unregister_on_early_return() {
        fn failing(tms: &TreeModSeq) -> Result<(), ()> {
            let _elem = tms.register_reader();
            Err(())
        }
        let tms = TreeModSeq::new();
        assert!(failing(&tms).is_err());
        assert_eq!(tms.reader_count(), 0);
    }
}
