//! Ulist：保持插入顺序的 u64 唯一集合
//!
//! 每个元素带一个 aux 值。按下标遍历，遍历过程中追加的元素也会被访问到，
//! 闭包驱动用它作为工作队列。

use crate::error::Result;
use alloc::{collections::BTreeMap, vec::Vec};

/// ulist 元素
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UlistNode<A> {
    /// 值
    pub val: u64,
    /// 附加数据
    pub aux: A,
}

/// 保持插入顺序的唯一集合
#[derive(Debug, Clone)]
pub struct Ulist<A = ()> {
    nodes: Vec<UlistNode<A>>,
    index: BTreeMap<u64, usize>,
}

impl<A> Default for Ulist<A> {
    fn default() -> Self {
        Self { nodes: Vec::new(), index: BTreeMap::new() }
    }
}

impl<A> Ulist<A> {
    /// 创建空集合
    pub fn new() -> Self {
        Self::default()
    }

    /// 元素个数
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 是否包含 `val`
    pub fn contains(&self, val: u64) -> bool {
        self.index.contains_key(&val)
    }

    /// 第 `idx` 个插入的元素
    pub fn get(&self, idx: usize) -> Option<&UlistNode<A>> {
        self.nodes.get(idx)
    }

    /// `val` 的 aux
    pub fn aux(&self, val: u64) -> Option<&A> {
        self.index.get(&val).map(|&i| &self.nodes[i].aux)
    }

    /// 按插入顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &UlistNode<A>> {
        self.nodes.iter()
    }

    /// 按插入顺序的值
    pub fn values(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.iter().map(|n| n.val)
    }

    /// 添加；已存在时丢弃 `aux` 并返回 false
    pub fn add(&mut self, val: u64, aux: A) -> Result<bool> {
        self.add_merge(val, aux, |_, _| Ok(()))
    }

    /// 添加；已存在时用 `merge(existing, aux)` 合并并返回 false
    pub fn add_merge<F>(&mut self, val: u64, aux: A, merge: F) -> Result<bool>
    where
        F: FnOnce(&mut A, A) -> Result<()>,
    {
        if let Some(&i) = self.index.get(&val) {
            merge(&mut self.nodes[i].aux, aux)?;
            return Ok(false);
        }
        self.nodes.try_reserve(1)?;
        self.index.insert(val, self.nodes.len());
        self.nodes.push(UlistNode { val, aux });
        Ok(true)
    }

    /// 清空
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
    }

    /// 取出全部元素
    pub fn into_nodes(self) -> Vec<UlistNode<A>> {
        self.nodes
    }
}
