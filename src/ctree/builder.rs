//! tree block 编码
//!
//! 按磁盘格式构造叶子和内部节点：item 表从 header 之后向后增长，
//! item 数据从块尾向前增长。测试和镜像生成工具用它写出 tree block。

use crate::{
    consts::*,
    crc::crc32c,
    types::{HeaderFlags, Key},
};
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};

fn write_header(buf: &mut [u8], bytenr: u64, generation: u64, owner: u64, nritems: u32, level: u8) {
    LittleEndian::write_u64(&mut buf[BTRFS_HEADER_BYTENR_OFFSET..], bytenr);
    LittleEndian::write_u64(&mut buf[BTRFS_HEADER_FLAGS_OFFSET..], HeaderFlags::WRITTEN.bits());
    LittleEndian::write_u64(&mut buf[BTRFS_HEADER_GENERATION_OFFSET..], generation);
    LittleEndian::write_u64(&mut buf[BTRFS_HEADER_OWNER_OFFSET..], owner);
    LittleEndian::write_u32(&mut buf[BTRFS_HEADER_NRITEMS_OFFSET..], nritems);
    buf[BTRFS_HEADER_LEVEL_OFFSET] = level;
}

fn seal(buf: &mut [u8]) {
    let csum = crc32c(&buf[BTRFS_CSUM_SIZE..]);
    buf[..BTRFS_CSUM_SIZE].fill(0);
    LittleEndian::write_u32(&mut buf[0..4], csum);
}

/// 叶子构造器
#[derive(Debug, Clone)]
pub struct LeafBuilder {
    bytenr: u64,
    nodesize: u32,
    owner: u64,
    generation: u64,
    items: Vec<(Key, Vec<u8>)>,
}

impl LeafBuilder {
    /// 创建空叶子
    pub fn new(bytenr: u64, nodesize: u32, owner: u64, generation: u64) -> Self {
        Self { bytenr, nodesize, owner, generation, items: Vec::new() }
    }

    /// 添加一个 item，finish 时按 key 排序
    pub fn push(&mut self, key: Key, data: &[u8]) -> &mut Self {
        self.items.push((key, data.to_vec()));
        self
    }

    /// 已用字节（item 表 + 数据）
    pub fn used_bytes(&self) -> usize {
        self.items.iter().map(|(_, d)| BTRFS_ITEM_SIZE + d.len()).sum()
    }

    /// 是否还能容纳 `data_len` 字节的 item
    pub fn fits(&self, data_len: usize) -> bool {
        BTRFS_HEADER_SIZE + self.used_bytes() + BTRFS_ITEM_SIZE + data_len
            <= self.nodesize as usize
    }

    /// item 数量
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 编码为 nodesize 字节的块
    ///
    /// # Panics
    ///
    /// item 放不下时 panic
    pub fn finish(&self) -> Vec<u8> {
        let mut items: Vec<&(Key, Vec<u8>)> = self.items.iter().collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));

        let nodesize = self.nodesize as usize;
        assert!(
            BTRFS_HEADER_SIZE + self.used_bytes() <= nodesize,
            "leaf items exceed nodesize"
        );

        let mut buf = alloc::vec![0u8; nodesize];
        write_header(&mut buf, self.bytenr, self.generation, self.owner, items.len() as u32, 0);

        // 数据偏移相对 header 末尾
        let mut data_end = nodesize - BTRFS_HEADER_SIZE;
        for (slot, (key, data)) in items.iter().enumerate() {
            data_end -= data.len();
            let base = BTRFS_HEADER_SIZE + slot * BTRFS_ITEM_SIZE;
            key.write_disk(&mut buf[base..base + BTRFS_DISK_KEY_SIZE]);
            LittleEndian::write_u32(&mut buf[base + 17..], data_end as u32);
            LittleEndian::write_u32(&mut buf[base + 21..], data.len() as u32);
            let start = BTRFS_HEADER_SIZE + data_end;
            buf[start..start + data.len()].copy_from_slice(data);
        }

        seal(&mut buf);
        buf
    }
}

/// 内部节点构造器
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    bytenr: u64,
    nodesize: u32,
    owner: u64,
    generation: u64,
    level: u8,
    ptrs: Vec<(Key, u64, u64)>,
}

impl NodeBuilder {
    /// 创建空节点，`level` 必须大于 0
    pub fn new(bytenr: u64, nodesize: u32, owner: u64, generation: u64, level: u8) -> Self {
        debug_assert!(level > 0);
        Self { bytenr, nodesize, owner, generation, level, ptrs: Vec::new() }
    }

    /// 添加 key pointer
    pub fn push(&mut self, key: Key, blockptr: u64, ptr_generation: u64) -> &mut Self {
        self.ptrs.push((key, blockptr, ptr_generation));
        self
    }

    /// 编码为 nodesize 字节的块
    pub fn finish(&self) -> Vec<u8> {
        let mut ptrs = self.ptrs.clone();
        ptrs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buf = alloc::vec![0u8; self.nodesize as usize];
        assert!(
            BTRFS_HEADER_SIZE + ptrs.len() * BTRFS_KEY_PTR_SIZE <= buf.len(),
            "key pointers exceed nodesize"
        );
        write_header(
            &mut buf,
            self.bytenr,
            self.generation,
            self.owner,
            ptrs.len() as u32,
            self.level,
        );
        for (slot, (key, blockptr, gen)) in ptrs.iter().enumerate() {
            let base = BTRFS_HEADER_SIZE + slot * BTRFS_KEY_PTR_SIZE;
            key.write_disk(&mut buf[base..base + BTRFS_DISK_KEY_SIZE]);
            LittleEndian::write_u64(&mut buf[base + 17..], *blockptr);
            LittleEndian::write_u64(&mut buf[base + 25..], *gen);
        }

        seal(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctree::ExtentBuffer;

    #[test]
    fn test_items_sorted_on_finish() {
        let mut b = LeafBuilder::new(4096, 4096, 5, 1);
        b.push(Key::new(300, 1, 0), &[3]);
        b.push(Key::new(256, 1, 0), &[1, 1]);
        let eb = ExtentBuffer::from_bytes(b.finish(), 4096, true).unwrap();
        assert_eq!(eb.item_key(0).objectid, 256);
        assert_eq!(eb.item_data(0), &[1, 1]);
        assert_eq!(eb.item_data(1), &[3]);
    }

    #[test]
    fn test_fits() {
        let mut b = LeafBuilder::new(4096, 4096, 5, 1);
        assert!(b.fits(4096 - BTRFS_HEADER_SIZE - BTRFS_ITEM_SIZE));
        assert!(!b.fits(4096));
        b.push(Key::new(1, 1, 1), &[0; 100]);
        assert_eq!(b.used_bytes(), BTRFS_ITEM_SIZE + 100);
        assert_eq!(b.len(), 1);
    }

    #[test]
    #[should_panic(expected = "leaf items exceed nodesize")]
    fn test_overfull_leaf_panics() {
        let mut b = LeafBuilder::new(4096, 4096, 5, 1);
        b.push(Key::new(1, 1, 1), &[0; 4096]);
        b.finish();
    }
}
