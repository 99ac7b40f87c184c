//! Tree block（extent buffer）解析
//!
//! 一个 `ExtentBuffer` 是从设备读取的、已校验的不可变 tree block。
//! item 和 key pointer 按需从原始字节中读取。

use crate::{
    consts::*,
    crc::crc32c,
    error::{Error, ErrorKind, Result},
    types::{HeaderFlags, Key},
};
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};

/// 已解析的 tree block
pub struct ExtentBuffer {
    /// 块的原始数据（nodesize 字节）
    data: Vec<u8>,
    /// 块地址
    start: u64,
    /// 树中 level（0 为叶子）
    level: u8,
    /// item / key pointer 数量
    nritems: u32,
    /// 写入时的 generation
    generation: u64,
    /// 所属 tree id
    owner: u64,
    /// header 标志
    flags: HeaderFlags,
}

impl core::fmt::Debug for ExtentBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtentBuffer")
            .field("start", &self.start)
            .field("len", &self.data.len())
            .field("level", &self.level)
            .field("nritems", &self.nritems)
            .field("generation", &self.generation)
            .field("owner", &self.owner)
            .finish()
    }
}

impl ExtentBuffer {
    /// 从原始字节构造并校验
    ///
    /// # 参数
    ///
    /// * `data` - 块数据
    /// * `expected_start` - 读取时使用的地址，必须与 header 中的 bytenr 一致
    /// * `verify_csum` - 是否校验 header 校验和
    ///
    /// # 错误
    ///
    /// 块结构不合法时返回 `ErrorKind::Corrupted`
    pub fn from_bytes(data: Vec<u8>, expected_start: u64, verify_csum: bool) -> Result<Self> {
        if data.len() < BTRFS_HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupted, "Tree block smaller than header"));
        }

        if verify_csum {
            let stored = LittleEndian::read_u32(&data[0..4]);
            if stored != crc32c(&data[BTRFS_CSUM_SIZE..]) {
                log::error!("[TREE] checksum mismatch for tree block {:#x}", expected_start);
                return Err(Error::new(ErrorKind::Corrupted, "Tree block checksum mismatch"));
            }
        }

        let start = LittleEndian::read_u64(&data[BTRFS_HEADER_BYTENR_OFFSET..]);
        if start != expected_start {
            log::error!(
                "[TREE] bytenr mismatch: wanted {:#x}, header says {:#x}",
                expected_start,
                start
            );
            return Err(Error::new(ErrorKind::Corrupted, "Tree block bytenr mismatch"));
        }

        let level = data[BTRFS_HEADER_LEVEL_OFFSET];
        if level as usize >= BTRFS_MAX_LEVEL {
            return Err(Error::new(ErrorKind::Corrupted, "Tree block level too large"));
        }

        let eb = ExtentBuffer {
            start,
            level,
            nritems: LittleEndian::read_u32(&data[BTRFS_HEADER_NRITEMS_OFFSET..]),
            generation: LittleEndian::read_u64(&data[BTRFS_HEADER_GENERATION_OFFSET..]),
            owner: LittleEndian::read_u64(&data[BTRFS_HEADER_OWNER_OFFSET..]),
            flags: HeaderFlags::from_bits_retain(LittleEndian::read_u64(
                &data[BTRFS_HEADER_FLAGS_OFFSET..],
            )),
            data,
        };
        eb.check_layout()?;
        Ok(eb)
    }

    /// 检查 item 表以及 item 数据都在块内
    fn check_layout(&self) -> Result<()> {
        let nritems = self.nritems as usize;
        let entry_size = if self.level == 0 { BTRFS_ITEM_SIZE } else { BTRFS_KEY_PTR_SIZE };
        let table_end = nritems
            .checked_mul(entry_size)
            .and_then(|n| n.checked_add(BTRFS_HEADER_SIZE))
            .ok_or(Error::new(ErrorKind::Corrupted, "Item table overflow"))?;
        if table_end > self.data.len() {
            return Err(Error::new(ErrorKind::Corrupted, "Item count exceeds block capacity"));
        }

        if self.level == 0 {
            for slot in 0..nritems {
                let (off, size) = self.item_location(slot);
                let end = BTRFS_HEADER_SIZE + off + size;
                if BTRFS_HEADER_SIZE + off < table_end || end > self.data.len() {
                    return Err(Error::new(ErrorKind::Corrupted, "Item data outside leaf"));
                }
            }
        } else if nritems == 0 {
            return Err(Error::new(ErrorKind::Corrupted, "Empty internal node"));
        }
        Ok(())
    }

    /// 块地址
    pub fn start(&self) -> u64 {
        self.start
    }

    /// 块大小
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// level
    pub fn level(&self) -> u8 {
        self.level
    }

    /// item 数量
    pub fn nritems(&self) -> usize {
        self.nritems as usize
    }

    /// generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 所属 tree
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// header 标志
    pub fn flags(&self) -> HeaderFlags {
        self.flags
    }

    /// 是否为叶子
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    fn item_location(&self, slot: usize) -> (usize, usize) {
        let base = BTRFS_HEADER_SIZE + slot * BTRFS_ITEM_SIZE;
        let off = LittleEndian::read_u32(&self.data[base + 17..]) as usize;
        let size = LittleEndian::read_u32(&self.data[base + 21..]) as usize;
        (off, size)
    }

    /// 叶子 item 的 key
    pub fn item_key(&self, slot: usize) -> Key {
        debug_assert!(self.is_leaf() && slot < self.nritems());
        let base = BTRFS_HEADER_SIZE + slot * BTRFS_ITEM_SIZE;
        Key::read_disk(&self.data[base..base + BTRFS_DISK_KEY_SIZE])
    }

    /// 叶子 item 的大小
    pub fn item_size(&self, slot: usize) -> usize {
        self.item_location(slot).1
    }

    /// 叶子 item 的数据
    pub fn item_data(&self, slot: usize) -> &[u8] {
        let (off, size) = self.item_location(slot);
        let start = BTRFS_HEADER_SIZE + off;
        &self.data[start..start + size]
    }

    /// 内部节点第 slot 个 key
    pub fn node_key(&self, slot: usize) -> Key {
        debug_assert!(!self.is_leaf() && slot < self.nritems());
        let base = BTRFS_HEADER_SIZE + slot * BTRFS_KEY_PTR_SIZE;
        Key::read_disk(&self.data[base..base + BTRFS_DISK_KEY_SIZE])
    }

    /// 内部节点第 slot 个子块地址
    pub fn node_blockptr(&self, slot: usize) -> u64 {
        let base = BTRFS_HEADER_SIZE + slot * BTRFS_KEY_PTR_SIZE;
        LittleEndian::read_u64(&self.data[base + 17..])
    }

    /// 内部节点第 slot 个子块的 generation
    pub fn node_ptr_generation(&self, slot: usize) -> u64 {
        let base = BTRFS_HEADER_SIZE + slot * BTRFS_KEY_PTR_SIZE;
        LittleEndian::read_u64(&self.data[base + 25..])
    }

    /// 第 slot 个 key（叶子取 item key，节点取 key pointer 的 key）
    pub fn key_at(&self, slot: usize) -> Key {
        if self.is_leaf() {
            self.item_key(slot)
        } else {
            self.node_key(slot)
        }
    }

    /// 块中的第一个 key，空叶子返回 None
    pub fn first_key(&self) -> Option<Key> {
        if self.nritems == 0 {
            None
        } else {
            Some(self.key_at(0))
        }
    }

    /// 二分查找
    ///
    /// 返回 (是否精确命中, 第一个 >= key 的位置)
    pub fn bin_search(&self, key: &Key) -> (bool, usize) {
        let mut low = 0usize;
        let mut high = self.nritems();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key_at(mid).cmp(key) {
                core::cmp::Ordering::Less => low = mid + 1,
                core::cmp::Ordering::Greater => high = mid,
                core::cmp::Ordering::Equal => return (true, mid),
            }
        }
        (false, low)
    }
}
