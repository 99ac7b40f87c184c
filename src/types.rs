//! btrfs 数据结构定义
//!
//! 这个模块包含了 backref 引擎读取的磁盘格式结构。
//!
//! ## 设计原则
//!
//! 1. **按字节解析** - 所有结构都通过 `byteorder` 从小端字节切片读取，不做指针转换
//! 2. **只读视图** - item 解析结果是普通值类型，便于在 prelim ref 之间复制
//! 3. **编码函数** - 提供对应的编码函数，用于构造 tree block（测试和镜像工具使用）

use crate::consts::*;
use crate::crc::{crc32c_append, BTRFS_CRC32_INIT};
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use core::cmp::Ordering;

//=============================================================================
// Key
//=============================================================================

/// btrfs key（cpu 字节序）
///
/// 排序顺序为 (objectid, type, offset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Key {
    /// 对象 id
    pub objectid: u64,
    /// item 类型
    pub item_type: u8,
    /// 偏移（含义随类型变化）
    pub offset: u64,
}

impl Key {
    /// 最小 key
    pub const MIN: Self = Key::new(u64::MIN, u8::MIN, u64::MIN);
    /// 最大 key
    pub const MAX: Self = Key::new(u64::MAX, u8::MAX, u64::MAX);

    /// 创建 key
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self { objectid, item_type, offset }
    }

    /// 是否为全零 key（indirect-missing-keys 状态）
    pub fn is_zero(&self) -> bool {
        self.objectid == 0 && self.item_type == 0 && self.offset == 0
    }

    /// 下一个 key（带进位）
    pub fn next(&self) -> Self {
        let (offset, carry1) = self.offset.overflowing_add(1);
        let (item_type, carry2) = self.item_type.overflowing_add(carry1 as u8);
        let objectid = self.objectid.wrapping_add(carry2 as u64);
        Key { objectid, item_type, offset }
    }

    /// 从 disk key 字节解析
    pub fn read_disk(buf: &[u8]) -> Self {
        Key {
            objectid: LittleEndian::read_u64(&buf[0..8]),
            item_type: buf[8],
            offset: LittleEndian::read_u64(&buf[9..17]),
        }
    }

    /// 编码为 disk key 字节
    pub fn write_disk(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.objectid);
        buf[8] = self.item_type;
        LittleEndian::write_u64(&mut buf[9..17], self.offset);
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.objectid
            .cmp(&other.objectid)
            .then(self.item_type.cmp(&other.item_type))
            .then(self.offset.cmp(&other.offset))
    }
}

//=============================================================================
// 标志位
//=============================================================================

bitflags! {
    /// extent item 标志
    ///
    /// 对应 `BTRFS_EXTENT_FLAG_*` / `BTRFS_BLOCK_FLAG_FULL_BACKREF`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtentFlags: u64 {
        /// 数据 extent
        const DATA = 1 << 0;
        /// tree block
        const TREE_BLOCK = 1 << 1;
        /// tree block 的所有引用均为 full backref（shared block ref）
        const FULL_BACKREF = 1 << 8;
    }
}

bitflags! {
    /// tree block header 标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u64 {
        /// 已写出
        const WRITTEN = 1 << 0;
        /// 已 reloc
        const RELOC = 1 << 1;
    }
}

//=============================================================================
// extent item
//=============================================================================

/// extent item 头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentItem {
    /// 引用总数
    pub refs: u64,
    /// 分配时的 generation
    pub generation: u64,
    /// 标志
    pub flags: ExtentFlags,
}

impl ExtentItem {
    /// 从 item 数据解析头部
    pub fn parse(data: &[u8]) -> Self {
        assert!(
            data.len() >= BTRFS_EXTENT_ITEM_SIZE,
            "extent item smaller than its header"
        );
        ExtentItem {
            refs: LittleEndian::read_u64(&data[0..8]),
            generation: LittleEndian::read_u64(&data[8..16]),
            flags: ExtentFlags::from_bits_retain(LittleEndian::read_u64(&data[16..24])),
        }
    }

    /// 编码头部
    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.refs);
        LittleEndian::write_u64(&mut buf[8..16], self.generation);
        LittleEndian::write_u64(&mut buf[16..24], self.flags.bits());
    }
}

/// 非 skinny tree block extent item 中的 tree_block_info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeBlockInfo {
    /// tree block 的第一个 key
    pub key: Key,
    /// tree block 的 level
    pub level: u8,
}

impl TreeBlockInfo {
    /// 解析
    pub fn parse(data: &[u8]) -> Self {
        TreeBlockInfo {
            key: Key::read_disk(&data[0..BTRFS_DISK_KEY_SIZE]),
            level: data[BTRFS_DISK_KEY_SIZE],
        }
    }

    /// 编码
    pub fn write(&self, buf: &mut [u8]) {
        self.key.write_disk(&mut buf[0..BTRFS_DISK_KEY_SIZE]);
        buf[BTRFS_DISK_KEY_SIZE] = self.level;
    }
}

/// 数据间接引用记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentDataRef {
    /// 所属 root
    pub root: u64,
    /// inode 号
    pub objectid: u64,
    /// 文件位置 - extent 内偏移
    pub offset: u64,
    /// 引用次数
    pub count: u32,
}

impl ExtentDataRef {
    /// 解析
    pub fn parse(data: &[u8]) -> Self {
        ExtentDataRef {
            root: LittleEndian::read_u64(&data[0..8]),
            objectid: LittleEndian::read_u64(&data[8..16]),
            offset: LittleEndian::read_u64(&data[16..24]),
            count: LittleEndian::read_u32(&data[24..28]),
        }
    }

    /// 编码
    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.root);
        LittleEndian::write_u64(&mut buf[8..16], self.objectid);
        LittleEndian::write_u64(&mut buf[16..24], self.offset);
        LittleEndian::write_u32(&mut buf[24..28], self.count);
    }

    /// keyed 形式下的 key offset
    pub fn key_offset(&self) -> u64 {
        hash_extent_data_ref(self.root, self.objectid, self.offset)
    }
}

/// 解析 shared data ref 的引用次数
pub fn shared_data_ref_count(data: &[u8]) -> u32 {
    LittleEndian::read_u32(&data[0..4])
}

/// keyed extent data ref 的 key offset 哈希
///
/// root 进入高位 crc，(objectid, offset) 进入低位 crc
pub fn hash_extent_data_ref(root: u64, objectid: u64, offset: u64) -> u64 {
    let mut lenum = [0u8; 8];

    LittleEndian::write_u64(&mut lenum, root);
    let high_crc = crc32c_append(BTRFS_CRC32_INIT, &lenum);

    LittleEndian::write_u64(&mut lenum, objectid);
    let mut low_crc = crc32c_append(BTRFS_CRC32_INIT, &lenum);
    LittleEndian::write_u64(&mut lenum, offset);
    low_crc = crc32c_append(low_crc, &lenum);

    ((high_crc as u64) << 31) ^ (low_crc as u64)
}

/// inline ref 的大小（含类型字节），未知类型返回 None
pub fn inline_ref_size(ref_type: u8) -> Option<usize> {
    match ref_type {
        BTRFS_TREE_BLOCK_REF_KEY | BTRFS_SHARED_BLOCK_REF_KEY => Some(BTRFS_EXTENT_INLINE_REF_SIZE),
        BTRFS_SHARED_DATA_REF_KEY => {
            Some(BTRFS_EXTENT_INLINE_REF_SIZE + BTRFS_SHARED_DATA_REF_SIZE)
        }
        // extent data ref 覆盖 inline ref 的 offset 字段
        BTRFS_EXTENT_DATA_REF_KEY => Some(1 + BTRFS_EXTENT_DATA_REF_SIZE),
        _ => None,
    }
}

/// 解析后的 inline ref
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineRef {
    /// tree block，owner root 已知
    TreeBlock {
        /// root id
        root: u64,
    },
    /// tree block，parent 已知
    SharedBlock {
        /// parent 地址
        parent: u64,
    },
    /// 数据，root + inode + offset 已知
    ExtentData(ExtentDataRef),
    /// 数据，parent 已知
    SharedData {
        /// parent 地址
        parent: u64,
        /// 引用次数
        count: u32,
    },
}

impl InlineRef {
    /// 从 `buf` 起始处解析一个 inline ref，返回 (ref, 占用字节)
    ///
    /// 未知类型属于磁盘损坏，直接 panic
    pub fn parse(buf: &[u8]) -> (Self, usize) {
        let ref_type = buf[0];
        let size = match inline_ref_size(ref_type) {
            Some(size) => size,
            None => panic!("corrupt extent item: unknown inline ref type {}", ref_type),
        };
        assert!(size <= buf.len(), "inline ref crosses extent item end");

        let parsed = match ref_type {
            BTRFS_TREE_BLOCK_REF_KEY => InlineRef::TreeBlock {
                root: LittleEndian::read_u64(&buf[1..9]),
            },
            BTRFS_SHARED_BLOCK_REF_KEY => InlineRef::SharedBlock {
                parent: LittleEndian::read_u64(&buf[1..9]),
            },
            BTRFS_SHARED_DATA_REF_KEY => InlineRef::SharedData {
                parent: LittleEndian::read_u64(&buf[1..9]),
                count: shared_data_ref_count(&buf[9..13]),
            },
            _ => InlineRef::ExtentData(ExtentDataRef::parse(&buf[1..])),
        };
        (parsed, size)
    }

    /// 类型字节
    pub fn ref_type(&self) -> u8 {
        match self {
            InlineRef::TreeBlock { .. } => BTRFS_TREE_BLOCK_REF_KEY,
            InlineRef::SharedBlock { .. } => BTRFS_SHARED_BLOCK_REF_KEY,
            InlineRef::ExtentData(_) => BTRFS_EXTENT_DATA_REF_KEY,
            InlineRef::SharedData { .. } => BTRFS_SHARED_DATA_REF_KEY,
        }
    }

    /// 编码，返回写入的字节数
    pub fn write(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.ref_type();
        match self {
            InlineRef::TreeBlock { root: v } | InlineRef::SharedBlock { parent: v } => {
                LittleEndian::write_u64(&mut buf[1..9], *v);
            }
            InlineRef::SharedData { parent, count } => {
                LittleEndian::write_u64(&mut buf[1..9], *parent);
                LittleEndian::write_u32(&mut buf[9..13], *count);
            }
            InlineRef::ExtentData(dref) => dref.write(&mut buf[1..]),
        }
        inline_ref_size(self.ref_type()).unwrap_or(0)
    }
}

//=============================================================================
// file extent item
//=============================================================================

/// 文件 extent item（只包含 backref 需要的字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileExtentItem {
    /// generation
    pub generation: u64,
    /// 解压后的大小
    pub ram_bytes: u64,
    /// 压缩算法
    pub compression: u8,
    /// 加密
    pub encryption: u8,
    /// 其他编码
    pub other_encoding: u16,
    /// extent 类型
    pub extent_type: u8,
    /// 磁盘 extent 起始地址
    pub disk_bytenr: u64,
    /// 磁盘 extent 大小
    pub disk_num_bytes: u64,
    /// 文件数据在 extent 内的偏移
    pub offset: u64,
    /// 文件引用的字节数
    pub num_bytes: u64,
}

impl FileExtentItem {
    /// 解析；inline extent 只解析到类型字段
    pub fn parse(data: &[u8]) -> Self {
        let mut fi = FileExtentItem {
            generation: LittleEndian::read_u64(&data[0..8]),
            ram_bytes: LittleEndian::read_u64(&data[8..16]),
            compression: data[16],
            encryption: data[17],
            other_encoding: LittleEndian::read_u16(&data[18..20]),
            extent_type: data[20],
            ..Default::default()
        };
        if fi.extent_type != BTRFS_FILE_EXTENT_INLINE && data.len() >= BTRFS_FILE_EXTENT_ITEM_SIZE {
            fi.disk_bytenr = LittleEndian::read_u64(&data[21..29]);
            fi.disk_num_bytes = LittleEndian::read_u64(&data[29..37]);
            fi.offset = LittleEndian::read_u64(&data[37..45]);
            fi.num_bytes = LittleEndian::read_u64(&data[45..53]);
        }
        fi
    }

    /// 编码（regular / prealloc）
    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.generation);
        LittleEndian::write_u64(&mut buf[8..16], self.ram_bytes);
        buf[16] = self.compression;
        buf[17] = self.encryption;
        LittleEndian::write_u16(&mut buf[18..20], self.other_encoding);
        buf[20] = self.extent_type;
        if self.extent_type != BTRFS_FILE_EXTENT_INLINE {
            LittleEndian::write_u64(&mut buf[21..29], self.disk_bytenr);
            LittleEndian::write_u64(&mut buf[29..37], self.disk_num_bytes);
            LittleEndian::write_u64(&mut buf[37..45], self.offset);
            LittleEndian::write_u64(&mut buf[45..53], self.num_bytes);
        }
    }

    /// 是否为 inline extent
    pub fn is_inline(&self) -> bool {
        self.extent_type == BTRFS_FILE_EXTENT_INLINE
    }

    /// 数据是否按原样存储（未压缩/加密/编码）
    pub fn is_plain(&self) -> bool {
        self.compression == 0 && self.encryption == 0 && self.other_encoding == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let a = Key::new(256, BTRFS_EXTENT_DATA_KEY, 0);
        let b = Key::new(256, BTRFS_EXTENT_DATA_KEY, 4096);
        let c = Key::new(257, BTRFS_INODE_ITEM_KEY, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(Key::MAX.next(), Key::MIN);
        assert_eq!(
            Key::new(1, 2, u64::MAX).next(),
            Key::new(1, 3, 0)
        );
    }

    #[test]
    fn test_inline_ref_sizes() {
        assert_eq!(inline_ref_size(BTRFS_TREE_BLOCK_REF_KEY), Some(9));
        assert_eq!(inline_ref_size(BTRFS_SHARED_DATA_REF_KEY), Some(13));
        assert_eq!(inline_ref_size(BTRFS_EXTENT_DATA_REF_KEY), Some(29));
        assert_eq!(inline_ref_size(BTRFS_EXTENT_ITEM_KEY), None);
    }

    #[test]
    fn test_inline_ref_parse_extent_data() {
        let dref = ExtentDataRef { root: 5, objectid: 257, offset: 8192, count: 3 };
        let mut buf = [0u8; 64];
        let n = InlineRef::ExtentData(dref).write(&mut buf);
        assert_eq!(n, 29);
        let (parsed, size) = InlineRef::parse(&buf[..n]);
        assert_eq!(size, 29);
        assert_eq!(parsed, InlineRef::ExtentData(dref));
    }

    #[test]
    #[should_panic(expected = "unknown inline ref type")]
    fn test_inline_ref_unknown_type_panics() {
        let buf = [0x7fu8; 16];
        InlineRef::parse(&buf);
    }

    #[test]
    fn test_hash_extent_data_ref_distinguishes_roots() {
        assert_ne!(
            hash_extent_data_ref(5, 256, 0),
            hash_extent_data_ref(6, 256, 0)
        );
        assert_eq!(
            hash_extent_data_ref(5, 256, 0),
            ExtentDataRef { root: 5, objectid: 256, offset: 0, count: 1 }.key_offset()
        );
    }

    #[test]
    fn test_hash_extent_data_ref_layout() {
        let high = crc32c_append(BTRFS_CRC32_INIT, &5u64.to_le_bytes());
        let low = crc32c_append(crc32c_append(BTRFS_CRC32_INIT, &256u64.to_le_bytes()), &0u64.to_le_bytes());
        assert_eq!(hash_extent_data_ref(5, 256, 0), ((high as u64) << 31) ^ (low as u64));
    }

    #[test]
    fn test_file_extent_inline_skips_disk_fields() {
        let mut buf = [0u8; 32];
        buf[20] = BTRFS_FILE_EXTENT_INLINE;
        let fi = FileExtentItem::parse(&buf);
        assert!(fi.is_inline());
        assert_eq!(fi.disk_bytenr, 0);
    }

    #[test]
    fn test_extent_flags_retain_unknown_bits() {
        let mut buf = [0u8; BTRFS_EXTENT_ITEM_SIZE];
        ExtentItem {
            refs: 2,
            generation: 7,
            flags: ExtentFlags::TREE_BLOCK | ExtentFlags::FULL_BACKREF,
        }
        .write(&mut buf);
        let ei = ExtentItem::parse(&buf);
        assert_eq!(ei.refs, 2);
        assert!(ei.flags.contains(ExtentFlags::TREE_BLOCK));
        assert!(!ei.flags.contains(ExtentFlags::DATA));
    }
}
