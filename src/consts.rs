//! btrfs 磁盘格式常量定义
//!
//! 这个模块包含了 backref 引擎需要的所有常量，包括：
//! - tree block 布局
//! - key 类型
//! - 特殊 objectid
//! - 序列号哨兵值

//=============================================================================
// 基础常量
//=============================================================================

/// 默认扇区大小（4096 字节）
pub const BTRFS_DEFAULT_SECTORSIZE: u32 = 4096;

/// 默认 tree block 大小（16 KiB）
pub const BTRFS_DEFAULT_NODESIZE: u32 = 16384;

/// 最大树深度
pub const BTRFS_MAX_LEVEL: usize = 8;

/// csum 字段大小
pub const BTRFS_CSUM_SIZE: usize = 32;

/// fsid 大小
pub const BTRFS_FSID_SIZE: usize = 16;

/// uuid 大小
pub const BTRFS_UUID_SIZE: usize = 16;

//=============================================================================
// tree block 布局
//=============================================================================

/// tree block header 大小
pub const BTRFS_HEADER_SIZE: usize = 101;

/// disk key 大小 (objectid u64 + type u8 + offset u64)
pub const BTRFS_DISK_KEY_SIZE: usize = 17;

/// 叶子 item 描述符大小 (key + data offset u32 + data size u32)
pub const BTRFS_ITEM_SIZE: usize = 25;

/// 内部节点 key pointer 大小 (key + blockptr u64 + generation u64)
pub const BTRFS_KEY_PTR_SIZE: usize = 33;

/// header 字段偏移
pub const BTRFS_HEADER_BYTENR_OFFSET: usize = 0x30;
/// header flags 偏移
pub const BTRFS_HEADER_FLAGS_OFFSET: usize = 0x38;
/// header chunk tree uuid 偏移
pub const BTRFS_HEADER_CHUNK_UUID_OFFSET: usize = 0x40;
/// header generation 偏移
pub const BTRFS_HEADER_GENERATION_OFFSET: usize = 0x50;
/// header owner 偏移
pub const BTRFS_HEADER_OWNER_OFFSET: usize = 0x58;
/// header nritems 偏移
pub const BTRFS_HEADER_NRITEMS_OFFSET: usize = 0x60;
/// header level 偏移
pub const BTRFS_HEADER_LEVEL_OFFSET: usize = 0x64;

//=============================================================================
// extent item 布局
//=============================================================================

/// btrfs_extent_item 大小 (refs u64 + generation u64 + flags u64)
pub const BTRFS_EXTENT_ITEM_SIZE: usize = 24;

/// btrfs_tree_block_info 大小 (disk key + level u8)
pub const BTRFS_TREE_BLOCK_INFO_SIZE: usize = 18;

/// btrfs_extent_inline_ref 头大小 (type u8 + offset u64)
pub const BTRFS_EXTENT_INLINE_REF_SIZE: usize = 9;

/// btrfs_extent_data_ref 大小 (root u64 + objectid u64 + offset u64 + count u32)
pub const BTRFS_EXTENT_DATA_REF_SIZE: usize = 28;

/// btrfs_shared_data_ref 大小 (count u32)
pub const BTRFS_SHARED_DATA_REF_SIZE: usize = 4;

/// btrfs_file_extent_item 中 disk_bytenr 之前的部分（inline extent 数据从这里开始）
pub const BTRFS_FILE_EXTENT_INLINE_DATA_START: usize = 21;

/// btrfs_file_extent_item 大小（regular / prealloc）
pub const BTRFS_FILE_EXTENT_ITEM_SIZE: usize = 53;

//=============================================================================
// key 类型
//=============================================================================

/// inode item
pub const BTRFS_INODE_ITEM_KEY: u8 = 1;
/// 文件数据 extent
pub const BTRFS_EXTENT_DATA_KEY: u8 = 108;
/// root item
pub const BTRFS_ROOT_ITEM_KEY: u8 = 132;
/// extent item（数据 extent，或非 skinny 的 tree block）
pub const BTRFS_EXTENT_ITEM_KEY: u8 = 168;
/// skinny metadata item（key offset 为 level）
pub const BTRFS_METADATA_ITEM_KEY: u8 = 169;
/// tree block 间接引用（owner root 已知）
pub const BTRFS_TREE_BLOCK_REF_KEY: u8 = 176;
/// 数据间接引用（root + inode + offset）
pub const BTRFS_EXTENT_DATA_REF_KEY: u8 = 178;
/// tree block 直接引用（parent 已知）
pub const BTRFS_SHARED_BLOCK_REF_KEY: u8 = 182;
/// 数据直接引用（parent 已知）
pub const BTRFS_SHARED_DATA_REF_KEY: u8 = 184;
/// block group item
pub const BTRFS_BLOCK_GROUP_ITEM_KEY: u8 = 192;

//=============================================================================
// file extent 类型
//=============================================================================

/// inline extent（数据在 item 内）
pub const BTRFS_FILE_EXTENT_INLINE: u8 = 0;
/// 普通 extent
pub const BTRFS_FILE_EXTENT_REG: u8 = 1;
/// 预分配 extent
pub const BTRFS_FILE_EXTENT_PREALLOC: u8 = 2;

//=============================================================================
// 特殊 objectid
//=============================================================================

/// root tree
pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
/// extent tree
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
/// 默认子卷 (fs tree)
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
/// 第一个普通 inode
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;
/// 子卷 id 上限
pub const BTRFS_LAST_FREE_OBJECTID: u64 = u64::MAX - 256;

//=============================================================================
// 序列号
//=============================================================================

/// 哨兵：使用最新树，不需要 delayed ref
pub const BTRFS_SEQ_LAST: u64 = u64::MAX;

/// clone 导致 offset 下溢时的阈值（i64::MAX）
pub const BTRFS_MAX_FILE_OFFSET: u64 = i64::MAX as u64;

/// LOGICAL_INO 结果中每个元素占用的字节数 (inum + offset + root)
pub const BTRFS_INODE_ELEM_BYTES: u64 = 3 * 8;
