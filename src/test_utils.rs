//! 测试工具：内存块设备与镜像构造

use crate::{
    block::BlockDevice,
    consts::*,
    ctree::{LeafBuilder, NodeBuilder, RootNode},
    error::{Error, ErrorKind, Result},
    fs::{FsConfig, FsInfo},
    types::{
        ExtentDataRef, ExtentFlags, ExtentItem, FileExtentItem, InlineRef, Key, TreeBlockInfo,
    },
};
use alloc::{vec, vec::Vec};
use byteorder::{ByteOrder, LittleEndian};

/// 内存块设备（512 字节扇区）
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    /// 创建 `size` 字节的全零设备
    pub fn new(size: usize) -> Self {
        Self { data: vec![0u8; size] }
    }
}

impl BlockDevice for MemDevice {
    fn sector_size(&self) -> u32 {
        512
    }

    fn total_sectors(&self) -> u64 {
        (self.data.len() / 512) as u64
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        let start = lba as usize * 512;
        let len = count as usize * 512;
        if start + len > self.data.len() || buf.len() < len {
            return Err(Error::new(ErrorKind::Io, "MemDevice read out of range"));
        }
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(len)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        let start = lba as usize * 512;
        let len = count as usize * 512;
        if start + len > self.data.len() || buf.len() < len {
            return Err(Error::new(ErrorKind::Io, "MemDevice write out of range"));
        }
        self.data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(len)
    }
}

/// 测试镜像，nodesize 4096
pub struct TestFs {
    pub fs: FsInfo<MemDevice>,
}

/// 测试镜像的 generation
pub const TEST_GENERATION: u64 = 1;

impl TestFs {
    pub fn new() -> Self {
        Self::with_config(FsConfig { nodesize: 4096, tree_cache_blocks: 16, ..FsConfig::default() })
    }

    pub fn with_config(config: FsConfig) -> Self {
        let fs = FsInfo::new(MemDevice::new(4 * 1024 * 1024), config).unwrap();
        fs.set_generation(TEST_GENERATION);
        Self { fs }
    }

    /// 写一个叶子
    pub fn leaf(&self, bytenr: u64, owner: u64, items: Vec<(Key, Vec<u8>)>) -> &Self {
        let mut builder = LeafBuilder::new(bytenr, self.fs.nodesize(), owner, TEST_GENERATION);
        for (key, data) in &items {
            builder.push(*key, data);
        }
        self.fs.write_tree_block(bytenr, &builder.finish()).unwrap();
        self
    }

    /// 写一个内部节点
    pub fn node(&self, bytenr: u64, owner: u64, level: u8, ptrs: &[(Key, u64)]) -> &Self {
        let mut builder =
            NodeBuilder::new(bytenr, self.fs.nodesize(), owner, TEST_GENERATION, level);
        for (key, child) in ptrs {
            builder.push(*key, *child, TEST_GENERATION);
        }
        self.fs.write_tree_block(bytenr, &builder.finish()).unwrap();
        self
    }

    /// 注册已提交的 root
    pub fn root(&self, root_id: u64, bytenr: u64, level: u8) -> &Self {
        self.fs.roots().insert_committed(root_id, RootNode::new(bytenr, level, TEST_GENERATION));
        self
    }

    /// 单叶子的 extent tree
    pub fn extent_tree(&self, bytenr: u64, items: Vec<(Key, Vec<u8>)>) -> &Self {
        self.leaf(bytenr, BTRFS_EXTENT_TREE_OBJECTID, items);
        self.root(BTRFS_EXTENT_TREE_OBJECTID, bytenr, 0)
    }
}

fn extent_item(refs: u64, flags: ExtentFlags, info: Option<TreeBlockInfo>, inline: &[InlineRef]) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    ExtentItem { refs, generation: TEST_GENERATION, flags }.write(&mut buf);
    let mut len = BTRFS_EXTENT_ITEM_SIZE;
    if let Some(info) = info {
        info.write(&mut buf[len..]);
        len += BTRFS_TREE_BLOCK_INFO_SIZE;
    }
    for iref in inline {
        len += iref.write(&mut buf[len..]);
    }
    buf.truncate(len);
    buf
}

/// 数据 extent item
pub fn data_extent_item(refs: u64, inline: &[InlineRef]) -> Vec<u8> {
    extent_item(refs, ExtentFlags::DATA, None, inline)
}

/// skinny metadata item
pub fn metadata_extent_item(refs: u64, inline: &[InlineRef]) -> Vec<u8> {
    extent_item(refs, ExtentFlags::TREE_BLOCK, None, inline)
}

/// 非 skinny 的 tree block extent item
pub fn tree_block_extent_item(refs: u64, key: Key, level: u8, inline: &[InlineRef]) -> Vec<u8> {
    extent_item(refs, ExtentFlags::TREE_BLOCK, Some(TreeBlockInfo { key, level }), inline)
}

/// 数据 extent item 的 key
pub fn data_extent_key(bytenr: u64, num_bytes: u64) -> Key {
    Key::new(bytenr, BTRFS_EXTENT_ITEM_KEY, num_bytes)
}

/// skinny metadata item 的 key
pub fn metadata_key(bytenr: u64, level: u8) -> Key {
    Key::new(bytenr, BTRFS_METADATA_ITEM_KEY, level as u64)
}

/// 文件数据 key
pub fn data_key(ino: u64, file_pos: u64) -> Key {
    Key::new(ino, BTRFS_EXTENT_DATA_KEY, file_pos)
}

/// regular 文件 extent item
pub fn file_extent(disk_bytenr: u64, disk_num_bytes: u64, offset: u64, num_bytes: u64) -> Vec<u8> {
    let mut buf = vec![0u8; BTRFS_FILE_EXTENT_ITEM_SIZE];
    FileExtentItem {
        generation: TEST_GENERATION,
        ram_bytes: disk_num_bytes,
        extent_type: BTRFS_FILE_EXTENT_REG,
        disk_bytenr,
        disk_num_bytes,
        offset,
        num_bytes,
        ..Default::default()
    }
    .write(&mut buf);
    buf
}

/// inline 文件 extent item（带 8 字节数据）
pub fn inline_file_extent() -> Vec<u8> {
    let mut buf = vec![0xabu8; BTRFS_FILE_EXTENT_INLINE_DATA_START + 8];
    FileExtentItem {
        generation: TEST_GENERATION,
        ram_bytes: 8,
        extent_type: BTRFS_FILE_EXTENT_INLINE,
        ..Default::default()
    }
    .write(&mut buf);
    buf
}

/// keyed extent data ref
pub fn keyed_data_ref(bytenr: u64, root: u64, objectid: u64, offset: u64, count: u32) -> (Key, Vec<u8>) {
    let dref = ExtentDataRef { root, objectid, offset, count };
    let mut buf = vec![0u8; BTRFS_EXTENT_DATA_REF_SIZE];
    dref.write(&mut buf);
    (Key::new(bytenr, BTRFS_EXTENT_DATA_REF_KEY, dref.key_offset()), buf)
}

/// keyed shared data ref
pub fn keyed_shared_data_ref(bytenr: u64, parent: u64, count: u32) -> (Key, Vec<u8>) {
    let mut buf = vec![0u8; BTRFS_SHARED_DATA_REF_SIZE];
    LittleEndian::write_u32(&mut buf, count);
    (Key::new(bytenr, BTRFS_SHARED_DATA_REF_KEY, parent), buf)
}

/// keyed tree block ref
pub fn keyed_tree_block_ref(bytenr: u64, root: u64) -> (Key, Vec<u8>) {
    (Key::new(bytenr, BTRFS_TREE_BLOCK_REF_KEY, root), Vec::new())
}

/// keyed shared block ref
pub fn keyed_shared_block_ref(bytenr: u64, parent: u64) -> (Key, Vec<u8>) {
    (Key::new(bytenr, BTRFS_SHARED_BLOCK_REF_KEY, parent), Vec::new())
}

/// 数据 extent 0x1000 的引用：inline shared-data-ref(parent 0x2000, count 2)
/// 加 keyed extent-data-ref(root 5, inode 256, offset 0, count 1)
///
/// - tree 5：node 0x5000（level 1）→ 叶子 0x2000（inode 255）、0x3000（inode 256）
/// - extent tree：单叶子 0x10000
pub fn shared_and_keyed_scenario() -> TestFs {
    let t = TestFs::new();
    t.leaf(
        0x2000,
        BTRFS_FS_TREE_OBJECTID,
        vec![
            (data_key(255, 0), file_extent(0x1000, 4096, 0, 4096)),
            (data_key(255, 4096), file_extent(0x1000, 4096, 0, 4096)),
        ],
    );
    t.leaf(
        0x3000,
        BTRFS_FS_TREE_OBJECTID,
        vec![
            (Key::new(256, BTRFS_INODE_ITEM_KEY, 0), vec![0u8; 16]),
            (data_key(256, 0), file_extent(0x1000, 4096, 0, 4096)),
        ],
    );
    t.node(
        0x5000,
        BTRFS_FS_TREE_OBJECTID,
        1,
        &[(data_key(255, 0), 0x2000), (Key::new(256, BTRFS_INODE_ITEM_KEY, 0), 0x3000)],
    );
    t.root(BTRFS_FS_TREE_OBJECTID, 0x5000, 1);

    let fs_tree_ref = [InlineRef::TreeBlock { root: BTRFS_FS_TREE_OBJECTID }];
    t.extent_tree(
        0x10000,
        vec![
            (
                data_extent_key(0x1000, 4096),
                data_extent_item(3, &[InlineRef::SharedData { parent: 0x2000, count: 2 }]),
            ),
            keyed_data_ref(0x1000, BTRFS_FS_TREE_OBJECTID, 256, 0, 1),
            (metadata_key(0x2000, 0), metadata_extent_item(1, &fs_tree_ref)),
            (metadata_key(0x3000, 0), metadata_extent_item(1, &fs_tree_ref)),
            (metadata_key(0x5000, 1), metadata_extent_item(1, &fs_tree_ref)),
        ],
    );
    t
}

/// 数据 extent 0x1000 由叶子 L1 (0x2000) 引用；L1 是 tree 100 的 root，
/// 同时被 tree 200 的 root 节点 N2 (0x4000, level 1) 通过 shared block ref 引用
pub fn two_root_closure_scenario() -> TestFs {
    let t = TestFs::new();
    t.leaf(0x2000, 100, vec![(data_key(256, 0), file_extent(0x1000, 4096, 0, 4096))]);
    t.node(0x4000, 200, 1, &[(data_key(256, 0), 0x2000)]);
    t.root(100, 0x2000, 0);
    t.root(200, 0x4000, 1);
    t.extent_tree(
        0x10000,
        vec![
            (
                data_extent_key(0x1000, 4096),
                data_extent_item(1, &[InlineRef::SharedData { parent: 0x2000, count: 1 }]),
            ),
            (
                metadata_key(0x2000, 0),
                metadata_extent_item(
                    2,
                    &[InlineRef::TreeBlock { root: 100 }, InlineRef::SharedBlock { parent: 0x4000 }],
                ),
            ),
            (metadata_key(0x4000, 1), metadata_extent_item(1, &[InlineRef::TreeBlock { root: 200 }])),
        ],
    );
    t
}

/// 数据 extent 0x1000 由 tree 5 的叶子 0x3000（inode 256, 文件位置 0）引用一次
pub fn single_ref_scenario() -> TestFs {
    let t = TestFs::new();
    t.leaf(
        0x3000,
        BTRFS_FS_TREE_OBJECTID,
        vec![(data_key(256, 0), file_extent(0x1000, 4096, 0, 4096))],
    );
    t.root(BTRFS_FS_TREE_OBJECTID, 0x3000, 0);
    t.extent_tree(
        0x10000,
        vec![
            (
                data_extent_key(0x1000, 4096),
                data_extent_item(
                    1,
                    &[InlineRef::ExtentData(ExtentDataRef {
                        root: BTRFS_FS_TREE_OBJECTID,
                        objectid: 256,
                        offset: 0,
                        count: 1,
                    })],
                ),
            ),
            (
                metadata_key(0x3000, 0),
                metadata_extent_item(1, &[InlineRef::TreeBlock { root: BTRFS_FS_TREE_OBJECTID }]),
            ),
        ],
    );
    t
}
