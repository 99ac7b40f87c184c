//! 块设备核心类型

use crate::{
    cache::TreeBlockCache,
    ctree::ExtentBuffer,
    error::{Error, ErrorKind, Result},
};
use alloc::{sync::Arc, vec};

/// 块设备接口
///
/// 实现此 trait 以提供底层块设备访问。
///
/// # 示例
///
/// ```rust,ignore
/// use btrfs_backref::{BlockDevice, Result};
///
/// struct MyDevice {
///     // ...
/// }
///
/// impl BlockDevice for MyDevice {
///     fn sector_size(&self) -> u32 {
///         512
///     }
///
///     fn total_sectors(&self) -> u64 {
///         1000000
///     }
///
///     fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
///         // 实现扇区读取
///         Ok(count as usize * self.sector_size() as usize)
///     }
///
///     fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
///         // 实现扇区写入
///         Ok(count as usize * self.sector_size() as usize)
///     }
/// }
/// ```
pub trait BlockDevice {
    /// 物理扇区大小（通常 512）
    fn sector_size(&self) -> u32;

    /// 总扇区数
    fn total_sectors(&self) -> u64;

    /// 读取扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号
    /// * `count` - 要读取的扇区数
    /// * `buf` - 目标缓冲区（大小至少为 count * sector_size）
    ///
    /// # 返回
    ///
    /// 成功返回实际读取的字节数
    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize>;

    /// 写入扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号
    /// * `count` - 要写入的扇区数
    /// * `buf` - 源缓冲区（大小至少为 count * sector_size）
    ///
    /// # 返回
    ///
    /// 成功返回实际写入的字节数
    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize>;

    /// 刷新缓存
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// 是否只读
    fn is_read_only(&self) -> bool {
        false
    }
}

/// 块设备包装器
///
/// 按字节地址读写 tree block，包含统计信息和可选的 tree block 缓存。
///
/// # 并发使用
///
/// BlockDev 本身不包含内部锁，由 [`crate::fs::FsInfo`] 用 `parking_lot::Mutex` 包装后共享。
pub struct BlockDev<D> {
    /// 底层设备
    device: D,
    /// 分区偏移（字节）
    partition_offset: u64,
    /// 逻辑读取次数（包括缓存命中）
    read_count: u64,
    /// 逻辑写入次数
    write_count: u64,
    /// 物理读取次数（实际设备操作）
    physical_read_count: u64,
    /// 物理写入次数（实际设备操作）
    physical_write_count: u64,
    /// tree block 缓存（可选）
    bcache: Option<TreeBlockCache>,
}

impl<D: BlockDevice> BlockDev<D> {
    /// 创建新的块设备包装器（无缓存）
    pub fn new(device: D) -> Result<Self> {
        if device.sector_size() == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Sector size must be non-zero"));
        }

        Ok(Self {
            device,
            partition_offset: 0,
            read_count: 0,
            write_count: 0,
            physical_read_count: 0,
            physical_write_count: 0,
            bcache: None,
        })
    }

    /// 创建带 tree block 缓存的块设备包装器
    ///
    /// # 参数
    ///
    /// * `device` - 底层块设备
    /// * `cache_blocks` - 缓存的 tree block 数量，0 表示不缓存
    pub fn new_with_cache(device: D, cache_blocks: usize) -> Result<Self> {
        let mut bd = Self::new(device)?;
        bd.bcache = TreeBlockCache::new(cache_blocks);
        Ok(bd)
    }

    /// 获取底层设备的引用
    pub fn device(&self) -> &D {
        &self.device
    }

    /// 获取物理扇区大小
    pub fn sector_size(&self) -> u32 {
        self.device.sector_size()
    }

    /// 设置分区偏移
    pub fn set_partition_offset(&mut self, offset: u64) {
        self.partition_offset = offset;
    }

    /// 获取逻辑读取次数（包括缓存命中）
    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    /// 获取逻辑写入次数
    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    /// 获取物理读取次数（实际设备操作）
    pub fn physical_read_count(&self) -> u64 {
        self.physical_read_count
    }

    /// 获取物理写入次数（实际设备操作）
    pub fn physical_write_count(&self) -> u64 {
        self.physical_write_count
    }

    /// 获取 tree block 缓存（如果启用）
    pub fn cache(&self) -> Option<&TreeBlockCache> {
        self.bcache.as_ref()
    }

    /// 将字节范围转换为 (起始扇区, 扇区数)
    fn byte_range_to_sectors(&self, offset: u64, len: usize) -> Result<(u64, u32)> {
        let sector_size = self.device.sector_size() as u64;
        let start = offset + self.partition_offset;
        if start % sector_size != 0 || len as u64 % sector_size != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Tree block not aligned to sector size",
            ));
        }
        let lba = start / sector_size;
        let count = (len as u64 / sector_size) as u32;
        if lba + count as u64 > self.device.total_sectors() {
            return Err(Error::new(ErrorKind::Io, "Tree block beyond end of device"));
        }
        Ok((lba, count))
    }

    /// 直接读取字节范围（绕过缓存）
    pub fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (lba, count) = self.byte_range_to_sectors(offset, buf.len())?;
        self.physical_read_count += 1;
        let n = self.device.read_blocks(lba, count, buf)?;
        if n != buf.len() {
            return Err(Error::new(ErrorKind::Io, "Short read from device"));
        }
        Ok(())
    }

    /// 直接写入字节范围，并使覆盖到的缓存块失效
    pub fn write_bytes(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.device.is_read_only() {
            return Err(Error::new(ErrorKind::Unsupported, "Device is read-only"));
        }
        let (lba, count) = self.byte_range_to_sectors(offset, buf.len())?;
        self.write_count += 1;
        self.physical_write_count += 1;
        let n = self.device.write_blocks(lba, count, buf)?;
        if n != buf.len() {
            return Err(Error::new(ErrorKind::Io, "Short write to device"));
        }
        if let Some(cache) = &mut self.bcache {
            cache.invalidate(offset);
        }
        Ok(())
    }

    /// 读取一个 tree block
    ///
    /// 先查缓存，未命中时从设备读取 `nodesize` 字节并解析、校验。
    /// 这里只校验块自身（校验和、bytenr、布局），level / generation 由调用者检查。
    pub fn read_tree_block(
        &mut self,
        bytenr: u64,
        nodesize: u32,
        verify_csum: bool,
    ) -> Result<Arc<ExtentBuffer>> {
        self.read_count += 1;

        if let Some(cache) = &mut self.bcache {
            if let Some(eb) = cache.get(bytenr) {
                return Ok(eb);
            }
        }

        let mut data = vec![0u8; nodesize as usize];
        self.read_bytes(bytenr, &mut data)?;
        let eb = Arc::new(ExtentBuffer::from_bytes(data, bytenr, verify_csum)?);

        if let Some(cache) = &mut self.bcache {
            cache.insert(bytenr, eb.clone());
        }
        Ok(eb)
    }

    /// 写入一个编码好的 tree block
    pub fn write_tree_block(&mut self, bytenr: u64, data: &[u8]) -> Result<()> {
        self.write_bytes(bytenr, data)
    }

    /// 刷新底层设备
    pub fn flush(&mut self) -> Result<()> {
        self.device.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemDevice;

    #[test]
    fn test_unaligned_read_rejected() {
        let mut bdev = BlockDev::new(MemDevice::new(64 * 1024)).unwrap();
        let mut buf = [0u8; 100];
        let err = bdev.read_bytes(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_read_beyond_device_is_io_error() {
        let mut bdev = BlockDev::new(MemDevice::new(64 * 1024)).unwrap();
        let mut buf = [0u8; 4096];
        let err = bdev.read_bytes(64 * 1024, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_write_then_read_bytes() {
        let mut bdev = BlockDev::new(MemDevice::new(64 * 1024)).unwrap();
        let data = [0x5au8; 4096];
        bdev.write_bytes(8192, &data).unwrap();
        let mut out = [0u8; 4096];
        bdev.read_bytes(8192, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(bdev.physical_write_count(), 1);
        assert_eq!(bdev.physical_read_count(), 1);
    }

    #[test]
    fn test_partition_offset_shifts_addresses() {
        let mut bdev = BlockDev::new(MemDevice::new(64 * 1024)).unwrap();
        bdev.set_partition_offset(4096);
        let data = [0x33u8; 4096];
        bdev.write_bytes(0, &data).unwrap();

        bdev.set_partition_offset(0);
        let mut out = [0u8; 4096];
        bdev.read_bytes(4096, &mut out).unwrap();
        assert_eq!(out, data);
        bdev.read_bytes(0, &mut out).unwrap();
        assert_eq!(out, [0u8; 4096]);
    }

    #[test]
    fn test_garbage_tree_block_is_corrupted() {
        let mut bdev = BlockDev::new_with_cache(MemDevice::new(64 * 1024), 4).unwrap();
        bdev.write_bytes(16384, &[0xffu8; 16384]).unwrap();
        let err = bdev.read_tree_block(16384, 16384, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }
}
