//! CRC32C 校验和计算
//!
//! 为 tree block 校验和以及 extent data ref 的 key 哈希提供计算功能

use crc32fast::Hasher;

/// CRC32 初始值
pub const BTRFS_CRC32_INIT: u32 = !0u32;

/// 计算 CRC32C 校验和（一次性计算）
///
/// # 参数
/// * `data` - 要计算校验和的数据
///
/// # 返回
/// CRC32C 值
#[inline]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// 计算 CRC32C 校验和（追加模式）
///
/// # 参数
/// * `crc` - 初始 CRC 值
/// * `data` - 要计算校验和的数据
///
/// # 返回
/// 更新后的 CRC32C 值
#[inline]
pub fn crc32c_append(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_deterministic() {
        let data = b"extent tree";
        assert_eq!(crc32c(data), crc32c(data));
        assert_ne!(crc32c(b"a"), crc32c(b"b"));
    }

    #[test]
    fn test_crc32c_append_matches_split() {
        let whole = crc32c_append(BTRFS_CRC32_INIT, b"hello world");
        let part = crc32c_append(BTRFS_CRC32_INIT, b"hello ");
        let joined = crc32c_append(part, b"world");
        assert_eq!(whole, joined);
    }
}
