//! 块设备抽象
//!
//! 提供块设备接口和 tree block 级 I/O 操作。
//! block/device.rs 提供 `BlockDevice` trait 以及包装器 `BlockDev`，
//! `BlockDev` 按字节地址读写 tree block，并可选地通过 tree block 缓存读取。
//!
//! 地址约定：tree block 的 bytenr 即设备（分区）内的字节偏移，不做 chunk 映射。

mod device;

pub use device::{BlockDev, BlockDevice};
