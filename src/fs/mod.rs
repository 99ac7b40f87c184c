//! 文件系统全局状态
//!
//! [`FsInfo`] 持有 backref 引擎需要的全部共享状态，[`FsConfig`] 为其配置。

mod config;
mod info;

pub use config::{FsConfig, FsStats};
pub use info::FsInfo;
