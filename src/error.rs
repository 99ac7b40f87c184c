//! 错误类型定义
//!
//! 提供 backref 解析引擎以及底层 tree/block 访问的错误类型。
//!
//! 注意：`FoundShared`（共享短路）不是错误，而是通过返回值
//! （见 [`crate::backref::FindOutcome`]）表达的。

use core::fmt;

/// backref 操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误
    Io,
    /// 无效参数
    InvalidInput,
    /// 元数据损坏（校验和、bytenr、level 不匹配等）
    Corrupted,
    /// 块读取成功但不是最新数据（generation 不匹配）
    Stale,
    /// extent / root / key 在请求的快照中不存在
    NotFound,
    /// 内存不足
    NoMemory,
    /// 资源忙
    Busy,
    /// 无效状态
    InvalidState,
    /// 不支持的操作
    Unsupported,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// 是否为 NotFound（在闭包驱动中可被容忍）
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<alloc::collections::TryReserveError> for Error {
    fn from(_err: alloc::collections::TryReserveError) -> Self {
        Error::new(ErrorKind::NoMemory, "allocation failed")
    }
}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
