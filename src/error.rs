//! 错误类型定义
//!
//! 提供块缓存与 SD 总线核心操作的错误类型。

use core::fmt;

/// 核心操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 模块尚未初始化
    NotInit,
    /// 无效的初始化配置
    InvalidConfig,
    /// 池或表已耗尽
    AllocFailure,
    /// 无效句柄（过期的作业句柄、未知总线等）
    InvalidHandle,
    /// 无效状态（设备正在解绑、卡未使能、重复绑定等）
    InvalidState,
    /// I/O 错误
    Io,
    /// 超时（命令无响应、同步传输等待超时）
    Timeout,
    /// 不支持的操作或卡类型
    NotSupported,
    /// 逻辑块大小超出缓存支持范围
    SizeInvalid,
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
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
