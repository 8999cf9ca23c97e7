//! 块设备抽象
//!
//! 缓存引擎通过 [`BlockDevice`] trait 访问底层存储介质，
//! 通过 [`BlkDevHandle`] 在描述符表和写作业中标识设备。

use crate::error::Result;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

/// 块设备接口
///
/// 实现此 trait 以提供底层逻辑块访问。所有方法以 `&self`
/// 接收，设备内部需要自行处理可变状态（缓存引擎可能在
/// 持有缓存锁时发起读写）。
///
/// # 示例
///
/// ```rust,ignore
/// use sdfs_core::{BlockDevice, Result};
///
/// struct MyDevice {
///     // ...
/// }
///
/// impl BlockDevice for MyDevice {
///     fn lb_size_log2(&self) -> u8 {
///         9 // 512 字节逻辑块
///     }
///
///     fn lb_cnt(&self) -> u64 {
///         1000000
///     }
///
///     fn rd(&self, lb_nbr: u64, buf: &mut [u8]) -> Result<()> {
///         // 读取一个逻辑块
///         Ok(())
///     }
///
///     fn wr(&self, lb_nbr: u64, buf: &[u8]) -> Result<()> {
///         // 写入一个逻辑块
///         Ok(())
///     }
/// }
/// ```
pub trait BlockDevice: Send + Sync {
    /// 逻辑块大小的以 2 为底的对数（512 字节即 9）
    fn lb_size_log2(&self) -> u8;

    /// 逻辑块总数
    fn lb_cnt(&self) -> u64;

    /// 读取一个逻辑块
    ///
    /// `buf` 长度恰好为一个逻辑块
    fn rd(&self, lb_nbr: u64, buf: &mut [u8]) -> Result<()>;

    /// 写入一个逻辑块
    fn wr(&self, lb_nbr: u64, buf: &[u8]) -> Result<()>;
}

static NEXT_DEV_ID: AtomicU32 = AtomicU32::new(0);

/// 块设备句柄
///
/// 持有设备实现的共享引用，并携带进程内唯一的设备编号。
/// 句柄相等性按编号判定。
#[derive(Clone)]
pub struct BlkDevHandle {
    id: u32,
    dev: Arc<dyn BlockDevice>,
}

impl BlkDevHandle {
    /// 为设备分配句柄
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            id: NEXT_DEV_ID.fetch_add(1, Ordering::Relaxed),
            dev,
        }
    }

    /// 设备编号
    pub fn id(&self) -> u32 {
        self.id
    }

    /// 逻辑块大小对数
    pub fn lb_size_log2(&self) -> u8 {
        self.dev.lb_size_log2()
    }

    /// 读取一个逻辑块
    pub fn rd(&self, lb_nbr: u64, buf: &mut [u8]) -> Result<()> {
        self.dev.rd(lb_nbr, buf)
    }

    /// 写入一个逻辑块
    pub fn wr(&self, lb_nbr: u64, buf: &[u8]) -> Result<()> {
        self.dev.wr(lb_nbr, buf)
    }
}

impl PartialEq for BlkDevHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BlkDevHandle {}

impl core::fmt::Debug for BlkDevHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlkDevHandle").field("id", &self.id).finish()
    }
}
