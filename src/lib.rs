//! sdfs_core: 块缓存与 SD 总线核心
//!
//! 这是一个面向嵌入式文件系统栈的核心库，包含两个独立可用的
//! 部分：
//! - **块缓存**：带写序约束调度的缓冲块缓存，按需回写、
//!   LRU 淘汰，脏块之间的先后顺序由作业调度器保证
//! - **SD 总线核心**：SD/SDIO 卡的事件编排与数据传输管线，
//!   卡初始化、插拔检测与异步传输队列
//!
//! # 示例
//!
//! ```rust,ignore
//! use sdfs_core::{BlkDevHandle, BlockDevice, CacheBlkDevData, CacheBlkMode, CacheCfg, FsCache, Result};
//!
//! // 实现 BlockDevice trait
//! struct MyDevice {
//!     // ...
//! }
//!
//! impl BlockDevice for MyDevice {
//!     // 实现必要的方法
//!     // ...
//! }
//!
//! fn main() -> Result<()> {
//!     let dev = BlkDevHandle::new(alloc::sync::Arc::new(MyDevice::new()));
//!     let blk_dev_data = FsCache::dflt_assign(dev, 16)?;
//!
//!     // 写入一个逻辑块
//!     let mut blk = blk_dev_data.blk_acquire(0, CacheBlkMode::Wr)?;
//!     blk[..4].copy_from_slice(b"data");
//!     drop(blk);
//!
//!     blk_dev_data.sync()?;
//!     Ok(())
//! }
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`kal`] - 内核抽象接口（信号量、延时、定时器）
//! - [`blkdev`] - 块设备抽象
//! - [`cache`] - 块缓存与写作业调度
//! - [`sd`] - SD 总线核心

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 内核抽象接口
pub mod kal;

/// 块设备抽象
pub mod blkdev;

/// 块缓存
pub mod cache;

/// SD 总线核心
pub mod sd;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 内核抽象
pub use kal::{Kal, KalSem};

// 块设备
pub use blkdev::{BlkDevHandle, BlockDevice};

// 缓存
pub use cache::{CacheBlk, CacheBlkDevData, CacheBlkMode, CacheCfg, CacheStats, FsCache};

// SD 总线核心
pub use sd::{
    SdAsyncXferCb, SdBusDrv, SdBusHandle, SdCardDetectMode, SdCardType, SdCfg, SdContext,
    SdEventFncts, SdIoFnctDrv, SdTransportMode,
};
