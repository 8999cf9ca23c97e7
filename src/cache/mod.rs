//! 块缓存模块
//!
//! 提供带写顺序约束的缓冲块缓存。
//!
//! # 主要组件
//!
//! - [`BuddyAlloc`] - 伙伴块分配器，在连续内存上按 2 的幂分配缓存块
//! - [`JobSched`] - 写作业调度器，维护块落盘顺序的有向无环图
//! - [`FsCache`] - 缓存引擎，组合以上组件并提供获取/刷新/失效操作
//! - [`CacheBlkDevData`] - 设备绑定，块操作的入口
//! - [`CacheBlk`] - 缓存块守卫，存续期间持有缓存锁
//!
//! # 设计原理
//!
//! 1. **单锁模型**：每个缓存一把锁保护全部内部状态，
//!    获取到的块守卫持锁到释放
//! 2. **序号池**：描述符表、使用链表和作业表都以序号互相引用，
//!    作业句柄带序列号校验，槽位复用后旧句柄自动失效
//! 3. **顺序写回**：脏块经由写作业落盘，作业间的边保证
//!    元数据一致性要求的先后次序；淘汰一个块可能因顺序约束
//!    把额外的块一并排干
//!
//! # 使用示例
//!
//! ```rust,ignore
//! use sdfs_core::{BlkDevHandle, FsCache, CacheBlkMode};
//!
//! let binding = FsCache::dflt_assign(BlkDevHandle::new(device), 8)?;
//!
//! {
//!     let mut blk = binding.blk_acquire(42, CacheBlkMode::RdWr)?;
//!     blk[0] = 0x5a;
//! } // 守卫释放，缓存锁归还
//!
//! binding.sync()?;
//! ```

mod buddy;
mod engine;
mod job_sched;

pub use buddy::BuddyAlloc;
pub use engine::{BlkFlags, CacheBlk, CacheBlkDevData, CacheBlkMode, CacheCfg, CacheStats, FsCache};
pub use job_sched::{JobHandle, JobSched, JOB_HANDLE_VOID};
