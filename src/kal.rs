//! 内核抽象接口
//!
//! 核心任务与传输管线只依赖宿主内核提供的少量阻塞原语：
//! 计数信号量、毫秒延时和卡检测轮询定时器。
//!
//! # 设计说明
//!
//! 这是一个接口预留，允许用户根据运行环境选择实现：
//! - RTOS 环境：用内核自带的信号量/定时器服务实现
//! - 带 `std` 的宿主环境：使用内置的 [`std_kal::StdKal`]
//!
//! 自旋锁（保护事件队列、缓存内部状态）不经过此接口，
//! 直接使用 `spin` crate。

use crate::error::Result;
use alloc::sync::Arc;

/// 计数信号量
pub trait KalSem: Send + Sync {
    /// 释放信号量（可从中断上下文调用）
    fn post(&self);

    /// 等待信号量
    ///
    /// # 参数
    ///
    /// * `timeout_ms` - `None` 表示无限等待；`Some(ms)` 超时后返回
    ///   [`ErrorKind::Timeout`](crate::error::ErrorKind::Timeout) 错误
    fn pend(&self, timeout_ms: Option<u32>) -> Result<()>;
}

/// 内核服务接口
pub trait Kal: Send + Sync {
    /// 创建一个初值为 0 的计数信号量
    fn sem_create(&self, name: &'static str) -> Arc<dyn KalSem>;

    /// 延时指定毫秒数
    fn dly_ms(&self, ms: u32);

    /// 重新启动一次性卡检测轮询定时器
    ///
    /// 仅在轮询检测模式下使用。定时器到期时宿主应调用
    /// [`SdContext::card_polling_tick`](crate::sd::SdContext::card_polling_tick)。
    /// 默认实现为空操作。
    fn card_poll_tmr_restart(&self) {}
}

#[cfg(any(test, feature = "std"))]
pub mod std_kal {
    //! 基于 `std` 的内核服务实现（用于宿主测试环境）

    use super::{Kal, KalSem};
    use crate::error::{Error, ErrorKind, Result};
    use alloc::sync::Arc;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    /// Mutex + Condvar 实现的计数信号量
    pub struct StdSem {
        count: Mutex<u32>,
        cond: Condvar,
    }

    impl StdSem {
        /// 创建初值为 0 的信号量
        pub fn new() -> Self {
            Self {
                count: Mutex::new(0),
                cond: Condvar::new(),
            }
        }
    }

    impl Default for StdSem {
        fn default() -> Self {
            Self::new()
        }
    }

    impl KalSem for StdSem {
        fn post(&self) {
            if let Ok(mut count) = self.count.lock() {
                *count += 1;
                self.cond.notify_one();
            }
        }

        fn pend(&self, timeout_ms: Option<u32>) -> Result<()> {
            let mut count = self
                .count
                .lock()
                .map_err(|_| Error::new(ErrorKind::InvalidState, "semaphore poisoned"))?;
            match timeout_ms {
                None => {
                    while *count == 0 {
                        count = self
                            .cond
                            .wait(count)
                            .map_err(|_| Error::new(ErrorKind::InvalidState, "semaphore poisoned"))?;
                    }
                }
                Some(ms) => {
                    let deadline = Duration::from_millis(u64::from(ms));
                    let (guard, res) = self
                        .cond
                        .wait_timeout_while(count, deadline, |c| *c == 0)
                        .map_err(|_| Error::new(ErrorKind::InvalidState, "semaphore poisoned"))?;
                    count = guard;
                    if res.timed_out() && *count == 0 {
                        return Err(Error::new(ErrorKind::Timeout, "semaphore pend timed out"));
                    }
                }
            }
            *count -= 1;
            Ok(())
        }
    }

    /// `std` 环境的内核服务
    pub struct StdKal;

    impl Kal for StdKal {
        fn sem_create(&self, _name: &'static str) -> Arc<dyn KalSem> {
            Arc::new(StdSem::new())
        }

        fn dly_ms(&self, ms: u32) {
            std::thread::sleep(Duration::from_millis(u64::from(ms)));
        }
    }
}
