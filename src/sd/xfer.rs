//! 数据传输管线
//!
//! 每条总线一个先进先出传输队列，同一时刻只向驱动提交队首
//! 一笔传输。提交发生在两处：入队时队列原本为空，或异步任务
//! 处理完一笔完成事件后接续下一笔。
//!
//! 完成事件可能产生于中断上下文，因此入队前必须预留事件槽，
//! 驱动上报完成时投递不会失败。
//!
//! 同步提交在调用方栈上等待一次性信号量；等待超时不撤销
//! 传输，记录留在队列里由完成事件收尾，只是结果无人认领。

use super::{SdBusHandle, SdContext};
use crate::error::{Error, ErrorKind, Result};
use crate::kal::KalSem;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// 异步传输完成回调
///
/// 参数为功能号、数据缓冲区（归还所有权）与传输结果。
pub type SdAsyncXferCb = Box<dyn FnOnce(u8, Vec<u8>, Result<()>) + Send>;

pub(crate) enum SdXferCmpl {
    Sync {
        sem: Arc<dyn KalSem>,
        slot: Arc<spin::Mutex<Option<(Vec<u8>, Result<()>)>>>,
    },
    Async {
        cb: SdAsyncXferCb,
    },
}

pub(crate) struct SdXferData {
    pub(crate) fnct_nbr: u8,
    pub(crate) dir_rd: bool,
    pub(crate) buf: Vec<u8>,
    pub(crate) blk_qty: u32,
    pub(crate) blk_len: u32,
    pub(crate) cmpl: SdXferCmpl,
    /// 卡已移除，完成事件到来时直接以 I/O 错误收尾
    pub(crate) abandoned: bool,
}

impl SdContext {
    /// 同步执行一次数据传输
    ///
    /// 阻塞等待完成或超时。超时返回
    /// [`ErrorKind::Timeout`]，传输记录仍在队列中等待完成事件
    /// 收尾，缓冲区所有权随之丢失。
    pub fn sync_xfer_exec(
        &self,
        bus: &Arc<SdBusHandle>,
        fnct_nbr: u8,
        dir_rd: bool,
        buf: Vec<u8>,
        blk_qty: u32,
        blk_len: u32,
    ) -> Result<Vec<u8>> {
        let sem = self.kal.sem_create("sd sync xfer");
        let slot = Arc::new(spin::Mutex::new(None));

        self.xfer_add(
            bus,
            SdXferData {
                fnct_nbr,
                dir_rd,
                buf,
                blk_qty,
                blk_len,
                cmpl: SdXferCmpl::Sync {
                    sem: Arc::clone(&sem),
                    slot: Arc::clone(&slot),
                },
                abandoned: false,
            },
        )?;

        sem.pend(Some(self.cfg.sync_xfer_timeout_ms))?;
        let (buf, res) = slot
            .lock()
            .take()
            .ok_or(Error::new(ErrorKind::InvalidState, "sync transfer signaled without result"))?;
        res.map(|()| buf)
    }

    /// 发起一次异步数据传输
    ///
    /// 完成（或失败）时在异步任务上回调 `cb`，缓冲区所有权随
    /// 回调归还。
    pub fn async_xfer_add(
        &self,
        bus: &Arc<SdBusHandle>,
        fnct_nbr: u8,
        dir_rd: bool,
        buf: Vec<u8>,
        blk_qty: u32,
        blk_len: u32,
        cb: SdAsyncXferCb,
    ) -> Result<()> {
        self.xfer_add(
            bus,
            SdXferData {
                fnct_nbr,
                dir_rd,
                buf,
                blk_qty,
                blk_len,
                cmpl: SdXferCmpl::Async { cb },
                abandoned: false,
            },
        )
    }

    /// 传输入队，队列原本为空时立即提交给驱动
    fn xfer_add(&self, bus: &Arc<SdBusHandle>, mut xfer: SdXferData) -> Result<()> {
        // 完成事件槽与传输记录预算都要先到手
        self.event_prealloc()?;
        if let Err(e) = self.xfer_budget_take() {
            self.event_prealloc_undo();
            return Err(e);
        }

        let mut inner = bus.inner.lock();
        if !inner.card_en {
            drop(inner);
            self.xfer_budget_free();
            self.event_prealloc_undo();
            return Err(Error::new(ErrorKind::InvalidState, "card not enabled for transfers"));
        }

        let was_empty = inner.xfer_q.is_empty();
        if was_empty {
            // 队首直接提交；驱动拒绝则整个操作失败
            if let Err(e) = bus.drv.data_xfer_submit(
                xfer.fnct_nbr,
                xfer.dir_rd,
                &mut xfer.buf,
                xfer.blk_qty,
                xfer.blk_len,
            ) {
                drop(inner);
                self.xfer_budget_free();
                self.event_prealloc_undo();
                return Err(e);
            }
        }
        inner.xfer_q.push_back(xfer);
        log::trace!(
            "queued transfer on bus {} ({} pending)",
            bus.name,
            inner.xfer_q.len()
        );
        Ok(())
    }

    /// 异步任务的完成事件处理
    ///
    /// 取出队首记录，成功时让驱动收尾，随即在持有总线锁的状态
    /// 下提交下一笔，最后通知等待方并归还记录预算。
    pub(crate) fn xfer_cmpl_process(&self, bus: &Arc<SdBusHandle>, err: Option<Error>) {
        let mut inner = bus.inner.lock();
        let Some(mut xfer) = inner.xfer_q.pop_front() else {
            drop(inner);
            log::warn!("transfer completion on bus {} with empty queue", bus.name);
            return;
        };

        if xfer.abandoned {
            // 卡移除后的迟到完成，不碰驱动也不接续队列
            drop(inner);
            xfer_complete(xfer, Err(Error::new(ErrorKind::Io, "card removed during transfer")));
            self.xfer_budget_free();
            return;
        }

        let mut res = match err {
            Some(e) => Err(e),
            None => Ok(()),
        };
        if res.is_ok() {
            res = bus.drv.data_xfer_cmpl(
                xfer.fnct_nbr,
                xfer.dir_rd,
                &mut xfer.buf,
                xfer.blk_qty,
                xfer.blk_len,
            );
        }

        // 接续下一笔；提交失败的记录就地以错误完成，继续尝试再下一笔
        let mut failed_submits: Vec<(SdXferData, Error)> = Vec::new();
        while let Some(next) = inner.xfer_q.front_mut() {
            match bus.drv.data_xfer_submit(
                next.fnct_nbr,
                next.dir_rd,
                &mut next.buf,
                next.blk_qty,
                next.blk_len,
            ) {
                Ok(()) => break,
                Err(e) => {
                    log::warn!("transfer submission on bus {} failed: {}", bus.name, e);
                    if let Some(failed) = inner.xfer_q.pop_front() {
                        failed_submits.push((failed, e));
                    }
                }
            }
        }
        drop(inner);

        xfer_complete(xfer, res);
        self.xfer_budget_free();

        for (failed, e) in failed_submits {
            // 这笔传输不会再有完成事件，预留的事件槽一并归还
            self.event_prealloc_undo();
            xfer_complete(failed, Err(e));
            self.xfer_budget_free();
        }
    }
}

/// 通知等待方传输结束，归还缓冲区所有权
fn xfer_complete(xfer: SdXferData, res: Result<()>) {
    match xfer.cmpl {
        SdXferCmpl::Sync { sem, slot } => {
            *slot.lock() = Some((xfer.buf, res));
            sem.post();
        }
        SdXferCmpl::Async { cb } => cb(xfer.fnct_nbr, xfer.buf, res),
    }
}

/// 卡移除时废弃一笔尚未提交的传输
pub(crate) fn xfer_abandon(ctx: &SdContext, xfer: SdXferData) {
    ctx.event_prealloc_undo();
    xfer_complete(xfer, Err(Error::new(ErrorKind::Io, "card removed")));
    ctx.xfer_budget_free();
}
