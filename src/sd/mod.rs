//! SD 总线核心
//!
//! 管理 SD/SDIO 总线的事件编排与数据传输管线。
//!
//! # 主要组件
//!
//! - [`SdContext`] - 核心上下文：总线表、事件队列、事件/传输记录池
//! - [`SdBusHandle`] - 总线句柄：驱动、卡状态、传输队列
//! - [`SdBusDrv`] - 主机控制器驱动接口
//! - [`SdIoFnctDrv`] - SDIO 功能驱动接口
//!
//! # 任务模型
//!
//! 两个宿主任务驱动整个核心：
//!
//! - **核心任务**（[`SdContext::core_task_run`]）处理卡插入、
//!   卡拔出和 SDIO 卡中断事件，卡初始化全流程在此任务上执行
//! - **异步任务**（[`SdContext::async_task_run`]）处理数据传输
//!   完成事件，驱动传输队列前进并通知等待方
//!
//! 事件从中断上下文投递：队列由自旋锁保护，唤醒经由计数信号量。
//! 可能在中断里产生的完成事件必须在发起操作前预留事件槽
//! （见 [`SdContext::data_xfer_cmpl_event`] 与传输提交路径），
//! 保证投递永不失败。

mod bus_drv;
mod card;
mod io;
mod xfer;

#[cfg(test)]
pub(crate) mod mock_drv;

pub use bus_drv::{
    SdBusCapabilities, SdBusDrv, SdBusVolt, SdCapBitmap, SdCardDetectMode, SdCardType,
    SdCmdR4Resp, SdCmdR7Resp, SdHostCapabilities, SdTransportMode, SD_CMD8_ARG,
    SD_CMD8_CHK_PATTERN, SD_CMD_GO_IDLE_STATE, SD_CMD_IO_SEND_OP_COND,
    SD_CMD_SELECT_CARD, SD_CMD_SEND_IF_COND, SD_CMD_SEND_RELATIVE_ADDR, SD_FREQ_DFLT_HZ,
};
pub use io::{SdIoFnctDrv, CCCR_BUS_IF_CTRL, CCCR_CARD_CAP, CCCR_INT_EN};
pub use xfer::SdAsyncXferCb;

use crate::error::{Error, ErrorKind, Result};
use crate::kal::{Kal, KalSem};
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use xfer::SdXferData;

/// SD 核心配置
#[derive(Debug, Clone)]
pub struct SdCfg {
    /// 异步事件槽数量
    pub event_qty: u32,
    /// 传输记录数量
    pub xfer_qty: u32,
    /// CMD0 复位重试上限
    pub cmd0_retry_cnt: u32,
    /// CMD0 重试间隔（毫秒）
    pub cmd0_retry_dly_ms: u32,
    /// CMD5 就绪轮询上限
    pub io_ocr_retry_cnt: u32,
    /// 同步传输等待超时（毫秒）
    pub sync_xfer_timeout_ms: u32,
    /// 卡检测轮询周期（毫秒）
    pub card_polling_period_ms: u32,
}

impl Default for SdCfg {
    fn default() -> Self {
        Self {
            event_qty: 8,
            xfer_qty: 4,
            cmd0_retry_cnt: 128,
            cmd0_retry_dly_ms: 1,
            io_ocr_retry_cnt: 100,
            sync_xfer_timeout_ms: 5000,
            card_polling_period_ms: 100,
        }
    }
}

/// 核心事件种类
#[derive(Debug)]
pub(crate) enum SdEventKind {
    /// 检测到卡插入
    CardDetect,
    /// 卡被拔出
    CardRemove,
    /// SDIO 卡中断
    CardIoInt,
    /// 数据传输完成（驱动上报的结果随事件携带）
    DataXferCmpl { err: Option<Error> },
}

pub(crate) struct SdEvent {
    pub(crate) bus: Arc<SdBusHandle>,
    pub(crate) kind: SdEventKind,
}

/// 卡事件通知回调
pub trait SdEventFncts: Send + Sync {
    /// 卡初始化完成，可以开始使用
    fn card_conn(&self, bus: &Arc<SdBusHandle>);

    /// 卡初始化失败
    fn card_conn_fail(&self, bus: &Arc<SdBusHandle>, err: Error);

    /// 卡已拔出
    fn card_disconn(&self, bus: &Arc<SdBusHandle>);
}

pub(crate) struct SdBusInner {
    pub(crate) started: bool,
    pub(crate) card_type: SdCardType,
    pub(crate) card_present: bool,
    pub(crate) card_en: bool,
    pub(crate) rca: u16,
    pub(crate) io_fnct_nbr: u8,
    pub(crate) capabilities: SdBusCapabilities,
    pub(crate) xfer_q: VecDeque<SdXferData>,
    pub(crate) io_fnct_drvs: Vec<(u8, Arc<dyn SdIoFnctDrv>)>,
    /// 本轮卡初始化中已成功 `init` 的功能号，移除时据此回调 `rem`
    pub(crate) io_fncts_inited: Vec<u8>,
}

/// SD 总线句柄
pub struct SdBusHandle {
    pub(crate) name: String,
    pub(crate) drv: Arc<dyn SdBusDrv>,
    pub(crate) transport_mode: SdTransportMode,
    pub(crate) card_detect_mode: SdCardDetectMode,
    /// 每条总线同一时刻至多一个未决核心事件
    pub(crate) core_event_posted: AtomicBool,
    pub(crate) inner: spin::Mutex<SdBusInner>,
}

impl core::fmt::Debug for SdBusHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdBusHandle").field("name", &self.name).finish()
    }
}

impl SdBusHandle {
    /// 总线名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前识别出的卡类型
    pub fn card_type(&self) -> SdCardType {
        self.inner.lock().card_type
    }

    /// 卡是否在位
    pub fn card_present(&self) -> bool {
        self.inner.lock().card_present
    }

    /// 数据缓冲区对齐要求
    pub fn align_req(&self) -> usize {
        self.drv.align_req_get()
    }

    /// 注册 SDIO 功能驱动
    ///
    /// 功能号取值 1 到 7。卡初始化时按注册顺序回调各驱动。
    pub fn io_fnct_drv_reg(&self, fnct_nbr: u8, drv: Arc<dyn SdIoFnctDrv>) -> Result<()> {
        if fnct_nbr == 0 || fnct_nbr > 7 {
            return Err(Error::new(ErrorKind::InvalidHandle, "SDIO function number out of range"));
        }
        let mut inner = self.inner.lock();
        if inner.io_fnct_drvs.iter().any(|(n, _)| *n == fnct_nbr) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "SDIO function driver already registered",
            ));
        }
        inner.io_fnct_drvs.push((fnct_nbr, drv));
        Ok(())
    }
}

pub(crate) struct SdPools {
    pub(crate) event_free: u32,
    pub(crate) event_prealloc: u32,
    pub(crate) xfer_avail: u32,
}

/// SD 核心上下文
pub struct SdContext {
    pub(crate) cfg: SdCfg,
    pub(crate) kal: Arc<dyn Kal>,
    pub(crate) event_fncts: Option<Arc<dyn SdEventFncts>>,
    pub(crate) core_event_sem: Arc<dyn KalSem>,
    pub(crate) async_event_sem: Arc<dyn KalSem>,
    pub(crate) core_event_q: spin::Mutex<VecDeque<SdEvent>>,
    pub(crate) async_event_q: spin::Mutex<VecDeque<SdEvent>>,
    pub(crate) pools: spin::Mutex<SdPools>,
    pub(crate) buses: spin::Mutex<Vec<Arc<SdBusHandle>>>,
}

impl SdContext {
    /// 创建 SD 核心上下文
    pub fn new(
        cfg: SdCfg,
        kal: Arc<dyn Kal>,
        event_fncts: Option<Arc<dyn SdEventFncts>>,
    ) -> Result<Arc<Self>> {
        if cfg.event_qty == 0 || cfg.xfer_qty == 0 {
            return Err(Error::new(ErrorKind::InvalidConfig, "SD pool quantity is zero"));
        }
        if cfg.cmd0_retry_cnt == 0 {
            return Err(Error::new(ErrorKind::InvalidConfig, "CMD0 retry count is zero"));
        }

        Ok(Arc::new(Self {
            core_event_sem: kal.sem_create("sd core event"),
            async_event_sem: kal.sem_create("sd async event"),
            core_event_q: spin::Mutex::new(VecDeque::new()),
            async_event_q: spin::Mutex::new(VecDeque::new()),
            pools: spin::Mutex::new(SdPools {
                event_free: cfg.event_qty,
                event_prealloc: 0,
                xfer_avail: cfg.xfer_qty,
            }),
            buses: spin::Mutex::new(Vec::new()),
            cfg,
            kal,
            event_fncts,
        }))
    }

    // ------------------------------------------------------------------
    // 总线生命周期
    // ------------------------------------------------------------------

    /// 注册一条 SD 总线
    pub fn bus_add(
        &self,
        name: &str,
        drv: Arc<dyn SdBusDrv>,
        transport_mode: SdTransportMode,
        card_detect_mode: SdCardDetectMode,
    ) -> Result<Arc<SdBusHandle>> {
        let mut buses = self.buses.lock();
        if buses.iter().any(|b| b.name == name) {
            return Err(Error::new(ErrorKind::InvalidState, "SD bus name already registered"));
        }

        drv.init()?;

        let bus = Arc::new(SdBusHandle {
            name: String::from(name),
            drv,
            transport_mode,
            card_detect_mode,
            core_event_posted: AtomicBool::new(false),
            inner: spin::Mutex::new(SdBusInner {
                started: false,
                card_type: SdCardType::None,
                card_present: false,
                card_en: false,
                rca: 0,
                io_fnct_nbr: 0,
                capabilities: SdBusCapabilities::none(),
                xfer_q: VecDeque::new(),
                io_fnct_drvs: Vec::new(),
                io_fncts_inited: Vec::new(),
            }),
        });
        buses.push(Arc::clone(&bus));
        log::debug!("added SD bus {}", bus.name);
        Ok(bus)
    }

    /// 按名称查找总线句柄
    pub fn bus_handle_get_from_name(&self, name: &str) -> Option<Arc<SdBusHandle>> {
        self.buses.lock().iter().find(|b| b.name == name).cloned()
    }

    /// 启动总线控制器
    ///
    /// 初始化主机硬件、设定默认总线参数并启动控制器。焊接模式
    /// 随即初始化卡，轮询模式启动检测定时器。
    pub fn bus_start(&self, bus: &Arc<SdBusHandle>) -> Result<()> {
        let host_caps = bus.drv.init_hw()?;
        bus.drv.clk_freq_set(SD_FREQ_DFLT_HZ)?;
        bus.drv.bus_supply_volt_set(SdBusVolt::V3_3)?;
        bus.drv.bus_signal_volt_init()?;

        {
            let mut inner = bus.inner.lock();
            inner.capabilities.host = host_caps;
            if !inner.xfer_q.is_empty() {
                log::warn!("bus {} started with a non-empty transfer queue", bus.name);
                inner.xfer_q.clear();
            }
            inner.started = true;
        }

        bus.drv.start()?;
        log::debug!("started SD bus {}", bus.name);

        match bus.card_detect_mode {
            SdCardDetectMode::Wired => {
                // 卡固定在位，直接初始化
                card::card_init(self, bus)?;
                bus.inner.lock().card_present = true;
                if let Some(fncts) = &self.event_fncts {
                    fncts.card_conn(bus);
                }
            }
            SdCardDetectMode::Polling => self.kal.card_poll_tmr_restart(),
            SdCardDetectMode::Interrupt => {}
        }
        Ok(())
    }

    /// 停止总线控制器
    pub fn bus_stop(&self, bus: &Arc<SdBusHandle>) -> Result<()> {
        bus.drv.stop()?;
        bus.inner.lock().started = false;

        if bus.card_detect_mode == SdCardDetectMode::Wired {
            self.card_remove_process(bus);
        }
        log::debug!("stopped SD bus {}", bus.name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // 事件投递（BSP / 驱动入口）
    // ------------------------------------------------------------------

    /// BSP 上报卡插入
    pub fn bus_card_detect_event(&self, bus: &Arc<SdBusHandle>) {
        if bus.card_detect_mode == SdCardDetectMode::Wired {
            // 焊接模式下总线启动时已初始化
            return;
        }
        self.core_event_post(bus, SdEventKind::CardDetect);
    }

    /// BSP 上报卡拔出
    pub fn bus_card_remove_event(&self, bus: &Arc<SdBusHandle>) {
        if bus.card_detect_mode == SdCardDetectMode::Wired {
            return;
        }
        self.core_event_post(bus, SdEventKind::CardRemove);
    }

    /// 驱动上报 SDIO 卡中断
    ///
    /// 驱动应先在主机侧屏蔽卡中断再上报，核心任务分发给功能
    /// 驱动后重新开启。
    pub fn card_int_event(&self, bus: &Arc<SdBusHandle>) {
        self.core_event_post(bus, SdEventKind::CardIoInt);
    }

    /// 驱动上报数据传输完成
    ///
    /// 使用传输提交时预留的事件槽，投递本身不会失败。
    pub fn data_xfer_cmpl_event(&self, bus: &Arc<SdBusHandle>, err: Option<Error>) {
        self.async_event_post(bus, SdEventKind::DataXferCmpl { err });
    }

    /// 卡检测轮询定时器到期回调
    ///
    /// 宿主在定时器到期时调用。为每条已启动的轮询模式总线
    /// 投递一次检测事件；核心任务处理后重新武装定时器。
    pub fn card_polling_tick(&self) {
        let buses: Vec<Arc<SdBusHandle>> = self.buses.lock().clone();
        for bus in buses {
            if bus.card_detect_mode == SdCardDetectMode::Polling && bus.inner.lock().started {
                self.core_event_post(&bus, SdEventKind::CardDetect);
            }
        }
    }

    pub(crate) fn core_event_post(&self, bus: &Arc<SdBusHandle>, kind: SdEventKind) {
        if bus.core_event_posted.swap(true, Ordering::AcqRel) {
            // 上一个核心事件尚未处理，合并
            log::trace!("core event for bus {} already pending, dropping {:?}", bus.name, kind);
            return;
        }
        self.core_event_q.lock().push_back(SdEvent {
            bus: Arc::clone(bus),
            kind,
        });
        self.core_event_sem.post();
    }

    pub(crate) fn async_event_post(&self, bus: &Arc<SdBusHandle>, kind: SdEventKind) {
        {
            let mut pools = self.pools.lock();
            debug_assert!(pools.event_prealloc > 0, "async event posted without prealloc");
            pools.event_prealloc = pools.event_prealloc.saturating_sub(1);
        }
        self.async_event_q.lock().push_back(SdEvent {
            bus: Arc::clone(bus),
            kind,
        });
        self.async_event_sem.post();
    }

    // ------------------------------------------------------------------
    // 事件槽与传输记录预算
    // ------------------------------------------------------------------

    /// 预留一个异步事件槽
    ///
    /// 可能从中断上下文投递完成事件的操作必须先预留槽位，
    /// 否则投递可能因池耗尽而丢失。
    pub(crate) fn event_prealloc(&self) -> Result<()> {
        let mut pools = self.pools.lock();
        if pools.event_free == 0 {
            return Err(Error::new(ErrorKind::AllocFailure, "async event pool exhausted"));
        }
        pools.event_free -= 1;
        pools.event_prealloc += 1;
        Ok(())
    }

    /// 归还一个未使用的预留事件槽
    pub(crate) fn event_prealloc_undo(&self) {
        let mut pools = self.pools.lock();
        pools.event_prealloc = pools.event_prealloc.saturating_sub(1);
        pools.event_free += 1;
    }

    /// 事件处理完毕，槽位回池
    pub(crate) fn event_slot_free(&self) {
        self.pools.lock().event_free += 1;
    }

    pub(crate) fn xfer_budget_take(&self) -> Result<()> {
        let mut pools = self.pools.lock();
        if pools.xfer_avail == 0 {
            return Err(Error::new(ErrorKind::AllocFailure, "transfer record pool exhausted"));
        }
        pools.xfer_avail -= 1;
        Ok(())
    }

    pub(crate) fn xfer_budget_free(&self) {
        self.pools.lock().xfer_avail += 1;
    }

    // ------------------------------------------------------------------
    // 任务处理
    // ------------------------------------------------------------------

    /// 核心任务主循环
    pub fn core_task_run(&self) -> ! {
        loop {
            if let Err(e) = self.core_event_process_one() {
                log::error!("core task event processing failed: {}", e);
            }
        }
    }

    /// 异步任务主循环
    pub fn async_task_run(&self) -> ! {
        loop {
            if let Err(e) = self.async_event_process_one() {
                log::error!("async task event processing failed: {}", e);
            }
        }
    }

    /// 处理一个核心事件（卡插拔、SDIO 中断）
    pub fn core_event_process_one(&self) -> Result<()> {
        self.core_event_sem.pend(None)?;
        let ev = self
            .core_event_q
            .lock()
            .pop_front()
            .ok_or(Error::new(ErrorKind::InvalidState, "core event semaphore out of sync"))?;
        ev.bus.core_event_posted.store(false, Ordering::Release);

        match ev.kind {
            SdEventKind::CardDetect => self.card_detect_process(&ev.bus),
            SdEventKind::CardRemove => self.card_remove_process(&ev.bus),
            SdEventKind::CardIoInt => io::card_int_process(&ev.bus),
            SdEventKind::DataXferCmpl { .. } => {
                unreachable!("data transfer completion routed to core task")
            }
        }
        Ok(())
    }

    /// 处理一个异步事件（数据传输完成）
    pub fn async_event_process_one(&self) -> Result<()> {
        self.async_event_sem.pend(None)?;
        let ev = self
            .async_event_q
            .lock()
            .pop_front()
            .ok_or(Error::new(ErrorKind::InvalidState, "async event semaphore out of sync"))?;
        // 先归还事件槽，分发期间新的完成事件才有槽可用
        self.event_slot_free();

        match ev.kind {
            SdEventKind::DataXferCmpl { err } => self.xfer_cmpl_process(&ev.bus, err),
            _ => unreachable!("card event routed to async task"),
        }
        Ok(())
    }

    fn card_detect_process(&self, bus: &Arc<SdBusHandle>) {
        let polling = bus.card_detect_mode == SdCardDetectMode::Polling;

        if bus.inner.lock().card_present {
            // 卡已在位，轮询周期内无变化
            if polling {
                self.kal.card_poll_tmr_restart();
            }
            return;
        }

        match card::card_init(self, bus) {
            Ok(()) => {
                bus.inner.lock().card_present = true;
                log::info!("card connected on bus {}", bus.name);
                if let Some(fncts) = &self.event_fncts {
                    fncts.card_conn(bus);
                }
            }
            Err(e) => {
                if polling {
                    // 轮询模式下卡可能不在位，静默等待下个周期
                    log::trace!("polling detect on bus {} found no usable card: {}", bus.name, e);
                } else {
                    log::warn!("card initialization failed on bus {}: {}", bus.name, e);
                    if let Some(fncts) = &self.event_fncts {
                        fncts.card_conn_fail(bus, e);
                    }
                }
            }
        }

        if polling {
            self.kal.card_poll_tmr_restart();
        }
    }

    fn card_remove_process(&self, bus: &Arc<SdBusHandle>) {
        let was_present = bus.inner.lock().card_present;
        card::card_rem(self, bus);
        if was_present {
            log::info!("card removed from bus {}", bus.name);
            if let Some(fncts) = &self.event_fncts {
                fncts.card_disconn(bus);
            }
        }
        if bus.card_detect_mode == SdCardDetectMode::Polling && bus.inner.lock().started {
            self.kal.card_poll_tmr_restart();
        }
    }
}
