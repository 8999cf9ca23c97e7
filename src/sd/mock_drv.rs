//! 测试用的总线驱动、内核服务与事件回调桩
//!
//! [`MockBusDrv`] 模拟一张默认可正常初始化的组合卡，各测试
//! 通过公开字段注入失败或调整卡的应答。

use super::bus_drv::{
    SdBusDrv, SdBusVolt, SdCapBitmap, SdCardType, SdCmdR4Resp, SdCmdR7Resp, SdHostCapabilities,
    SD_CMD_GO_IDLE_STATE,
};
use super::{SdBusHandle, SdCfg, SdContext, SdEventFncts, SdIoFnctDrv};
use crate::error::{Error, ErrorKind, Result};
use crate::kal::std_kal::StdSem;
use crate::kal::{Kal, KalSem};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub(crate) struct MockBusDrv {
    /// CMD0 连续失败次数（u32::MAX 表示永远失败）
    pub(crate) cmd0_fail_cnt: Mutex<u32>,
    /// 观察到的 CMD0 尝试次数
    pub(crate) cmd0_attempts: Mutex<u32>,
    /// CMD8 以超时应答（模拟 1.x 规范卡）
    pub(crate) cmd8_timeout: AtomicBool,
    /// R4 应答报告的 IO 功能数
    pub(crate) io_fnct_nbr: Mutex<u8>,
    /// R4 应答报告是否含存储部分
    pub(crate) mem_present: AtomicBool,
    /// 主机控制器能力位图
    pub(crate) host_caps: Mutex<SdCapBitmap>,
    /// CCCR 寄存器内容
    pub(crate) cccr: Mutex<BTreeMap<u32, u8>>,
    /// 主机侧位宽设置历史
    pub(crate) width_log: Mutex<Vec<u8>>,
    /// 读传输完成时的填充字节
    pub(crate) fill_byte: AtomicU8,
    submit_cnt: AtomicU32,
    card_int_en_cnt: AtomicU32,
}

impl MockBusDrv {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cmd0_fail_cnt: Mutex::new(0),
            cmd0_attempts: Mutex::new(0),
            cmd8_timeout: AtomicBool::new(false),
            io_fnct_nbr: Mutex::new(1),
            mem_present: AtomicBool::new(true),
            host_caps: Mutex::new(SdCapBitmap::empty()),
            cccr: Mutex::new(BTreeMap::new()),
            width_log: Mutex::new(Vec::new()),
            fill_byte: AtomicU8::new(0),
            submit_cnt: AtomicU32::new(0),
            card_int_en_cnt: AtomicU32::new(0),
        })
    }

    pub(crate) fn submit_cnt(&self) -> u32 {
        self.submit_cnt.load(Ordering::Acquire)
    }

    /// 主机侧卡中断被开启的次数
    pub(crate) fn card_int_en_cnt(&self) -> u32 {
        self.card_int_en_cnt.load(Ordering::Acquire)
    }
}

impl SdBusDrv for MockBusDrv {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn init_hw(&self) -> Result<SdHostCapabilities> {
        Ok(SdHostCapabilities {
            capabilities: *self.host_caps.lock().unwrap(),
            ocr: 0x00FF_8000,
        })
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn clk_freq_set(&self, _freq_hz: u32) -> Result<()> {
        Ok(())
    }

    fn bus_supply_volt_set(&self, _volt: SdBusVolt) -> Result<()> {
        Ok(())
    }

    fn bus_signal_volt_init(&self) -> Result<()> {
        Ok(())
    }

    fn bus_signal_volt_switch(&self) -> Result<bool> {
        Ok(true)
    }

    fn bus_width_set(&self, width: u8) -> Result<()> {
        self.width_log.lock().unwrap().push(width);
        Ok(())
    }

    fn cmd_no_resp_exec(&self, _card_type: SdCardType, cmd: u8, _arg: u32) -> Result<()> {
        if cmd == SD_CMD_GO_IDLE_STATE {
            *self.cmd0_attempts.lock().unwrap() += 1;
            let mut fail_cnt = self.cmd0_fail_cnt.lock().unwrap();
            if *fail_cnt > 0 {
                if *fail_cnt != u32::MAX {
                    *fail_cnt -= 1;
                }
                return Err(Error::new(ErrorKind::Timeout, "no response"));
            }
        }
        Ok(())
    }

    fn cmd_r7_exec(&self, _card_type: SdCardType, _cmd: u8, _arg: u32) -> Result<SdCmdR7Resp> {
        if self.cmd8_timeout.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::Timeout, "no response"));
        }
        Ok(SdCmdR7Resp {
            volt_accepted: true,
            echo_pattern: super::bus_drv::SD_CMD8_CHK_PATTERN,
        })
    }

    fn cmd_r4_exec(&self, _card_type: SdCardType, _cmd: u8, _arg: u32) -> Result<SdCmdR4Resp> {
        Ok(SdCmdR4Resp {
            card_rdy: true,
            io_fnct_nbr: *self.io_fnct_nbr.lock().unwrap(),
            mem_present: self.mem_present.load(Ordering::Relaxed),
            io_ocr: 0x0030_0000,
        })
    }

    fn cmd3_exec(&self, _card_type: SdCardType) -> Result<u16> {
        Ok(1)
    }

    fn cmd7_exec(&self, _card_type: SdCardType, _rca: u16, _select: bool) -> Result<()> {
        Ok(())
    }

    fn io_rw_direct(&self, _fnct_nbr: u8, reg_addr: u32, wr: bool, data: u8) -> Result<u8> {
        let mut cccr = self.cccr.lock().unwrap();
        if wr {
            cccr.insert(reg_addr, data);
            Ok(data)
        } else {
            Ok(cccr.get(&reg_addr).copied().unwrap_or(0))
        }
    }

    fn data_xfer_submit(
        &self,
        _fnct_nbr: u8,
        _dir_rd: bool,
        _buf: &mut [u8],
        _blk_qty: u32,
        _blk_len: u32,
    ) -> Result<()> {
        self.submit_cnt.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn data_xfer_cmpl(
        &self,
        _fnct_nbr: u8,
        dir_rd: bool,
        buf: &mut [u8],
        _blk_qty: u32,
        _blk_len: u32,
    ) -> Result<()> {
        if dir_rd {
            buf.fill(self.fill_byte.load(Ordering::Relaxed));
        }
        Ok(())
    }

    fn card_int_en_dis(&self, en: bool) {
        if en {
            self.card_int_en_cnt.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// 记录各回调次数的 SDIO 功能驱动
pub(crate) struct RecFnctDrv {
    /// 置位后 `init` 返回错误
    pub(crate) fail_init: AtomicBool,
    init_cnt: AtomicU32,
    rem_cnt: AtomicU32,
    int_cnt: AtomicU32,
}

impl RecFnctDrv {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_init: AtomicBool::new(false),
            init_cnt: AtomicU32::new(0),
            rem_cnt: AtomicU32::new(0),
            int_cnt: AtomicU32::new(0),
        })
    }

    pub(crate) fn init_cnt(&self) -> u32 {
        self.init_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn rem_cnt(&self) -> u32 {
        self.rem_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn int_cnt(&self) -> u32 {
        self.int_cnt.load(Ordering::Acquire)
    }
}

impl SdIoFnctDrv for RecFnctDrv {
    fn init(&self, _bus: &Arc<SdBusHandle>, _fnct_nbr: u8) -> Result<()> {
        if self.fail_init.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::Io, "function init failed"));
        }
        self.init_cnt.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn rem(&self, _bus: &Arc<SdBusHandle>, _fnct_nbr: u8) {
        self.rem_cnt.fetch_add(1, Ordering::AcqRel);
    }

    fn int(&self, _bus: &Arc<SdBusHandle>, _fnct_nbr: u8) {
        self.int_cnt.fetch_add(1, Ordering::AcqRel);
    }
}

/// 记录定时器重启次数的内核服务
pub(crate) struct RecKal {
    tmr_restarts: AtomicU32,
}

impl RecKal {
    pub(crate) fn tmr_restart_cnt(&self) -> u32 {
        self.tmr_restarts.load(Ordering::Acquire)
    }
}

impl Kal for RecKal {
    fn sem_create(&self, _name: &'static str) -> Arc<dyn KalSem> {
        Arc::new(StdSem::new())
    }

    fn dly_ms(&self, _ms: u32) {}

    fn card_poll_tmr_restart(&self) {
        self.tmr_restarts.fetch_add(1, Ordering::AcqRel);
    }
}

/// 记录连接通知的事件回调
pub(crate) struct RecEventFncts {
    conn_cnt: AtomicU32,
    conn_fail_cnt: AtomicU32,
    disconn_cnt: AtomicU32,
    last_fail: Mutex<Option<ErrorKind>>,
}

impl RecEventFncts {
    pub(crate) fn conn_cnt(&self) -> u32 {
        self.conn_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn conn_fail_cnt(&self) -> u32 {
        self.conn_fail_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn disconn_cnt(&self) -> u32 {
        self.disconn_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn last_fail_kind(&self) -> Option<ErrorKind> {
        *self.last_fail.lock().unwrap()
    }
}

impl SdEventFncts for RecEventFncts {
    fn card_conn(&self, _bus: &Arc<SdBusHandle>) {
        self.conn_cnt.fetch_add(1, Ordering::AcqRel);
    }

    fn card_conn_fail(&self, _bus: &Arc<SdBusHandle>, err: Error) {
        self.conn_fail_cnt.fetch_add(1, Ordering::AcqRel);
        *self.last_fail.lock().unwrap() = Some(err.kind());
    }

    fn card_disconn(&self, _bus: &Arc<SdBusHandle>) {
        self.disconn_cnt.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) fn new_ctx(cfg: SdCfg) -> (Arc<SdContext>, Arc<RecKal>, Arc<RecEventFncts>) {
    let kal = Arc::new(RecKal {
        tmr_restarts: AtomicU32::new(0),
    });
    let fncts = Arc::new(RecEventFncts {
        conn_cnt: AtomicU32::new(0),
        conn_fail_cnt: AtomicU32::new(0),
        disconn_cnt: AtomicU32::new(0),
        last_fail: Mutex::new(None),
    });
    let ctx = SdContext::new(
        cfg,
        Arc::clone(&kal) as Arc<dyn Kal>,
        Some(Arc::clone(&fncts) as Arc<dyn SdEventFncts>),
    )
    .unwrap();
    (ctx, kal, fncts)
}
