//! SDIO 卡操作
//!
//! 覆盖卡初始化流程需要的 SDIO 部分：CMD5 功能发现、CCCR
//! 公共寄存器访问（卡侧位宽与中断总开关）以及功能驱动的
//! 初始化/移除/中断分发。寄存器位语义在此，线上编码在驱动。

use super::bus_drv::{SdCapBitmap, SdCmdR4Resp, SD_CMD_IO_SEND_OP_COND};
use super::{SdBusHandle, SdContext};
use crate::error::{Error, ErrorKind, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;

/// CCCR 中断使能寄存器
pub const CCCR_INT_EN: u32 = 0x04;
/// CCCR 总线接口控制寄存器
pub const CCCR_BUS_IF_CTRL: u32 = 0x07;
/// CCCR 卡能力寄存器
pub const CCCR_CARD_CAP: u32 = 0x08;

/// 中断使能寄存器：主中断开关位
const CCCR_INT_EN_MASTER: u8 = 1 << 0;
/// 总线接口控制：位宽字段掩码
const CCCR_BUS_IF_WIDTH_MASK: u8 = 0x03;
/// 总线接口控制：4 位位宽编码
const CCCR_BUS_IF_WIDTH_4_BIT: u8 = 0x02;
/// 卡能力：仅低速卡
const CCCR_CARD_CAP_LSC: u8 = 1 << 6;
/// 卡能力：低速卡支持 4 位
const CCCR_CARD_CAP_4BLS: u8 = 1 << 7;

/// SDIO 功能驱动
///
/// 每个 SDIO 功能号对应一个驱动实例，卡初始化、移除和卡中断
/// 时按注册顺序回调。
pub trait SdIoFnctDrv: Send + Sync {
    /// 卡上的对应功能完成枚举，驱动可开始配置功能
    fn init(&self, bus: &Arc<SdBusHandle>, fnct_nbr: u8) -> Result<()>;

    /// 卡被移除，释放功能相关资源
    fn rem(&self, bus: &Arc<SdBusHandle>, fnct_nbr: u8);

    /// 卡中断分发
    fn int(&self, bus: &Arc<SdBusHandle>, fnct_nbr: u8);
}

/// CMD5 功能发现
///
/// 轮询 IO_SEND_OP_COND 直到卡的 IO 部分就绪，返回最后一次
/// 响应。首轮参数为 0（探询电压窗口），之后回送卡报告的 OCR。
pub(crate) fn io_card_init(ctx: &SdContext, bus: &Arc<SdBusHandle>) -> Result<SdCmdR4Resp> {
    let card_type = bus.inner.lock().card_type;
    let mut arg = 0u32;

    for _ in 0..ctx.cfg.io_ocr_retry_cnt {
        let resp = bus.drv.cmd_r4_exec(card_type, SD_CMD_IO_SEND_OP_COND, arg)?;
        if resp.io_fnct_nbr == 0 {
            // 非 SDIO 卡，无需继续轮询
            return Ok(resp);
        }
        if resp.card_rdy {
            return Ok(resp);
        }
        arg = resp.io_ocr;
        ctx.kal.dly_ms(1);
    }

    Err(Error::new(ErrorKind::Timeout, "card IO portion never became ready"))
}

/// 读取卡侧支持的总线位宽能力
pub(crate) fn io_card_bus_width_cap_get(bus: &Arc<SdBusHandle>) -> Result<SdCapBitmap> {
    let cap_reg = bus.drv.io_rw_direct(0, CCCR_CARD_CAP, false, 0)?;

    let mut caps = SdCapBitmap::empty();
    // 全速卡必须支持 4 位；低速卡看 4BLS 位
    if cap_reg & CCCR_CARD_CAP_LSC == 0 || cap_reg & CCCR_CARD_CAP_4BLS != 0 {
        caps |= SdCapBitmap::BUS_WIDTH_4_BIT;
    }
    Ok(caps)
}

/// 设置卡侧总线位宽
pub(crate) fn io_card_bus_width_set(bus: &Arc<SdBusHandle>, width: u8) -> Result<()> {
    if width != 1 && width != 4 {
        return Err(Error::new(ErrorKind::NotSupported, "unsupported IO card bus width"));
    }

    let mut ctrl = bus.drv.io_rw_direct(0, CCCR_BUS_IF_CTRL, false, 0)?;
    ctrl &= !CCCR_BUS_IF_WIDTH_MASK;
    if width == 4 {
        ctrl |= CCCR_BUS_IF_WIDTH_4_BIT;
    }
    bus.drv.io_rw_direct(0, CCCR_BUS_IF_CTRL, true, ctrl)?;
    Ok(())
}

/// 开关卡侧主中断
pub(crate) fn io_card_int_master_en_dis(bus: &Arc<SdBusHandle>, en: bool) -> Result<()> {
    let mut int_en = bus.drv.io_rw_direct(0, CCCR_INT_EN, false, 0)?;
    if en {
        int_en |= CCCR_INT_EN_MASTER;
    } else {
        int_en &= !CCCR_INT_EN_MASTER;
    }
    bus.drv.io_rw_direct(0, CCCR_INT_EN, true, int_en)?;
    Ok(())
}

/// 按注册顺序初始化各功能驱动
///
/// 任一功能初始化失败视为整卡初始化失败；已成功初始化的功能
/// 记录在总线状态里，清理路径据此逐个回调 `rem`。
pub(crate) fn io_fncts_init(bus: &Arc<SdBusHandle>) -> Result<()> {
    let io_fnct_nbr = bus.inner.lock().io_fnct_nbr;
    let drvs = fnct_drvs_snapshot(bus);

    for (fnct_nbr, drv) in drvs {
        if fnct_nbr > io_fnct_nbr {
            log::warn!(
                "function driver {} registered but card only exposes {} functions",
                fnct_nbr,
                io_fnct_nbr
            );
            continue;
        }
        drv.init(bus, fnct_nbr)?;
        bus.inner.lock().io_fncts_inited.push(fnct_nbr);
    }
    Ok(())
}

/// 通知已初始化的功能驱动卡已移除
///
/// 覆盖部分初始化的情况：只有 `init` 成功过的功能收到 `rem`。
pub(crate) fn io_fncts_rem(bus: &Arc<SdBusHandle>) {
    let inited = core::mem::take(&mut bus.inner.lock().io_fncts_inited);
    if inited.is_empty() {
        return;
    }
    for (fnct_nbr, drv) in fnct_drvs_snapshot(bus) {
        if inited.contains(&fnct_nbr) {
            drv.rem(bus, fnct_nbr);
        }
    }
}

/// 核心任务的卡中断分发
///
/// 逐个回调功能驱动的中断处理，完成后重新开启主机侧卡中断。
pub(crate) fn card_int_process(bus: &Arc<SdBusHandle>) {
    for (fnct_nbr, drv) in fnct_drvs_snapshot(bus) {
        drv.int(bus, fnct_nbr);
    }
    bus.drv.card_int_en_dis(true);
}

fn fnct_drvs_snapshot(bus: &Arc<SdBusHandle>) -> Vec<(u8, Arc<dyn SdIoFnctDrv>)> {
    bus.inner.lock().io_fnct_drvs.clone()
}

#[cfg(test)]
mod tests {
    use super::super::mock_drv::{new_ctx, MockBusDrv};
    use super::super::{SdCardDetectMode, SdCfg, SdTransportMode};
    use super::*;

    #[test]
    fn test_bus_width_cap_full_speed_card() {
        let (ctx, _kal, _fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        let bus = ctx
            .bus_add("sd0", drv.clone(), SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();

        drv.cccr.lock().unwrap().insert(CCCR_CARD_CAP, 0);
        let caps = io_card_bus_width_cap_get(&bus).unwrap();
        assert!(caps.contains(SdCapBitmap::BUS_WIDTH_4_BIT));
    }

    #[test]
    fn test_bus_width_cap_low_speed_card() {
        let (ctx, _kal, _fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        let bus = ctx
            .bus_add("sd0", drv.clone(), SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();

        drv.cccr.lock().unwrap().insert(CCCR_CARD_CAP, CCCR_CARD_CAP_LSC);
        let caps = io_card_bus_width_cap_get(&bus).unwrap();
        assert!(caps.is_empty());

        drv.cccr
            .lock()
            .unwrap()
            .insert(CCCR_CARD_CAP, CCCR_CARD_CAP_LSC | CCCR_CARD_CAP_4BLS);
        let caps = io_card_bus_width_cap_get(&bus).unwrap();
        assert!(caps.contains(SdCapBitmap::BUS_WIDTH_4_BIT));
    }

    #[test]
    fn test_card_bus_width_set_preserves_other_bits() {
        let (ctx, _kal, _fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        let bus = ctx
            .bus_add("sd0", drv.clone(), SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();

        drv.cccr.lock().unwrap().insert(CCCR_BUS_IF_CTRL, 0x80);
        io_card_bus_width_set(&bus, 4).unwrap();
        assert_eq!(
            drv.cccr.lock().unwrap().get(&CCCR_BUS_IF_CTRL),
            Some(&(0x80 | CCCR_BUS_IF_WIDTH_4_BIT))
        );

        io_card_bus_width_set(&bus, 1).unwrap();
        assert_eq!(drv.cccr.lock().unwrap().get(&CCCR_BUS_IF_CTRL), Some(&0x80));
    }

    #[test]
    fn test_int_master_toggle() {
        let (ctx, _kal, _fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        let bus = ctx
            .bus_add("sd0", drv.clone(), SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();

        io_card_int_master_en_dis(&bus, true).unwrap();
        assert_eq!(
            drv.cccr.lock().unwrap().get(&CCCR_INT_EN).copied().unwrap_or(0) & CCCR_INT_EN_MASTER,
            CCCR_INT_EN_MASTER
        );
        io_card_int_master_en_dis(&bus, false).unwrap();
        assert_eq!(
            drv.cccr.lock().unwrap().get(&CCCR_INT_EN).copied().unwrap_or(0) & CCCR_INT_EN_MASTER,
            0
        );
    }
}
