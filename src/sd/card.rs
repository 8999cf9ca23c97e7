//! 卡初始化与移除
//!
//! 在核心任务上执行完整的卡上电识别序列：复位、版本探测、
//! SDIO 功能发现、信号电平切换、寻址选卡和总线位宽协商。
//! 任一步骤失败都会走统一的清理路径：去选卡、清除卡状态，
//! 由调用方决定是否上报连接失败。

use super::bus_drv::{
    SdBusVolt, SdCapBitmap, SdCardType, SdTransportMode, SD_CMD8_ARG, SD_CMD8_CHK_PATTERN,
    SD_CMD_GO_IDLE_STATE, SD_CMD_SEND_IF_COND, SD_FREQ_DFLT_HZ,
};
use super::{io, SdBusHandle, SdContext};
use crate::error::{Error, ErrorKind, Result};
use alloc::sync::Arc;

/// 卡初始化全流程
///
/// 失败时已完成清理（卡状态清除、排队传输废弃），错误返回给
/// 调用方用于连接失败通知。
pub(crate) fn card_init(ctx: &SdContext, bus: &Arc<SdBusHandle>) -> Result<()> {
    match card_init_steps(ctx, bus) {
        Ok(()) => Ok(()),
        Err(e) => {
            let (card_en, card_type, rca) = {
                let inner = bus.inner.lock();
                (inner.card_en, inner.card_type, inner.rca)
            };
            if card_en {
                if let Err(desel_err) = bus.drv.cmd7_exec(card_type, rca, false) {
                    log::warn!("card deselect during teardown failed: {}", desel_err);
                }
            }
            card_rem(ctx, bus);
            Err(e)
        }
    }
}

fn card_init_steps(ctx: &SdContext, bus: &Arc<SdBusHandle>) -> Result<()> {
    // 回到识别阶段的总线参数
    {
        let mut inner = bus.inner.lock();
        inner.card_type = SdCardType::None;
        inner.card_en = false;
        inner.rca = 0;
        inner.io_fnct_nbr = 0;
        inner.capabilities.card = SdCapBitmap::empty();
        inner.io_fncts_inited.clear();
    }
    bus.drv.bus_supply_volt_set(SdBusVolt::V3_3)?;
    bus.drv.bus_signal_volt_init()?;
    bus.drv.clk_freq_set(SD_FREQ_DFLT_HZ)?;
    bus.drv.bus_width_set(1)?;

    // CMD0 复位，卡可能需要多次尝试才应答
    let mut reset_ok = false;
    for retry in 0..ctx.cfg.cmd0_retry_cnt {
        match bus.drv.cmd_no_resp_exec(SdCardType::None, SD_CMD_GO_IDLE_STATE, 0) {
            Ok(()) => {
                if retry > 0 {
                    log::debug!("card on bus {} reset after {} retries", bus.name, retry);
                }
                reset_ok = true;
                break;
            }
            Err(_) => ctx.kal.dly_ms(ctx.cfg.cmd0_retry_dly_ms),
        }
    }
    if !reset_ok {
        return Err(Error::new(ErrorKind::Timeout, "no card response to reset command"));
    }

    // 卡复位后的稳定时间
    ctx.kal.dly_ms(2);

    // CMD8 区分 1.x 与 2.0 规范卡：1.x 卡不认识该命令，超时即判定
    let card_type = match bus.drv.cmd_r7_exec(SdCardType::None, SD_CMD_SEND_IF_COND, SD_CMD8_ARG) {
        Ok(resp) if resp.volt_accepted && resp.echo_pattern == SD_CMD8_CHK_PATTERN => {
            SdCardType::SdV2_0
        }
        Ok(_) => {
            return Err(Error::new(ErrorKind::Io, "interface condition echo mismatch"));
        }
        Err(e) if e.kind() == ErrorKind::Timeout => SdCardType::SdV1x,
        Err(e) => return Err(e),
    };
    bus.inner.lock().card_type = card_type;

    // SDIO 功能发现
    let r4 = io::io_card_init(ctx, bus)?;
    if r4.io_fnct_nbr == 0 {
        return Err(Error::new(ErrorKind::NotSupported, "card has no IO function"));
    }
    {
        let mut inner = bus.inner.lock();
        inner.io_fnct_nbr = r4.io_fnct_nbr;
        inner.card_type = if r4.mem_present {
            SdCardType::Combo
        } else {
            SdCardType::Io
        };
    }

    // 主机与卡都支持时切到 1.8V 信号电平
    let host_caps = bus.inner.lock().capabilities.host.capabilities;
    if host_caps.contains(SdCapBitmap::VOLT_1_8) {
        match bus.drv.bus_signal_volt_switch() {
            Ok(true) => log::debug!("bus {} switched to 1.8V signaling", bus.name),
            Ok(false) => {}
            Err(e) => return Err(e),
        }
    }

    if bus.transport_mode == SdTransportMode::Sd {
        let card_type = bus.inner.lock().card_type;
        let rca = bus.drv.cmd3_exec(card_type)?;
        bus.drv.cmd7_exec(card_type, rca, true)?;
        {
            let mut inner = bus.inner.lock();
            inner.rca = rca;
            inner.card_en = true;
        }
        bus_width_update(bus)?;
    }

    // 功能驱动逐个初始化
    io::io_fncts_init(bus)?;
    Ok(())
}

/// 协商并切换数据总线位宽
///
/// 取主机与卡能力的交集，按 8 > 4 > 1 选取。切换期间关闭
/// 两侧的卡中断，避免位宽不一致时误采样中断线。
fn bus_width_update(bus: &Arc<SdBusHandle>) -> Result<()> {
    let card_caps = io::io_card_bus_width_cap_get(bus)?;
    let host_caps = {
        let mut inner = bus.inner.lock();
        inner.capabilities.card = card_caps;
        inner.capabilities.host.capabilities
    };

    let joint = card_caps & host_caps;
    let width = if joint.contains(SdCapBitmap::BUS_WIDTH_8_BIT) {
        8
    } else if joint.contains(SdCapBitmap::BUS_WIDTH_4_BIT) {
        4
    } else {
        1
    };
    if width == 1 {
        return Ok(());
    }

    bus.drv.card_int_en_dis(false);
    io::io_card_int_master_en_dis(bus, false)?;
    io::io_card_bus_width_set(bus, width)?;
    bus.drv.bus_width_set(width)?;
    io::io_card_int_master_en_dis(bus, true)?;
    bus.drv.card_int_en_dis(true);

    log::debug!("bus {} data width set to {}", bus.name, width);
    Ok(())
}

/// 清除卡状态并废弃排队中的传输
///
/// 队首传输已提交给控制器，其完成中断仍可能到来，因此留在
/// 队列里由完成事件收尾（对等待方报 I/O 错误）；只有未提交的
/// 后续传输立即废弃。
pub(crate) fn card_rem(ctx: &SdContext, bus: &Arc<SdBusHandle>) {
    io::io_fncts_rem(bus);

    let abandoned = {
        let mut inner = bus.inner.lock();
        inner.card_type = SdCardType::None;
        inner.card_present = false;
        inner.card_en = false;
        inner.rca = 0;
        inner.io_fnct_nbr = 0;
        inner.capabilities.card = SdCapBitmap::empty();
        if let Some(head) = inner.xfer_q.front_mut() {
            head.abandoned = true;
        }
        if inner.xfer_q.len() > 1 {
            inner.xfer_q.drain(1..).collect::<alloc::vec::Vec<_>>()
        } else {
            alloc::vec::Vec::new()
        }
    };

    for xfer in abandoned {
        super::xfer::xfer_abandon(ctx, xfer);
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock_drv::{new_ctx, MockBusDrv, RecFnctDrv};
    use super::super::{SdCardDetectMode, SdCfg, SdTransportMode};
    use super::*;
    use alloc::vec;

    fn detect(ctx: &SdContext, bus: &Arc<SdBusHandle>) {
        ctx.bus_card_detect_event(bus);
        ctx.core_event_process_one().unwrap();
    }

    #[test]
    fn test_card_init_combo_card() {
        let (ctx, _kal, fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        let bus = ctx
            .bus_add("sd0", drv.clone(), SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();
        ctx.bus_start(&bus).unwrap();

        detect(&ctx, &bus);

        assert_eq!(bus.card_type(), SdCardType::Combo);
        assert!(bus.card_present());
        assert!(bus.inner.lock().card_en);
        assert_eq!(fncts.conn_cnt(), 1);
        assert_eq!(fncts.conn_fail_cnt(), 0);
    }

    #[test]
    fn test_card_init_io_only_card() {
        let (ctx, _kal, _fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        drv.mem_present.store(false, core::sync::atomic::Ordering::Relaxed);
        let bus = ctx
            .bus_add("sd0", drv, SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();
        ctx.bus_start(&bus).unwrap();

        detect(&ctx, &bus);
        assert_eq!(bus.card_type(), SdCardType::Io);
    }

    #[test]
    fn test_cmd0_retries_until_success() {
        let (ctx, _kal, fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        *drv.cmd0_fail_cnt.lock().unwrap() = 100;
        let bus = ctx
            .bus_add("sd0", drv.clone(), SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();
        ctx.bus_start(&bus).unwrap();

        detect(&ctx, &bus);

        assert_eq!(*drv.cmd0_attempts.lock().unwrap(), 101);
        assert!(bus.card_present());
        assert_eq!(fncts.conn_cnt(), 1);
    }

    #[test]
    fn test_cmd0_retry_exhaustion_reports_failure() {
        let (ctx, _kal, fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        *drv.cmd0_fail_cnt.lock().unwrap() = 128;
        let bus = ctx
            .bus_add("sd0", drv.clone(), SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();
        ctx.bus_start(&bus).unwrap();

        detect(&ctx, &bus);

        assert_eq!(*drv.cmd0_attempts.lock().unwrap(), 128);
        assert!(!bus.card_present());
        assert_eq!(fncts.conn_cnt(), 0);
        assert_eq!(fncts.conn_fail_cnt(), 1);
        assert_eq!(fncts.last_fail_kind(), Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_polling_detect_failure_is_silent_and_rearms() {
        let (ctx, kal, fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        *drv.cmd0_fail_cnt.lock().unwrap() = u32::MAX;
        let bus = ctx
            .bus_add("sd0", drv, SdTransportMode::Sd, SdCardDetectMode::Polling)
            .unwrap();
        ctx.bus_start(&bus).unwrap();
        let armed_before = kal.tmr_restart_cnt();

        ctx.card_polling_tick();
        ctx.core_event_process_one().unwrap();

        assert_eq!(fncts.conn_fail_cnt(), 0);
        assert!(kal.tmr_restart_cnt() > armed_before);
    }

    #[test]
    fn test_cmd8_timeout_means_v1x_card() {
        let (ctx, _kal, _fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        drv.cmd8_timeout.store(true, core::sync::atomic::Ordering::Relaxed);
        drv.mem_present.store(false, core::sync::atomic::Ordering::Relaxed);
        let bus = ctx
            .bus_add("sd0", drv.clone(), SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();
        ctx.bus_start(&bus).unwrap();

        detect(&ctx, &bus);

        // CMD8 超时按 1.x 卡继续，随后的 SDIO 发现将其归为纯 IO 卡
        assert!(bus.card_present());
        assert_eq!(bus.card_type(), SdCardType::Io);
    }

    #[test]
    fn test_memory_only_card_rejected() {
        let (ctx, _kal, fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        *drv.io_fnct_nbr.lock().unwrap() = 0;
        let bus = ctx
            .bus_add("sd0", drv, SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();
        ctx.bus_start(&bus).unwrap();

        detect(&ctx, &bus);

        assert!(!bus.card_present());
        assert_eq!(fncts.last_fail_kind(), Some(ErrorKind::NotSupported));
    }

    #[test]
    fn test_bus_width_negotiation_picks_joint_max() {
        let (ctx, _kal, _fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        // 主机支持 4 与 8 位，卡只支持 4 位
        *drv.host_caps.lock().unwrap() =
            SdCapBitmap::BUS_WIDTH_4_BIT | SdCapBitmap::BUS_WIDTH_8_BIT;
        let bus = ctx
            .bus_add("sd0", drv.clone(), SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();
        ctx.bus_start(&bus).unwrap();

        detect(&ctx, &bus);

        // 识别阶段 1 位，协商后 4 位
        assert_eq!(*drv.width_log.lock().unwrap(), vec![1, 4]);
    }

    #[test]
    fn test_fnct_drivers_called_on_init_and_remove() {
        let (ctx, _kal, _fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        let bus = ctx
            .bus_add("sd0", drv, SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();
        let fnct_drv = RecFnctDrv::new();
        bus.io_fnct_drv_reg(1, fnct_drv.clone()).unwrap();
        ctx.bus_start(&bus).unwrap();

        detect(&ctx, &bus);
        assert_eq!(fnct_drv.init_cnt(), 1);

        ctx.bus_card_remove_event(&bus);
        ctx.core_event_process_one().unwrap();
        assert_eq!(fnct_drv.rem_cnt(), 1);
        assert!(!bus.card_present());
    }

    #[test]
    fn test_partial_fnct_init_failure_removes_inited() {
        let (ctx, _kal, fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        *drv.io_fnct_nbr.lock().unwrap() = 2;
        let bus = ctx
            .bus_add("sd0", drv, SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();
        let first = RecFnctDrv::new();
        let second = RecFnctDrv::new();
        second.fail_init.store(true, core::sync::atomic::Ordering::Relaxed);
        bus.io_fnct_drv_reg(1, first.clone()).unwrap();
        bus.io_fnct_drv_reg(2, second.clone()).unwrap();
        ctx.bus_start(&bus).unwrap();

        detect(&ctx, &bus);

        assert!(!bus.card_present());
        assert_eq!(fncts.conn_fail_cnt(), 1);
        // 已初始化的功能在清理时收到 rem，未初始化的不收
        assert_eq!(first.init_cnt(), 1);
        assert_eq!(first.rem_cnt(), 1);
        assert_eq!(second.init_cnt(), 0);
        assert_eq!(second.rem_cnt(), 0);
    }

    #[test]
    fn test_card_int_dispatched_to_fnct_drivers() {
        let (ctx, _kal, _fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        let bus = ctx
            .bus_add("sd0", drv.clone(), SdTransportMode::Sd, SdCardDetectMode::Interrupt)
            .unwrap();
        let fnct_drv = RecFnctDrv::new();
        bus.io_fnct_drv_reg(1, fnct_drv.clone()).unwrap();
        ctx.bus_start(&bus).unwrap();
        detect(&ctx, &bus);

        let int_en_before = drv.card_int_en_cnt();
        ctx.card_int_event(&bus);
        ctx.core_event_process_one().unwrap();

        assert_eq!(fnct_drv.int_cnt(), 1);
        // 分发完成后主机侧卡中断重新开启
        assert!(drv.card_int_en_cnt() > int_en_before);
    }

    #[test]
    fn test_wired_bus_start_inits_card() {
        let (ctx, _kal, fncts) = new_ctx(SdCfg::default());
        let drv = MockBusDrv::new();
        let bus = ctx
            .bus_add("sd0", drv, SdTransportMode::Sd, SdCardDetectMode::Wired)
            .unwrap();
        ctx.bus_start(&bus).unwrap();

        assert!(bus.card_present());
        assert_eq!(fncts.conn_cnt(), 1);

        ctx.bus_stop(&bus).unwrap();
        assert!(!bus.card_present());
        assert_eq!(fncts.disconn_cnt(), 1);
    }
}
