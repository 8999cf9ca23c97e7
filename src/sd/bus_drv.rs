//! SD 总线驱动接口
//!
//! 核心层只负责命令时序与事件编排，主机控制器的寄存器操作和
//! 命令线编码全部落在实现此接口的驱动里。响应以解码后的
//! 结构体交还核心层。

use crate::error::Result;
use bitflags::bitflags;

/// 复位命令（GO_IDLE_STATE）
pub const SD_CMD_GO_IDLE_STATE: u8 = 0;
/// 发布相对地址命令（SEND_RELATIVE_ADDR）
pub const SD_CMD_SEND_RELATIVE_ADDR: u8 = 3;
/// IO 卡探测命令（IO_SEND_OP_COND）
pub const SD_CMD_IO_SEND_OP_COND: u8 = 5;
/// 选卡命令（SELECT_CARD）
pub const SD_CMD_SELECT_CARD: u8 = 7;
/// 工作条件查询命令（SEND_IF_COND）
pub const SD_CMD_SEND_IF_COND: u8 = 8;

/// CMD8 参数：2.7-3.6V 电压窗口 + 回显校验字节
pub const SD_CMD8_ARG: u32 = 0x1AA;
/// CMD8 回显校验字节
pub const SD_CMD8_CHK_PATTERN: u8 = 0xAA;

/// 总线默认时钟频率（识别阶段，Hz）
pub const SD_FREQ_DFLT_HZ: u32 = 400_000;

bitflags! {
    /// 主机/卡能力位图
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdCapBitmap: u32 {
        /// 支持 4 位数据总线
        const BUS_WIDTH_4_BIT = 1 << 0;
        /// 支持 8 位数据总线
        const BUS_WIDTH_8_BIT = 1 << 1;
        /// 支持 1.8V 信号电平
        const VOLT_1_8 = 1 << 2;
    }
}

/// 主机控制器能力
#[derive(Debug, Clone, Copy)]
pub struct SdHostCapabilities {
    /// 能力位图
    pub capabilities: SdCapBitmap,
    /// 支持的供电电压窗口（OCR 格式）
    pub ocr: u32,
}

impl SdHostCapabilities {
    /// 空能力集
    pub const fn none() -> Self {
        Self {
            capabilities: SdCapBitmap::empty(),
            ocr: 0,
        }
    }
}

/// 总线（主机 + 卡）能力
#[derive(Debug, Clone, Copy)]
pub struct SdBusCapabilities {
    /// 主机侧能力
    pub host: SdHostCapabilities,
    /// 卡侧能力位图
    pub card: SdCapBitmap,
}

impl SdBusCapabilities {
    /// 空能力集
    pub const fn none() -> Self {
        Self {
            host: SdHostCapabilities::none(),
            card: SdCapBitmap::empty(),
        }
    }
}

/// SD 卡类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdCardType {
    /// 未识别
    None,
    /// SD 规范 1.x 存储卡
    SdV1x,
    /// SD 规范 2.0 存储卡
    SdV2_0,
    /// SD 规范 2.0 高容量存储卡
    SdV2_0HiCapacity,
    /// 纯 SDIO 卡
    Io,
    /// 存储 + SDIO 组合卡
    Combo,
}

/// 传输模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdTransportMode {
    /// 原生 SD 总线
    Sd,
    /// SPI 模式
    Spi,
}

/// 卡检测模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdCardDetectMode {
    /// 卡固定焊接，总线启动时直接初始化
    Wired,
    /// 检测引脚中断，由 BSP 上报插拔事件
    Interrupt,
    /// 核心任务定时轮询
    Polling,
}

/// 总线供电电压
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdBusVolt {
    /// 3.3V
    V3_3,
    /// 1.8V
    V1_8,
}

/// CMD8（SEND_IF_COND）响应
#[derive(Debug, Clone, Copy)]
pub struct SdCmdR7Resp {
    /// 卡接受了提供的电压窗口
    pub volt_accepted: bool,
    /// 回显的校验字节
    pub echo_pattern: u8,
}

/// CMD5（IO_SEND_OP_COND）响应
#[derive(Debug, Clone, Copy)]
pub struct SdCmdR4Resp {
    /// IO 部分初始化完成
    pub card_rdy: bool,
    /// IO 功能数量（0 表示非 SDIO 卡）
    pub io_fnct_nbr: u8,
    /// 卡同时含有存储部分
    pub mem_present: bool,
    /// IO 部分工作电压窗口
    pub io_ocr: u32,
}

/// SD 总线驱动
///
/// 由各主机控制器驱动实现。数据传输接口是异步的：
/// [`data_xfer_submit`](Self::data_xfer_submit) 启动传输后立即返回，
/// 完成由驱动通过
/// [`SdContext::data_xfer_cmpl_event`](crate::sd::SdContext::data_xfer_cmpl_event)
/// 上报，随后核心层回调
/// [`data_xfer_cmpl`](Self::data_xfer_cmpl) 让驱动收尾。
pub trait SdBusDrv: Send + Sync {
    /// 驱动初始化（总线注册时调用一次）
    fn init(&self) -> Result<()>;

    /// 初始化主机控制器硬件并返回其能力
    fn init_hw(&self) -> Result<SdHostCapabilities>;

    /// 启动控制器
    fn start(&self) -> Result<()>;

    /// 停止控制器
    fn stop(&self) -> Result<()>;

    /// 设置总线时钟频率
    fn clk_freq_set(&self, freq_hz: u32) -> Result<()>;

    /// 设置总线供电电压
    fn bus_supply_volt_set(&self, volt: SdBusVolt) -> Result<()>;

    /// 信号电平恢复默认（3.3V）
    fn bus_signal_volt_init(&self) -> Result<()>;

    /// 执行 1.8V 信号电平切换时序，返回是否切换成功
    fn bus_signal_volt_switch(&self) -> Result<bool>;

    /// 设置主机侧数据总线宽度（1、4 或 8）
    fn bus_width_set(&self, width: u8) -> Result<()>;

    /// 执行无响应命令（如 CMD0）
    fn cmd_no_resp_exec(&self, card_type: SdCardType, cmd: u8, arg: u32) -> Result<()>;

    /// 执行带 R7 响应的命令（CMD8）
    fn cmd_r7_exec(&self, card_type: SdCardType, cmd: u8, arg: u32) -> Result<SdCmdR7Resp>;

    /// 执行带 R4 响应的命令（CMD5）
    fn cmd_r4_exec(&self, card_type: SdCardType, cmd: u8, arg: u32) -> Result<SdCmdR4Resp>;

    /// 执行 CMD3，返回卡发布的相对地址
    fn cmd3_exec(&self, card_type: SdCardType) -> Result<u16>;

    /// 执行 CMD7 选卡/去选
    fn cmd7_exec(&self, card_type: SdCardType, rca: u16, select: bool) -> Result<()>;

    /// 单字节寄存器读写（CMD52）
    ///
    /// `wr` 为真时写入 `data` 并返回写后读出的值，否则返回读出的值。
    fn io_rw_direct(&self, fnct_nbr: u8, reg_addr: u32, wr: bool, data: u8) -> Result<u8>;

    /// 提交一次数据传输（CMD53），立即返回
    fn data_xfer_submit(
        &self,
        fnct_nbr: u8,
        dir_rd: bool,
        buf: &mut [u8],
        blk_qty: u32,
        blk_len: u32,
    ) -> Result<()>;

    /// 传输完成收尾（由异步任务在完成事件后调用）
    fn data_xfer_cmpl(
        &self,
        fnct_nbr: u8,
        dir_rd: bool,
        buf: &mut [u8],
        blk_qty: u32,
        blk_len: u32,
    ) -> Result<()>;

    /// 使能/关闭主机侧卡中断
    fn card_int_en_dis(&self, en: bool);

    /// 数据缓冲区对齐要求（字节）
    fn align_req_get(&self) -> usize {
        core::mem::size_of::<usize>()
    }
}
