//! 缓存引擎
//!
//! 把伙伴分配器、块描述符表、使用链表和写作业调度器组合成
//! 带写顺序约束的块缓存。所有内部状态由单把缓存锁保护，
//! [`CacheBlk`] 守卫在存续期间持有该锁，释放即归还。

use crate::blkdev::BlkDevHandle;
use crate::cache::buddy::BuddyAlloc;
use crate::cache::job_sched::{JobHandle, JobSched, JOB_HANDLE_VOID};
use crate::error::{Error, ErrorKind, Result};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

bitflags! {
    /// 缓存块状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlkFlags: u8 {
        /// 槽位在用
        const USED = 1 << 0;
        /// 内容比设备新，需要写回
        const DIRTY = 1 << 1;
    }
}

/// 块获取模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBlkMode {
    /// 只读：未命中时从设备读入
    Rd,
    /// 整块覆写：未命中时不读设备，缓冲区清零
    Wr,
    /// 读改写：未命中时从设备读入，并标记为脏
    RdWr,
}

/// 缓存配置
#[derive(Debug, Clone)]
pub struct CacheCfg {
    /// 缓冲区对齐要求（2 的幂）
    pub align: usize,
    /// 支持的最小逻辑块大小对数
    pub min_lb_size_log2: u8,
    /// 支持的最大逻辑块大小对数
    pub max_lb_size_log2: u8,
    /// 最大逻辑块大小下的缓存块数量
    pub min_blk_cnt: u32,
}

impl Default for CacheCfg {
    fn default() -> Self {
        Self {
            align: core::mem::size_of::<usize>(),
            min_lb_size_log2: 9,
            max_lb_size_log2: 12,
            min_blk_cnt: 4,
        }
    }
}

/// 缓存统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// 命中次数
    pub hits: u64,
    /// 未命中次数
    pub misses: u64,
    /// 淘汰次数
    pub evictions: u64,
    /// 写回设备次数
    pub write_backs: u64,
}

struct BlkDesc {
    flags: BlkFlags,
    dev: Option<BlkDevHandle>,
    lb_nbr: u64,
    lb_size_log2: u8,
    wr_job: JobHandle,
}

impl BlkDesc {
    const fn empty() -> Self {
        Self {
            flags: BlkFlags::empty(),
            dev: None,
            lb_nbr: 0,
            lb_size_log2: 0,
            wr_job: JOB_HANDLE_VOID,
        }
    }
}

struct CacheInner {
    buddy: BuddyAlloc,
    tbl: Vec<BlkDesc>,
    /// 在用块序号，队首最久未用，队尾最近使用
    used: VecDeque<u32>,
    sched: JobSched,
    assigned_devs: Vec<u32>,
    stats: CacheStats,
}

/// 块缓存
///
/// 通过 [`FsCache::assign`] 绑定块设备后，经
/// [`CacheBlkDevData`] 获取与释放缓存块。
pub struct FsCache {
    cfg: CacheCfg,
    inner: spin::Mutex<CacheInner>,
}

/// 设备与缓存的绑定
///
/// 块的获取、同步和失效都以绑定为入口。`is_unassigning`
/// 置位后新的获取请求被拒绝，用于解绑期间的竞态防护。
pub struct CacheBlkDevData {
    cache: Arc<FsCache>,
    dev: BlkDevHandle,
    is_unassigning: AtomicBool,
}

/// 缓存块守卫
///
/// 存续期间持有缓存锁并可读写块内容，释放（drop）即归还
/// 缓存锁。同一线程在持有守卫时再次获取会死锁。
pub struct CacheBlk<'a> {
    inner: spin::MutexGuard<'a, CacheInner>,
    blk_ix: u32,
    wr_job: JobHandle,
}

impl FsCache {
    /// 创建缓存
    pub fn new(cfg: CacheCfg) -> Result<Arc<Self>> {
        if cfg.min_blk_cnt == 0 {
            return Err(Error::new(ErrorKind::InvalidConfig, "cache block count is zero"));
        }
        if cfg.min_lb_size_log2 > cfg.max_lb_size_log2 {
            return Err(Error::new(
                ErrorKind::InvalidConfig,
                "cache min block size above max block size",
            ));
        }
        if !cfg.align.is_power_of_two() {
            return Err(Error::new(ErrorKind::InvalidConfig, "cache alignment not a power of two"));
        }

        let order_max = cfg.max_lb_size_log2 - cfg.min_lb_size_log2;
        let zeroth_cnt = cfg
            .min_blk_cnt
            .checked_shl(u32::from(order_max))
            .ok_or(Error::new(ErrorKind::InvalidConfig, "cache size overflow"))?;
        let buddy = BuddyAlloc::new(cfg.min_lb_size_log2, zeroth_cnt, order_max)?;

        let mut tbl = Vec::with_capacity(zeroth_cnt as usize);
        for _ in 0..zeroth_cnt {
            tbl.push(BlkDesc::empty());
        }

        Ok(Arc::new(Self {
            cfg,
            inner: spin::Mutex::new(CacheInner {
                buddy,
                tbl,
                used: VecDeque::new(),
                sched: JobSched::new(zeroth_cnt + zeroth_cnt / 2 + 1),
                assigned_devs: Vec::new(),
                stats: CacheStats::default(),
            }),
        }))
    }

    /// 为单个设备创建并绑定一个默认缓存
    pub fn dflt_assign(dev: BlkDevHandle, blk_cnt: u32) -> Result<Arc<CacheBlkDevData>> {
        let lb_size_log2 = dev.lb_size_log2();
        let cache = Self::new(CacheCfg {
            align: core::mem::size_of::<usize>(),
            min_lb_size_log2: lb_size_log2,
            max_lb_size_log2: lb_size_log2,
            min_blk_cnt: blk_cnt,
        })?;
        cache.assign(dev)
    }

    /// 绑定块设备
    ///
    /// 设备逻辑块大小必须落在缓存支持范围内，否则返回
    /// [`ErrorKind::SizeInvalid`]；重复绑定返回
    /// [`ErrorKind::InvalidState`]。
    pub fn assign(self: &Arc<Self>, dev: BlkDevHandle) -> Result<Arc<CacheBlkDevData>> {
        let lb_size_log2 = dev.lb_size_log2();
        if lb_size_log2 < self.cfg.min_lb_size_log2 || lb_size_log2 > self.cfg.max_lb_size_log2 {
            return Err(Error::new(
                ErrorKind::SizeInvalid,
                "device block size outside cache supported range",
            ));
        }

        let mut inner = self.inner.lock();
        if inner.assigned_devs.contains(&dev.id()) {
            return Err(Error::new(ErrorKind::InvalidState, "device already assigned to cache"));
        }
        inner.assigned_devs.push(dev.id());
        drop(inner);

        log::debug!("assigned block device {} to cache", dev.id());
        Ok(Arc::new(CacheBlkDevData {
            cache: Arc::clone(self),
            dev,
            is_unassigning: AtomicBool::new(false),
        }))
    }

    /// 支持的最小逻辑块大小（字节）
    pub fn min_blk_size(&self) -> u32 {
        1 << self.cfg.min_lb_size_log2
    }

    /// 支持的最大逻辑块大小（字节）
    pub fn max_blk_size(&self) -> u32 {
        1 << self.cfg.max_lb_size_log2
    }

    /// 写回所有绑定设备的脏块（不失效）
    ///
    /// 直接排干调度器里的全部写作业。
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().jobs_drain()
    }

    /// 统计快照
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

impl CacheBlkDevData {
    /// 绑定的设备句柄
    pub fn dev(&self) -> &BlkDevHandle {
        &self.dev
    }

    /// 所属缓存
    pub fn cache(&self) -> &Arc<FsCache> {
        &self.cache
    }

    /// 获取一个缓存块
    pub fn blk_acquire(&self, lb_nbr: u64, mode: CacheBlkMode) -> Result<CacheBlk<'_>> {
        self.blk_acquire_ordered(lb_nbr, mode, JOB_HANDLE_VOID)
    }

    /// 获取一个缓存块，写作业排在 `prev_job` 之后
    ///
    /// 写模式下为块建立（或并入既有的）写作业并添加顺序边；
    /// 建边导致破环执行掉本块作业时重新建立。返回的守卫持有
    /// 缓存锁直到释放。
    pub fn blk_acquire_ordered(
        &self,
        lb_nbr: u64,
        mode: CacheBlkMode,
        prev_job: JobHandle,
    ) -> Result<CacheBlk<'_>> {
        if self.is_unassigning.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::InvalidState, "block device is unassigning"));
        }

        let mut inner = self.cache.inner.lock();
        let blk_ix = inner.blk_get(&self.dev, lb_nbr, mode)?;
        let wr_job = match mode {
            CacheBlkMode::Rd => JOB_HANDLE_VOID,
            CacheBlkMode::Wr | CacheBlkMode::RdWr => inner.wr_job_set(blk_ix, prev_job)?,
        };

        Ok(CacheBlk {
            inner,
            blk_ix,
            wr_job,
        })
    }

    /// 写回本设备所有脏块（不失效）
    pub fn sync(&self) -> Result<()> {
        self.cache.inner.lock().flush_internal(self.dev.id(), false)
    }

    /// 写回并失效本设备所有缓存块
    pub fn invalidate(&self) -> Result<()> {
        self.cache.inner.lock().flush_internal(self.dev.id(), true)
    }

    /// 丢弃单个逻辑块的缓存内容（不写回）
    ///
    /// 块有写作业时将其降级为占位作业再尝试桥接移除，
    /// 保持其余作业间的顺序约束。
    pub fn lb_invalidate(&self, lb_nbr: u64) -> Result<()> {
        let mut inner = self.cache.inner.lock();
        let Some(pos) = inner.used_pos(self.dev.id(), lb_nbr) else {
            return Ok(());
        };
        let Some(ix) = inner.used.remove(pos) else {
            return Ok(());
        };

        let job = inner.tbl[ix as usize].wr_job;
        if inner.sched.is_valid(job) {
            inner.sched.job_to_stub(job);
            inner.sched.stub_try_rem(job);
        }
        let offset = (ix as usize) << inner.buddy.blk_size_log2();
        inner.buddy.blk_free(offset);
        inner.tbl[ix as usize] = BlkDesc::empty();
        log::trace!("invalidated lb {} of dev {}", lb_nbr, self.dev.id());
        Ok(())
    }

    /// 设备关闭时的缓存解绑
    ///
    /// 先拒绝新的获取请求，再写回并失效本设备全部缓存块，
    /// 最后解除绑定。
    pub fn on_blk_dev_close(&self) -> Result<()> {
        self.is_unassigning.store(true, Ordering::Release);
        let mut inner = self.cache.inner.lock();
        let res = inner.flush_internal(self.dev.id(), true);
        inner.assigned_devs.retain(|&id| id != self.dev.id());
        if let Err(ref e) = res {
            log::warn!("cache teardown for dev {} reported {}", self.dev.id(), e);
        }
        res
    }
}

impl core::fmt::Debug for CacheBlkDevData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheBlkDevData").field("dev", &self.dev).finish()
    }
}

impl core::fmt::Debug for CacheBlk<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheBlk")
            .field("lb_nbr", &self.lb_nbr())
            .field("blk_ix", &self.blk_ix)
            .finish()
    }
}

impl CacheBlk<'_> {
    /// 块的逻辑块号
    pub fn lb_nbr(&self) -> u64 {
        self.inner.tbl[self.blk_ix as usize].lb_nbr
    }

    /// 本次获取关联的写作业句柄（只读获取时为空句柄）
    pub fn wr_job(&self) -> JobHandle {
        self.wr_job
    }
}

impl Deref for CacheBlk<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.inner.blk_buf(self.blk_ix)
    }
}

impl DerefMut for CacheBlk<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.inner.blk_buf_mut(self.blk_ix)
    }
}

/// 作业执行回调：写回脏块，按需失效
///
/// `restart` 在本次执行失效了缓存块时置位，刷新扫描据此重启。
fn wr_cb(
    buddy: &mut BuddyAlloc,
    tbl: &mut [BlkDesc],
    used: &mut VecDeque<u32>,
    stats: &mut CacheStats,
    restart: &mut bool,
    blk_ix: Option<u32>,
    invalidate: bool,
) -> Result<()> {
    let Some(ix) = blk_ix else {
        // 占位作业无事可做
        return Ok(());
    };
    let ixu = ix as usize;

    if tbl[ixu].flags.contains(BlkFlags::DIRTY) {
        let dev = tbl[ixu]
            .dev
            .clone()
            .ok_or(Error::new(ErrorKind::InvalidState, "dirty block without device"))?;
        let lb_nbr = tbl[ixu].lb_nbr;
        let len = 1usize << tbl[ixu].lb_size_log2;
        let offset = ixu << buddy.blk_size_log2();
        log::trace!("writing back lb {} of dev {}", lb_nbr, dev.id());
        dev.wr(lb_nbr, buddy.blk_buf(offset, len))?;
        tbl[ixu].flags.remove(BlkFlags::DIRTY);
        stats.write_backs += 1;
    }
    tbl[ixu].wr_job = JOB_HANDLE_VOID;

    if invalidate {
        if let Some(pos) = used.iter().position(|&u| u == ix) {
            used.remove(pos);
        }
        buddy.blk_free(ixu << buddy.blk_size_log2());
        tbl[ixu] = BlkDesc::empty();
        *restart = true;
    }
    Ok(())
}

impl CacheInner {
    fn blk_buf(&self, ix: u32) -> &[u8] {
        let offset = (ix as usize) << self.buddy.blk_size_log2();
        let len = 1usize << self.tbl[ix as usize].lb_size_log2;
        self.buddy.blk_buf(offset, len)
    }

    fn blk_buf_mut(&mut self, ix: u32) -> &mut [u8] {
        let offset = (ix as usize) << self.buddy.blk_size_log2();
        let len = 1usize << self.tbl[ix as usize].lb_size_log2;
        self.buddy.blk_buf_mut(offset, len)
    }

    fn used_pos(&self, dev_id: u32, lb_nbr: u64) -> Option<usize> {
        self.used.iter().position(|&ix| {
            let desc = &self.tbl[ix as usize];
            desc.lb_nbr == lb_nbr && desc.dev.as_ref().map_or(false, |h| h.id() == dev_id)
        })
    }

    /// 查找或装入一个缓存块，返回描述符序号并移到最近使用端
    fn blk_get(&mut self, dev: &BlkDevHandle, lb_nbr: u64, mode: CacheBlkMode) -> Result<u32> {
        if let Some(pos) = self.used_pos(dev.id(), lb_nbr) {
            if let Some(ix) = self.used.remove(pos) {
                self.used.push_back(ix);
                self.stats.hits += 1;
                log::trace!("cache hit for lb {} of dev {}", lb_nbr, dev.id());
                return Ok(ix);
            }
        }

        self.stats.misses += 1;
        log::trace!("cache miss for lb {} of dev {}", lb_nbr, dev.id());

        let size_log2 = dev.lb_size_log2();
        let offset = loop {
            if let Some(offset) = self.buddy.blk_alloc(size_log2) {
                break offset;
            }
            self.blk_evict()?;
        };
        let ix = self.buddy.offset_to_ix(offset);

        let len = 1usize << size_log2;
        match mode {
            CacheBlkMode::Rd | CacheBlkMode::RdWr => {
                if let Err(e) = dev.rd(lb_nbr, self.buddy.blk_buf_mut(offset, len)) {
                    self.buddy.blk_free(offset);
                    return Err(e);
                }
            }
            CacheBlkMode::Wr => {
                // 整块覆写，不读设备，避免暴露陈旧内容
                self.buddy.blk_buf_mut(offset, len).fill(0);
            }
        }

        self.tbl[ix as usize] = BlkDesc {
            flags: BlkFlags::USED,
            dev: Some(dev.clone()),
            lb_nbr,
            lb_size_log2: size_log2,
            wr_job: JOB_HANDLE_VOID,
        };
        self.used.push_back(ix);
        Ok(ix)
    }

    /// 淘汰最久未用的块
    ///
    /// 脏块经由其写作业落盘并失效；顺序约束可能把额外的块
    /// 一并排干和失效。
    fn blk_evict(&mut self) -> Result<()> {
        let &ix = self
            .used
            .front()
            .ok_or(Error::new(ErrorKind::AllocFailure, "cache has no block to evict"))?;
        self.stats.evictions += 1;
        log::debug!("evicting cache block for lb {}", self.tbl[ix as usize].lb_nbr);

        let job = self.tbl[ix as usize].wr_job;
        if self.sched.is_valid(job) {
            let mut restart = false;
            return self.job_exec(job, true, &mut restart);
        }

        // 干净块直接释放
        self.used.pop_front();
        let offset = (ix as usize) << self.buddy.blk_size_log2();
        self.buddy.blk_free(offset);
        self.tbl[ix as usize] = BlkDesc::empty();
        Ok(())
    }

    /// 为块建立写作业（或并入既有作业）并排在 `prev` 之后
    fn wr_job_set(&mut self, ix: u32, prev: JobHandle) -> Result<JobHandle> {
        loop {
            let cur = self.tbl[ix as usize].wr_job;
            if self.tbl[ix as usize].flags.contains(BlkFlags::DIRTY) && self.sched.is_valid(cur) {
                self.job_order(prev, cur)?;
                if self.sched.is_valid(cur) {
                    return Ok(cur);
                }
                // 建边破环时本块作业被执行，重新建立
                continue;
            }

            let job = self.job_add(prev, ix)?;
            self.tbl[ix as usize].flags.insert(BlkFlags::DIRTY);
            self.tbl[ix as usize].wr_job = job;
            return Ok(job);
        }
    }

    fn job_add(&mut self, prev: JobHandle, blk_ix: u32) -> Result<JobHandle> {
        let Self {
            buddy,
            tbl,
            used,
            sched,
            stats,
            ..
        } = self;
        let mut restart = false;
        sched.add(prev, Some(blk_ix), &mut |blk| {
            wr_cb(buddy, tbl, used, stats, &mut restart, blk, false)
        })
    }

    fn job_order(&mut self, before: JobHandle, after: JobHandle) -> Result<()> {
        let Self {
            buddy,
            tbl,
            used,
            sched,
            stats,
            ..
        } = self;
        let mut restart = false;
        sched.order(before, after, &mut |blk| {
            wr_cb(buddy, tbl, used, stats, &mut restart, blk, false)
        })
    }

    fn job_exec(&mut self, job: JobHandle, invalidate: bool, restart: &mut bool) -> Result<()> {
        let Self {
            buddy,
            tbl,
            used,
            sched,
            stats,
            ..
        } = self;
        sched.exec(job, &mut |blk| {
            wr_cb(buddy, tbl, used, stats, restart, blk, invalidate)
        })
    }

    /// 排干全部写作业（所有设备的脏块落盘，不失效）
    fn jobs_drain(&mut self) -> Result<()> {
        let Self {
            buddy,
            tbl,
            used,
            sched,
            stats,
            ..
        } = self;
        let mut restart = false;
        sched.exec_all(&mut |blk| wr_cb(buddy, tbl, used, stats, &mut restart, blk, false))
    }

    /// 写回（按需失效）匹配设备的全部缓存块
    ///
    /// 第一个 I/O 错误被记住，遍历继续；其他类别的错误立即
    /// 中止。作业执行失效了块时从头重扫（小容量缓存可接受的
    /// O(n^2)）。
    fn flush_internal(&mut self, dev_id: u32, invalidate: bool) -> Result<()> {
        let mut first_err: Option<Error> = None;

        'restart: loop {
            let mut i = 0;
            while i < self.used.len() {
                let ix = self.used[i];
                let desc = &self.tbl[ix as usize];
                if !desc.dev.as_ref().map_or(false, |h| h.id() == dev_id) {
                    i += 1;
                    continue;
                }

                if desc.flags.contains(BlkFlags::DIRTY) {
                    let job = desc.wr_job;
                    let mut restart = false;
                    match self.job_exec(job, invalidate, &mut restart) {
                        Ok(()) if restart => continue 'restart,
                        Ok(()) => i += 1,
                        Err(e) => {
                            if e.kind() != ErrorKind::Io {
                                return Err(e);
                            }
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                            if restart {
                                continue 'restart;
                            }
                            i += 1;
                        }
                    }
                } else if invalidate {
                    self.used.remove(i);
                    let offset = (ix as usize) << self.buddy.blk_size_log2();
                    self.buddy.blk_free(offset);
                    self.tbl[ix as usize] = BlkDesc::empty();
                    // 原位删除，序号不前进
                } else {
                    i += 1;
                }
            }
            break;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
