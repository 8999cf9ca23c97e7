//! 写作业调度器
//!
//! 维护缓存块落盘顺序约束的有向无环图。每个脏块至多对应一个
//! 写作业；作业之间的边表示"前者必须先于后者写入设备"。
//!
//! # 主要组件
//!
//! - [`JobHandle`] - 带序列号校验的作业句柄，槽位复用后旧句柄自动失效
//! - [`JobSched`] - 固定容量的作业表与依赖图
//!
//! # 执行模型
//!
//! [`JobSched::exec`] 使用显式工作栈做拓扑遍历：先下降到尚未
//! 执行的前驱，叶子先执行，目标作业最后执行。执行回调失败时
//! 遍历中止，失败作业及其后继全部保留，已执行的前驱不回滚。

use crate::error::{Error, ErrorKind, Result};
use alloc::vec;
use alloc::vec::Vec;

const IX_NONE: u32 = u32::MAX;

/// 作业句柄
///
/// 句柄携带槽位序列号。作业执行或移除后槽位序列号递增，
/// 此后旧句柄在所有操作中被视为空句柄（无副作用）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    ix: u32,
    serial: u32,
}

/// 空作业句柄
pub const JOB_HANDLE_VOID: JobHandle = JobHandle {
    ix: IX_NONE,
    serial: 0,
};

struct Job {
    serial: u32,
    in_use: bool,
    /// 关联的缓存块描述符序号，`None` 表示占位作业
    blk_ix: Option<u32>,
    preds: Vec<u32>,
    succs: Vec<u32>,
}

/// 写作业调度器
pub struct JobSched {
    jobs: Vec<Job>,
    free: Vec<u32>,
    job_qty: u32,
}

impl JobSched {
    /// 创建容量为 `job_qty` 的调度器
    pub fn new(job_qty: u32) -> Self {
        Self {
            jobs: Vec::new(),
            free: Vec::new(),
            job_qty,
        }
    }

    /// 句柄是否指向一个在用作业
    pub fn is_valid(&self, h: JobHandle) -> bool {
        (h.ix as usize) < self.jobs.len() && {
            let job = &self.jobs[h.ix as usize];
            job.in_use && job.serial == h.serial
        }
    }

    /// 新建一个作业并排在 `prev` 之后
    ///
    /// `blk_ix` 为 `None` 时创建占位作业。作业表耗尽时先执行一个
    /// 无前驱的现存作业腾出槽位。
    pub fn add<F>(&mut self, prev: JobHandle, blk_ix: Option<u32>, exec_cb: &mut F) -> Result<JobHandle>
    where
        F: FnMut(Option<u32>) -> Result<()>,
    {
        let ix = self.job_get(exec_cb)?;
        let job = &mut self.jobs[ix as usize];
        job.in_use = true;
        job.blk_ix = blk_ix;
        let handle = JobHandle {
            ix,
            serial: job.serial,
        };
        // 新作业尚无任何边，此处不可能形成环
        self.order(prev, handle, exec_cb)?;
        Ok(handle)
    }

    /// 约束 `before` 先于 `after` 执行
    ///
    /// 任一句柄无效（作业已完成）或两者相同时为空操作。若新边会
    /// 闭合成环（已存在 `after` 到 `before` 的路径），立即执行
    /// `after` 打破环，新约束随之失去意义。
    pub fn order<F>(&mut self, before: JobHandle, after: JobHandle, exec_cb: &mut F) -> Result<()>
    where
        F: FnMut(Option<u32>) -> Result<()>,
    {
        if !self.is_valid(before) || !self.is_valid(after) || before == after {
            return Ok(());
        }
        if self.jobs[before.ix as usize].succs.contains(&after.ix) {
            return Ok(());
        }
        if self.path_exists(after.ix, before.ix) {
            log::debug!(
                "write job ordering {} -> {} would close a cycle, executing {} now",
                before.ix,
                after.ix,
                after.ix
            );
            return self.exec(after, exec_cb);
        }

        self.jobs[before.ix as usize].succs.push(after.ix);
        self.jobs[after.ix as usize].preds.push(before.ix);
        Ok(())
    }

    /// 执行 `h` 及其全部（传递）前驱
    ///
    /// 句柄无效时为空操作。回调按拓扑顺序收到每个作业的
    /// `blk_ix`；回调返回错误时中止，失败作业保留在图中。
    pub fn exec<F>(&mut self, h: JobHandle, exec_cb: &mut F) -> Result<()>
    where
        F: FnMut(Option<u32>) -> Result<()>,
    {
        if !self.is_valid(h) {
            return Ok(());
        }

        let mut stack = vec![h.ix];
        while let Some(&top) = stack.last() {
            if let Some(&pred) = self.jobs[top as usize].preds.first() {
                stack.push(pred);
                continue;
            }
            exec_cb(self.jobs[top as usize].blk_ix)?;
            self.job_remove(top);
            stack.pop();
        }
        Ok(())
    }

    /// 排干所有在用作业
    ///
    /// 第一个 I/O 错误被记住并最终返回，遍历继续，尽量让其余
    /// 作业都得到执行；其他类别的错误立即中止。
    pub fn exec_all<F>(&mut self, exec_cb: &mut F) -> Result<()>
    where
        F: FnMut(Option<u32>) -> Result<()>,
    {
        let mut first_err: Option<Error> = None;
        for h in self.live_handles() {
            match self.exec(h, exec_cb) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Io => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 尝试移除一个占位作业
    ///
    /// 仅当作业是占位作业，且其前驱数与后继数不同时大于 1 时移除
    /// （否则桥接会使边数膨胀）。移除时把每个前驱桥接到每个后继，
    /// 保持既有顺序约束。
    pub fn stub_try_rem(&mut self, h: JobHandle) {
        if !self.is_valid(h) {
            return;
        }
        let job = &self.jobs[h.ix as usize];
        if job.blk_ix.is_some() {
            return;
        }
        if job.preds.len() > 1 && job.succs.len() > 1 {
            return;
        }

        let preds = job.preds.clone();
        let succs = job.succs.clone();
        for &p in &preds {
            for &s in &succs {
                if !self.jobs[p as usize].succs.contains(&s) && !self.path_exists(s, p) {
                    self.jobs[p as usize].succs.push(s);
                    self.jobs[s as usize].preds.push(p);
                }
            }
        }
        self.job_remove(h.ix);
    }

    /// 把作业降级为占位作业（块被丢弃但顺序约束保留）
    pub fn job_to_stub(&mut self, h: JobHandle) {
        if self.is_valid(h) {
            self.jobs[h.ix as usize].blk_ix = None;
        }
    }

    /// 在用作业句柄列表（刷新遍历用）
    pub fn live_handles(&self) -> Vec<JobHandle> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.in_use)
            .map(|(ix, j)| JobHandle {
                ix: ix as u32,
                serial: j.serial,
            })
            .collect()
    }

    /// 是否存在 `from` 到 `to` 的有向路径
    fn path_exists(&self, from: u32, to: u32) -> bool {
        if from == to {
            return true;
        }
        let mut visited = vec![false; self.jobs.len()];
        let mut stack = vec![from];
        while let Some(cur) = stack.pop() {
            if cur == to {
                return true;
            }
            for &s in &self.jobs[cur as usize].succs {
                if !visited[s as usize] {
                    visited[s as usize] = true;
                    stack.push(s);
                }
            }
        }
        false
    }

    fn job_get<F>(&mut self, exec_cb: &mut F) -> Result<u32>
    where
        F: FnMut(Option<u32>) -> Result<()>,
    {
        if let Some(ix) = self.free.pop() {
            return Ok(ix);
        }
        if (self.jobs.len() as u32) < self.job_qty {
            self.jobs.push(Job {
                serial: 0,
                in_use: false,
                blk_ix: None,
                preds: Vec::new(),
                succs: Vec::new(),
            });
            return Ok((self.jobs.len() - 1) as u32);
        }

        // 作业表耗尽：执行一个无前驱的作业回收其槽位
        let src = self
            .jobs
            .iter()
            .enumerate()
            .find(|(_, j)| j.in_use && j.preds.is_empty())
            .map(|(ix, j)| JobHandle {
                ix: ix as u32,
                serial: j.serial,
            });
        match src {
            Some(h) => {
                log::debug!("write job table full, executing job {} to recycle it", h.ix);
                self.exec(h, exec_cb)?;
                self.free
                    .pop()
                    .ok_or(Error::new(ErrorKind::AllocFailure, "write job table exhausted"))
            }
            None => Err(Error::new(ErrorKind::AllocFailure, "write job table exhausted")),
        }
    }

    fn job_remove(&mut self, ix: u32) {
        let preds = core::mem::take(&mut self.jobs[ix as usize].preds);
        let succs = core::mem::take(&mut self.jobs[ix as usize].succs);
        for &p in &preds {
            let list = &mut self.jobs[p as usize].succs;
            if let Some(pos) = list.iter().position(|&x| x == ix) {
                list.swap_remove(pos);
            }
        }
        for &s in &succs {
            let list = &mut self.jobs[s as usize].preds;
            if let Some(pos) = list.iter().position(|&x| x == ix) {
                list.swap_remove(pos);
            }
        }
        let job = &mut self.jobs[ix as usize];
        job.in_use = false;
        job.blk_ix = None;
        job.serial = job.serial.wrapping_add(1);
        self.free.push(ix);
    }
}
