//! 伙伴块分配器
//!
//! 在一整块连续内存上按 2 的幂分级分配缓存块。零阶块大小等于
//! 缓存支持的最小逻辑块大小，更大的块由相邻伙伴段合并而成。
//! 字节偏移与零阶块序号之间通过移位互相换算，缓存引擎以此把
//! 缓存块映射到描述符表槽位。

use crate::error::{Error, ErrorKind, Result};
use alloc::vec;
use alloc::vec::Vec;

/// 未分配标记
const SEG_ORDER_NONE: u8 = u8::MAX;

/// 伙伴分配器
pub struct BuddyAlloc {
    arena: Vec<u8>,
    blk_size_log2: u8,
    blk_cnt: u32,
    order_max: u8,
    /// 每一阶的空闲段表，元素为段首的零阶块序号
    free_lists: Vec<Vec<u32>>,
    /// 每个零阶块序号上记录的已分配段阶数（仅段首有效）
    seg_order: Vec<u8>,
}

impl BuddyAlloc {
    /// 创建分配器
    ///
    /// # 参数
    ///
    /// * `blk_size_log2` - 零阶块大小对数
    /// * `blk_cnt` - 零阶块总数
    /// * `order_max` - 最高阶（最大可分配段为 `1 << (blk_size_log2 + order_max)` 字节）
    pub fn new(blk_size_log2: u8, blk_cnt: u32, order_max: u8) -> Result<Self> {
        if blk_cnt == 0 {
            return Err(Error::new(ErrorKind::InvalidConfig, "buddy block count is zero"));
        }
        if usize::from(blk_size_log2) + usize::from(order_max) >= usize::BITS as usize {
            return Err(Error::new(ErrorKind::InvalidConfig, "buddy order out of range"));
        }

        let arena_len = (blk_cnt as usize) << blk_size_log2;
        let mut this = Self {
            arena: vec![0u8; arena_len],
            blk_size_log2,
            blk_cnt,
            order_max,
            free_lists: (0..=order_max).map(|_| Vec::new()).collect(),
            seg_order: vec![SEG_ORDER_NONE; blk_cnt as usize],
        };

        // 用尽可能大的对齐段覆盖整个区域
        let mut ix = 0u32;
        while ix < blk_cnt {
            let mut order = order_max;
            while order > 0 && (ix & ((1 << order) - 1) != 0 || ix + (1 << order) > blk_cnt) {
                order -= 1;
            }
            this.free_lists[usize::from(order)].push(ix);
            ix += 1 << order;
        }

        Ok(this)
    }

    /// 零阶块大小对数
    pub fn blk_size_log2(&self) -> u8 {
        self.blk_size_log2
    }

    /// 分配一个 `1 << size_log2` 字节的块
    ///
    /// 返回块在区域内的字节偏移；空间不足时返回 `None`，
    /// 由调用方决定是否通过淘汰腾出空间。
    pub fn blk_alloc(&mut self, size_log2: u8) -> Option<usize> {
        let order = size_log2.checked_sub(self.blk_size_log2)?;
        if order > self.order_max {
            return None;
        }

        // 找到最小的非空阶
        let mut cur = order;
        while usize::from(cur) < self.free_lists.len() && self.free_lists[usize::from(cur)].is_empty()
        {
            cur += 1;
        }
        if usize::from(cur) >= self.free_lists.len() {
            return None;
        }

        let ix = self.free_lists[usize::from(cur)].pop()?;
        // 向下分裂，高半段回填空闲表
        while cur > order {
            cur -= 1;
            self.free_lists[usize::from(cur)].push(ix + (1 << cur));
        }

        self.seg_order[ix as usize] = order;
        Some((ix as usize) << self.blk_size_log2)
    }

    /// 释放 `blk_alloc` 返回的块并尽可能与伙伴合并
    pub fn blk_free(&mut self, offset: usize) {
        let mut ix = (offset >> self.blk_size_log2) as u32;
        let mut order = self.seg_order[ix as usize];
        debug_assert_ne!(order, SEG_ORDER_NONE, "double free of cache block");
        self.seg_order[ix as usize] = SEG_ORDER_NONE;

        while order < self.order_max {
            let buddy_ix = ix ^ (1 << order);
            if buddy_ix + (1 << order) > self.blk_cnt {
                break;
            }
            let list = &mut self.free_lists[usize::from(order)];
            match list.iter().position(|&f| f == buddy_ix) {
                Some(pos) => {
                    list.swap_remove(pos);
                    ix = ix.min(buddy_ix);
                    order += 1;
                }
                None => break,
            }
        }

        self.free_lists[usize::from(order)].push(ix);
    }

    /// 字节偏移换算为零阶块序号
    pub fn offset_to_ix(&self, offset: usize) -> u32 {
        (offset >> self.blk_size_log2) as u32
    }

    /// 借出块数据
    pub fn blk_buf(&self, offset: usize, len: usize) -> &[u8] {
        &self.arena[offset..offset + len]
    }

    /// 可变借出块数据
    pub fn blk_buf_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.arena[offset..offset + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_roundtrip() {
        let mut buddy = BuddyAlloc::new(9, 8, 3).unwrap();
        let off = buddy.blk_alloc(9).unwrap();
        assert_eq!(buddy.offset_to_ix(off), (off >> 9) as u32);
        buddy.blk_free(off);
    }

    #[test]
    fn test_split_and_merge() {
        // 8 个 512 字节零阶块，最大段 4096 字节
        let mut buddy = BuddyAlloc::new(9, 8, 3).unwrap();

        let a = buddy.blk_alloc(9).unwrap();
        let b = buddy.blk_alloc(9).unwrap();
        assert_ne!(a, b);

        // 分裂后无法再分配整段
        assert!(buddy.blk_alloc(12).is_none());

        // 归还后伙伴重新合并，整段恢复可用
        buddy.blk_free(a);
        buddy.blk_free(b);
        let whole = buddy.blk_alloc(12).unwrap();
        assert_eq!(whole, 0);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut buddy = BuddyAlloc::new(9, 4, 2).unwrap();
        for _ in 0..4 {
            assert!(buddy.blk_alloc(9).is_some());
        }
        assert!(buddy.blk_alloc(9).is_none());
    }

    #[test]
    fn test_mixed_sizes() {
        let mut buddy = BuddyAlloc::new(9, 8, 3).unwrap();
        let big = buddy.blk_alloc(11).unwrap(); // 4 个零阶块
        let small = buddy.blk_alloc(9).unwrap();
        assert!(small >= (4 << 9) || small + 512 <= big || big + 2048 <= small);
        buddy.blk_free(small);
        buddy.blk_free(big);
        assert!(buddy.blk_alloc(12).is_some());
    }

    #[test]
    fn test_non_power_of_two_cnt() {
        let mut buddy = BuddyAlloc::new(9, 6, 3).unwrap();
        let mut offs = Vec::new();
        for _ in 0..6 {
            offs.push(buddy.blk_alloc(9).unwrap());
        }
        assert!(buddy.blk_alloc(9).is_none());
        for off in offs {
            buddy.blk_free(off);
        }
    }

    #[test]
    fn test_invalid_config() {
        assert!(BuddyAlloc::new(9, 0, 3).is_err());
    }
}
