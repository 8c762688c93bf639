//! 参考帧集合.
//!
//! 以图像池槽位为下标的两个 32 位掩码:
//! - `short_term`: 短期参考
//! - `long_term`: 长期参考
//!
//! 两个掩码同时置位只用于 frame_num 间隔产生的 "不存在" 占位帧,
//! 它们参与滑动窗口, 但不进入参考列表.

mod list;
mod marking;

pub use list::{ListParams, RefPicListMod, RefPicLists, build_ref_pic_lists};
pub use marking::{DecRefPicMarking, MarkingOutcome, MmcoOp};

/// 参考集合可容纳的槽位数
pub const MAX_SLOTS: usize = 32;

/// 单个参考槽位的排序信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefEntry {
    /// 绝对 FrameNum (跨越 MaxFrameNum 回绕后继续递增)
    pub frame_num: i32,
    /// LongTermFrameIdx, 仅长期参考有效
    pub long_term_idx: u32,
    /// TopFieldOrderCnt
    pub top_poc: i32,
    /// BottomFieldOrderCnt
    pub bottom_poc: i32,
}

impl RefEntry {
    /// 帧的 PicOrderCnt
    pub fn poc(&self) -> i32 {
        self.top_poc.min(self.bottom_poc)
    }
}

/// 参考帧集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSet {
    short_term: u32,
    long_term: u32,
    entries: [RefEntry; MAX_SLOTS],
    /// MaxLongTermFrameIdx + 1, 0 表示 "no long-term frame indices"
    max_long_term_frame_idx_plus1: u32,
}

impl Default for ReferenceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceSet {
    /// 创建空集合
    pub fn new() -> Self {
        Self {
            short_term: 0,
            long_term: 0,
            entries: [RefEntry::default(); MAX_SLOTS],
            max_long_term_frame_idx_plus1: 0,
        }
    }

    /// 短期参考掩码 (含不存在帧)
    pub fn short_term(&self) -> u32 {
        self.short_term
    }

    /// 长期参考掩码 (含不存在帧)
    pub fn long_term(&self) -> u32 {
        self.long_term
    }

    /// 可用于预测的短期参考
    pub fn short_term_only(&self) -> u32 {
        self.short_term & !self.long_term
    }

    /// 可用于预测的长期参考
    pub fn long_term_only(&self) -> u32 {
        self.long_term & !self.short_term
    }

    /// 不存在的占位帧
    pub fn non_existing(&self) -> u32 {
        self.short_term & self.long_term
    }

    /// 所有占用参考名额的槽位
    pub fn mask(&self) -> u32 {
        self.short_term | self.long_term
    }

    /// 参考帧数量
    pub fn count(&self) -> u32 {
        self.mask().count_ones()
    }

    /// 槽位是否仍被参考
    pub fn contains(&self, slot: usize) -> bool {
        slot < MAX_SLOTS && self.mask() & 1 << slot != 0
    }

    /// 槽位排序信息
    pub fn entry(&self, slot: usize) -> &RefEntry {
        &self.entries[slot % MAX_SLOTS]
    }

    /// MaxLongTermFrameIdx, None 表示不允许长期参考
    pub fn max_long_term_frame_idx(&self) -> Option<u32> {
        self.max_long_term_frame_idx_plus1.checked_sub(1)
    }

    /// 清空全部参考
    pub fn clear(&mut self) {
        self.short_term = 0;
        self.long_term = 0;
        self.max_long_term_frame_idx_plus1 = 0;
    }

    /// 释放一个槽位的参考标记
    pub fn remove(&mut self, slot: usize) {
        let bit = !(1u32 << (slot % MAX_SLOTS));
        self.short_term &= bit;
        self.long_term &= bit;
    }

    /// 标记为短期参考
    pub fn insert_short_term(&mut self, slot: usize, entry: RefEntry) {
        let slot = slot % MAX_SLOTS;
        self.entries[slot] = entry;
        self.long_term &= !(1 << slot);
        self.short_term |= 1 << slot;
    }

    /// 标记为长期参考, 已持有同一 LongTermFrameIdx 的图像先被释放
    pub fn insert_long_term(&mut self, slot: usize, entry: RefEntry, long_term_idx: u32) {
        let slot = slot % MAX_SLOTS;
        if let Some(old) = self.find_long_term(long_term_idx) {
            if old != slot {
                self.remove(old);
            }
        }
        self.entries[slot] = RefEntry {
            long_term_idx,
            ..entry
        };
        self.short_term &= !(1 << slot);
        self.long_term |= 1 << slot;
    }

    /// 插入 frame_num 间隔产生的不存在帧
    pub fn insert_non_existing(&mut self, slot: usize, entry: RefEntry) {
        let slot = slot % MAX_SLOTS;
        self.entries[slot] = entry;
        self.short_term |= 1 << slot;
        self.long_term |= 1 << slot;
    }

    /// 按绝对 FrameNum 查找短期参考
    pub fn find_short_term(&self, frame_num: i32) -> Option<usize> {
        iter_bits(self.short_term_only()).find(|&i| self.entries[i].frame_num == frame_num)
    }

    /// 按 LongTermFrameIdx 查找长期参考
    pub fn find_long_term(&self, long_term_idx: u32) -> Option<usize> {
        iter_bits(self.long_term_only()).find(|&i| self.entries[i].long_term_idx == long_term_idx)
    }

    /// 滑动窗口: 参考帧数达到 `max_num_ref_frames` 时逐个淘汰 FrameNum 最小的短期参考
    ///
    /// `reserve` 为随后要加入的参考帧数. 返回被淘汰的槽位掩码.
    pub fn sliding_window(&mut self, max_num_ref_frames: u32, reserve: u32) -> u32 {
        let limit = max_num_ref_frames.max(1);
        let mut evicted = 0u32;
        while self.count() + reserve > limit {
            let victim = iter_bits(self.short_term)
                .min_by_key(|&i| self.entries[i].frame_num)
                .or_else(|| {
                    iter_bits(self.long_term).min_by_key(|&i| self.entries[i].long_term_idx)
                });
            let Some(victim) = victim else {
                break;
            };
            self.remove(victim);
            evicted |= 1 << victim;
        }
        evicted
    }

    /// 插入 `gap_frames` 个不存在帧后再开始一张图像, 事先需要的空闲槽位数
    ///
    /// 被滑动窗口淘汰的参考若不在 `held` 中, 其槽位可由之后的图像复用.
    pub fn slots_for_gap(&self, max_num_ref_frames: u32, gap_frames: u32, held: u32) -> u32 {
        let mut trial = self.clone();
        let mut frame_num = iter_bits(self.short_term)
            .map(|i| self.entries[i].frame_num)
            .max()
            .unwrap_or(0);
        // 已占用的新槽位减去回收的槽位
        let mut in_use = 0i32;
        let mut required = 0i32;
        for _ in 0..gap_frames {
            let Some(slot) = iter_bits(!(trial.mask() | held)).next() else {
                break;
            };
            in_use += 1;
            required = required.max(in_use);
            let evicted = trial.sliding_window(max_num_ref_frames, 1);
            in_use -= (evicted & !held).count_ones() as i32;
            frame_num += 1;
            trial.insert_non_existing(
                slot,
                RefEntry {
                    frame_num,
                    ..RefEntry::default()
                },
            );
        }
        required.max(in_use + 1) as u32
    }

    /// 对所有排序键减去偏移 (MMCO5 之后当前图像 POC 归零时使用)
    pub fn rebase_frame_nums(&mut self, delta: i32) {
        for i in iter_bits(self.mask()) {
            self.entries[i].frame_num -= delta;
        }
    }
}

/// 遍历掩码中置位的位置
pub fn iter_bits(mut mask: u32) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let i = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        Some(i)
    })
}
