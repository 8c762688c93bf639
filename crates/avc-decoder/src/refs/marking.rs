//! 解码参考图像标记 (8.2.5).

use log::{debug, warn};

use super::{RefEntry, ReferenceSet};

/// MMCO (memory_management_control_operation) 操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcoOp {
    /// MMCO1: 释放一个短期参考
    ForgetShort { difference_of_pic_nums_minus1: u32 },
    /// MMCO2: 释放一个长期参考
    ForgetLong { long_term_pic_num: u32 },
    /// MMCO3: 短期参考转为长期参考
    ConvertShortToLong {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },
    /// MMCO4: 设置 MaxLongTermFrameIdx 并释放超限的长期参考
    TrimLong { max_long_term_frame_idx_plus1: u32 },
    /// MMCO5: 清空全部参考
    ClearAll,
    /// MMCO6: 当前图像标记为长期参考
    MarkCurrentLong { long_term_frame_idx: u32 },
}

/// dec_ref_pic_marking() 语法
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecRefPicMarking {
    /// IDR: no_output_of_prior_pics_flag
    pub no_output_of_prior_pics: bool,
    /// IDR: long_term_reference_flag
    pub long_term_reference_flag: bool,
    /// 非 IDR: adaptive_ref_pic_marking_mode_flag
    pub adaptive: bool,
    /// MMCO 操作序列
    pub ops: Vec<MmcoOp>,
}

impl DecRefPicMarking {
    /// 是否包含 MMCO5
    pub fn has_clear_all(&self) -> bool {
        self.adaptive && self.ops.contains(&MmcoOp::ClearAll)
    }
}

/// 标记过程的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkingOutcome {
    /// 执行了 MMCO5, 调用方需要把当前图像的 FrameNum 与 POC 归零
    pub cleared_all: bool,
    /// MMCO5 之前当前图像的 PicOrderCnt, 用于整体平移输出顺序
    pub poc_rebase: i32,
    /// 当前图像最终使用的长期索引
    pub long_term_idx: Option<u32>,
    /// 被移除参考标记的槽位
    pub released: u32,
}

impl ReferenceSet {
    /// IDR 图像: 清空全部参考, 当前图像成为唯一的参考
    pub fn mark_idr(&mut self, slot: usize, current: RefEntry, long_term: bool) -> MarkingOutcome {
        let released = self.mask() & !(1 << (slot % 32));
        self.clear();
        if long_term {
            self.max_long_term_frame_idx_plus1 = 1;
            self.insert_long_term(slot, current, 0);
        } else {
            self.insert_short_term(slot, current);
        }
        MarkingOutcome {
            long_term_idx: long_term.then_some(0),
            released,
            ..Default::default()
        }
    }

    /// 非 IDR 参考图像: 执行 MMCO 序列或滑动窗口, 然后把当前图像加入集合
    ///
    /// `current.frame_num` 为绝对 FrameNum. 无论操作序列如何, 返回后参考帧数量
    /// 不超过 `max(max_num_ref_frames, 1)`.
    pub fn apply_marking(
        &mut self,
        slot: usize,
        current: RefEntry,
        marking: &DecRefPicMarking,
        max_num_ref_frames: u32,
    ) -> MarkingOutcome {
        let before = self.mask();
        let mut outcome = MarkingOutcome::default();
        let mut current = current;

        if marking.adaptive {
            for op in &marking.ops {
                self.apply_mmco(*op, &current, &mut outcome);
            }
        }

        if outcome.cleared_all {
            let rebase = current.poc();
            outcome.poc_rebase = rebase;
            current = RefEntry {
                frame_num: 0,
                long_term_idx: 0,
                top_poc: current.top_poc - rebase,
                bottom_poc: current.bottom_poc - rebase,
            };
        }

        if let Some(idx) = outcome.long_term_idx {
            if let Some(old) = self.find_long_term(idx) {
                self.remove(old);
            }
        }
        self.sliding_window(max_num_ref_frames, 1);
        match outcome.long_term_idx {
            Some(idx) => self.insert_long_term(slot, current, idx),
            None => self.insert_short_term(slot, current),
        }

        outcome.released = before & !self.mask();
        debug!(
            "H264: 参考标记完成, slot={}, short={:#x}, long={:#x}, released={:#x}",
            slot,
            self.short_term_only(),
            self.long_term_only(),
            outcome.released
        );
        outcome
    }

    /// frame_num 间隔: 以滑动窗口方式插入一个不存在的短期参考
    pub fn insert_gap_frame(&mut self, slot: usize, entry: RefEntry, max_num_ref_frames: u32) {
        self.sliding_window(max_num_ref_frames, 1);
        self.insert_non_existing(slot, entry);
    }

    fn apply_mmco(&mut self, op: MmcoOp, current: &RefEntry, outcome: &mut MarkingOutcome) {
        match op {
            MmcoOp::ForgetShort {
                difference_of_pic_nums_minus1,
            } => {
                let target = pic_num_target(current, difference_of_pic_nums_minus1);
                match self.find_short_term(target) {
                    Some(slot) => self.remove(slot),
                    None => warn!("H264: MMCO1 目标短期参考不存在, frame_num={}", target),
                }
            }
            MmcoOp::ForgetLong { long_term_pic_num } => match self.find_long_term(long_term_pic_num) {
                Some(slot) => self.remove(slot),
                None => warn!(
                    "H264: MMCO2 目标长期参考不存在, long_term_pic_num={}",
                    long_term_pic_num
                ),
            },
            MmcoOp::ConvertShortToLong {
                difference_of_pic_nums_minus1,
                long_term_frame_idx,
            } => {
                let target = pic_num_target(current, difference_of_pic_nums_minus1);
                let Some(slot) = self.find_short_term(target) else {
                    warn!("H264: MMCO3 目标短期参考不存在, frame_num={}", target);
                    return;
                };
                if !self.long_term_idx_allowed(long_term_frame_idx) {
                    warn!(
                        "H264: MMCO3 长期索引超出 MaxLongTermFrameIdx, idx={}",
                        long_term_frame_idx
                    );
                    return;
                }
                let entry = *self.entry(slot);
                self.insert_long_term(slot, entry, long_term_frame_idx);
            }
            MmcoOp::TrimLong {
                max_long_term_frame_idx_plus1,
            } => {
                self.max_long_term_frame_idx_plus1 = max_long_term_frame_idx_plus1;
                for slot in super::iter_bits(self.long_term_only()) {
                    if self.entry(slot).long_term_idx >= max_long_term_frame_idx_plus1 {
                        self.remove(slot);
                    }
                }
            }
            MmcoOp::ClearAll => {
                self.clear();
                outcome.cleared_all = true;
                outcome.long_term_idx = None;
            }
            MmcoOp::MarkCurrentLong {
                long_term_frame_idx,
            } => {
                if self.long_term_idx_allowed(long_term_frame_idx) {
                    outcome.long_term_idx = Some(long_term_frame_idx);
                } else {
                    warn!(
                        "H264: MMCO6 长期索引超出 MaxLongTermFrameIdx, idx={}",
                        long_term_frame_idx
                    );
                }
            }
        }
    }

    fn long_term_idx_allowed(&self, idx: u32) -> bool {
        idx < self.max_long_term_frame_idx_plus1
    }
}

/// picNumX = CurrPicNum - (difference_of_pic_nums_minus1 + 1), 以绝对 FrameNum 表示
fn pic_num_target(current: &RefEntry, difference_of_pic_nums_minus1: u32) -> i32 {
    let diff = i64::from(difference_of_pic_nums_minus1) + 1;
    (i64::from(current.frame_num) - diff).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(frame_num: i32) -> RefEntry {
        RefEntry {
            frame_num,
            long_term_idx: 0,
            top_poc: frame_num * 2,
            bottom_poc: frame_num * 2,
        }
    }

    fn sliding() -> DecRefPicMarking {
        DecRefPicMarking::default()
    }

    fn adaptive(ops: Vec<MmcoOp>) -> DecRefPicMarking {
        DecRefPicMarking {
            adaptive: true,
            ops,
            ..Default::default()
        }
    }

    fn check_invariant(refs: &ReferenceSet, max: u32) {
        assert_eq!(
            refs.short_term_only() & refs.long_term_only(),
            0,
            "短期与长期参考必须互斥"
        );
        assert!(refs.count() <= max.max(1), "参考数量超过上限");
    }

    #[test]
    fn test_sliding_window_keeps_latest_four() {
        let mut refs = ReferenceSet::new();
        refs.mark_idr(0, entry(0), false);
        for i in 1..6 {
            refs.apply_marking(i, entry(i as i32), &sliding(), 4);
            check_invariant(&refs, 4);
        }
        assert_eq!(refs.short_term_only(), 0b11_1100, "应保留第 2..5 帧");
    }

    #[test]
    fn test_idr_clears_and_long_term_flag() {
        let mut refs = ReferenceSet::new();
        refs.insert_short_term(1, entry(1));
        refs.insert_short_term(2, entry(2));
        let out = refs.mark_idr(3, entry(0), true);
        assert_eq!(out.released, 0b110);
        assert_eq!(refs.long_term_only(), 1 << 3);
        assert_eq!(refs.max_long_term_frame_idx(), Some(0));
    }

    #[test]
    fn test_mmco_forget_and_convert() {
        let mut refs = ReferenceSet::new();
        refs.mark_idr(0, entry(0), false);
        refs.apply_marking(1, entry(1), &sliding(), 4);
        refs.apply_marking(2, entry(2), &sliding(), 4);

        // MMCO4 允许索引 0..=1, MMCO3 把 FrameNum 1 转为长期 1, MMCO1 释放 FrameNum 0
        let ops = vec![
            MmcoOp::TrimLong {
                max_long_term_frame_idx_plus1: 2,
            },
            MmcoOp::ConvertShortToLong {
                difference_of_pic_nums_minus1: 1,
                long_term_frame_idx: 1,
            },
            MmcoOp::ForgetShort {
                difference_of_pic_nums_minus1: 2,
            },
        ];
        let out = refs.apply_marking(3, entry(3), &adaptive(ops), 4);
        assert_eq!(out.released, 1 << 0);
        assert_eq!(refs.long_term_only(), 1 << 1);
        assert_eq!(refs.entry(1).long_term_idx, 1);
        assert_eq!(refs.short_term_only(), (1 << 2) | (1 << 3));
        check_invariant(&refs, 4);

        let ops = vec![MmcoOp::ForgetLong {
            long_term_pic_num: 1,
        }];
        refs.apply_marking(4, entry(4), &adaptive(ops), 4);
        assert_eq!(refs.long_term_only(), 0);
    }

    #[test]
    fn test_mmco_current_long_replaces_holder() {
        let mut refs = ReferenceSet::new();
        refs.mark_idr(0, entry(0), true);
        let ops = vec![MmcoOp::MarkCurrentLong {
            long_term_frame_idx: 0,
        }];
        let out = refs.apply_marking(1, entry(1), &adaptive(ops), 4);
        assert_eq!(out.long_term_idx, Some(0));
        assert_eq!(refs.long_term_only(), 1 << 1, "旧的长期 0 应被替换");
        assert!(!refs.contains(0));
    }

    #[test]
    fn test_mmco_current_long_rejected_without_max_idx() {
        let mut refs = ReferenceSet::new();
        refs.mark_idr(0, entry(0), false);
        let ops = vec![MmcoOp::MarkCurrentLong {
            long_term_frame_idx: 2,
        }];
        let out = refs.apply_marking(1, entry(1), &adaptive(ops), 4);
        assert_eq!(out.long_term_idx, None);
        assert_eq!(refs.short_term_only(), 0b11);
    }

    #[test]
    fn test_mmco5_rebases_current() {
        let mut refs = ReferenceSet::new();
        refs.mark_idr(0, entry(0), false);
        refs.apply_marking(1, entry(1), &sliding(), 4);
        let current = RefEntry {
            frame_num: 2,
            long_term_idx: 0,
            top_poc: 10,
            bottom_poc: 11,
        };
        let out = refs.apply_marking(2, current, &adaptive(vec![MmcoOp::ClearAll]), 4);
        assert!(out.cleared_all);
        assert_eq!(out.poc_rebase, 10);
        assert_eq!(refs.short_term_only(), 1 << 2);
        let e = refs.entry(2);
        assert_eq!((e.frame_num, e.top_poc, e.bottom_poc), (0, 0, 1));
    }

    #[test]
    fn test_missing_targets_are_skipped() {
        let mut refs = ReferenceSet::new();
        refs.mark_idr(0, entry(0), false);
        let ops = vec![
            MmcoOp::ForgetShort {
                difference_of_pic_nums_minus1: 7,
            },
            MmcoOp::ForgetLong {
                long_term_pic_num: 3,
            },
        ];
        refs.apply_marking(1, entry(1), &adaptive(ops), 4);
        assert_eq!(refs.short_term_only(), 0b11);
    }

    #[test]
    fn test_adaptive_overflow_still_bounded() {
        let mut refs = ReferenceSet::new();
        refs.mark_idr(0, entry(0), false);
        refs.apply_marking(1, entry(1), &sliding(), 2);
        // 不释放任何参考的自适应标记, 数量仍被限制
        refs.apply_marking(2, entry(2), &adaptive(Vec::new()), 2);
        check_invariant(&refs, 2);
        assert_eq!(refs.short_term_only(), 0b110);
    }

    #[test]
    fn test_gap_frames_enter_sliding_window() {
        let mut refs = ReferenceSet::new();
        refs.mark_idr(0, entry(0), false);
        refs.insert_gap_frame(1, entry(1), 2);
        refs.insert_gap_frame(2, entry(2), 2);
        assert_eq!(refs.non_existing(), 0b110);
        refs.apply_marking(3, entry(3), &sliding(), 2);
        assert_eq!(refs.non_existing(), 1 << 2);
        assert_eq!(refs.short_term_only(), 1 << 3);
    }
}
