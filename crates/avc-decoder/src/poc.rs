//! FrameNum 与图像顺序计数 (8.2.1).
//!
//! 计算过程拆成纯函数 [`PocState::compute`] 与提交 [`PocState::commit`]: 新图像在分配槽位
//! 之前先计算, 分配失败 (背压) 时状态不变, 调用方重试同一单元即可.

use crate::parameter_sets::Sps;
use crate::slice::SliceHeader;

/// 当前图像的编号
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PictureNumbering {
    /// 绝对 FrameNum, IDR 为 0
    pub frame_num: i32,
    /// TopFieldOrderCnt
    pub top_poc: i32,
    /// BottomFieldOrderCnt
    pub bottom_poc: i32,
    /// frame_num 间隔中缺失的帧数
    pub gap: u32,
    /// 解析出的 POC 高位 (类型 0), 提交时保存
    poc_msb: i32,
}

impl PictureNumbering {
    /// PicOrderCnt
    pub fn poc(&self) -> i32 {
        self.top_poc.min(self.bottom_poc)
    }
}

/// 跨图像保存的编号状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PocState {
    prev_ref_frame_num: i32,
    prev_poc_msb: i32,
    prev_poc_lsb: i32,
}

impl PocState {
    /// 清空状态 (IDR 或序列结束)
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// 上一个参考图像的绝对 FrameNum
    pub fn prev_ref_frame_num(&self) -> i32 {
        self.prev_ref_frame_num
    }

    /// 计算新图像的 FrameNum 与 POC, 不修改状态
    pub fn compute(&self, header: &SliceHeader) -> PictureNumbering {
        let sps = &header.sps;
        let idr = header.is_idr();
        let frame_num = if idr {
            0
        } else {
            let mask = sps.max_frame_num() as i32 - 1;
            self.prev_ref_frame_num + ((header.frame_num as i32 - self.prev_ref_frame_num) & mask)
        };
        let gap = if idr {
            0
        } else {
            (frame_num - self.prev_ref_frame_num - 1).max(0) as u32
        };

        let mut numbering = PictureNumbering {
            frame_num,
            gap,
            ..Default::default()
        };
        match sps.poc_type {
            0 => {
                let (prev_msb, prev_lsb) = if idr {
                    (0, 0)
                } else {
                    (self.prev_poc_msb, self.prev_poc_lsb)
                };
                let max_lsb = 1i32 << sps.log2_max_poc_lsb.min(16);
                let lsb = header.pic_order_cnt_lsb as i32;
                let msb = if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
                    prev_msb + max_lsb
                } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
                    prev_msb - max_lsb
                } else {
                    prev_msb
                };
                numbering.poc_msb = msb;
                numbering.top_poc = msb + lsb;
                numbering.bottom_poc = numbering.top_poc + header.delta_pic_order_cnt_bottom;
            }
            1 => {
                let top = expected_poc_type1(sps, frame_num, header.is_reference())
                    + header.delta_pic_order_cnt[0];
                numbering.top_poc = top;
                numbering.bottom_poc =
                    top + sps.offset_for_top_to_bottom_field + header.delta_pic_order_cnt[1];
            }
            _ => {
                let poc = 2 * frame_num - i32::from(!header.is_reference());
                numbering.top_poc = poc;
                numbering.bottom_poc = poc;
            }
        }
        numbering
    }

    /// 第 `index` 个不存在帧 (从 1 开始) 的编号, 仅类型 1/2 能得到有意义的 POC
    pub fn gap_frame(&self, sps: &Sps, index: u32) -> PictureNumbering {
        let frame_num = self.prev_ref_frame_num + index as i32;
        let poc = match sps.poc_type {
            0 => 0,
            1 => expected_poc_type1(sps, frame_num, true),
            _ => 2 * frame_num,
        };
        PictureNumbering {
            frame_num,
            top_poc: poc,
            bottom_poc: poc + if sps.poc_type == 1 { sps.offset_for_top_to_bottom_field } else { 0 },
            gap: 0,
            poc_msb: 0,
        }
    }

    /// 图像的第一个切片被接受后提交状态
    ///
    /// `mmco5_top_poc` 为 MMCO5 平移后当前图像的 TopFieldOrderCnt.
    pub fn commit(
        &mut self,
        header: &SliceHeader,
        numbering: &PictureNumbering,
        mmco5_top_poc: Option<i32>,
    ) {
        if !header.is_reference() {
            return;
        }
        match mmco5_top_poc {
            Some(top) => {
                self.prev_ref_frame_num = 0;
                self.prev_poc_msb = 0;
                self.prev_poc_lsb = top;
            }
            None => {
                self.prev_ref_frame_num = numbering.frame_num;
                self.prev_poc_msb = numbering.poc_msb;
                self.prev_poc_lsb = header.pic_order_cnt_lsb as i32;
            }
        }
    }

    /// 插入不存在帧之后推进参考 FrameNum
    pub fn commit_gap(&mut self, frame_num: i32) {
        self.prev_ref_frame_num = frame_num;
    }
}

/// POC 类型 1 的 expectedPicOrderCnt
fn expected_poc_type1(sps: &Sps, frame_num: i32, is_reference: bool) -> i32 {
    let mut abs_frame_num = if sps.max_num_ref_frames == 0 {
        0
    } else {
        frame_num
    };
    if !is_reference && abs_frame_num > 0 {
        abs_frame_num -= 1;
    }

    let mut expected = 0i32;
    let cycle = &sps.offset_for_ref_frame;
    if abs_frame_num > 0 && !cycle.is_empty() {
        let cycle_len = cycle.len() as i32;
        let delta_per_cycle: i32 = cycle.iter().fold(0i32, |acc, &v| acc.wrapping_add(v));
        let cycle_cnt = (abs_frame_num - 1) / cycle_len;
        let in_cycle = (abs_frame_num - 1) % cycle_len;
        expected = cycle_cnt.wrapping_mul(delta_per_cycle);
        for &offset in &cycle[..=in_cycle as usize] {
            expected = expected.wrapping_add(offset);
        }
    }
    if !is_reference {
        expected = expected.wrapping_add(sps.offset_for_non_ref_pic);
    }
    expected
}
