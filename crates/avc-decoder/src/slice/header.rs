//! 切片头解析 (7.3.3).

use std::sync::Arc;

use avc_core::{AvcError, AvcResult, BitCache};

use crate::nal::{NalHeader, NalUnitType};
use crate::parameter_sets::{ParameterSets, Pps, Sps, read_se_range, read_ue_max};
use crate::refs::{DecRefPicMarking, MmcoOp, RefPicListMod};

/// MMCO 操作数上限
const MAX_MMCO_OPS: usize = 32;
/// 每个列表的修改操作数上限
const MAX_LIST_MODS: usize = 32;

/// 切片类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceType {
    /// 由 slice_type 语法值创建 (5..9 与 0..4 相同)
    pub fn from_id(id: u32) -> Option<Self> {
        match id % 5 {
            0 => Some(Self::P),
            1 => Some(Self::B),
            2 => Some(Self::I),
            3 => Some(Self::Sp),
            4 => Some(Self::Si),
            _ => None,
        }
    }

    /// 是否只含帧内宏块
    pub fn is_intra(&self) -> bool {
        matches!(self, Self::I | Self::Si)
    }

    /// 是否为 B 切片
    pub fn is_b(&self) -> bool {
        matches!(self, Self::B)
    }

    /// 使用的参考列表数
    pub fn list_count(&self) -> usize {
        match self {
            Self::B => 2,
            Self::P | Self::Sp => 1,
            Self::I | Self::Si => 0,
        }
    }
}

impl std::fmt::Display for SliceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::P => "P",
            Self::B => "B",
            Self::I => "I",
            Self::Sp => "SP",
            Self::Si => "SI",
        };
        f.write_str(s)
    }
}

/// 单个参考索引的显式加权参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredWeight {
    pub luma_weight: i32,
    pub luma_offset: i32,
    pub chroma_weight: [i32; 2],
    pub chroma_offset: [i32; 2],
}

/// 加权预测模式
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WeightedPrediction {
    /// 默认平均
    #[default]
    Default,
    /// 切片头携带的权重表
    Explicit(PredWeightTable),
    /// 由 POC 距离推导 (weighted_bipred_idc == 2)
    Implicit,
}

/// pred_weight_table() 语法
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,
    /// 每个列表按 ref_idx 排列的权重
    pub weights: [Vec<PredWeight>; 2],
}

/// 去块滤波参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeblockParams {
    /// disable_deblocking_filter_idc
    pub disable_idc: u32,
    /// FilterOffsetA
    pub alpha_c0_offset: i32,
    /// FilterOffsetB
    pub beta_offset: i32,
}

/// 解析后的切片头
#[derive(Debug, Clone)]
pub struct SliceHeader {
    pub nal: NalHeader,
    pub first_mb: u32,
    pub slice_type: SliceType,
    pub pps_id: u32,
    pub frame_num: u32,
    pub idr_pic_id: Option<u32>,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
    pub direct_spatial_mv_pred: bool,
    pub num_ref_idx_active: [u32; 2],
    pub ref_pic_list_mods: [Vec<RefPicListMod>; 2],
    pub weighted_prediction: WeightedPrediction,
    /// 非参考图像为 None
    pub dec_ref_pic_marking: Option<DecRefPicMarking>,
    pub cabac_init_idc: u32,
    pub slice_qp: i32,
    pub deblock: DeblockParams,
    pub sps: Arc<Sps>,
    pub pps: Arc<Pps>,
}

impl SliceHeader {
    /// 是否为 IDR 图像的切片
    pub fn is_idr(&self) -> bool {
        self.nal.nal_type.is_idr()
    }

    /// 是否为参考图像的切片
    pub fn is_reference(&self) -> bool {
        self.nal.is_reference()
    }

    /// 是否与上一个切片属于不同图像 (7.4.1.2.4)
    pub fn starts_new_picture(&self, prev: &SliceHeader) -> bool {
        if self.frame_num != prev.frame_num
            || self.pps_id != prev.pps_id
            || self.is_reference() != prev.is_reference()
            || self.is_idr() != prev.is_idr()
        {
            return true;
        }
        if self.is_idr() && self.idr_pic_id != prev.idr_pic_id {
            return true;
        }
        match self.sps.poc_type {
            0 => {
                self.pic_order_cnt_lsb != prev.pic_order_cnt_lsb
                    || self.delta_pic_order_cnt_bottom != prev.delta_pic_order_cnt_bottom
            }
            1 => self.delta_pic_order_cnt != prev.delta_pic_order_cnt,
            _ => false,
        }
    }

    /// CABAC 上下文初始化模式
    pub fn cabac_init_mode(&self) -> usize {
        crate::cabac::init_mode(self.slice_type.is_intra(), self.cabac_init_idc)
    }
}

/// 解析切片头, 返回后 `bc` 位于 slice_data() 起点 (尚未做 CABAC 对齐)
pub fn parse_slice_header(
    bc: &mut BitCache<'_>,
    nal: NalHeader,
    params: &ParameterSets,
) -> AvcResult<SliceHeader> {
    if !matches!(nal.nal_type, NalUnitType::Slice | NalUnitType::SliceIdr) {
        return Err(AvcError::UnsupportedFeature(format!(
            "H264: 不支持的切片 NAL 类型, nal_type={}",
            nal.nal_type
        )));
    }

    let first_mb = bc.read_ue(u32::MAX);
    let slice_type_id = read_ue_max(bc, "slice_type", 9)?;
    let slice_type = SliceType::from_id(slice_type_id).ok_or_else(|| {
        AvcError::MalformedBitstream(format!("H264: slice_type 非法, value={}", slice_type_id))
    })?;
    let pps_id = read_ue_max(bc, "pic_parameter_set_id", 255)?;
    let (sps, pps) = params.active(pps_id)?;

    if matches!(slice_type, SliceType::Sp | SliceType::Si) {
        return Err(AvcError::UnsupportedFeature(format!(
            "H264: 不支持 SP/SI 切片, slice_type={}",
            slice_type_id
        )));
    }
    sps.check_supported()?;
    pps.check_supported()?;

    let mb_count = sps.mb_count() as u32;
    if first_mb >= mb_count {
        return Err(AvcError::MalformedBitstream(format!(
            "H264: first_mb_in_slice 超出范围, value={}, mb_count={}",
            first_mb, mb_count
        )));
    }
    if nal.nal_type.is_idr() && !slice_type.is_intra() {
        return Err(AvcError::MalformedBitstream(format!(
            "H264: IDR 图像只能包含 I 切片, slice_type={}",
            slice_type
        )));
    }

    let frame_num = bc.read_bits(sps.log2_max_frame_num);
    let idr_pic_id = if nal.nal_type.is_idr() {
        Some(read_ue_max(bc, "idr_pic_id", 65535)?)
    } else {
        None
    };

    let mut pic_order_cnt_lsb = 0;
    let mut delta_pic_order_cnt_bottom = 0;
    let mut delta_pic_order_cnt = [0i32; 2];
    if sps.poc_type == 0 {
        pic_order_cnt_lsb = bc.read_bits(sps.log2_max_poc_lsb);
        if pps.bottom_field_pic_order_in_frame_present {
            delta_pic_order_cnt_bottom = read_se_range(
                bc,
                "delta_pic_order_cnt_bottom",
                -(1 << 30) + 1,
                (1 << 30) - 1,
            )?;
        }
    } else if sps.poc_type == 1 && !sps.delta_pic_order_always_zero_flag {
        delta_pic_order_cnt[0] =
            read_se_range(bc, "delta_pic_order_cnt[0]", -(1 << 30) + 1, (1 << 30) - 1)?;
        if pps.bottom_field_pic_order_in_frame_present {
            delta_pic_order_cnt[1] =
                read_se_range(bc, "delta_pic_order_cnt[1]", -(1 << 30) + 1, (1 << 30) - 1)?;
        }
    }

    let redundant_pic_cnt = if pps.redundant_pic_cnt_present {
        read_ue_max(bc, "redundant_pic_cnt", 127)?
    } else {
        0
    };

    let mut direct_spatial_mv_pred = false;
    let mut num_ref_idx_active = [0u32; 2];
    if !slice_type.is_intra() {
        if slice_type.is_b() {
            direct_spatial_mv_pred = bc.read_flag();
        }
        num_ref_idx_active = pps.num_ref_idx_default_active;
        if bc.read_flag() {
            num_ref_idx_active[0] = read_ue_max(bc, "num_ref_idx_l0_active_minus1", 31)? + 1;
            if slice_type.is_b() {
                num_ref_idx_active[1] = read_ue_max(bc, "num_ref_idx_l1_active_minus1", 31)? + 1;
            }
        }
        if !slice_type.is_b() {
            num_ref_idx_active[1] = 0;
        }
    }

    let mut ref_pic_list_mods = [Vec::new(), Vec::new()];
    for (l, mods) in ref_pic_list_mods
        .iter_mut()
        .enumerate()
        .take(slice_type.list_count())
    {
        if bc.read_flag() {
            *mods = parse_ref_pic_list_mod(bc, &sps, l)?;
        }
    }

    let weighted_prediction = if (pps.weighted_pred && !slice_type.is_b())
        || (pps.weighted_bipred_idc == 1 && slice_type.is_b())
    {
        WeightedPrediction::Explicit(parse_pred_weight_table(
            bc,
            &sps,
            slice_type,
            num_ref_idx_active,
        )?)
    } else if pps.weighted_bipred_idc == 2 && slice_type.is_b() {
        WeightedPrediction::Implicit
    } else {
        WeightedPrediction::Default
    };

    let dec_ref_pic_marking = if nal.is_reference() {
        Some(parse_dec_ref_pic_marking(bc, nal, &sps)?)
    } else {
        None
    };

    let cabac_init_idc = if !slice_type.is_intra() {
        read_ue_max(bc, "cabac_init_idc", 2)?
    } else {
        0
    };

    let slice_qp = pps.pic_init_qp + bc.read_se(-87, 87);
    if !(0..=51).contains(&slice_qp) {
        return Err(AvcError::MalformedBitstream(format!(
            "H264: slice_qp 超出范围, value={}",
            slice_qp
        )));
    }

    let mut deblock = DeblockParams::default();
    if pps.deblocking_filter_control_present {
        deblock.disable_idc = read_ue_max(bc, "disable_deblocking_filter_idc", 2)?;
        if deblock.disable_idc != 1 {
            deblock.alpha_c0_offset = read_se_range(bc, "slice_alpha_c0_offset_div2", -6, 6)? * 2;
            deblock.beta_offset = read_se_range(bc, "slice_beta_offset_div2", -6, 6)? * 2;
        }
    }

    Ok(SliceHeader {
        nal,
        first_mb,
        slice_type,
        pps_id,
        frame_num,
        idr_pic_id,
        pic_order_cnt_lsb,
        delta_pic_order_cnt_bottom,
        delta_pic_order_cnt,
        redundant_pic_cnt,
        direct_spatial_mv_pred,
        num_ref_idx_active,
        ref_pic_list_mods,
        weighted_prediction,
        dec_ref_pic_marking,
        cabac_init_idc,
        slice_qp,
        deblock,
        sps,
        pps,
    })
}

/// 解析一个列表的 ref_pic_list_modification 操作
fn parse_ref_pic_list_mod(
    bc: &mut BitCache<'_>,
    sps: &Sps,
    list: usize,
) -> AvcResult<Vec<RefPicListMod>> {
    let max_abs_diff = sps.max_frame_num() - 1;
    let mut mods = Vec::new();
    loop {
        let idc = read_ue_max(bc, "modification_of_pic_nums_idc", 5)?;
        let op = match idc {
            0 | 1 => {
                let abs_diff_pic_num_minus1 = read_ue_max(bc, "abs_diff_pic_num_minus1", max_abs_diff)?;
                if idc == 0 {
                    RefPicListMod::ShortTermSub {
                        abs_diff_pic_num_minus1,
                    }
                } else {
                    RefPicListMod::ShortTermAdd {
                        abs_diff_pic_num_minus1,
                    }
                }
            }
            2 => RefPicListMod::LongTerm {
                long_term_pic_num: read_ue_max(bc, "long_term_pic_num", 31)?,
            },
            3 => break,
            _ => {
                return Err(AvcError::UnsupportedFeature(format!(
                    "H264: 不支持视图间参考修改, modification_of_pic_nums_idc={}",
                    idc
                )));
            }
        };
        if mods.len() >= MAX_LIST_MODS {
            return Err(AvcError::MalformedBitstream(format!(
                "H264: ref_pic_list_modification_l{} 项数过多",
                list
            )));
        }
        mods.push(op);
    }
    Ok(mods)
}

/// 解析 pred_weight_table()
fn parse_pred_weight_table(
    bc: &mut BitCache<'_>,
    sps: &Sps,
    slice_type: SliceType,
    num_ref_idx_active: [u32; 2],
) -> AvcResult<PredWeightTable> {
    let luma_log2_weight_denom = read_ue_max(bc, "luma_log2_weight_denom", 7)? as u8;
    let chroma_present = sps.chroma_array_type() != 0;
    let chroma_log2_weight_denom = if chroma_present {
        read_ue_max(bc, "chroma_log2_weight_denom", 7)? as u8
    } else {
        0
    };

    let mut table = PredWeightTable {
        luma_log2_weight_denom,
        chroma_log2_weight_denom,
        weights: [Vec::new(), Vec::new()],
    };
    for l in 0..slice_type.list_count() {
        for _ in 0..num_ref_idx_active[l] {
            let mut w = PredWeight {
                luma_weight: 1 << luma_log2_weight_denom,
                luma_offset: 0,
                chroma_weight: [1 << chroma_log2_weight_denom; 2],
                chroma_offset: [0, 0],
            };
            if bc.read_flag() {
                w.luma_weight = read_se_range(bc, "luma_weight", -128, 127)?;
                w.luma_offset = read_se_range(bc, "luma_offset", -128, 127)?;
            }
            if chroma_present && bc.read_flag() {
                for c in 0..2 {
                    w.chroma_weight[c] = read_se_range(bc, "chroma_weight", -128, 127)?;
                    w.chroma_offset[c] = read_se_range(bc, "chroma_offset", -128, 127)?;
                }
            }
            table.weights[l].push(w);
        }
    }
    Ok(table)
}

/// 解析 dec_ref_pic_marking()
fn parse_dec_ref_pic_marking(
    bc: &mut BitCache<'_>,
    nal: NalHeader,
    sps: &Sps,
) -> AvcResult<DecRefPicMarking> {
    let mut marking = DecRefPicMarking::default();
    if nal.nal_type.is_idr() {
        marking.no_output_of_prior_pics = bc.read_flag();
        marking.long_term_reference_flag = bc.read_flag();
        return Ok(marking);
    }

    marking.adaptive = bc.read_flag();
    if !marking.adaptive {
        return Ok(marking);
    }

    let max_difference = sps.max_frame_num() - 1;
    let max_long_term_idx = sps.max_num_ref_frames.saturating_sub(1);
    loop {
        let op = read_ue_max(bc, "memory_management_control_operation", 6)?;
        let mmco = match op {
            0 => break,
            1 => MmcoOp::ForgetShort {
                difference_of_pic_nums_minus1: read_ue_max(
                    bc,
                    "difference_of_pic_nums_minus1",
                    max_difference,
                )?,
            },
            2 => MmcoOp::ForgetLong {
                long_term_pic_num: read_ue_max(bc, "long_term_pic_num", max_long_term_idx)?,
            },
            3 => {
                let difference_of_pic_nums_minus1 =
                    read_ue_max(bc, "difference_of_pic_nums_minus1", max_difference)?;
                MmcoOp::ConvertShortToLong {
                    difference_of_pic_nums_minus1,
                    long_term_frame_idx: read_ue_max(bc, "long_term_frame_idx", max_long_term_idx)?,
                }
            }
            4 => MmcoOp::TrimLong {
                max_long_term_frame_idx_plus1: read_ue_max(
                    bc,
                    "max_long_term_frame_idx_plus1",
                    sps.max_num_ref_frames,
                )?,
            },
            5 => MmcoOp::ClearAll,
            _ => MmcoOp::MarkCurrentLong {
                long_term_frame_idx: read_ue_max(bc, "long_term_frame_idx", max_long_term_idx)?,
            },
        };
        if marking.ops.len() >= MAX_MMCO_OPS {
            return Err(AvcError::MalformedBitstream(format!(
                "H264: MMCO 操作数量过多, max={}",
                MAX_MMCO_OPS
            )));
        }
        marking.ops.push(mmco);
    }
    Ok(marking)
}
