//! H.264 参数集解析.
//!
//! 只解析决定缓冲区尺寸和参考模型配置的字段, 其余语法读取后丢弃或原样保存给重建核.
//! 超出语义范围的值按 `MalformedBitstream` 报告, 有意不支持的特性由 [`Sps::check_supported`]
//! 与 [`Pps::check_supported`] 报告为 `UnsupportedFeature`.

use std::sync::Arc;

use avc_core::{AvcError, AvcResult, BitCache};

/// SPS id 上限 (不含)
pub const MAX_SPS_COUNT: usize = 32;
/// PPS id 上限 (不含)
pub const MAX_PPS_COUNT: usize = 256;
/// 图像池容量上限
pub const MAX_FRAME_BUFFERS: usize = 32;

const DEFAULT_SCALING_4X4_INTRA: [u8; 16] = [
    6, 13, 20, 28, 13, 20, 28, 32, 20, 28, 32, 37, 28, 32, 37, 42,
];

const DEFAULT_SCALING_4X4_INTER: [u8; 16] = [
    10, 14, 20, 24, 14, 20, 24, 27, 20, 24, 27, 30, 24, 27, 30, 34,
];

const DEFAULT_SCALING_8X8_INTRA: [u8; 64] = [
    6, 10, 13, 16, 18, 23, 25, 27, 10, 11, 16, 18, 23, 25, 27, 29, 13, 16, 18, 23, 25, 27, 29, 31,
    16, 18, 23, 25, 27, 29, 31, 33, 18, 23, 25, 27, 29, 31, 33, 36, 23, 25, 27, 29, 31, 33, 36, 38,
    25, 27, 29, 31, 33, 36, 38, 40, 27, 29, 31, 33, 36, 38, 40, 42,
];

const DEFAULT_SCALING_8X8_INTER: [u8; 64] = [
    9, 13, 15, 17, 19, 21, 22, 24, 13, 13, 17, 19, 21, 22, 24, 25, 15, 17, 19, 21, 22, 24, 25, 27,
    17, 19, 21, 22, 24, 25, 27, 28, 19, 21, 22, 24, 25, 27, 28, 30, 21, 22, 24, 25, 27, 28, 30, 32,
    22, 24, 25, 27, 28, 30, 32, 33, 24, 25, 27, 28, 30, 32, 33, 35,
];

/// 量化矩阵 (按扫描顺序保存)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingLists {
    /// 4x4 矩阵: Intra Y/Cb/Cr, Inter Y/Cb/Cr
    pub list_4x4: [[u8; 16]; 6],
    /// 8x8 矩阵: Intra Y, Inter Y
    pub list_8x8: [[u8; 64]; 2],
}

impl Default for ScalingLists {
    /// Flat_4x4_16 / Flat_8x8_16
    fn default() -> Self {
        Self {
            list_4x4: [[16; 16]; 6],
            list_8x8: [[16; 64]; 2],
        }
    }
}

/// SPS 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    /// profile_idc
    pub profile_idc: u8,
    /// constraint_set0..5 标志, 最高位为 constraint_set0
    pub constraint_set_flags: u8,
    /// level_idc
    pub level_idc: u8,
    /// seq_parameter_set_id
    pub sps_id: u32,
    /// 色度格式 (0=单色, 1=4:2:0, 2=4:2:2, 3=4:4:4)
    pub chroma_format_idc: u32,
    /// separate_colour_plane_flag
    pub separate_colour_plane: bool,
    /// 亮度位深
    pub bit_depth_luma: u32,
    /// 色度位深
    pub bit_depth_chroma: u32,
    /// qpprime_y_zero_transform_bypass_flag
    pub qpprime_y_zero_transform_bypass: bool,
    /// 序列级量化矩阵, 未出现时为 None (平坦矩阵)
    pub scaling_lists: Option<ScalingLists>,
    /// log2(MaxFrameNum)
    pub log2_max_frame_num: u32,
    /// pic_order_cnt_type (0, 1, 2)
    pub poc_type: u32,
    /// log2(MaxPicOrderCntLsb), 仅 poc_type==0
    pub log2_max_poc_lsb: u32,
    /// poc_type==1: delta_pic_order_always_zero_flag
    pub delta_pic_order_always_zero_flag: bool,
    /// poc_type==1: offset_for_non_ref_pic
    pub offset_for_non_ref_pic: i32,
    /// poc_type==1: offset_for_top_to_bottom_field
    pub offset_for_top_to_bottom_field: i32,
    /// poc_type==1: offset_for_ref_frame 列表
    pub offset_for_ref_frame: Vec<i32>,
    /// max_num_ref_frames
    pub max_num_ref_frames: u32,
    /// gaps_in_frame_num_value_allowed_flag
    pub gaps_in_frame_num_allowed: bool,
    /// 宽度 (宏块)
    pub pic_width_in_mbs: u32,
    /// 高度 (map unit)
    pub pic_height_in_map_units: u32,
    /// frame_mbs_only_flag
    pub frame_mbs_only: bool,
    /// mb_adaptive_frame_field_flag
    pub mb_adaptive_frame_field: bool,
    /// direct_8x8_inference_flag
    pub direct_8x8_inference: bool,
    /// 裁剪 (左, 右, 上, 下), 以裁剪单位计
    pub crop: [u32; 4],
    /// 裁剪后宽度 (像素)
    pub width: u32,
    /// 裁剪后高度 (像素)
    pub height: u32,
    /// 是否存在 VUI
    pub vui_present: bool,
    /// 最大重排序帧数 (bitstream_restriction 或推导值)
    pub max_num_reorder_frames: u32,
    /// 最大解码缓冲帧数 (bitstream_restriction 或按级别推导)
    pub max_dec_frame_buffering: u32,
}

/// 根据 SPS 和配置覆盖值得到的 DPB 规模
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpbSizing {
    /// 图像池槽位数
    pub num_frame_buffers: usize,
    /// 等待输出与调用方持有的图像上限
    pub max_dec_frame_buffering: u32,
    /// 允许的重排序深度
    pub max_num_reorder_frames: u32,
    /// 同时保留的参考帧上限 (至少为 1)
    pub max_num_ref_frames: u32,
}

impl Sps {
    /// 宽度 (宏块)
    pub fn mb_width(&self) -> usize {
        self.pic_width_in_mbs as usize
    }

    /// 帧高度 (宏块)
    pub fn mb_height(&self) -> usize {
        (self.pic_height_in_map_units * if self.frame_mbs_only { 1 } else { 2 }) as usize
    }

    /// 每帧宏块数
    pub fn mb_count(&self) -> usize {
        self.mb_width() * self.mb_height()
    }

    /// MaxFrameNum
    pub fn max_frame_num(&self) -> u32 {
        1 << self.log2_max_frame_num
    }

    /// ChromaArrayType
    pub fn chroma_array_type(&self) -> u32 {
        if self.separate_colour_plane {
            0
        } else {
            self.chroma_format_idc
        }
    }

    /// 检查本实现是否支持该序列
    pub fn check_supported(&self) -> AvcResult<()> {
        if !self.frame_mbs_only {
            return Err(AvcError::UnsupportedFeature(format!(
                "H264: 不支持场编码/MBAFF, sps_id={}",
                self.sps_id
            )));
        }
        if self.chroma_array_type() > 1 {
            return Err(AvcError::UnsupportedFeature(format!(
                "H264: 不支持的色度格式, chroma_format_idc={}, separate_colour_plane={}",
                self.chroma_format_idc, self.separate_colour_plane
            )));
        }
        if self.bit_depth_luma != 8 || self.bit_depth_chroma != 8 {
            return Err(AvcError::UnsupportedFeature(format!(
                "H264: 仅支持 8 位采样, bit_depth_luma={}, bit_depth_chroma={}",
                self.bit_depth_luma, self.bit_depth_chroma
            )));
        }
        Ok(())
    }

    /// 计算 DPB 规模, `max_frame_buffering` 为配置覆盖值
    pub fn dpb_sizing(&self, max_frame_buffering: Option<u32>) -> DpbSizing {
        let max_num_ref_frames = self.max_num_ref_frames.max(1);
        let max_dec_frame_buffering = max_frame_buffering
            .unwrap_or(self.max_dec_frame_buffering)
            .min(MAX_FRAME_BUFFERS as u32 - 1);
        let max_num_reorder_frames = self.max_num_reorder_frames.min(max_dec_frame_buffering);
        let frames = max_dec_frame_buffering
            .max(max_num_ref_frames)
            .max(max_num_reorder_frames) as usize;
        DpbSizing {
            num_frame_buffers: (frames + 1).min(MAX_FRAME_BUFFERS),
            max_dec_frame_buffering,
            max_num_reorder_frames,
            max_num_ref_frames,
        }
    }
}

/// PPS 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    /// pic_parameter_set_id
    pub pps_id: u32,
    /// 引用的 seq_parameter_set_id
    pub sps_id: u32,
    /// entropy_coding_mode_flag (true 为 CABAC)
    pub entropy_coding_mode: bool,
    /// bottom_field_pic_order_in_frame_present_flag
    pub bottom_field_pic_order_in_frame_present: bool,
    /// num_slice_groups_minus1 + 1
    pub num_slice_groups: u32,
    /// num_ref_idx_l0/l1_default_active_minus1 + 1
    pub num_ref_idx_default_active: [u32; 2],
    /// weighted_pred_flag
    pub weighted_pred: bool,
    /// weighted_bipred_idc
    pub weighted_bipred_idc: u32,
    /// 26 + pic_init_qp_minus26
    pub pic_init_qp: i32,
    /// 26 + pic_init_qs_minus26
    pub pic_init_qs: i32,
    /// chroma_qp_index_offset
    pub chroma_qp_index_offset: i32,
    /// second_chroma_qp_index_offset
    pub second_chroma_qp_index_offset: i32,
    /// deblocking_filter_control_present_flag
    pub deblocking_filter_control_present: bool,
    /// constrained_intra_pred_flag
    pub constrained_intra_pred: bool,
    /// redundant_pic_cnt_present_flag
    pub redundant_pic_cnt_present: bool,
    /// transform_8x8_mode_flag
    pub transform_8x8_mode: bool,
    /// 图像级量化矩阵
    pub scaling_lists: Option<ScalingLists>,
}

impl Pps {
    /// 检查本实现是否支持该图像参数集
    pub fn check_supported(&self) -> AvcResult<()> {
        if !self.entropy_coding_mode {
            return Err(AvcError::UnsupportedFeature(format!(
                "H264: 不支持 CAVLC 熵编码, pps_id={}",
                self.pps_id
            )));
        }
        if self.num_slice_groups > 1 {
            return Err(AvcError::UnsupportedFeature(format!(
                "H264: 不支持多 slice group, num_slice_groups={}",
                self.num_slice_groups
            )));
        }
        Ok(())
    }
}

/// 按 id 保存的参数集
///
/// 切片通过 `Arc` 共享参数集快照, 后续同 id 的参数集替换不影响已经排队的任务.
#[derive(Debug, Clone)]
pub struct ParameterSets {
    sps: Vec<Option<Arc<Sps>>>,
    pps: Vec<Option<Arc<Pps>>>,
}

impl Default for ParameterSets {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterSets {
    /// 创建空表
    pub fn new() -> Self {
        Self {
            sps: vec![None; MAX_SPS_COUNT],
            pps: vec![None; MAX_PPS_COUNT],
        }
    }

    /// 保存 SPS, 返回是否替换了内容不同的旧值
    pub fn insert_sps(&mut self, sps: Sps) -> bool {
        let id = sps.sps_id as usize % MAX_SPS_COUNT;
        let changed = self.sps[id].as_deref().is_some_and(|old| *old != sps);
        self.sps[id] = Some(Arc::new(sps));
        changed
    }

    /// 保存 PPS
    pub fn insert_pps(&mut self, pps: Pps) {
        let id = pps.pps_id as usize % MAX_PPS_COUNT;
        self.pps[id] = Some(Arc::new(pps));
    }

    /// 按 id 获取 SPS
    pub fn sps(&self, id: u32) -> Option<&Arc<Sps>> {
        self.sps.get(id as usize)?.as_ref()
    }

    /// 按 PPS id 获取 PPS 及其引用的 SPS
    pub fn active(&self, pps_id: u32) -> AvcResult<(Arc<Sps>, Arc<Pps>)> {
        let pps = self
            .pps
            .get(pps_id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                AvcError::MalformedBitstream(format!("H264: 未找到 PPS, pps_id={}", pps_id))
            })?;
        let sps = self.sps(pps.sps_id).ok_or_else(|| {
            AvcError::MalformedBitstream(format!("H264: 未找到 SPS, sps_id={}", pps.sps_id))
        })?;
        Ok((Arc::clone(sps), Arc::clone(pps)))
    }

    /// 清空全部参数集
    pub fn clear(&mut self) {
        self.sps.iter_mut().for_each(|s| *s = None);
        self.pps.iter_mut().for_each(|p| *p = None);
    }
}

// ============================================================
// 通用读取工具
// ============================================================

/// 读取 ue(v), 超过 `max` 时报告码流错误
pub(crate) fn read_ue_max(bc: &mut BitCache<'_>, name: &str, max: u32) -> AvcResult<u32> {
    let value = bc.read_ue(u32::MAX);
    if value > max {
        return Err(AvcError::MalformedBitstream(format!(
            "H264: {} 超出范围, value={}",
            name, value
        )));
    }
    Ok(value)
}

/// 读取 se(v), 超出 `[min, max]` 时报告码流错误
pub(crate) fn read_se_range(
    bc: &mut BitCache<'_>,
    name: &str,
    min: i32,
    max: i32,
) -> AvcResult<i32> {
    let value = bc.read_se(i32::MIN, i32::MAX);
    if !(min..=max).contains(&value) {
        return Err(AvcError::MalformedBitstream(format!(
            "H264: {} 超出范围, value={}",
            name, value
        )));
    }
    Ok(value)
}

// ============================================================
// SPS
// ============================================================

/// 从 NAL 负载 (不含头部字节) 解析 SPS
pub fn parse_sps(payload: &[u8]) -> AvcResult<Sps> {
    if payload.len() < 3 {
        return Err(AvcError::MalformedBitstream(format!(
            "H264: SPS 负载太短, len={}",
            payload.len()
        )));
    }
    let mut bc = BitCache::new(payload);

    let profile_idc = bc.read_bits(8) as u8;
    let constraint_set_flags = bc.read_bits(8) as u8;
    let level_idc = bc.read_bits(8) as u8;
    let sps_id = read_ue_max(&mut bc, "seq_parameter_set_id", MAX_SPS_COUNT as u32 - 1)?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    let mut bit_depth_luma = 8;
    let mut bit_depth_chroma = 8;
    let mut qpprime_y_zero_transform_bypass = false;
    let mut scaling_lists = None;

    if is_high_profile(profile_idc) {
        chroma_format_idc = read_ue_max(&mut bc, "chroma_format_idc", 3)?;
        if chroma_format_idc == 3 {
            separate_colour_plane = bc.read_flag();
        }
        bit_depth_luma = read_ue_max(&mut bc, "bit_depth_luma_minus8", 6)? + 8;
        bit_depth_chroma = read_ue_max(&mut bc, "bit_depth_chroma_minus8", 6)? + 8;
        qpprime_y_zero_transform_bypass = bc.read_flag();
        if bc.read_flag() {
            let count = if chroma_format_idc == 3 { 12 } else { 8 };
            scaling_lists = Some(parse_scaling_lists(&mut bc, count));
        }
    }

    let log2_max_frame_num = read_ue_max(&mut bc, "log2_max_frame_num_minus4", 12)? + 4;
    let poc_type = read_ue_max(&mut bc, "pic_order_cnt_type", 2)?;
    let mut log2_max_poc_lsb = 0;
    let mut delta_pic_order_always_zero_flag = false;
    let mut offset_for_non_ref_pic = 0;
    let mut offset_for_top_to_bottom_field = 0;
    let mut offset_for_ref_frame = Vec::new();
    match poc_type {
        0 => {
            log2_max_poc_lsb = read_ue_max(&mut bc, "log2_max_pic_order_cnt_lsb_minus4", 12)? + 4;
        }
        1 => {
            delta_pic_order_always_zero_flag = bc.read_flag();
            offset_for_non_ref_pic = read_se_range(
                &mut bc,
                "offset_for_non_ref_pic",
                -(1 << 30),
                (1 << 30) - 1,
            )?;
            offset_for_top_to_bottom_field = read_se_range(
                &mut bc,
                "offset_for_top_to_bottom_field",
                -(1 << 30),
                (1 << 30) - 1,
            )?;
            let cycle = read_ue_max(&mut bc, "num_ref_frames_in_pic_order_cnt_cycle", 255)?;
            for _ in 0..cycle {
                offset_for_ref_frame.push(bc.read_se(-(1 << 30), (1 << 30) - 1));
            }
        }
        _ => {}
    }

    let max_num_ref_frames = read_ue_max(&mut bc, "max_num_ref_frames", 16)?;
    let gaps_in_frame_num_allowed = bc.read_flag();
    let pic_width_in_mbs = read_ue_max(&mut bc, "pic_width_in_mbs_minus1", 1023)? + 1;
    let pic_height_in_map_units = read_ue_max(&mut bc, "pic_height_in_map_units_minus1", 1023)? + 1;
    let frame_mbs_only = bc.read_flag();
    let mb_adaptive_frame_field = !frame_mbs_only && bc.read_flag();
    let direct_8x8_inference = bc.read_flag();

    let mut crop = [0u32; 4];
    if bc.read_flag() {
        for c in &mut crop {
            *c = bc.read_ue(u32::MAX);
        }
    }

    let chroma_array_type = if separate_colour_plane {
        0
    } else {
        chroma_format_idc
    };
    let (crop_unit_x, crop_unit_y) = cropping_unit(chroma_array_type, frame_mbs_only);
    let raw_width = pic_width_in_mbs * 16;
    let raw_height = pic_height_in_map_units * 16 * if frame_mbs_only { 1 } else { 2 };
    let crop_x = (u64::from(crop[0]) + u64::from(crop[1])) * u64::from(crop_unit_x);
    let crop_y = (u64::from(crop[2]) + u64::from(crop[3])) * u64::from(crop_unit_y);
    if crop_x >= u64::from(raw_width) || crop_y >= u64::from(raw_height) {
        return Err(AvcError::MalformedBitstream(format!(
            "H264: 裁剪参数非法, raw={}x{}, crop_x={}, crop_y={}",
            raw_width, raw_height, crop_x, crop_y
        )));
    }
    let width = raw_width - crop_x as u32;
    let height = raw_height - crop_y as u32;

    let frame_size_in_mbs = pic_width_in_mbs * (raw_height / 16);
    let max_dpb_frames = (max_dpb_mbs(level_idc, constraint_set_flags) / frame_size_in_mbs).min(16);
    let mut max_dec_frame_buffering = max_dpb_frames;
    // 帧内 profile 且 constraint_set3 时没有重排序
    let mut max_num_reorder_frames = if matches!(profile_idc, 44 | 86 | 100 | 110 | 122 | 244)
        && constraint_set_flags & 0x10 != 0
    {
        0
    } else {
        max_dpb_frames
    };

    let vui_present = bc.read_flag();
    if vui_present {
        if let Some((reorder, buffering)) = parse_vui(&mut bc)? {
            max_dec_frame_buffering = buffering;
            max_num_reorder_frames = reorder.min(buffering);
        }
    }

    Ok(Sps {
        profile_idc,
        constraint_set_flags,
        level_idc,
        sps_id,
        chroma_format_idc,
        separate_colour_plane,
        bit_depth_luma,
        bit_depth_chroma,
        qpprime_y_zero_transform_bypass,
        scaling_lists,
        log2_max_frame_num,
        poc_type,
        log2_max_poc_lsb,
        delta_pic_order_always_zero_flag,
        offset_for_non_ref_pic,
        offset_for_top_to_bottom_field,
        offset_for_ref_frame,
        max_num_ref_frames,
        gaps_in_frame_num_allowed,
        pic_width_in_mbs,
        pic_height_in_map_units,
        frame_mbs_only,
        mb_adaptive_frame_field,
        direct_8x8_inference,
        crop,
        width,
        height,
        vui_present,
        max_num_reorder_frames,
        max_dec_frame_buffering,
    })
}

/// 是否为带 chroma_format_idc 等扩展字段的 profile
fn is_high_profile(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

/// 获取裁剪单位
fn cropping_unit(chroma_array_type: u32, frame_mbs_only: bool) -> (u32, u32) {
    let sub_width = match chroma_array_type {
        1 | 2 => 2,
        _ => 1,
    };
    let sub_height = if chroma_array_type == 1 { 2 } else { 1 };
    let height_mult = if frame_mbs_only { 1 } else { 2 };
    (sub_width, sub_height * height_mult)
}

/// 按级别查 MaxDpbMbs (表 A-1)
fn max_dpb_mbs(level_idc: u8, constraint_set_flags: u8) -> u32 {
    match level_idc {
        // level 1b 在 Baseline/Main 中以 11 + constraint_set3 表示
        11 if constraint_set_flags & 0x10 != 0 => 396,
        9 | 10 => 396,
        11 => 900,
        12 | 13 | 20 => 2376,
        21 => 4752,
        22 | 30 => 8100,
        31 => 18000,
        32 => 20480,
        40 | 41 => 32768,
        42 => 34816,
        50 => 110400,
        51 | 52 => 184320,
        _ => 696320,
    }
}

/// 解析 VUI, 返回 bitstream_restriction 中的 (max_num_reorder_frames, max_dec_frame_buffering)
fn parse_vui(bc: &mut BitCache<'_>) -> AvcResult<Option<(u32, u32)>> {
    // aspect_ratio_info_present_flag
    if bc.read_flag() && bc.read_bits(8) == 255 {
        bc.skip_bits(32); // sar_width, sar_height
    }
    // overscan_info_present_flag
    if bc.read_flag() {
        bc.skip_bits(1);
    }
    // video_signal_type_present_flag
    if bc.read_flag() {
        bc.skip_bits(4);
        if bc.read_flag() {
            bc.skip_bits(24);
        }
    }
    // chroma_loc_info_present_flag
    if bc.read_flag() {
        bc.read_ue(5);
        bc.read_ue(5);
    }
    // timing_info_present_flag
    if bc.read_flag() {
        let num_units_in_tick = bc.read_bits(32);
        let time_scale = bc.read_bits(32);
        bc.skip_bits(1); // fixed_frame_rate_flag
        if num_units_in_tick == 0 || time_scale == 0 {
            return Err(AvcError::MalformedBitstream(format!(
                "H264: VUI 时间信息非法, num_units_in_tick={}, time_scale={}",
                num_units_in_tick, time_scale
            )));
        }
    }
    let nal_hrd = bc.read_flag();
    if nal_hrd {
        skip_hrd_parameters(bc)?;
    }
    let vcl_hrd = bc.read_flag();
    if vcl_hrd {
        skip_hrd_parameters(bc)?;
    }
    if nal_hrd || vcl_hrd {
        bc.skip_bits(1); // low_delay_hrd_flag
    }
    bc.skip_bits(1); // pic_struct_present_flag

    if !bc.read_flag() {
        return Ok(None);
    }
    bc.skip_bits(1); // motion_vectors_over_pic_boundaries_flag
    bc.read_ue(16); // max_bytes_per_pic_denom
    bc.read_ue(16); // max_bits_per_mb_denom
    bc.read_ue(16); // log2_max_mv_length_horizontal
    bc.read_ue(16); // log2_max_mv_length_vertical
    let max_num_reorder_frames = read_ue_max(bc, "max_num_reorder_frames", 16)?;
    let max_dec_frame_buffering = read_ue_max(bc, "max_dec_frame_buffering", 16)?;
    Ok(Some((max_num_reorder_frames, max_dec_frame_buffering)))
}

fn skip_hrd_parameters(bc: &mut BitCache<'_>) -> AvcResult<()> {
    let cpb_cnt = read_ue_max(bc, "cpb_cnt_minus1", 31)? + 1;
    bc.skip_bits(8); // bit_rate_scale, cpb_size_scale
    for _ in 0..cpb_cnt {
        bc.read_ue(u32::MAX); // bit_rate_value_minus1
        bc.read_ue(u32::MAX); // cpb_size_value_minus1
        bc.skip_bits(1); // cbr_flag
    }
    bc.skip_bits(20);
    Ok(())
}

// ============================================================
// PPS
// ============================================================

/// 从 NAL 负载 (不含头部字节) 解析 PPS
pub fn parse_pps(payload: &[u8]) -> AvcResult<Pps> {
    if payload.is_empty() {
        return Err(AvcError::MalformedBitstream("H264: PPS 负载为空".into()));
    }
    let mut bc = BitCache::new(payload);

    let pps_id = read_ue_max(&mut bc, "pic_parameter_set_id", MAX_PPS_COUNT as u32 - 1)?;
    let sps_id = read_ue_max(&mut bc, "seq_parameter_set_id", MAX_SPS_COUNT as u32 - 1)?;
    let entropy_coding_mode = bc.read_flag();
    let bottom_field_pic_order_in_frame_present = bc.read_flag();
    let num_slice_groups = read_ue_max(&mut bc, "num_slice_groups_minus1", 7)? + 1;
    if num_slice_groups > 1 {
        skip_slice_groups(&mut bc, num_slice_groups)?;
    }
    let num_ref_idx_l0 = read_ue_max(&mut bc, "num_ref_idx_l0_default_active_minus1", 31)? + 1;
    let num_ref_idx_l1 = read_ue_max(&mut bc, "num_ref_idx_l1_default_active_minus1", 31)? + 1;
    let weighted_pred = bc.read_flag();
    let weighted_bipred_idc = bc.read_bits(2);
    if weighted_bipred_idc > 2 {
        return Err(AvcError::MalformedBitstream(format!(
            "H264: weighted_bipred_idc 非法, value={}",
            weighted_bipred_idc
        )));
    }
    let pic_init_qp = 26 + read_se_range(&mut bc, "pic_init_qp_minus26", -26, 25)?;
    let pic_init_qs = 26 + read_se_range(&mut bc, "pic_init_qs_minus26", -26, 25)?;
    let chroma_qp_index_offset = read_se_range(&mut bc, "chroma_qp_index_offset", -12, 12)?;
    let deblocking_filter_control_present = bc.read_flag();
    let constrained_intra_pred = bc.read_flag();
    let redundant_pic_cnt_present = bc.read_flag();

    let mut transform_8x8_mode = false;
    let mut scaling_lists = None;
    let mut second_chroma_qp_index_offset = chroma_qp_index_offset;
    if bc.more_rbsp_data() {
        transform_8x8_mode = bc.read_flag();
        if bc.read_flag() {
            let count = if transform_8x8_mode { 8 } else { 6 };
            scaling_lists = Some(parse_scaling_lists(&mut bc, count));
        }
        second_chroma_qp_index_offset =
            read_se_range(&mut bc, "second_chroma_qp_index_offset", -12, 12)?;
    }

    Ok(Pps {
        pps_id,
        sps_id,
        entropy_coding_mode,
        bottom_field_pic_order_in_frame_present,
        num_slice_groups,
        num_ref_idx_default_active: [num_ref_idx_l0, num_ref_idx_l1],
        weighted_pred,
        weighted_bipred_idc,
        pic_init_qp,
        pic_init_qs,
        chroma_qp_index_offset,
        second_chroma_qp_index_offset,
        deblocking_filter_control_present,
        constrained_intra_pred,
        redundant_pic_cnt_present,
        transform_8x8_mode,
        scaling_lists,
    })
}

/// 跳过 slice group 映射语法
fn skip_slice_groups(bc: &mut BitCache<'_>, num_slice_groups: u32) -> AvcResult<()> {
    let map_type = read_ue_max(bc, "slice_group_map_type", 6)?;
    match map_type {
        0 => {
            for _ in 0..num_slice_groups {
                bc.read_ue(u32::MAX); // run_length_minus1
            }
        }
        2 => {
            for _ in 1..num_slice_groups {
                bc.read_ue(u32::MAX); // top_left
                bc.read_ue(u32::MAX); // bottom_right
            }
        }
        3..=5 => {
            bc.skip_bits(1); // slice_group_change_direction_flag
            bc.read_ue(u32::MAX); // slice_group_change_rate_minus1
        }
        6 => {
            let map_units = read_ue_max(bc, "pic_size_in_map_units_minus1", 1 << 20)? + 1;
            let bits = u32::BITS - (num_slice_groups - 1).leading_zeros();
            bc.skip_bits(u64::from(map_units) * u64::from(bits));
        }
        _ => {}
    }
    Ok(())
}

// ============================================================
// 量化矩阵
// ============================================================

/// 解析 `count` 个量化矩阵, 缺失矩阵按回退规则 A 处理 (回退到默认矩阵或前一个矩阵)
fn parse_scaling_lists(bc: &mut BitCache<'_>, count: usize) -> ScalingLists {
    let mut lists = ScalingLists {
        list_4x4: [[0; 16]; 6],
        list_8x8: [[0; 64]; 2],
    };
    for idx in 0..count {
        let present = bc.read_flag();
        if idx < 6 {
            let default = if idx < 3 {
                DEFAULT_SCALING_4X4_INTRA
            } else {
                DEFAULT_SCALING_4X4_INTER
            };
            lists.list_4x4[idx] = if present {
                parse_scaling_list::<16>(bc).unwrap_or(default)
            } else if idx == 0 || idx == 3 {
                default
            } else {
                lists.list_4x4[idx - 1]
            };
        } else {
            let idx8 = idx - 6;
            let default = if idx8 % 2 == 0 {
                DEFAULT_SCALING_8X8_INTRA
            } else {
                DEFAULT_SCALING_8X8_INTER
            };
            let parsed = if present {
                parse_scaling_list::<64>(bc).unwrap_or(default)
            } else if idx8 < 2 {
                default
            } else {
                lists.list_8x8[(idx8 - 2) % 2]
            };
            // 4:4:4 的色度 8x8 矩阵读取后丢弃
            if idx8 < 2 {
                lists.list_8x8[idx8] = parsed;
            }
        }
    }
    for idx8 in count.saturating_sub(6)..2 {
        lists.list_8x8[idx8] = if idx8 == 0 {
            DEFAULT_SCALING_8X8_INTRA
        } else {
            DEFAULT_SCALING_8X8_INTER
        };
    }
    lists
}

/// 解析一个量化矩阵, 返回 None 表示 useDefaultScalingMatrixFlag
fn parse_scaling_list<const N: usize>(bc: &mut BitCache<'_>) -> Option<[u8; N]> {
    let mut list = [0u8; N];
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for (idx, slot) in list.iter_mut().enumerate() {
        if next_scale != 0 {
            let delta_scale = bc.read_se(-128, 127);
            next_scale = (last_scale + delta_scale + 256) % 256;
            if idx == 0 && next_scale == 0 {
                return None;
            }
        }
        let cur_scale = if next_scale == 0 {
            last_scale
        } else {
            next_scale
        };
        *slot = cur_scale as u8;
        last_scale = cur_scale;
    }
    Some(list)
}
