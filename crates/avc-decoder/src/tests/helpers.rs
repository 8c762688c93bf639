use std::collections::VecDeque;

use avc_core::bitwriter::insert_emulation_prevention;
use avc_core::{AvcError, BitCache, BitWriter};

use crate::cabac::{CabacEncoder, init_mode};
use crate::config::DecoderConfig;
use crate::decoder::Decoder;
use crate::nal::{CodedUnit, NalHeader, NalUnitType};
use crate::parameter_sets::{ParameterSets, parse_pps, parse_sps};
use crate::picture::Frame;
use crate::refs::{MmcoOp, ReferenceSet, iter_bits};
use crate::slice::{SliceHeader, parse_slice_header};

/// 测试序列的 log2(MaxFrameNum)
pub const LOG2_MAX_FRAME_NUM: u32 = 4;
/// 测试序列的 log2(MaxPicOrderCntLsb)
pub const LOG2_MAX_POC_LSB: u32 = 8;
/// 4:2:0 I_PCM 宏块的采样数
pub const PCM_SAMPLES: usize = 256 + 128;

/// 测试序列参数
#[derive(Debug, Clone)]
pub struct SeqConfig {
    pub sps_id: u32,
    pub mb_width: u32,
    pub mb_height: u32,
    pub max_num_ref_frames: u32,
    pub gaps_allowed: bool,
    pub poc_type: u32,
    /// VUI bitstream_restriction: (max_num_reorder_frames, max_dec_frame_buffering)
    pub restriction: Option<(u32, u32)>,
    pub redundant_pic_cnt_present: bool,
}

impl Default for SeqConfig {
    fn default() -> Self {
        Self {
            sps_id: 0,
            mb_width: 2,
            mb_height: 2,
            max_num_ref_frames: 4,
            gaps_allowed: false,
            poc_type: 0,
            restriction: Some((2, 4)),
            redundant_pic_cnt_present: false,
        }
    }
}

impl SeqConfig {
    pub fn mb_count(&self) -> u32 {
        self.mb_width * self.mb_height
    }
}

/// 一个测试切片
#[derive(Debug, Clone)]
pub struct SliceDesc {
    pub idr: bool,
    pub ref_idc: u8,
    /// true 为全 I_PCM 的 I 切片, false 为全 P_Skip 的 P 切片
    pub intra: bool,
    pub frame_num: u32,
    pub poc_lsb: u32,
    pub idr_pic_id: u32,
    pub first_mb: u32,
    /// 本切片编码的宏块数, None 表示直到图像末尾
    pub mb_count: Option<u32>,
    /// I_PCM 样本值
    pub fill: u8,
    pub redundant_pic_cnt: u32,
    pub no_output_of_prior_pics: bool,
    /// 非空时使用自适应标记
    pub mmco: Vec<MmcoOp>,
}

impl SliceDesc {
    /// IDR 图像
    pub fn idr(poc_lsb: u32, fill: u8) -> Self {
        Self {
            idr: true,
            ref_idc: 3,
            intra: true,
            frame_num: 0,
            poc_lsb,
            idr_pic_id: 0,
            first_mb: 0,
            mb_count: None,
            fill,
            redundant_pic_cnt: 0,
            no_output_of_prior_pics: false,
            mmco: Vec::new(),
        }
    }

    /// 非 IDR 的参考 I 图像
    pub fn intra(frame_num: u32, poc_lsb: u32, fill: u8) -> Self {
        Self {
            idr: false,
            frame_num,
            ..Self::idr(poc_lsb, fill)
        }
    }

    /// 参考 P 图像 (全部 P_Skip)
    pub fn p(frame_num: u32, poc_lsb: u32) -> Self {
        Self {
            intra: false,
            ..Self::intra(frame_num, poc_lsb, 0)
        }
    }

    /// 改为非参考图像
    pub fn non_ref(mut self) -> Self {
        self.ref_idc = 0;
        self
    }

    /// 只编码 `[first_mb, first_mb + count)` 的宏块
    pub fn part(mut self, first_mb: u32, count: u32) -> Self {
        self.first_mb = first_mb;
        self.mb_count = Some(count);
        self
    }

    pub fn with_idr_pic_id(mut self, id: u32) -> Self {
        self.idr_pic_id = id;
        self
    }

    pub fn with_mmco(mut self, ops: Vec<MmcoOp>) -> Self {
        self.mmco = ops;
        self
    }

    pub fn redundant(mut self, cnt: u32) -> Self {
        self.redundant_pic_cnt = cnt;
        self
    }

    pub fn no_output_of_prior_pics(mut self) -> Self {
        self.no_output_of_prior_pics = true;
        self
    }
}

// ============================================================
// 码流构造
// ============================================================

fn finish_nal(nal_type: NalUnitType, ref_idc: u8, rbsp: &[u8]) -> Vec<u8> {
    let mut nal = vec![NalHeader::new(nal_type, ref_idc).to_byte()];
    nal.extend_from_slice(&insert_emulation_prevention(rbsp));
    nal
}

/// 含头部字节的 SPS NAL (Main profile, level 3.0)
pub fn build_sps_nal(cfg: &SeqConfig) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bits(77, 8);
    w.write_bits(0, 8);
    w.write_bits(30, 8);
    w.write_ue(cfg.sps_id);
    w.write_ue(LOG2_MAX_FRAME_NUM - 4);
    w.write_ue(cfg.poc_type);
    match cfg.poc_type {
        0 => w.write_ue(LOG2_MAX_POC_LSB - 4),
        1 => {
            w.write_flag(true); // delta_pic_order_always_zero_flag
            w.write_se(-1); // offset_for_non_ref_pic
            w.write_se(0);
            w.write_ue(1);
            w.write_se(2);
        }
        _ => {}
    }
    w.write_ue(cfg.max_num_ref_frames);
    w.write_flag(cfg.gaps_allowed);
    w.write_ue(cfg.mb_width - 1);
    w.write_ue(cfg.mb_height - 1);
    w.write_flag(true); // frame_mbs_only_flag
    w.write_flag(true); // direct_8x8_inference_flag
    w.write_flag(false); // frame_cropping_flag
    match cfg.restriction {
        Some((reorder, buffering)) => {
            w.write_flag(true);
            // aspect, overscan, video_signal, chroma_loc, timing, nal_hrd, vcl_hrd, pic_struct
            for _ in 0..8 {
                w.write_flag(false);
            }
            w.write_flag(true); // bitstream_restriction_flag
            w.write_flag(true);
            w.write_ue(2);
            w.write_ue(1);
            w.write_ue(16);
            w.write_ue(16);
            w.write_ue(reorder);
            w.write_ue(buffering);
        }
        None => w.write_flag(false),
    }
    w.write_trailing_bits();
    finish_nal(NalUnitType::Sps, 3, &w.finish())
}

/// 含头部字节的 PPS NAL (CABAC, 单参考, 去块参数出现在切片头)
pub fn build_pps_nal(cfg: &SeqConfig) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_ue(0);
    w.write_ue(cfg.sps_id);
    w.write_flag(true); // entropy_coding_mode_flag
    w.write_flag(false); // bottom_field_pic_order_in_frame_present_flag
    w.write_ue(0); // num_slice_groups_minus1
    w.write_ue(0);
    w.write_ue(0);
    w.write_flag(false); // weighted_pred_flag
    w.write_bits(0, 2);
    w.write_se(0); // pic_init_qp_minus26
    w.write_se(0);
    w.write_se(0);
    w.write_flag(true); // deblocking_filter_control_present_flag
    w.write_flag(false);
    w.write_flag(cfg.redundant_pic_cnt_present);
    w.write_trailing_bits();
    finish_nal(NalUnitType::Pps, 3, &w.finish())
}

fn write_marking(w: &mut BitWriter, desc: &SliceDesc) {
    if desc.idr {
        w.write_flag(desc.no_output_of_prior_pics);
        w.write_flag(false); // long_term_reference_flag
        return;
    }
    w.write_flag(!desc.mmco.is_empty());
    if desc.mmco.is_empty() {
        return;
    }
    for op in &desc.mmco {
        match *op {
            MmcoOp::ForgetShort {
                difference_of_pic_nums_minus1,
            } => {
                w.write_ue(1);
                w.write_ue(difference_of_pic_nums_minus1);
            }
            MmcoOp::ForgetLong { long_term_pic_num } => {
                w.write_ue(2);
                w.write_ue(long_term_pic_num);
            }
            MmcoOp::ConvertShortToLong {
                difference_of_pic_nums_minus1,
                long_term_frame_idx,
            } => {
                w.write_ue(3);
                w.write_ue(difference_of_pic_nums_minus1);
                w.write_ue(long_term_frame_idx);
            }
            MmcoOp::TrimLong {
                max_long_term_frame_idx_plus1,
            } => {
                w.write_ue(4);
                w.write_ue(max_long_term_frame_idx_plus1);
            }
            MmcoOp::ClearAll => w.write_ue(5),
            MmcoOp::MarkCurrentLong {
                long_term_frame_idx,
            } => {
                w.write_ue(6);
                w.write_ue(long_term_frame_idx);
            }
        }
    }
    w.write_ue(0);
}

/// 含头部字节的切片 NAL
///
/// I 切片的宏块全部为 I_PCM, P 切片的宏块全部为 P_Skip.
pub fn build_slice_nal(cfg: &SeqConfig, desc: &SliceDesc) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_ue(desc.first_mb);
    w.write_ue(if desc.intra { 7 } else { 5 });
    w.write_ue(0);
    w.write_bits(desc.frame_num, LOG2_MAX_FRAME_NUM);
    if desc.idr {
        w.write_ue(desc.idr_pic_id);
    }
    if cfg.poc_type == 0 {
        w.write_bits(desc.poc_lsb, LOG2_MAX_POC_LSB);
    }
    if cfg.redundant_pic_cnt_present {
        w.write_ue(desc.redundant_pic_cnt);
    }
    if !desc.intra {
        w.write_flag(false); // num_ref_idx_active_override_flag
        w.write_flag(false); // ref_pic_list_modification_flag_l0
    }
    if desc.ref_idc != 0 {
        write_marking(&mut w, desc);
    }
    if !desc.intra {
        w.write_ue(0); // cabac_init_idc
    }
    w.write_se(0); // slice_qp_delta
    w.write_ue(1); // disable_deblocking_filter_idc

    let total = cfg.mb_count();
    let count = desc
        .mb_count
        .unwrap_or(total - desc.first_mb)
        .min(total - desc.first_mb);
    let mut enc = CabacEncoder::new(w, init_mode(desc.intra, 0), 26);
    let width = cfg.mb_width;
    for i in 0..count {
        let addr = desc.first_mb + i;
        if desc.intra {
            let left = addr % width != 0 && addr > desc.first_mb;
            let top = addr >= width && addr - width >= desc.first_mb;
            let inc = usize::from(left) + usize::from(top);
            enc.encode_bin(3 + inc, 1);
            enc.encode_terminate(1);
            enc.write_pcm_samples(&[desc.fill; PCM_SAMPLES]);
        } else {
            // 邻居全部为 P_Skip, ctxIdxInc 恒为 0
            enc.encode_bin(11, 1);
        }
        enc.encode_terminate(u32::from(i + 1 == count));
    }
    let rbsp = enc.finish().finish();

    let nal_type = if desc.idr {
        NalUnitType::SliceIdr
    } else {
        NalUnitType::Slice
    };
    finish_nal(nal_type, desc.ref_idc, &rbsp)
}

/// 解码顺序 I0 P6 b2 b4 P12 b8 b10, 小写为非参考图像
pub fn reorder_stream() -> Vec<Vec<u8>> {
    let cfg = SeqConfig::default();
    build_sequence(
        &cfg,
        &[
            SliceDesc::idr(0, 10),
            SliceDesc::p(1, 6),
            SliceDesc::p(2, 2).non_ref(),
            SliceDesc::p(2, 4).non_ref(),
            SliceDesc::p(2, 12),
            SliceDesc::p(3, 8).non_ref(),
            SliceDesc::p(3, 10).non_ref(),
        ],
    )
}

/// SPS, PPS 与全部切片
pub fn build_sequence(cfg: &SeqConfig, slices: &[SliceDesc]) -> Vec<Vec<u8>> {
    let mut nals = vec![build_sps_nal(cfg), build_pps_nal(cfg)];
    nals.extend(slices.iter().map(|s| build_slice_nal(cfg, s)));
    nals
}

/// 解析测试序列的参数集
pub fn build_param_sets(cfg: &SeqConfig) -> ParameterSets {
    let mut params = ParameterSets::new();
    let sps = build_sps_nal(cfg);
    let pps = build_pps_nal(cfg);
    params.insert_sps(parse_sps(&CodedUnit::parse(sps).expect("SPS 单元").payload).expect("解析 SPS"));
    params.insert_pps(parse_pps(&CodedUnit::parse(pps).expect("PPS 单元").payload).expect("解析 PPS"));
    params
}

/// 解析切片 NAL 的头部
pub fn parse_header(params: &ParameterSets, nal: Vec<u8>) -> SliceHeader {
    let unit = CodedUnit::parse(nal).expect("切片单元");
    let mut bc = BitCache::new(&unit.payload);
    parse_slice_header(&mut bc, unit.header, params).expect("解析切片头")
}

// ============================================================
// 解码驱动
// ============================================================

/// 测试日志输出到 libtest 捕获的标准输出, 重复初始化被忽略
pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn build_test_decoder() -> Decoder {
    init_test_logger();
    Decoder::new(DecoderConfig::new().synchronous()).expect("创建同步解码器")
}

pub fn build_threaded_decoder(threads: usize) -> Decoder {
    init_test_logger();
    Decoder::new(DecoderConfig::new().with_threads(threads)).expect("创建多线程解码器")
}

/// 取出全部可输出的帧
pub fn drain(dec: &mut Decoder, out: &mut Vec<Frame>) {
    while let Some(frame) = dec.wait_frame(false) {
        out.push(frame);
    }
}

/// 送入一个 NAL, 遇到背压时取帧后重试
pub fn feed(dec: &mut Decoder, nal: &[u8], out: &mut Vec<Frame>) {
    for _ in 0..32 {
        match dec.decode_nal(nal) {
            Ok(()) => {
                drain(dec, out);
                return;
            }
            Err(AvcError::ResourceExhausted(_)) => {
                let before = out.len();
                drain(dec, out);
                assert!(out.len() > before, "背压时应至少能取出一帧");
            }
            Err(err) => panic!("解码失败: {}", err),
        }
    }
    panic!("背压重试次数过多");
}

/// 解码整个序列并 flush, 返回按输出顺序排列的帧
pub fn decode_stream(dec: &mut Decoder, nals: &[Vec<u8>]) -> Vec<Frame> {
    let mut out = Vec::new();
    for nal in nals {
        feed(dec, nal, &mut out);
    }
    dec.flush();
    drain(dec, &mut out);
    out
}

/// 借出取到的帧并最多保留 `max_held` 张, 返回按输出顺序排列的 POC
///
/// 背压且取不到新帧时归还最早借出的帧后重试.
pub fn decode_holding(dec: &mut Decoder, nals: &[Vec<u8>], max_held: usize) -> Vec<i32> {
    let mut held = VecDeque::new();
    let mut order = Vec::new();
    for nal in nals {
        let mut attempts = 0;
        loop {
            let result = dec.decode_nal(nal);
            let before = order.len();
            take_borrowed(dec, &mut held, &mut order, max_held);
            match result {
                Ok(()) => break,
                Err(AvcError::ResourceExhausted(_)) => {
                    if order.len() == before {
                        let oldest: Frame = held.pop_front().expect("背压时应有借出的帧可归还");
                        dec.return_frame(oldest.handle()).expect("归还借出的帧");
                    }
                }
                Err(err) => panic!("解码失败: {}", err),
            }
            attempts += 1;
            assert!(attempts < 32, "背压重试次数过多");
        }
    }
    dec.flush();
    take_borrowed(dec, &mut held, &mut order, max_held);
    for frame in held {
        dec.return_frame(frame.handle()).expect("归还借出的帧");
    }
    order
}

fn take_borrowed(
    dec: &mut Decoder,
    held: &mut VecDeque<Frame>,
    order: &mut Vec<i32>,
    max_held: usize,
) {
    while let Some(frame) = dec.wait_frame(true) {
        order.push(frame.poc);
        held.push_back(frame);
        while held.len() > max_held {
            if let Some(oldest) = held.pop_front() {
                dec.return_frame(oldest.handle()).expect("归还借出的帧");
            }
        }
    }
}

pub fn pocs(frames: &[Frame]) -> Vec<i32> {
    frames.iter().map(|f| f.poc).collect()
}

/// 短期参考的 FrameNum, 升序
pub fn short_term_frame_nums(refs: &ReferenceSet) -> Vec<i32> {
    let mut nums: Vec<i32> = iter_bits(refs.short_term_only())
        .map(|s| refs.entry(s).frame_num)
        .collect();
    nums.sort_unstable();
    nums
}

/// 帧左上角的亮度样本
pub fn first_luma(frame: &Frame) -> u8 {
    frame.planes().y[0]
}
