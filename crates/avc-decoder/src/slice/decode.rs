//! 切片宏块循环 (7.3.4 slice_data 与 7.3.5 macroblock_layer, 仅 CABAC).
//!
//! 每个宏块: 熵解码语法元素, 推导邻居上下文, 交给重建核, 然后写入图像的宏块元数据.
//! 出错时停止当前切片, 已解码的宏块保留, 其余由图像完成时的隐藏处理.

use avc_core::{AvcError, AvcResult, BitCache, BitCachePos};
use log::debug;

use super::neighbors::{
    MB_CHROMA_PRED, MB_DIRECT, MB_I_NXN, MB_INTRA, MB_PCM, MB_SKIP,
    MB_TRANSFORM_8X8, MbCtx, NeighborRing, block_left, block_top, ctx_inc, ctx_sum,
};
use super::residual::{
    BlockCat, CHROMA_AC, CHROMA_DC, LUMA_4X4, LUMA_8X8, LUMA_AC, LUMA_DC, decode_residual_block,
};
use super::syntax::*;
use super::{
    MacroblockParams, MbKind, PRED_BI, PRED_L0, PRED_L1, Partition, Residual, SliceParams,
    SubMb, SubPartition,
};
use crate::cabac::ArithmeticDecoder;
use crate::kernels::{ReconstructionKernels, RefPictures, SliceContext, mb_class};
use crate::picture::{MbInfo, PictureData};

/// 切片解码结果
#[derive(Debug, Default)]
pub struct SliceOutcome {
    /// 本切片新解码的宏块数
    pub decoded: usize,
    /// 使切片提前结束的错误
    pub error: Option<AvcError>,
}

/// B 切片 mb_type 4..=21 的两个分区预测方向
const B_PARTITION_PRED: [[u8; 2]; 9] = [
    [PRED_L0, PRED_L0],
    [PRED_L1, PRED_L1],
    [PRED_L0, PRED_L1],
    [PRED_L1, PRED_L0],
    [PRED_L0, PRED_BI],
    [PRED_L1, PRED_BI],
    [PRED_BI, PRED_L0],
    [PRED_BI, PRED_L1],
    [PRED_BI, PRED_BI],
];

/// B 切片 sub_mb_type 1..=12 的分区与预测方向
const B_SUB_TYPES: [(SubPartition, u8); 12] = [
    (SubPartition::S8x8, PRED_L0),
    (SubPartition::S8x8, PRED_L1),
    (SubPartition::S8x8, PRED_BI),
    (SubPartition::S8x4, PRED_L0),
    (SubPartition::S4x8, PRED_L0),
    (SubPartition::S8x4, PRED_L1),
    (SubPartition::S4x8, PRED_L1),
    (SubPartition::S8x4, PRED_BI),
    (SubPartition::S4x8, PRED_BI),
    (SubPartition::S4x4, PRED_L0),
    (SubPartition::S4x4, PRED_L1),
    (SubPartition::S4x4, PRED_BI),
];

/// P 切片 sub_mb_type 0..=3
const P_SUB_TYPES: [SubPartition; 4] = [
    SubPartition::S8x8,
    SubPartition::S8x4,
    SubPartition::S4x8,
    SubPartition::S4x4,
];

/// 以 4x4 块为单位的矩形
#[derive(Debug, Clone, Copy)]
struct Rect {
    x: usize,
    y: usize,
    w: usize,
    h: usize,
}

impl Rect {
    /// 覆盖的 8x8 象限
    fn quadrants(&self) -> Rect {
        Rect {
            x: self.x / 2,
            y: self.y / 2,
            w: (self.w / 2).max(1),
            h: (self.h / 2).max(1),
        }
    }
}

/// luma4x4BlkIdx 对应的光栅坐标
#[inline]
fn blk_xy(blk: usize) -> (usize, usize) {
    let (b8, b4) = (blk / 4, blk % 4);
    ((b8 % 2) * 2 + b4 % 2, (b8 / 2) * 2 + b4 / 2)
}

/// 解码一个切片的 slice_data()
///
/// `start` 为切片头之后的读取位置, 宏块依次写入 `pic`.
pub fn decode_slice(
    slice: &SliceParams,
    payload: &[u8],
    start: BitCachePos,
    pic: &mut PictureData,
    refs: &RefPictures<'_>,
    kernels: &dyn ReconstructionKernels,
) -> SliceOutcome {
    let geometry = slice.geometry;
    let mb_count = geometry.mb_count();
    let first_mb = slice.first_mb as usize;
    let bits = BitCache::resume(payload, start);
    let mut decoder = MacroblockDecoder {
        slice,
        dec: ArithmeticDecoder::new(bits, slice.cabac_init_mode, slice.slice_qp),
        ring: NeighborRing::new(geometry.mb_width, first_mb),
        mb: MacroblockParams::new(first_mb, geometry.mb_width),
        cur: MbCtx::current(),
        qp: slice.slice_qp,
        prev_qp_delta_nonzero: false,
    };
    let ctx = SliceContext { slice, refs };

    let mut outcome = SliceOutcome::default();
    let mut addr = first_mb;
    loop {
        if addr >= mb_count {
            outcome.error = Some(AvcError::MalformedBitstream(format!(
                "H264: 切片数据越过图像末尾, first_mb={}",
                first_mb
            )));
            break;
        }
        if pic.mbs[addr].is_decoded() {
            outcome.error = Some(AvcError::MalformedBitstream(format!(
                "H264: 宏块重复解码, mb_addr={}",
                addr
            )));
            break;
        }
        if let Err(err) = decoder.decode_macroblock(addr) {
            outcome.error = Some(err);
            break;
        }

        kernels.reconstruct_mb(&ctx, &decoder.mb, pic);
        pic.mbs[addr] = decoder.mb_info();
        decoder.ring.store(addr, decoder.cur);
        outcome.decoded += 1;

        if decode_end_of_slice(&mut decoder.dec) {
            break;
        }
        addr += 1;
    }

    debug!(
        "H264: 切片结束, type={}, first_mb={}, decoded={}, error={:?}",
        slice.slice_type, first_mb, outcome.decoded, outcome.error
    );
    outcome
}

/// 单个切片的宏块解码状态
struct MacroblockDecoder<'s, 'd> {
    slice: &'s SliceParams,
    dec: ArithmeticDecoder<'d>,
    ring: NeighborRing,
    mb: MacroblockParams,
    /// 当前宏块的上下文, 解码结束后存入 `ring`
    cur: MbCtx,
    /// QP_Y,PRED
    qp: i32,
    prev_qp_delta_nonzero: bool,
}

impl MacroblockDecoder<'_, '_> {
    // ============================================================
    // 宏块层
    // ============================================================

    fn decode_macroblock(&mut self, addr: usize) -> AvcResult<()> {
        let slice_type = self.slice.slice_type;
        self.mb.reset(addr, self.slice.geometry.mb_width);
        self.cur = MbCtx::current();
        let left = *self.ring.left(addr);
        let top = *self.ring.top(addr);

        if !slice_type.is_intra() {
            let inc = ctx_sum(
                left.available() && !left.has(MB_SKIP),
                top.available() && !top.has(MB_SKIP),
            );
            if decode_mb_skip(&mut self.dec, slice_type.is_b(), inc) {
                self.decode_skip();
                return Ok(());
            }
        }

        let intra_type = if slice_type.is_intra() {
            let inc = ctx_sum(
                left.available() && !left.has(MB_I_NXN),
                top.available() && !top.has(MB_I_NXN),
            );
            Some(decode_i_mb_type(&mut self.dec, inc))
        } else if slice_type.is_b() {
            let inc = ctx_sum(
                left.available() && !left.has(MB_DIRECT),
                top.available() && !top.has(MB_DIRECT),
            );
            let mb_type = decode_b_mb_type(&mut self.dec, inc);
            if mb_type >= 23 {
                Some(mb_type - 23)
            } else {
                self.set_b_kind(mb_type);
                None
            }
        } else {
            let mb_type = decode_p_mb_type(&mut self.dec);
            if mb_type >= 5 {
                Some(mb_type - 5)
            } else {
                self.set_p_kind(mb_type);
                None
            }
        };

        match intra_type {
            Some(25) => return self.decode_pcm(),
            Some(i_type) => self.decode_intra_pred(i_type, &left, &top),
            None => self.decode_inter_pred(&left, &top)?,
        }

        if !matches!(self.mb.kind, MbKind::I16x16 { .. }) {
            self.decode_cbp(&left, &top);
            if self.inter_transform_8x8_allowed() {
                let inc = self.transform_8x8_inc(&left, &top);
                self.mb.transform_8x8 = decode_transform_8x8(&mut self.dec, inc);
                if self.mb.transform_8x8 {
                    self.cur.flags |= MB_TRANSFORM_8X8;
                }
            }
        }
        self.cur.cbp_luma = self.mb.cbp_luma;
        self.cur.cbp_chroma = self.mb.cbp_chroma;

        let is_i16x16 = matches!(self.mb.kind, MbKind::I16x16 { .. });
        if self.mb.cbp_luma > 0 || self.mb.cbp_chroma > 0 || is_i16x16 {
            let delta = decode_qp_delta(&mut self.dec, self.prev_qp_delta_nonzero)?;
            self.prev_qp_delta_nonzero = delta != 0;
            self.qp = (self.qp + delta + 52) % 52;
            self.mb.qp = self.qp;
            self.decode_residual(&left, &top)?;
        } else {
            self.prev_qp_delta_nonzero = false;
            self.mb.qp = self.qp;
        }
        Ok(())
    }

    fn decode_skip(&mut self) {
        let is_b = self.slice.slice_type.is_b();
        self.cur.flags |= MB_SKIP;
        if is_b {
            self.cur.flags |= MB_DIRECT;
            self.mb.kind = MbKind::BSkip;
        } else {
            self.mb.kind = MbKind::PSkip;
            self.mb.ref_idx[0] = [0; 4];
        }
        self.cur.cbp_luma = 0;
        self.mb.qp = self.qp;
        self.prev_qp_delta_nonzero = false;
    }

    fn decode_pcm(&mut self) -> AvcResult<()> {
        let chroma = if self.slice.geometry.chroma_array_type == 0 {
            0
        } else {
            2 * 64
        };
        self.mb.kind = MbKind::Pcm;
        self.mb.residual.pcm.resize(256 + chroma, 0);
        self.dec.read_pcm_samples(&mut self.mb.residual.pcm);

        self.cur.flags |= MB_INTRA | MB_PCM;
        self.cur.cbp_luma = 0x0F;
        self.cur.cbp_chroma = 2;
        self.cur.cbf_luma = 0xFFFF;
        self.cur.cbf_dc = 0x07;
        self.cur.cbf_chroma_ac = [0x0F; 2];
        self.mb.cbp_luma = 0x0F;
        self.mb.cbp_chroma = 2;
        // 去块时 I_PCM 的 QP 视为 0, QP_Y,PRED 保持不变
        self.mb.qp = 0;
        self.prev_qp_delta_nonzero = false;
        Ok(())
    }

    /// 写入图像的宏块元数据
    fn mb_info(&self) -> MbInfo {
        MbInfo {
            class: mb_class(&self.mb.kind),
            qp: self.mb.qp.clamp(0, 51) as u8,
            cbp: self.mb.cbp_luma | self.mb.cbp_chroma << 4,
            transform_8x8: self.mb.transform_8x8,
            slice_num: self.slice.slice_num,
            nonzero_4x4: self.cur.cbf_luma,
            deblock: self.slice.deblock,
        }
    }

    // ============================================================
    // 帧内预测
    // ============================================================

    fn decode_intra_pred(&mut self, i_type: u32, left: &MbCtx, top: &MbCtx) {
        self.cur.flags |= MB_INTRA;
        if i_type == 0 {
            self.cur.flags |= MB_I_NXN;
            if self.slice.transform_8x8_mode {
                let inc = self.transform_8x8_inc(left, top);
                self.mb.transform_8x8 = decode_transform_8x8(&mut self.dec, inc);
            }
            if self.mb.transform_8x8 {
                self.cur.flags |= MB_TRANSFORM_8X8;
                let mut modes = [None; 4];
                for mode in modes.iter_mut() {
                    *mode = decode_intra_pred_mode(&mut self.dec);
                }
                self.mb.kind = MbKind::I8x8 { modes };
            } else {
                let mut modes = [None; 16];
                for mode in modes.iter_mut() {
                    *mode = decode_intra_pred_mode(&mut self.dec);
                }
                self.mb.kind = MbKind::I4x4 { modes };
            }
        } else {
            let i_type = i_type - 1;
            self.mb.kind = MbKind::I16x16 {
                pred_mode: (i_type % 4) as u8,
            };
            self.mb.cbp_chroma = ((i_type / 4) % 3) as u8;
            self.mb.cbp_luma = if i_type >= 12 { 0x0F } else { 0 };
        }

        if self.slice.geometry.chroma_array_type != 0 {
            let cond = |n: &MbCtx| {
                n.available() && n.has(MB_INTRA) && !n.has(MB_PCM) && n.has(MB_CHROMA_PRED)
            };
            let inc = ctx_sum(cond(left), cond(top));
            self.mb.intra_chroma_pred_mode = decode_intra_chroma_pred_mode(&mut self.dec, inc);
            if self.mb.intra_chroma_pred_mode != 0 {
                self.cur.flags |= MB_CHROMA_PRED;
            }
        }
    }

    // ============================================================
    // 帧间预测
    // ============================================================

    fn set_p_kind(&mut self, mb_type: u32) {
        let partition = match mb_type {
            0 => Partition::P16x16,
            1 => Partition::P16x8,
            2 => Partition::P8x16,
            _ => Partition::P8x8,
        };
        self.mb.kind = MbKind::Inter {
            partition,
            pred: [PRED_L0; 2],
            sub: [SubMb::default(); 4],
        };
    }

    fn set_b_kind(&mut self, mb_type: u32) {
        self.mb.kind = match mb_type {
            0 => {
                self.cur.flags |= MB_DIRECT;
                MbKind::BDirect16x16
            }
            1..=3 => MbKind::Inter {
                partition: Partition::P16x16,
                pred: [mb_type as u8; 2],
                sub: [SubMb::default(); 4],
            },
            4..=21 => MbKind::Inter {
                partition: if mb_type % 2 == 0 {
                    Partition::P16x8
                } else {
                    Partition::P8x16
                },
                pred: B_PARTITION_PRED[(mb_type as usize - 4) / 2],
                sub: [SubMb::default(); 4],
            },
            _ => MbKind::Inter {
                partition: Partition::P8x8,
                pred: [0; 2],
                sub: [SubMb::default(); 4],
            },
        };
    }

    /// mb_pred / sub_mb_pred 的帧间部分
    fn decode_inter_pred(&mut self, left: &MbCtx, top: &MbCtx) -> AvcResult<()> {
        let MbKind::Inter {
            partition,
            pred,
            mut sub,
        } = self.mb.kind
        else {
            // B_Direct_16x16 没有预测语法
            return Ok(());
        };

        // (矩形, 预测方向, 是否直接预测)
        let mut parts: Vec<(Rect, u8, bool)> = Vec::with_capacity(4);
        match partition {
            Partition::P16x16 => parts.push((Rect { x: 0, y: 0, w: 4, h: 4 }, pred[0], false)),
            Partition::P16x8 => {
                for (i, &p) in pred.iter().enumerate() {
                    parts.push((Rect { x: 0, y: 2 * i, w: 4, h: 2 }, p, false));
                }
            }
            Partition::P8x16 => {
                for (i, &p) in pred.iter().enumerate() {
                    parts.push((Rect { x: 2 * i, y: 0, w: 2, h: 4 }, p, false));
                }
            }
            Partition::P8x8 => {
                let is_b = self.slice.slice_type.is_b();
                for s in sub.iter_mut() {
                    if is_b {
                        let sub_type = decode_b_sub_mb_type(&mut self.dec) as usize;
                        *s = match sub_type {
                            0 => SubMb {
                                partition: SubPartition::S8x8,
                                pred: 0,
                                direct: true,
                            },
                            t => {
                                let (partition, pred) = B_SUB_TYPES[(t - 1).min(11)];
                                SubMb {
                                    partition,
                                    pred,
                                    direct: false,
                                }
                            }
                        };
                    } else {
                        let sub_type = decode_p_sub_mb_type(&mut self.dec) as usize;
                        *s = SubMb {
                            partition: P_SUB_TYPES[sub_type.min(3)],
                            pred: PRED_L0,
                            direct: false,
                        };
                    }
                }
                self.mb.kind = MbKind::Inter {
                    partition,
                    pred,
                    sub,
                };
                for (q, s) in sub.iter().enumerate() {
                    let (qx, qy) = (2 * (q % 2), 2 * (q / 2));
                    parts.push((Rect { x: qx, y: qy, w: 2, h: 2 }, s.pred, s.direct));
                }
            }
        }

        // ref_idx: 先 L0 全部分区, 再 L1
        for list in 0..2 {
            let flag = if list == 0 { PRED_L0 } else { PRED_L1 };
            let num_active = self.slice.num_ref_idx_active[list];
            for &(rect, p, direct) in &parts {
                if direct || p & flag == 0 {
                    continue;
                }
                let q = rect.quadrants();
                let ref_idx = if num_active > 1 {
                    let inc = self.ref_idx_inc(left, top, list, q.x, q.y);
                    decode_ref_idx(&mut self.dec, inc, num_active)?
                } else {
                    0
                };
                self.cur.fill_ref_gt0(list, q.x, q.y, q.w, q.h, ref_idx);
                for row in q.y..q.y + q.h {
                    for col in q.x..q.x + q.w {
                        self.mb.ref_idx[list][row * 2 + col] = ref_idx as i8;
                    }
                }
            }
        }

        // mvd: 先 L0 全部 (子) 分区, 再 L1
        for list in 0..2 {
            let flag = if list == 0 { PRED_L0 } else { PRED_L1 };
            for (i, &(rect, p, direct)) in parts.iter().enumerate() {
                if direct || p & flag == 0 {
                    continue;
                }
                if partition == Partition::P8x8 {
                    let s = sub[i];
                    for k in 0..s.partition.count() {
                        let r = sub_rect(rect, s.partition, k);
                        self.decode_mvd_block(left, top, list, r);
                    }
                } else {
                    self.decode_mvd_block(left, top, list, rect);
                }
            }
        }
        Ok(())
    }

    fn decode_mvd_block(&mut self, left: &MbCtx, top: &MbCtx, list: usize, r: Rect) {
        let (a, ax, ay) = block_left(&self.cur, left, r.x, r.y, 4);
        let (b, bx, by) = block_top(&self.cur, top, r.x, r.y, 4);
        let mut mvd = [0i32; 2];
        for (comp, v) in mvd.iter_mut().enumerate() {
            let sum = a.abs_mvd_at(list, ax, ay, comp) + b.abs_mvd_at(list, bx, by, comp);
            *v = decode_mvd(&mut self.dec, comp, sum);
        }
        self.cur.fill_abs_mvd(list, r.x, r.y, r.w, r.h, mvd);
        let stored = [
            mvd[0].clamp(i16::MIN.into(), i16::MAX.into()) as i16,
            mvd[1].clamp(i16::MIN.into(), i16::MAX.into()) as i16,
        ];
        for row in r.y..r.y + r.h {
            for col in r.x..r.x + r.w {
                self.mb.mvd[list][row * 4 + col] = stored;
            }
        }
    }

    fn ref_idx_inc(&self, left: &MbCtx, top: &MbCtx, list: usize, qx: usize, qy: usize) -> usize {
        let (a, ax, ay) = block_left(&self.cur, left, qx, qy, 2);
        let (b, bx, by) = block_top(&self.cur, top, qx, qy, 2);
        ctx_inc(a.ref_gt0_at(list, ax, ay), b.ref_gt0_at(list, bx, by))
    }

    // ============================================================
    // coded_block_pattern 与变换尺寸
    // ============================================================

    fn decode_cbp(&mut self, left: &MbCtx, top: &MbCtx) {
        let mut cbp = 0u8;
        for b8 in 0..4 {
            let (x, y) = (b8 % 2, b8 / 2);
            let a = if x > 0 {
                cbp >> (b8 - 1) & 1
            } else {
                left.cbp_luma >> (b8 + 1) & 1
            };
            let b = if y > 0 {
                cbp >> (b8 - 2) & 1
            } else {
                top.cbp_luma >> (b8 + 2) & 1
            };
            cbp |= decode_cbp_luma_bit(&mut self.dec, ctx_inc(a == 0, b == 0)) << b8;
        }
        self.mb.cbp_luma = cbp;
        if self.slice.geometry.chroma_array_type != 0 {
            self.mb.cbp_chroma = decode_cbp_chroma(&mut self.dec, left.cbp_chroma, top.cbp_chroma);
        }
    }

    fn transform_8x8_inc(&self, left: &MbCtx, top: &MbCtx) -> usize {
        ctx_sum(
            left.available() && left.has(MB_TRANSFORM_8X8),
            top.available() && top.has(MB_TRANSFORM_8X8),
        )
    }

    /// 帧间宏块是否携带 transform_size_8x8_flag
    fn inter_transform_8x8_allowed(&self) -> bool {
        if self.mb.cbp_luma == 0 || !self.slice.transform_8x8_mode {
            return false;
        }
        match self.mb.kind {
            MbKind::BDirect16x16 => self.slice.direct_8x8_inference,
            MbKind::Inter {
                partition: Partition::P8x8,
                sub,
                ..
            } => sub.iter().all(|s| {
                if s.direct {
                    self.slice.direct_8x8_inference
                } else {
                    s.partition == SubPartition::S8x8
                }
            }),
            MbKind::Inter { .. } => true,
            _ => false,
        }
    }

    // ============================================================
    // 残差
    // ============================================================

    /// 邻居块的 coded_block_flag 条件, 不可用的邻居按当前宏块是否帧内取值
    fn cbf_cond(&self, n: &MbCtx, bit: bool) -> bool {
        if n.available() {
            bit
        } else {
            self.cur.has(MB_INTRA)
        }
    }

    fn luma_cbf_inc(&self, left: &MbCtx, top: &MbCtx, x: usize, y: usize) -> usize {
        let (a, ax, ay) = block_left(&self.cur, left, x, y, 4);
        let (b, bx, by) = block_top(&self.cur, top, x, y, 4);
        ctx_inc(
            self.cbf_cond(a, a.cbf_luma_at(ax, ay)),
            self.cbf_cond(b, b.cbf_luma_at(bx, by)),
        )
    }

    fn decode_block(&mut self, cat: &BlockCat, inc: usize, coeffs: &mut [i32]) -> AvcResult<bool> {
        decode_residual_block(&mut self.dec, cat, inc, coeffs)
    }

    fn decode_residual(&mut self, left: &MbCtx, top: &MbCtx) -> AvcResult<()> {
        let mut residual = std::mem::take(&mut self.mb.residual);
        let result = self.decode_residual_into(left, top, &mut residual);
        self.mb.residual = residual;
        result
    }

    fn decode_residual_into(
        &mut self,
        left: &MbCtx,
        top: &MbCtx,
        residual: &mut Residual,
    ) -> AvcResult<()> {
        let cbp_luma = self.mb.cbp_luma;
        if matches!(self.mb.kind, MbKind::I16x16 { .. }) {
            let a = self.cbf_cond(left, left.cbf_dc & 1 != 0);
            let b = self.cbf_cond(top, top.cbf_dc & 1 != 0);
            if self.decode_block(&LUMA_DC, ctx_inc(a, b), &mut residual.luma_dc)? {
                self.cur.cbf_dc |= 1;
                residual.coded_dc |= 1;
            }
            if cbp_luma != 0 {
                for blk in 0..16 {
                    let (x, y) = blk_xy(blk);
                    let inc = self.luma_cbf_inc(left, top, x, y);
                    if self.decode_block(&LUMA_AC, inc, &mut residual.luma_4x4[blk][1..])? {
                        self.cur.cbf_luma |= 1 << (y * 4 + x);
                        residual.coded_luma |= 1 << blk;
                    }
                }
            }
        } else {
            for b8 in 0..4 {
                if cbp_luma >> b8 & 1 == 0 {
                    continue;
                }
                if self.mb.transform_8x8 {
                    self.decode_block(&LUMA_8X8, 0, &mut residual.luma_8x8[b8])?;
                    // 4:2:0 下 8x8 块的 coded_block_flag 推断为 1
                    for b4 in 0..4 {
                        let (x, y) = blk_xy(b8 * 4 + b4);
                        self.cur.cbf_luma |= 1 << (y * 4 + x);
                    }
                    residual.coded_luma |= 0x0F << (b8 * 4);
                    continue;
                }
                for b4 in 0..4 {
                    let blk = b8 * 4 + b4;
                    let (x, y) = blk_xy(blk);
                    let inc = self.luma_cbf_inc(left, top, x, y);
                    if self.decode_block(&LUMA_4X4, inc, &mut residual.luma_4x4[blk])? {
                        self.cur.cbf_luma |= 1 << (y * 4 + x);
                        residual.coded_luma |= 1 << blk;
                    }
                }
            }
        }

        let cbp_chroma = self.mb.cbp_chroma;
        if cbp_chroma == 0 || self.slice.geometry.chroma_array_type == 0 {
            return Ok(());
        }
        for comp in 0..2 {
            let bit = 2 << comp;
            let a = self.cbf_cond(left, left.cbf_dc & bit != 0);
            let b = self.cbf_cond(top, top.cbf_dc & bit != 0);
            if self.decode_block(&CHROMA_DC, ctx_inc(a, b), &mut residual.chroma_dc[comp])? {
                self.cur.cbf_dc |= bit;
                residual.coded_dc |= bit;
            }
        }
        if cbp_chroma != 2 {
            return Ok(());
        }
        for comp in 0..2 {
            for blk in 0..4 {
                let (x, y) = (blk % 2, blk / 2);
                let (a, ax, ay) = block_left(&self.cur, left, x, y, 2);
                let (b, bx, by) = block_top(&self.cur, top, x, y, 2);
                let inc = ctx_inc(
                    self.cbf_cond(a, a.cbf_chroma_at(comp, ax, ay)),
                    self.cbf_cond(b, b.cbf_chroma_at(comp, bx, by)),
                );
                let idx = comp * 4 + blk;
                if self.decode_block(&CHROMA_AC, inc, &mut residual.chroma_ac[idx][1..])? {
                    self.cur.cbf_chroma_ac[comp] |= 1 << blk;
                    residual.coded_chroma_ac |= 1 << idx;
                }
            }
        }
        Ok(())
    }
}

/// 8x8 子宏块中第 `k` 个子分区的矩形
fn sub_rect(quadrant: Rect, partition: SubPartition, k: usize) -> Rect {
    let Rect { x, y, .. } = quadrant;
    match partition {
        SubPartition::S8x8 => quadrant,
        SubPartition::S8x4 => Rect { x, y: y + k, w: 2, h: 1 },
        SubPartition::S4x8 => Rect { x: x + k, y, w: 1, h: 2 },
        SubPartition::S4x4 => Rect {
            x: x + k % 2,
            y: y + k / 2,
            w: 1,
            h: 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blk_xy_follows_zigzag_of_8x8_blocks() {
        assert_eq!(blk_xy(0), (0, 0));
        assert_eq!(blk_xy(3), (1, 1));
        assert_eq!(blk_xy(4), (2, 0));
        assert_eq!(blk_xy(10), (1, 3));
        assert_eq!(blk_xy(15), (3, 3));
    }

    #[test]
    fn test_sub_rect_layout() {
        let q = Rect { x: 2, y: 2, w: 2, h: 2 };
        let r = sub_rect(q, SubPartition::S8x4, 1);
        assert_eq!((r.x, r.y, r.w, r.h), (2, 3, 2, 1));
        let r = sub_rect(q, SubPartition::S4x4, 3);
        assert_eq!((r.x, r.y, r.w, r.h), (3, 3, 1, 1));
        let qq = Rect { x: 0, y: 2, w: 4, h: 2 }.quadrants();
        assert_eq!((qq.x, qq.y, qq.w, qq.h), (0, 1, 2, 1));
    }
}
