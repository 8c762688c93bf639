//! 切片层: 切片头, 邻居上下文, CABAC 语法元素, 残差与宏块循环.
//!
//! 宏块循环只负责熵解码和上下文推导, 解析出的参数交给 [`crate::kernels::ReconstructionKernels`]
//! 完成预测, 反变换与重建.

mod decode;
mod header;
mod neighbors;
mod residual;
mod syntax;

pub use decode::{SliceOutcome, decode_slice};
pub use header::{
    DeblockParams, PredWeight, PredWeightTable, SliceHeader, SliceType, WeightedPrediction,
    parse_slice_header,
};

use crate::picture::PictureGeometry;
use crate::refs::RefPicLists;

/// 宏块分区
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    P16x16,
    P16x8,
    P8x16,
    P8x8,
}

/// 子宏块分区
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubPartition {
    #[default]
    S8x8,
    S8x4,
    S4x8,
    S4x4,
}

impl SubPartition {
    /// 子分区个数
    pub fn count(&self) -> usize {
        match self {
            Self::S8x8 => 1,
            Self::S8x4 | Self::S4x8 => 2,
            Self::S4x4 => 4,
        }
    }
}

/// 预测方向位: bit0 = L0, bit1 = L1
pub const PRED_L0: u8 = 1;
pub const PRED_L1: u8 = 2;
pub const PRED_BI: u8 = PRED_L0 | PRED_L1;

/// 一个 8x8 子宏块
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubMb {
    pub partition: SubPartition,
    /// 预测方向, B_Direct_8x8 为 0
    pub pred: u8,
    /// B_Direct_8x8
    pub direct: bool,
}

/// 宏块类型及其预测语法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbKind {
    /// Intra_4x4: 每个块 `None` 表示使用预测模式, `Some(rem)` 为 rem_intra4x4_pred_mode
    I4x4 { modes: [Option<u8>; 16] },
    /// Intra_8x8
    I8x8 { modes: [Option<u8>; 4] },
    /// Intra_16x16
    I16x16 { pred_mode: u8 },
    /// I_PCM, 采样在 [`Residual::pcm`]
    Pcm,
    /// P_Skip
    PSkip,
    /// B_Skip
    BSkip,
    /// B_Direct_16x16
    BDirect16x16,
    /// 其余帧间宏块, `pred` 为每个分区的预测方向
    Inter {
        partition: Partition,
        pred: [u8; 2],
        sub: [SubMb; 4],
    },
}

impl MbKind {
    /// 是否为帧内宏块
    pub fn is_intra(&self) -> bool {
        matches!(
            self,
            Self::I4x4 { .. } | Self::I8x8 { .. } | Self::I16x16 { .. } | Self::Pcm
        )
    }
}

/// 一个宏块的残差系数 (按扫描顺序保存, 由重建核完成反扫描与反量化)
#[derive(Debug, Clone)]
pub struct Residual {
    /// Intra_16x16 亮度 DC
    pub luma_dc: [i32; 16],
    /// 16 个 4x4 亮度块, 按 luma4x4BlkIdx 排列; Intra_16x16 的 AC 位于下标 1..16
    pub luma_4x4: [[i32; 16]; 16],
    /// 4 个 8x8 亮度块
    pub luma_8x8: [[i32; 64]; 4],
    /// Cb/Cr DC
    pub chroma_dc: [[i32; 4]; 2],
    /// Cb 块 0..4, Cr 块 4..8, AC 位于下标 1..16
    pub chroma_ac: [[i32; 16]; 8],
    /// 有非零系数的 4x4 亮度块 (按 luma4x4BlkIdx)
    pub coded_luma: u16,
    /// bit0 = 亮度 DC, bit1 = Cb DC, bit2 = Cr DC
    pub coded_dc: u8,
    /// 有非零 AC 的色度块
    pub coded_chroma_ac: u8,
    /// I_PCM 采样: 256 亮度, 然后 Cb, Cr
    pub pcm: Vec<u8>,
}

impl Default for Residual {
    fn default() -> Self {
        Self {
            luma_dc: [0; 16],
            luma_4x4: [[0; 16]; 16],
            luma_8x8: [[0; 64]; 4],
            chroma_dc: [[0; 4]; 2],
            chroma_ac: [[0; 16]; 8],
            coded_luma: 0,
            coded_dc: 0,
            coded_chroma_ac: 0,
            pcm: Vec::new(),
        }
    }
}

impl Residual {
    /// 清空全部系数
    pub fn clear(&mut self) {
        let pcm = std::mem::take(&mut self.pcm);
        *self = Self {
            pcm,
            ..Self::default()
        };
        self.pcm.clear();
    }
}

/// 传给重建核的宏块参数
#[derive(Debug, Clone)]
pub struct MacroblockParams {
    pub mb_addr: usize,
    pub mb_x: usize,
    pub mb_y: usize,
    pub kind: MbKind,
    /// QP_Y
    pub qp: i32,
    pub cbp_luma: u8,
    pub cbp_chroma: u8,
    pub transform_8x8: bool,
    pub intra_chroma_pred_mode: u8,
    /// 每个 8x8 象限的参考索引, -1 表示不使用该列表
    pub ref_idx: [[i8; 4]; 2],
    /// 每个 4x4 块 (光栅顺序) 的运动矢量差
    pub mvd: [[[i16; 2]; 16]; 2],
    pub residual: Residual,
}

impl MacroblockParams {
    /// 位于 (mb_x, mb_y) 的空宏块参数
    pub fn new(mb_addr: usize, mb_width: usize) -> Self {
        Self {
            mb_addr,
            mb_x: mb_addr % mb_width.max(1),
            mb_y: mb_addr / mb_width.max(1),
            kind: MbKind::PSkip,
            qp: 0,
            cbp_luma: 0,
            cbp_chroma: 0,
            transform_8x8: false,
            intra_chroma_pred_mode: 0,
            ref_idx: [[-1; 4]; 2],
            mvd: [[[0; 2]; 16]; 2],
            residual: Residual::default(),
        }
    }

    fn reset(&mut self, mb_addr: usize, mb_width: usize) {
        self.mb_addr = mb_addr;
        self.mb_x = mb_addr % mb_width.max(1);
        self.mb_y = mb_addr / mb_width.max(1);
        self.kind = MbKind::PSkip;
        self.cbp_luma = 0;
        self.cbp_chroma = 0;
        self.transform_8x8 = false;
        self.intra_chroma_pred_mode = 0;
        self.ref_idx = [[-1; 4]; 2];
        self.mvd = [[[0; 2]; 16]; 2];
        self.residual.clear();
    }
}

/// 参考图像的排序信息 (时间直接预测与隐式加权使用)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefPicInfo {
    pub poc: i32,
    pub long_term: bool,
}

/// 一个切片的不可变快照, 随任务交给工作线程
#[derive(Debug, Clone)]
pub struct SliceParams {
    pub slice_type: SliceType,
    /// 图像内的切片序号
    pub slice_num: u16,
    pub first_mb: u32,
    pub slice_qp: i32,
    pub cabac_init_mode: usize,
    pub num_ref_idx_active: [u32; 2],
    pub ref_lists: RefPicLists,
    /// 参考列表各项的排序信息
    pub ref_info: [Vec<Option<RefPicInfo>>; 2],
    /// 槽位到 RefPicList0 下标的反向映射
    pub map_col_to_list0: [Option<u8>; 32],
    /// 当前图像 PicOrderCnt
    pub poc: i32,
    pub weighted_prediction: WeightedPrediction,
    pub direct_spatial_mv_pred: bool,
    pub direct_8x8_inference: bool,
    pub deblock: DeblockParams,
    /// Cb, Cr 的 QP 偏移
    pub chroma_qp_index_offset: [i32; 2],
    pub transform_8x8_mode: bool,
    pub constrained_intra_pred: bool,
    pub geometry: PictureGeometry,
}
