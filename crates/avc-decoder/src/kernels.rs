//! 像素重建接口.
//!
//! 控制平面只做熵解码与调度, 预测, 反变换, 去块等像素运算通过 [`ReconstructionKernels`]
//! 注入. [`NullKernels`] 是不做像素运算的默认实现: 复制 I_PCM 采样, 帧间宏块复制参考
//! 图像的同位宏块, 其余保持中灰.

use crate::picture::{MbClass, PictureData};
use crate::slice::{MacroblockParams, MbKind, SliceParams};

/// 一个切片可见的参考图像, 按 RefPicList 下标排列
#[derive(Default)]
pub struct RefPictures<'a> {
    lists: [Vec<Option<&'a PictureData>>; 2],
}

impl<'a> RefPictures<'a> {
    pub fn new(l0: Vec<Option<&'a PictureData>>, l1: Vec<Option<&'a PictureData>>) -> Self {
        Self { lists: [l0, l1] }
    }

    /// RefPicListX[idx], 缺失项返回 `None`
    pub fn get(&self, list: usize, idx: usize) -> Option<&'a PictureData> {
        self.lists.get(list)?.get(idx).copied().flatten()
    }

    /// 列表长度
    pub fn len(&self, list: usize) -> usize {
        self.lists.get(list).map_or(0, Vec::len)
    }
}

/// 重建一个宏块所需的切片上下文
pub struct SliceContext<'s, 'r> {
    pub slice: &'s SliceParams,
    pub refs: &'s RefPictures<'r>,
}

/// 像素重建核
///
/// 同一张图像的宏块按解码顺序调用, 不同图像可能在不同线程上并发调用.
pub trait ReconstructionKernels: Send + Sync {
    /// 预测 + 残差重建一个宏块
    fn reconstruct_mb(&self, ctx: &SliceContext<'_, '_>, mb: &MacroblockParams, pic: &mut PictureData);

    /// 隐藏一个缺失的宏块, `reference` 为最近的可用参考图像
    fn conceal_mb(&self, mb_x: usize, mb_y: usize, reference: Option<&PictureData>, pic: &mut PictureData) {
        match reference {
            Some(r) => pic.planes.copy_mb_from(&r.planes, mb_x, mb_y),
            None => pic.planes.fill_mb(mb_x, mb_y, 128),
        }
    }

    /// 对第 `mb_y` 行宏块做去块滤波, 行按自上而下的顺序调用
    fn deblock_row(&self, _mb_y: usize, _pic: &mut PictureData) {}
}

/// 不做像素运算的重建核
#[derive(Debug, Default, Clone, Copy)]
pub struct NullKernels;

impl ReconstructionKernels for NullKernels {
    fn reconstruct_mb(&self, ctx: &SliceContext<'_, '_>, mb: &MacroblockParams, pic: &mut PictureData) {
        match mb.kind {
            MbKind::Pcm => pic.planes.write_pcm(mb.mb_x, mb.mb_y, &mb.residual.pcm),
            MbKind::PSkip | MbKind::BSkip | MbKind::BDirect16x16 | MbKind::Inter { .. } => {
                let (list, idx) = if mb.ref_idx[0][0] >= 0 || ctx.refs.len(1) == 0 {
                    (0, mb.ref_idx[0][0].max(0) as usize)
                } else {
                    (1, mb.ref_idx[1][0].max(0) as usize)
                };
                if let Some(reference) = ctx.refs.get(list, idx) {
                    pic.planes.copy_mb_from(&reference.planes, mb.mb_x, mb.mb_y);
                }
            }
            _ => {}
        }
    }
}

/// 元数据中的宏块类别
pub(crate) fn mb_class(kind: &MbKind) -> MbClass {
    match kind {
        MbKind::Pcm => MbClass::Pcm,
        MbKind::PSkip | MbKind::BSkip => MbClass::Skip,
        k if k.is_intra() => MbClass::Intra,
        _ => MbClass::Inter,
    }
}
