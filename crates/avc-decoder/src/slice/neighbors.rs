//! 宏块邻居上下文.
//!
//! CABAC 的 ctxIdxInc 只依赖左邻 (A) 与上邻 (B) 宏块. 环形缓冲保存最近 `mb_width + 1`
//! 个宏块的上下文, 恰好覆盖当前宏块的左邻和上邻. 不在图像内或早于切片起点的邻居
//! 返回 [`MbCtx::UNAVAILABLE`].

// ============================================================
// 宏块标志
// ============================================================

pub(super) const MB_AVAILABLE: u16 = 1 << 0;
pub(super) const MB_SKIP: u16 = 1 << 1;
pub(super) const MB_INTRA: u16 = 1 << 2;
pub(super) const MB_PCM: u16 = 1 << 3;
pub(super) const MB_I_NXN: u16 = 1 << 4;
/// B_Skip 或 B_Direct_16x16
pub(super) const MB_DIRECT: u16 = 1 << 5;
pub(super) const MB_TRANSFORM_8X8: u16 = 1 << 6;
/// intra_chroma_pred_mode != 0
pub(super) const MB_CHROMA_PRED: u16 = 1 << 7;

/// mvd 绝对值的保存上限, 上下文推导只区分 3 与 32 两个门限
const ABS_MVD_CAP: u32 = 64;

/// 一个宏块留给后续宏块的熵解码上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct MbCtx {
    pub flags: u16,
    /// 不可用或 I_PCM 记为 0xF
    pub cbp_luma: u8,
    /// I_PCM 记为 2
    pub cbp_chroma: u8,
    /// 4x4 亮度块 coded_block_flag, 光栅顺序
    pub cbf_luma: u16,
    /// bit0 亮度 DC, bit1 Cb DC, bit2 Cr DC
    pub cbf_dc: u8,
    /// Cb/Cr 的 2x2 AC 块 coded_block_flag
    pub cbf_chroma_ac: [u8; 2],
    /// 每个 8x8 象限显式编码的 refIdx > 0
    pub ref_gt0: [u8; 2],
    /// 每个 4x4 块 (光栅顺序) 的 |mvd|
    pub abs_mvd: [[[u8; 2]; 16]; 2],
}

impl MbCtx {
    /// 不可用的邻居
    pub const UNAVAILABLE: Self = Self {
        flags: 0,
        cbp_luma: 0x0F,
        cbp_chroma: 0,
        cbf_luma: 0,
        cbf_dc: 0,
        cbf_chroma_ac: [0; 2],
        ref_gt0: [0; 2],
        abs_mvd: [[[0; 2]; 16]; 2],
    };

    /// 当前宏块的初始上下文
    pub fn current() -> Self {
        Self {
            flags: MB_AVAILABLE,
            cbp_luma: 0,
            ..Self::UNAVAILABLE
        }
    }

    #[inline]
    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn available(&self) -> bool {
        self.has(MB_AVAILABLE)
    }

    /// 4x4 亮度块 (x, y) 的 coded_block_flag
    #[inline]
    pub fn cbf_luma_at(&self, x: usize, y: usize) -> bool {
        self.cbf_luma >> (y * 4 + x) & 1 != 0
    }

    /// 色度 AC 块 (x, y) 的 coded_block_flag
    #[inline]
    pub fn cbf_chroma_at(&self, comp: usize, x: usize, y: usize) -> bool {
        self.cbf_chroma_ac[comp] >> (y * 2 + x) & 1 != 0
    }

    /// 8x8 象限 (x, y) 的 refIdx > 0 标志
    #[inline]
    pub fn ref_gt0_at(&self, list: usize, x: usize, y: usize) -> bool {
        self.ref_gt0[list] >> (y * 2 + x) & 1 != 0
    }

    /// 4x4 块 (x, y) 的 |mvd| 分量
    #[inline]
    pub fn abs_mvd_at(&self, list: usize, x: usize, y: usize, comp: usize) -> u32 {
        u32::from(self.abs_mvd[list][y * 4 + x][comp])
    }

    /// 以 |mvd| 填充 w x h 个 4x4 块
    pub fn fill_abs_mvd(&mut self, list: usize, x: usize, y: usize, w: usize, h: usize, mvd: [i32; 2]) {
        let abs = [
            mvd[0].unsigned_abs().min(ABS_MVD_CAP) as u8,
            mvd[1].unsigned_abs().min(ABS_MVD_CAP) as u8,
        ];
        for row in y..y + h {
            for col in x..x + w {
                self.abs_mvd[list][row * 4 + col] = abs;
            }
        }
    }

    /// 以 refIdx 设置 w x h 个 8x8 象限的标志
    pub fn fill_ref_gt0(&mut self, list: usize, x: usize, y: usize, w: usize, h: usize, ref_idx: u32) {
        for row in y..y + h {
            for col in x..x + w {
                let bit = 1u8 << (row * 2 + col);
                if ref_idx > 0 {
                    self.ref_gt0[list] |= bit;
                } else {
                    self.ref_gt0[list] &= !bit;
                }
            }
        }
    }
}

/// 按块邻居加权: condA + 2 * condB (ref_idx, cbp, coded_block_flag)
#[inline]
pub(super) fn ctx_inc(a: bool, b: bool) -> usize {
    usize::from(a) + 2 * usize::from(b)
}

/// 宏块级条件之和: condA + condB (mb_skip_flag, mb_type, transform_size_8x8_flag 等)
#[inline]
pub(super) fn ctx_sum(a: bool, b: bool) -> usize {
    usize::from(a) + usize::from(b)
}

// ============================================================
// 环形缓冲
// ============================================================

/// 保存最近 `mb_width + 1` 个宏块上下文的环形缓冲
pub(super) struct NeighborRing {
    mb_width: usize,
    first_mb: usize,
    entries: Vec<MbCtx>,
}

impl NeighborRing {
    pub fn new(mb_width: usize, first_mb: usize) -> Self {
        let mb_width = mb_width.max(1);
        Self {
            mb_width,
            first_mb,
            entries: vec![MbCtx::UNAVAILABLE; mb_width + 1],
        }
    }

    fn slot(&self, mb_addr: usize) -> usize {
        mb_addr % (self.mb_width + 1)
    }

    fn get(&self, mb_addr: Option<usize>) -> &MbCtx {
        match mb_addr {
            Some(addr) if addr >= self.first_mb => &self.entries[self.slot(addr)],
            _ => &MbCtx::UNAVAILABLE,
        }
    }

    /// 左邻宏块 A
    pub fn left(&self, mb_addr: usize) -> &MbCtx {
        let addr = (mb_addr % self.mb_width != 0).then(|| mb_addr - 1);
        self.get(addr)
    }

    /// 上邻宏块 B
    pub fn top(&self, mb_addr: usize) -> &MbCtx {
        self.get(mb_addr.checked_sub(self.mb_width))
    }

    /// 保存已解码宏块的上下文
    pub fn store(&mut self, mb_addr: usize, ctx: MbCtx) {
        let slot = self.slot(mb_addr);
        self.entries[slot] = ctx;
    }
}

/// 块 (x, y) 的左邻: 位于当前宏块内则取 `cur`, 否则取左邻宏块最右列
#[inline]
pub(super) fn block_left<'a>(cur: &'a MbCtx, left: &'a MbCtx, x: usize, y: usize, cols: usize) -> (&'a MbCtx, usize, usize) {
    if x > 0 {
        (cur, x - 1, y)
    } else {
        (left, cols - 1, y)
    }
}

/// 块 (x, y) 的上邻: 位于当前宏块内则取 `cur`, 否则取上邻宏块最下行
#[inline]
pub(super) fn block_top<'a>(cur: &'a MbCtx, top: &'a MbCtx, x: usize, y: usize, rows: usize) -> (&'a MbCtx, usize, usize) {
    if y > 0 {
        (cur, x, y - 1)
    } else {
        (top, x, rows - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_neighbors_respect_slice_start() {
        let mut ring = NeighborRing::new(3, 2);
        for addr in 2..6 {
            let mut ctx = MbCtx::current();
            ctx.cbp_chroma = addr as u8;
            ring.store(addr, ctx);
        }
        // 宏块 5 位于 (2, 1): 左邻 4, 上邻 2
        assert_eq!(ring.left(5).cbp_chroma, 4);
        assert_eq!(ring.top(5).cbp_chroma, 2);
        // 宏块 4 位于 (1, 1): 上邻 1 早于切片起点
        assert!(!ring.top(4).available(), "切片之前的宏块应不可用");
        // 宏块 3 位于 (0, 1): 没有左邻
        assert!(!ring.left(3).available(), "图像左边界外应不可用");
    }

    #[test]
    fn test_ring_overwrites_oldest_entry() {
        let mut ring = NeighborRing::new(2, 0);
        for addr in 0..5 {
            let mut ctx = MbCtx::current();
            ctx.cbp_chroma = addr as u8;
            ring.store(addr, ctx);
        }
        // 宏块 5 位于 (1, 2): 左邻 4, 上邻 3
        assert_eq!(ring.left(5).cbp_chroma, 4);
        assert_eq!(ring.top(5).cbp_chroma, 3);
    }

    #[test]
    fn test_block_neighbors_cross_macroblock_edge() {
        let cur = MbCtx::current();
        let mut left = MbCtx::current();
        left.cbf_luma = 1 << 7;
        let (n, x, y) = block_left(&cur, &left, 0, 1, 4);
        assert!(n.cbf_luma_at(x, y), "左边界块应取左邻宏块第 3 列");
        let (n, x, y) = block_top(&cur, &left, 2, 1, 4);
        assert_eq!((x, y), (2, 0));
        assert!(std::ptr::eq(n, &cur));
    }

    #[test]
    fn test_ctx_increment_forms() {
        assert_eq!(ctx_inc(false, true), 2, "块级条件中上邻权重为 2");
        assert_eq!(ctx_sum(false, true), 1, "宏块级条件直接相加");
        assert_eq!(ctx_sum(true, true), 2);
    }

    #[test]
    fn test_abs_mvd_saturates() {
        let mut ctx = MbCtx::current();
        ctx.fill_abs_mvd(0, 2, 0, 2, 4, [-500, 7]);
        assert_eq!(ctx.abs_mvd_at(0, 3, 3, 0), ABS_MVD_CAP);
        assert_eq!(ctx.abs_mvd_at(0, 2, 1, 1), 7);
        assert_eq!(ctx.abs_mvd_at(0, 1, 1, 1), 0);
    }
}
