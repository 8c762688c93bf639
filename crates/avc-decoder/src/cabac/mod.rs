//! CABAC 算术解码引擎.
//!
//! 9 比特形式的 `range` / `offset` 寄存器, 重归一化比特直接取自 [`BitCache`].
//! 引擎本身从不报错: 越过数据末尾时得到确定但无意义的 bin, 由 slice 循环负责
//! 限制宏块数量并检测终止条件.

mod encoder;
mod init_table;
mod tables;

pub use encoder::CabacEncoder;

use avc_core::BitCache;

use init_table::CONTEXT_INIT_MN;
use tables::{RANGE_TAB_LPS, TRANS_IDX_LPS, TRANS_IDX_MPS};

/// 上下文数量
pub const NUM_CONTEXTS: usize = 1024;

/// end_of_slice_flag / I_PCM 终止判定使用的上下文
pub const CTX_TERMINATE: usize = 276;

/// 单个上下文的概率状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CabacCtx {
    /// pStateIdx (0-63)
    pub state: u8,
    /// valMPS (0/1)
    pub mps: u8,
}

impl CabacCtx {
    /// 由 (m, n) 初始化参数和 slice QP 计算初始状态
    pub fn from_mn(m: i8, n: i8, qp: i32) -> Self {
        let qp = qp.clamp(0, 51);
        let pre = (((i32::from(m) * qp) >> 4) + i32::from(n)).clamp(1, 126);
        if pre <= 63 {
            Self {
                state: (63 - pre) as u8,
                mps: 0,
            }
        } else {
            Self {
                state: (pre - 64) as u8,
                mps: 1,
            }
        }
    }
}

/// 上下文初始化模式: I slice 为 0, P/B slice 为 `cabac_init_idc + 1`
pub fn init_mode(is_intra_slice: bool, cabac_init_idc: u32) -> usize {
    if is_intra_slice {
        0
    } else {
        1 + cabac_init_idc.min(2) as usize
    }
}

/// 按初始化模式和 QP 重置全部上下文
pub fn init_contexts(ctxs: &mut [CabacCtx; NUM_CONTEXTS], mode: usize, qp: i32) {
    let table = &CONTEXT_INIT_MN[mode.min(3)];
    for (ctx, &[m, n]) in ctxs.iter_mut().zip(table.iter()) {
        *ctx = CabacCtx::from_mn(m, n, qp);
    }
    ctxs[CTX_TERMINATE] = CabacCtx { state: 63, mps: 0 };
}

/// CABAC 算术解码器
pub struct ArithmeticDecoder<'a> {
    bits: BitCache<'a>,
    range: u32,
    offset: u32,
    ctxs: [CabacCtx; NUM_CONTEXTS],
}

impl<'a> ArithmeticDecoder<'a> {
    /// 初始化上下文并启动引擎, `bits` 须位于 slice_data() 起点
    pub fn new(bits: BitCache<'a>, mode: usize, qp: i32) -> Self {
        let mut dec = Self {
            bits,
            range: 510,
            offset: 0,
            ctxs: [CabacCtx::default(); NUM_CONTEXTS],
        };
        init_contexts(&mut dec.ctxs, mode, qp);
        dec.start();
        dec
    }

    /// 对齐到字节边界后读取 9 比特初始化 offset
    ///
    /// 510 和 511 为非法值, 钳制到 509 以维持 `offset < range`.
    pub fn start(&mut self) {
        self.bits.align_to_byte();
        self.range = 510;
        self.offset = self.bits.read_bits(9).min(509);
    }

    /// 当前上下文表
    pub fn contexts(&self) -> &[CabacCtx; NUM_CONTEXTS] {
        &self.ctxs
    }

    /// 底层比特读取器
    pub fn bits(&self) -> &BitCache<'a> {
        &self.bits
    }

    /// 交还底层比特读取器
    pub fn into_bits(self) -> BitCache<'a> {
        self.bits
    }

    #[inline]
    fn renorm(&mut self) {
        if self.range < 256 {
            let shift = self.range.leading_zeros() - 23;
            self.range <<= shift;
            self.offset = self.offset << shift | self.bits.read_bits(shift);
        }
    }

    /// 解码一个上下文自适应 bin
    #[inline]
    pub fn decode_bin(&mut self, ctx_idx: usize) -> u32 {
        let ctx = &mut self.ctxs[ctx_idx % NUM_CONTEXTS];
        let q = ((self.range >> 6) & 3) as usize;
        let lps = u32::from(RANGE_TAB_LPS[ctx.state as usize & 63][q]);
        self.range -= lps;
        let bin = if self.offset >= self.range {
            self.offset -= self.range;
            self.range = lps;
            let bin = 1 - ctx.mps;
            if ctx.state == 0 {
                ctx.mps = 1 - ctx.mps;
            }
            ctx.state = TRANS_IDX_LPS[ctx.state as usize & 63];
            bin
        } else {
            ctx.state = TRANS_IDX_MPS[ctx.state as usize & 63];
            ctx.mps
        };
        self.renorm();
        u32::from(bin)
    }

    /// 解码一个等概率 bin
    #[inline]
    pub fn decode_bypass(&mut self) -> u32 {
        self.offset = self.offset << 1 | self.bits.read_bit();
        if self.offset >= self.range {
            self.offset -= self.range;
            1
        } else {
            0
        }
    }

    /// 逐位解码 `n` 个等概率 bin (n <= 32), 高位在前
    pub fn decode_bypass_value_ref(&mut self, n: u32) -> u32 {
        let mut value = 0u32;
        for _ in 0..n.min(32) {
            value = value << 1 | self.decode_bypass();
        }
        value
    }

    /// 以一次除法解码 `n` 个等概率 bin (n <= 32), 结果与逐位路径一致
    ///
    /// 逐位过程等价于对 `offset * 2^n + bits` 做长除法, 商即 bin 序列, 余数为新 offset.
    #[inline]
    pub fn decode_bypass_value(&mut self, n: u32) -> u32 {
        let n = n.min(32);
        if n == 0 {
            return 0;
        }
        let v = u64::from(self.offset) << n | u64::from(self.bits.read_bits(n));
        let range = u64::from(self.range);
        self.offset = (v % range) as u32;
        (v / range) as u32
    }

    /// 解码 k 阶 Exp-Golomb 旁路后缀 (UEGk 的 suffix 部分)
    ///
    /// 用于 coeff_abs_level_minus1 (k=0) 和 mvd (k=3) 的长码.
    pub fn decode_ueg_suffix(&mut self, mut k: u32) -> u32 {
        let mut value = 0u32;
        while self.decode_bypass() == 1 {
            value = value.saturating_add(1 << k);
            k += 1;
            if k >= 31 {
                break;
            }
        }
        value.saturating_add(self.decode_bypass_value(k))
    }

    /// 解码终止 bin (end_of_slice_flag 及 I_PCM 判定)
    ///
    /// 返回 1 时不做重归一化, 读取位置恰好位于停止位之后. 此后只允许
    /// [`Self::read_pcm_samples`] 或结束 slice, 寄存器被复位到合法范围.
    pub fn decode_terminate(&mut self) -> u32 {
        self.range -= 2;
        if self.offset >= self.range {
            self.range = 510;
            self.offset = self.offset.min(509);
            return 1;
        }
        self.renorm();
        0
    }

    /// 读取 I_PCM 样本: 对齐后逐字节读取, 然后重新启动引擎
    pub fn read_pcm_samples(&mut self, out: &mut [u8]) {
        self.bits.align_to_byte();
        for b in out.iter_mut() {
            *b = self.bits.read_bits(8) as u8;
        }
        self.start();
    }
}
