//! 参考 CABAC 编码器.
//!
//! 按标准 9.3.4 的 EncodeDecision / EncodeBypass / EncodeTerminate / EncodeFlush 实现,
//! 与 [`super::ArithmeticDecoder`] 使用同一套上下文初始化. 用于往返回归测试和构造测试码流.

use avc_core::BitWriter;

use super::tables::{RANGE_TAB_LPS, TRANS_IDX_LPS, TRANS_IDX_MPS};
use super::{CabacCtx, NUM_CONTEXTS, init_contexts};

/// CABAC 参考编码器
pub struct CabacEncoder {
    writer: BitWriter,
    low: u32,
    range: u32,
    first_bit: bool,
    outstanding: u32,
    ctxs: [CabacCtx; NUM_CONTEXTS],
}

impl CabacEncoder {
    /// 在 `writer` 的当前位置开始编码, 若未对齐先以 1 比特填充 (cabac_alignment_one_bit)
    pub fn new(mut writer: BitWriter, mode: usize, qp: i32) -> Self {
        while !writer.is_byte_aligned() {
            writer.write_bit(1);
        }
        let mut ctxs = [CabacCtx::default(); NUM_CONTEXTS];
        init_contexts(&mut ctxs, mode, qp);
        Self {
            writer,
            low: 0,
            range: 510,
            first_bit: true,
            outstanding: 0,
            ctxs,
        }
    }

    fn restart(&mut self) {
        self.low = 0;
        self.range = 510;
        self.first_bit = true;
        self.outstanding = 0;
    }

    fn put_bit(&mut self, bit: u32) {
        if self.first_bit {
            self.first_bit = false;
        } else {
            self.writer.write_bit(bit);
        }
        while self.outstanding > 0 {
            self.writer.write_bit(1 - bit);
            self.outstanding -= 1;
        }
    }

    fn renorm(&mut self) {
        while self.range < 256 {
            if self.low < 256 {
                self.put_bit(0);
            } else if self.low >= 512 {
                self.low -= 512;
                self.put_bit(1);
            } else {
                self.low -= 256;
                self.outstanding += 1;
            }
            self.range <<= 1;
            self.low <<= 1;
        }
    }

    /// 编码一个上下文自适应 bin
    pub fn encode_bin(&mut self, ctx_idx: usize, bin: u32) {
        let ctx = &mut self.ctxs[ctx_idx % NUM_CONTEXTS];
        let q = ((self.range >> 6) & 3) as usize;
        let lps = u32::from(RANGE_TAB_LPS[ctx.state as usize & 63][q]);
        self.range -= lps;
        if (bin & 1) as u8 != ctx.mps {
            self.low += self.range;
            self.range = lps;
            if ctx.state == 0 {
                ctx.mps = 1 - ctx.mps;
            }
            ctx.state = TRANS_IDX_LPS[ctx.state as usize & 63];
        } else {
            ctx.state = TRANS_IDX_MPS[ctx.state as usize & 63];
        }
        self.renorm();
    }

    /// 编码一个等概率 bin
    pub fn encode_bypass(&mut self, bin: u32) {
        self.low <<= 1;
        if bin & 1 == 1 {
            self.low += self.range;
        }
        if self.low >= 1024 {
            self.put_bit(1);
            self.low -= 1024;
        } else if self.low < 512 {
            self.put_bit(0);
        } else {
            self.low -= 512;
            self.outstanding += 1;
        }
    }

    /// 编码 `n` 个等概率 bin, 高位在前
    pub fn encode_bypass_value(&mut self, value: u32, n: u32) {
        for i in (0..n.min(32)).rev() {
            self.encode_bypass(value >> i);
        }
    }

    /// 编码 k 阶 Exp-Golomb 旁路后缀
    pub fn encode_ueg_suffix(&mut self, mut value: u32, mut k: u32) {
        while value >= 1 << k {
            self.encode_bypass(1);
            value -= 1 << k;
            k += 1;
        }
        self.encode_bypass(0);
        self.encode_bypass_value(value, k);
    }

    /// 编码终止 bin, 为 1 时冲刷引擎, 最后写出的比特即停止位
    pub fn encode_terminate(&mut self, bin: u32) {
        self.range -= 2;
        if bin & 1 == 1 {
            self.low += self.range;
            self.flush();
        } else {
            self.renorm();
        }
    }

    fn flush(&mut self) {
        self.range = 2;
        self.renorm();
        self.put_bit((self.low >> 9) & 1);
        self.writer.write_bits(((self.low >> 7) & 3) | 1, 2);
    }

    /// 在 `encode_terminate(1)` 之后写入 I_PCM 样本并重启引擎
    pub fn write_pcm_samples(&mut self, samples: &[u8]) {
        self.writer.align_to_byte();
        self.writer.write_bytes(samples);
        self.restart();
    }

    /// 结束编码, 交还写入器 (位于停止位之后, 尚未对齐)
    pub fn finish(self) -> BitWriter {
        self.writer
    }
}
