//! CABAC 残差块解码 (7.3.5.3.3 residual_block_cabac).
//!
//! 系数按扫描顺序写入输出切片, 反扫描与反量化由重建核完成.

use avc_core::{AvcError, AvcResult};

use crate::cabac::ArithmeticDecoder;

// ============================================================
// 块类别
// ============================================================

/// ctxBlockCat 对应的上下文偏移
pub(super) struct BlockCat {
    /// coded_block_flag 上下文起点, `None` 表示不编码 (4:2:0 的 8x8 亮度块)
    pub cbf_offset: Option<usize>,
    pub sig_offset: usize,
    pub last_offset: usize,
    pub abs_offset: usize,
    pub max_coeff: usize,
    /// 色度 DC 的显著性上下文按 min(i, 2) 选择
    pub chroma_dc: bool,
    /// 8x8 块使用查表的显著性上下文
    pub is_8x8: bool,
}

/// Intra_16x16 亮度 DC (cat 0)
pub(super) const LUMA_DC: BlockCat = BlockCat {
    cbf_offset: Some(85),
    sig_offset: 105,
    last_offset: 166,
    abs_offset: 227,
    max_coeff: 16,
    chroma_dc: false,
    is_8x8: false,
};

/// Intra_16x16 亮度 AC (cat 1)
pub(super) const LUMA_AC: BlockCat = BlockCat {
    cbf_offset: Some(85 + 4),
    sig_offset: 105 + 15,
    last_offset: 166 + 15,
    abs_offset: 227 + 10,
    max_coeff: 15,
    chroma_dc: false,
    is_8x8: false,
};

/// 亮度 4x4 (cat 2)
pub(super) const LUMA_4X4: BlockCat = BlockCat {
    cbf_offset: Some(85 + 8),
    sig_offset: 105 + 29,
    last_offset: 166 + 29,
    abs_offset: 227 + 20,
    max_coeff: 16,
    chroma_dc: false,
    is_8x8: false,
};

/// 色度 DC, 4:2:0 (cat 3)
pub(super) const CHROMA_DC: BlockCat = BlockCat {
    cbf_offset: Some(85 + 12),
    sig_offset: 105 + 44,
    last_offset: 166 + 44,
    abs_offset: 227 + 30,
    max_coeff: 4,
    chroma_dc: true,
    is_8x8: false,
};

/// 色度 AC (cat 4)
pub(super) const CHROMA_AC: BlockCat = BlockCat {
    cbf_offset: Some(85 + 16),
    sig_offset: 105 + 47,
    last_offset: 166 + 47,
    abs_offset: 227 + 39,
    max_coeff: 15,
    chroma_dc: false,
    is_8x8: false,
};

/// 亮度 8x8 (cat 5), 帧编码
pub(super) const LUMA_8X8: BlockCat = BlockCat {
    cbf_offset: None,
    sig_offset: 402,
    last_offset: 417,
    abs_offset: 426,
    max_coeff: 64,
    chroma_dc: false,
    is_8x8: true,
};

/// 8x8 块 significant_coeff_flag 的 ctxIdxInc (帧编码)
const SIG_INC_8X8: [u8; 63] = [
    0, 1, 2, 3, 4, 5, 5, 4, 4, 3, 3, 4, 4, 4, 5, 5, //
    4, 4, 4, 4, 3, 3, 6, 7, 7, 7, 8, 9, 10, 9, 8, 7, //
    7, 6, 11, 12, 13, 11, 6, 7, 8, 9, 14, 10, 9, 8, 6, 11, //
    12, 13, 11, 6, 9, 14, 10, 9, 11, 12, 13, 11, 14, 10, 12,
];

/// 8x8 块 last_significant_coeff_flag 的 ctxIdxInc
const LAST_INC_8X8: [u8; 63] = [
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, //
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, //
    3, 3, 3, 3, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, //
    5, 5, 5, 5, 6, 6, 6, 6, 7, 7, 7, 7, 8, 8, 8,
];

/// coeff_abs_level_minus1 前缀的截断值
const ABS_PREFIX_MAX: u32 = 14;

/// 系数绝对值上限, 超出视为数据损坏
const MAX_ABS_LEVEL: u32 = 1 << 20;

// ============================================================
// 块解码
// ============================================================

/// 解码一个残差块, 返回 coded_block_flag
///
/// `coeffs` 至少包含 `cat.max_coeff` 个元素, 调用方负责清零.
pub(super) fn decode_residual_block(
    dec: &mut ArithmeticDecoder<'_>,
    cat: &BlockCat,
    cbf_inc: usize,
    coeffs: &mut [i32],
) -> AvcResult<bool> {
    if let Some(offset) = cat.cbf_offset {
        if dec.decode_bin(offset + cbf_inc.min(3)) == 0 {
            return Ok(false);
        }
    }

    let mut positions = [0u8; 64];
    let count = decode_significance_map(dec, cat, &mut positions);
    decode_levels(dec, cat, &positions[..count], coeffs)?;
    Ok(true)
}

/// 解码显著性图, 按扫描顺序写出非零位置, 返回个数
fn decode_significance_map(
    dec: &mut ArithmeticDecoder<'_>,
    cat: &BlockCat,
    positions: &mut [u8; 64],
) -> usize {
    let last_pos = cat.max_coeff - 1;
    let mut count = 0;
    for i in 0..last_pos {
        let (sig_inc, last_inc) = if cat.is_8x8 {
            (usize::from(SIG_INC_8X8[i]), usize::from(LAST_INC_8X8[i]))
        } else if cat.chroma_dc {
            (i.min(2), i.min(2))
        } else {
            (i, i)
        };
        if dec.decode_bin(cat.sig_offset + sig_inc) == 1 {
            positions[count] = i as u8;
            count += 1;
            if dec.decode_bin(cat.last_offset + last_inc) == 1 {
                return count;
            }
        }
    }
    // 未遇到 last 标志时最后一个位置必然显著
    positions[count] = last_pos as u8;
    count + 1
}

/// 逆扫描顺序解码系数绝对值与符号
fn decode_levels(
    dec: &mut ArithmeticDecoder<'_>,
    cat: &BlockCat,
    positions: &[u8],
    coeffs: &mut [i32],
) -> AvcResult<()> {
    let gt1_cap = if cat.chroma_dc { 3 } else { 4 };
    let mut num_eq1 = 0usize;
    let mut num_gt1 = 0usize;

    for &pos in positions.iter().rev() {
        let inc0 = if num_gt1 != 0 { 0 } else { (1 + num_eq1).min(4) };
        let mut level = 1u32;
        if dec.decode_bin(cat.abs_offset + inc0) == 1 {
            let ctx = cat.abs_offset + 5 + num_gt1.min(gt1_cap);
            let mut prefix = 1u32;
            while prefix < ABS_PREFIX_MAX && dec.decode_bin(ctx) == 1 {
                prefix += 1;
            }
            if prefix >= ABS_PREFIX_MAX {
                prefix = prefix.saturating_add(dec.decode_ueg_suffix(0));
            }
            level = prefix + 1;
        }
        if level > MAX_ABS_LEVEL {
            return Err(AvcError::MalformedBitstream(format!(
                "H264: 残差系数过大, level={}",
                level
            )));
        }

        let value = level as i32;
        coeffs[usize::from(pos)] = if dec.decode_bypass() == 1 { -value } else { value };
        if level == 1 {
            num_eq1 += 1;
        } else {
            num_gt1 += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cabac::CabacEncoder;
    use avc_core::{BitCache, BitWriter};

    /// 参考编码: 按 residual_block_cabac 的顺序写出一个块
    fn encode_block(enc: &mut CabacEncoder, cat: &BlockCat, cbf_inc: usize, coeffs: &[i32]) {
        let n = cat.max_coeff;
        let nz: Vec<usize> = (0..n).filter(|&i| coeffs[i] != 0).collect();
        if let Some(offset) = cat.cbf_offset {
            enc.encode_bin(offset + cbf_inc, u32::from(!nz.is_empty()));
        }
        let Some(&last) = nz.last() else {
            return;
        };
        for i in 0..n - 1 {
            let (sig_inc, last_inc) = if cat.is_8x8 {
                (usize::from(SIG_INC_8X8[i]), usize::from(LAST_INC_8X8[i]))
            } else if cat.chroma_dc {
                (i.min(2), i.min(2))
            } else {
                (i, i)
            };
            let sig = coeffs[i] != 0;
            enc.encode_bin(cat.sig_offset + sig_inc, u32::from(sig));
            if sig {
                enc.encode_bin(cat.last_offset + last_inc, u32::from(i == last));
                if i == last {
                    break;
                }
            }
        }
        let gt1_cap = if cat.chroma_dc { 3 } else { 4 };
        let (mut eq1, mut gt1) = (0usize, 0usize);
        for &i in nz.iter().rev() {
            let abs = coeffs[i].unsigned_abs();
            let inc0 = if gt1 != 0 { 0 } else { (1 + eq1).min(4) };
            enc.encode_bin(cat.abs_offset + inc0, u32::from(abs > 1));
            if abs > 1 {
                let ctx = cat.abs_offset + 5 + gt1.min(gt1_cap);
                let minus1 = abs - 1;
                for _ in 1..minus1.min(ABS_PREFIX_MAX) {
                    enc.encode_bin(ctx, 1);
                }
                if minus1 < ABS_PREFIX_MAX {
                    enc.encode_bin(ctx, 0);
                } else {
                    enc.encode_ueg_suffix(minus1 - ABS_PREFIX_MAX, 0);
                }
            }
            enc.encode_bypass(u32::from(coeffs[i] < 0));
            if abs == 1 {
                eq1 += 1;
            } else {
                gt1 += 1;
            }
        }
    }

    fn round_trip(cat: &BlockCat, coeffs: &[i32]) -> (bool, Vec<i32>) {
        let mut enc = CabacEncoder::new(BitWriter::new(), 1, 30);
        encode_block(&mut enc, cat, 2, coeffs);
        enc.encode_terminate(1);
        let data = enc.finish().finish();

        let mut dec = ArithmeticDecoder::new(BitCache::new(&data), 1, 30);
        let mut out = vec![0i32; cat.max_coeff];
        let coded = decode_residual_block(&mut dec, cat, 2, &mut out).unwrap();
        assert_eq!(dec.decode_terminate(), 1, "块之后应紧跟终止 bin");
        (coded, out)
    }

    #[test]
    fn test_uncoded_block() {
        let (coded, out) = round_trip(&LUMA_4X4, &[0; 16]);
        assert!(!coded);
        assert!(out.iter().all(|&c| c == 0));
    }

    #[test]
    fn test_luma_4x4_mixed_levels() {
        let coeffs = [7, -1, 0, 2, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, -30];
        let (coded, out) = round_trip(&LUMA_4X4, &coeffs);
        assert!(coded);
        assert_eq!(out, coeffs.to_vec());
    }

    #[test]
    fn test_chroma_dc_context_saturates() {
        let coeffs = [-3, 0, 4, 1];
        let (_, out) = round_trip(&CHROMA_DC, &coeffs);
        assert_eq!(out, coeffs.to_vec());
    }

    #[test]
    fn test_luma_8x8_without_cbf() {
        let mut coeffs = [0i32; 64];
        coeffs[0] = 12;
        coeffs[5] = -1;
        coeffs[40] = 2;
        coeffs[63] = 1;
        let (coded, out) = round_trip(&LUMA_8X8, &coeffs);
        assert!(coded, "8x8 块不编码 cbf, 总是视为有系数");
        assert_eq!(out, coeffs.to_vec());
    }

    #[test]
    fn test_ac_block_has_fifteen_positions() {
        let mut coeffs = [0i32; 15];
        coeffs[14] = -2;
        let (_, out) = round_trip(&CHROMA_AC, &coeffs);
        assert_eq!(out, coeffs.to_vec());
    }
}
