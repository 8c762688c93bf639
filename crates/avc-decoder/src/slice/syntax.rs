//! 宏块层 CABAC 语法元素 (9.3.2 二值化 + 9.3.3.1 上下文选择).
//!
//! 上下文增量由调用方根据邻居推导后传入, 这里只负责 bin 串到语法值的映射.

use avc_core::{AvcError, AvcResult};

use crate::cabac::ArithmeticDecoder;

/// mb_qp_delta 的合法范围
const QP_DELTA_MIN: i32 = -26;
const QP_DELTA_MAX: i32 = 25;

/// 一元码 bin 的上限, 防止损坏数据导致长循环
const MAX_UNARY_BINS: u32 = 32;

/// mvd 前缀截断值 (uCoff)
const MVD_PREFIX_MAX: u32 = 9;

// ============================================================
// 宏块类型
// ============================================================

/// mb_skip_flag
pub(super) fn decode_mb_skip(dec: &mut ArithmeticDecoder<'_>, is_b: bool, inc: usize) -> bool {
    let base = if is_b { 24 } else { 11 };
    dec.decode_bin(base + inc) == 1
}

/// end_of_slice_flag
pub(super) fn decode_end_of_slice(dec: &mut ArithmeticDecoder<'_>) -> bool {
    dec.decode_terminate() == 1
}

/// I 切片的 mb_type (0 = I_NxN, 1..=24 = I_16x16, 25 = I_PCM)
pub(super) fn decode_i_mb_type(dec: &mut ArithmeticDecoder<'_>, inc: usize) -> u32 {
    if dec.decode_bin(3 + inc) == 0 {
        return 0;
    }
    decode_intra_suffix(dec, 3, true)
}

/// P 切片的 mb_type: 0..=3 为帧间类型, 5.. 为 5 + 帧内类型
pub(super) fn decode_p_mb_type(dec: &mut ArithmeticDecoder<'_>) -> u32 {
    if dec.decode_bin(14) == 1 {
        return 5 + decode_intra_mb_type(dec, 17);
    }
    if dec.decode_bin(15) == 0 {
        3 * dec.decode_bin(16)
    } else {
        2 - dec.decode_bin(17)
    }
}

/// B 切片的 mb_type: 0..=22 为帧间类型, 23.. 为 23 + 帧内类型
pub(super) fn decode_b_mb_type(dec: &mut ArithmeticDecoder<'_>, inc: usize) -> u32 {
    if dec.decode_bin(27 + inc) == 0 {
        return 0;
    }
    if dec.decode_bin(27 + 3) == 0 {
        return 1 + dec.decode_bin(27 + 5);
    }
    let mut bits = dec.decode_bin(27 + 4) << 3;
    bits |= dec.decode_bin(27 + 5) << 2;
    bits |= dec.decode_bin(27 + 5) << 1;
    bits |= dec.decode_bin(27 + 5);
    match bits {
        0..=7 => bits + 3,
        13 => 23 + decode_intra_mb_type(dec, 32),
        14 => 11,
        15 => 22,
        _ => (bits << 1 | dec.decode_bin(27 + 5)) - 4,
    }
}

/// P/B 切片中的帧内 mb_type 后缀, `base` 为 17 (P) 或 32 (B)
fn decode_intra_mb_type(dec: &mut ArithmeticDecoder<'_>, base: usize) -> u32 {
    if dec.decode_bin(base) == 0 {
        return 0;
    }
    decode_intra_suffix(dec, base, false)
}

/// bin0 = 1 之后的部分: I_PCM 判定与 I_16x16 的 cbp/预测模式
fn decode_intra_suffix(dec: &mut ArithmeticDecoder<'_>, base: usize, intra_slice: bool) -> u32 {
    if dec.decode_terminate() == 1 {
        return 25;
    }
    // I 切片的后缀上下文从 base + 3 开始, P/B 从 base + 1 开始且后两对共用
    let (luma, chroma, chroma2, pm0, pm1) = if intra_slice {
        (base + 3, base + 4, base + 5, base + 6, base + 7)
    } else {
        (base + 1, base + 2, base + 2, base + 3, base + 3)
    };
    let mut mb_type = 1 + 12 * dec.decode_bin(luma);
    if dec.decode_bin(chroma) == 1 {
        mb_type += 4 + 4 * dec.decode_bin(chroma2);
    }
    mb_type += 2 * dec.decode_bin(pm0);
    mb_type += dec.decode_bin(pm1);
    mb_type
}

/// P 切片 sub_mb_type (0 = 8x8, 1 = 8x4, 2 = 4x8, 3 = 4x4)
pub(super) fn decode_p_sub_mb_type(dec: &mut ArithmeticDecoder<'_>) -> u32 {
    if dec.decode_bin(21) == 1 {
        return 0;
    }
    if dec.decode_bin(22) == 0 {
        return 1;
    }
    if dec.decode_bin(23) == 1 { 2 } else { 3 }
}

/// B 切片 sub_mb_type (0 = B_Direct_8x8 .. 12 = B_Bi_4x4)
pub(super) fn decode_b_sub_mb_type(dec: &mut ArithmeticDecoder<'_>) -> u32 {
    if dec.decode_bin(36) == 0 {
        return 0;
    }
    if dec.decode_bin(37) == 0 {
        return 1 + dec.decode_bin(39);
    }
    let mut sub_type = 3;
    if dec.decode_bin(38) == 1 {
        if dec.decode_bin(39) == 1 {
            return 11 + dec.decode_bin(39);
        }
        sub_type += 4;
    }
    sub_type += 2 * dec.decode_bin(39);
    sub_type += dec.decode_bin(39);
    sub_type
}

// ============================================================
// 帧间预测语法
// ============================================================

/// ref_idx_lX, 结果须小于 `num_active`
pub(super) fn decode_ref_idx(
    dec: &mut ArithmeticDecoder<'_>,
    inc: usize,
    num_active: u32,
) -> AvcResult<u32> {
    let mut ctx = inc;
    let mut value = 0u32;
    while dec.decode_bin(54 + ctx) == 1 {
        value += 1;
        ctx = (ctx >> 2) + 4;
        if value >= MAX_UNARY_BINS {
            break;
        }
    }
    if value >= num_active {
        return Err(AvcError::MalformedBitstream(format!(
            "H264: ref_idx 超出范围, value={}, num_active={}",
            value, num_active
        )));
    }
    Ok(value)
}

/// mvd_lX 的一个分量, `comp` 为 0 (水平) 或 1 (垂直), `abs_sum` 为邻居 |mvd| 之和
pub(super) fn decode_mvd(dec: &mut ArithmeticDecoder<'_>, comp: usize, abs_sum: u32) -> i32 {
    let base = if comp == 0 { 40 } else { 47 };
    let inc = if abs_sum < 3 {
        0
    } else if abs_sum > 32 {
        2
    } else {
        1
    };
    if dec.decode_bin(base + inc) == 0 {
        return 0;
    }

    let mut prefix = 1u32;
    let mut ctx = base + 3;
    while prefix < MVD_PREFIX_MAX && dec.decode_bin(ctx) == 1 {
        if prefix < 4 {
            ctx += 1;
        }
        prefix += 1;
    }
    let mut value = prefix;
    if prefix >= MVD_PREFIX_MAX {
        value = value.saturating_add(dec.decode_ueg_suffix(3));
    }
    let value = value.min(i32::MAX as u32) as i32;
    if dec.decode_bypass() == 1 { -value } else { value }
}

// ============================================================
// 帧内预测语法
// ============================================================

/// prev_intra_pred_mode_flag + rem_intra_pred_mode, `None` 表示使用预测模式
pub(super) fn decode_intra_pred_mode(dec: &mut ArithmeticDecoder<'_>) -> Option<u8> {
    if dec.decode_bin(68) == 1 {
        return None;
    }
    let mut rem = dec.decode_bin(69);
    rem |= dec.decode_bin(69) << 1;
    rem |= dec.decode_bin(69) << 2;
    Some(rem as u8)
}

/// intra_chroma_pred_mode (0..=3)
pub(super) fn decode_intra_chroma_pred_mode(dec: &mut ArithmeticDecoder<'_>, inc: usize) -> u8 {
    if dec.decode_bin(64 + inc) == 0 {
        return 0;
    }
    if dec.decode_bin(67) == 0 {
        return 1;
    }
    if dec.decode_bin(67) == 0 { 2 } else { 3 }
}

// ============================================================
// 残差控制语法
// ============================================================

/// coded_block_pattern 亮度部分的一个 bin
pub(super) fn decode_cbp_luma_bit(dec: &mut ArithmeticDecoder<'_>, inc: usize) -> u8 {
    dec.decode_bin(73 + inc) as u8
}

/// coded_block_pattern 色度部分 (0..=2)
///
/// `left`/`top` 为邻居的 CodedBlockPatternChroma, 不可用时传 0.
pub(super) fn decode_cbp_chroma(dec: &mut ArithmeticDecoder<'_>, left: u8, top: u8) -> u8 {
    let inc = usize::from(left > 0) + 2 * usize::from(top > 0);
    if dec.decode_bin(77 + inc) == 0 {
        return 0;
    }
    let inc = 4 + usize::from(left == 2) + 2 * usize::from(top == 2);
    1 + dec.decode_bin(77 + inc) as u8
}

/// transform_size_8x8_flag
pub(super) fn decode_transform_8x8(dec: &mut ArithmeticDecoder<'_>, inc: usize) -> bool {
    dec.decode_bin(399 + inc) == 1
}

/// mb_qp_delta, `prev_nonzero` 为解码顺序上前一宏块的 mb_qp_delta 是否非 0
pub(super) fn decode_qp_delta(dec: &mut ArithmeticDecoder<'_>, prev_nonzero: bool) -> AvcResult<i32> {
    let mut ctx = usize::from(prev_nonzero);
    let mut value = 0u32;
    while dec.decode_bin(60 + ctx) == 1 {
        ctx = 2 + (ctx >> 1);
        value += 1;
        if value > (QP_DELTA_MAX - QP_DELTA_MIN) as u32 + 1 {
            break;
        }
    }
    let delta = match value {
        0 => 0,
        v if v & 1 == 1 => v.div_ceil(2) as i32,
        v => -(v.div_ceil(2) as i32),
    };
    if !(QP_DELTA_MIN..=QP_DELTA_MAX).contains(&delta) {
        return Err(AvcError::MalformedBitstream(format!(
            "H264: mb_qp_delta 超出范围, value={}",
            delta
        )));
    }
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cabac::CabacEncoder;
    use avc_core::{BitCache, BitWriter};

    /// 用参考编码器写入一串 (ctx, bin), 再以终止 bin 结束
    fn encode(bins: &[(usize, u32)]) -> Vec<u8> {
        let mut enc = CabacEncoder::new(BitWriter::new(), 0, 26);
        for &(ctx, bin) in bins {
            enc.encode_bin(ctx, bin);
        }
        enc.encode_terminate(1);
        enc.finish().finish()
    }

    fn decoder(data: &[u8]) -> ArithmeticDecoder<'_> {
        ArithmeticDecoder::new(BitCache::new(data), 0, 26)
    }

    #[test]
    fn test_p_mb_type_mapping() {
        let cases: [(&[(usize, u32)], u32); 4] = [
            (&[(14, 0), (15, 0), (16, 0)], 0),
            (&[(14, 0), (15, 1), (17, 1)], 1),
            (&[(14, 0), (15, 1), (17, 0)], 2),
            (&[(14, 0), (15, 0), (16, 1)], 3),
        ];
        for (bins, expected) in cases {
            let data = encode(bins);
            let mut dec = decoder(&data);
            assert_eq!(decode_p_mb_type(&mut dec), expected, "bins={:?}", bins);
            assert!(decode_end_of_slice(&mut dec));
        }
    }

    #[test]
    fn test_i_mb_type_16x16_suffix() {
        // I_16x16_2_1_1: cbp_luma=15 -> 1 + 2 + 4 + 12 = 19
        let mut enc = CabacEncoder::new(BitWriter::new(), 0, 26);
        enc.encode_bin(3, 1);
        enc.encode_terminate(0);
        enc.encode_bin(6, 1);
        enc.encode_bin(7, 1);
        enc.encode_bin(8, 0);
        enc.encode_bin(9, 1);
        enc.encode_bin(10, 0);
        enc.encode_terminate(1);
        let data = enc.finish().finish();
        let mut dec = decoder(&data);
        assert_eq!(decode_i_mb_type(&mut dec, 0), 19);
        assert!(decode_end_of_slice(&mut dec));
    }

    #[test]
    fn test_b_mb_type_long_codes() {
        // 111110 -> bits=0b1111 -> B_8x8
        let data = encode(&[(27, 1), (30, 1), (31, 1), (32, 1), (32, 1), (32, 1)]);
        let mut dec = decoder(&data);
        assert_eq!(decode_b_mb_type(&mut dec, 0), 22);

        // bits=0b1000 后追加 1 -> (0b10001) - 4 = 13
        let data = encode(&[(28, 1), (30, 1), (31, 1), (32, 0), (32, 0), (32, 0), (32, 1)]);
        let mut dec = decoder(&data);
        assert_eq!(decode_b_mb_type(&mut dec, 1), 13);
    }

    #[test]
    fn test_b_sub_mb_type_mapping() {
        let data = encode(&[(36, 1), (37, 1), (38, 1), (39, 1), (39, 1)]);
        let mut dec = decoder(&data);
        assert_eq!(decode_b_sub_mb_type(&mut dec), 12, "B_Bi_4x4");

        let data = encode(&[(36, 1), (37, 1), (38, 0), (39, 1), (39, 0)]);
        let mut dec = decoder(&data);
        assert_eq!(decode_b_sub_mb_type(&mut dec), 5, "B_L0_4x8");
    }

    #[test]
    fn test_ref_idx_out_of_range_is_malformed() {
        let data = encode(&[(54, 1), (58, 1), (59, 0)]);
        let mut dec = decoder(&data);
        assert_eq!(decode_ref_idx(&mut dec, 0, 3).unwrap(), 2);

        let data = encode(&[(54, 1), (58, 1), (59, 0)]);
        let mut dec = decoder(&data);
        assert!(matches!(
            decode_ref_idx(&mut dec, 0, 2),
            Err(AvcError::MalformedBitstream(_))
        ));
    }

    #[test]
    fn test_mvd_with_exp_golomb_suffix() {
        // |mvd| = 9 + 5: 前缀 9 个 1, UEG3 后缀 5 = 0 + 3 比特 101, 负号
        let mut enc = CabacEncoder::new(BitWriter::new(), 0, 26);
        enc.encode_bin(47 + 1, 1);
        for ctx in [50, 51, 52, 53, 53, 53, 53, 53] {
            enc.encode_bin(ctx, 1);
        }
        enc.encode_ueg_suffix(5, 3);
        enc.encode_bypass(1);
        enc.encode_terminate(1);
        let data = enc.finish().finish();
        let mut dec = decoder(&data);
        assert_eq!(decode_mvd(&mut dec, 1, 10), -14);
        assert!(decode_end_of_slice(&mut dec));
    }

    #[test]
    fn test_qp_delta_sign_alternates() {
        let data = encode(&[(61, 1), (62, 1), (63, 1), (63, 0)]);
        let mut dec = decoder(&data);
        assert_eq!(decode_qp_delta(&mut dec, true).unwrap(), 2);

        let data = encode(&[(60, 1), (62, 0)]);
        let mut dec = decoder(&data);
        assert_eq!(decode_qp_delta(&mut dec, false).unwrap(), 1);
    }

    #[test]
    fn test_chroma_pred_mode_and_cbp_chroma() {
        let data = encode(&[(65, 1), (67, 1), (67, 1), (77 + 3, 1), (77 + 4 + 2, 1)]);
        let mut dec = decoder(&data);
        assert_eq!(decode_intra_chroma_pred_mode(&mut dec, 1), 3);
        assert_eq!(decode_cbp_chroma(&mut dec, 1, 2), 2);
    }

    #[test]
    fn test_intra_pred_mode_rem_is_lsb_first() {
        let data = encode(&[(68, 0), (69, 1), (69, 0), (69, 1), (68, 1)]);
        let mut dec = decoder(&data);
        assert_eq!(decode_intra_pred_mode(&mut dec), Some(5));
        assert_eq!(decode_intra_pred_mode(&mut dec), None);
    }
}
