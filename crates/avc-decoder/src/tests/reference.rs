use crate::refs::{MmcoOp, ReferenceSet, iter_bits};

use super::helpers::*;

/// 短期与长期互斥, 参考帧数不超过上限
fn assert_marking_invariant(refs: &ReferenceSet, max_num_ref_frames: u32) {
    assert_eq!(
        refs.short_term_only() & refs.long_term_only(),
        0,
        "短期与长期参考不能重叠"
    );
    assert!(
        refs.count() <= max_num_ref_frames,
        "参考帧数超过上限, count={}, max={}",
        refs.count(),
        max_num_ref_frames
    );
}

#[test]
fn test_sliding_window_keeps_latest_four_frames() {
    let cfg = SeqConfig {
        restriction: Some((0, 4)),
        ..SeqConfig::default()
    };
    let mut slices = vec![SliceDesc::idr(0, 10)];
    slices.extend((1..6).map(|n| SliceDesc::p(n, n * 2)));
    let nals = build_sequence(&cfg, &slices);

    let mut dec = build_test_decoder();
    let mut out = Vec::new();
    for nal in &nals {
        feed(&mut dec, nal, &mut out);
        assert_marking_invariant(dec.references(), 4);
    }
    assert_eq!(
        short_term_frame_nums(dec.references()),
        vec![2, 3, 4, 5],
        "滑动窗口应淘汰最早的两帧"
    );
    assert_eq!(dec.references().long_term_only(), 0);

    dec.flush();
    drain(&mut dec, &mut out);
    assert_eq!(out.len(), 6);
    assert!(dec.references().count() == 0, "flush 后参考集合应为空");
}

#[test]
fn test_mmco_forget_short_term() {
    let cfg = SeqConfig::default();
    let nals = build_sequence(
        &cfg,
        &[
            SliceDesc::idr(0, 10),
            SliceDesc::p(1, 2),
            SliceDesc::p(2, 4),
            // CurrPicNum = 3, picNumX = 3 - 2 = 1
            SliceDesc::p(3, 6).with_mmco(vec![MmcoOp::ForgetShort {
                difference_of_pic_nums_minus1: 1,
            }]),
        ],
    );
    let mut dec = build_test_decoder();
    let mut out = Vec::new();
    for nal in &nals {
        feed(&mut dec, nal, &mut out);
    }
    assert_eq!(short_term_frame_nums(dec.references()), vec![0, 2, 3]);
    assert_marking_invariant(dec.references(), 4);
}

#[test]
fn test_mmco_convert_short_to_long() {
    let cfg = SeqConfig::default();
    let nals = build_sequence(
        &cfg,
        &[
            SliceDesc::idr(0, 10),
            SliceDesc::p(1, 2),
            SliceDesc::p(2, 4).with_mmco(vec![
                MmcoOp::TrimLong {
                    max_long_term_frame_idx_plus1: 1,
                },
                MmcoOp::ConvertShortToLong {
                    difference_of_pic_nums_minus1: 0,
                    long_term_frame_idx: 0,
                },
            ]),
        ],
    );
    let mut dec = build_test_decoder();
    let mut out = Vec::new();
    for nal in &nals {
        feed(&mut dec, nal, &mut out);
    }
    let refs = dec.references();
    assert_eq!(short_term_frame_nums(refs), vec![0, 2]);
    let long: Vec<i32> = iter_bits(refs.long_term_only())
        .map(|s| refs.entry(s).frame_num)
        .collect();
    assert_eq!(long, vec![1], "frame_num 1 应转为长期参考");
    assert_eq!(refs.entry(iter_bits(refs.long_term_only()).next().unwrap_or(0)).long_term_idx, 0);
    assert_marking_invariant(refs, 4);
}

#[test]
fn test_mmco5_clears_references_and_restarts_output_order() {
    let cfg = SeqConfig::default();
    let nals = build_sequence(
        &cfg,
        &[
            SliceDesc::idr(0, 10),
            SliceDesc::p(1, 4),
            SliceDesc::p(2, 8).with_mmco(vec![MmcoOp::ClearAll]),
            SliceDesc::p(1, 4),
        ],
    );
    let mut dec = build_test_decoder();
    let out = decode_stream(&mut dec, &nals);
    assert_eq!(pocs(&out), vec![0, 4, 0, 4], "MMCO5 之前的图像先全部输出");
    assert_eq!(out[2].frame_num, 0, "MMCO5 图像的 FrameNum 视为 0");
}

#[test]
fn test_idr_clears_references() {
    let cfg = SeqConfig::default();
    let nals = build_sequence(
        &cfg,
        &[
            SliceDesc::idr(0, 10),
            SliceDesc::p(1, 2),
            SliceDesc::p(2, 4),
            SliceDesc::idr(0, 20).with_idr_pic_id(1),
        ],
    );
    let mut dec = build_test_decoder();
    let mut out = Vec::new();
    for nal in &nals {
        feed(&mut dec, nal, &mut out);
    }
    assert_eq!(short_term_frame_nums(dec.references()), vec![0]);
    assert_eq!(dec.references().count(), 1);

    dec.flush();
    drain(&mut dec, &mut out);
    assert_eq!(pocs(&out), vec![0, 2, 4, 0], "IDR 之前的图像应先输出");
    assert!(out[3].idr);
    assert_eq!(first_luma(&out[3]), 20);
}

#[test]
fn test_idr_no_output_of_prior_pics_discards_waiting() {
    let cfg = SeqConfig::default();
    let nals = build_sequence(
        &cfg,
        &[
            SliceDesc::idr(0, 10),
            SliceDesc::p(1, 2),
            SliceDesc::p(2, 4),
            SliceDesc::idr(0, 20)
                .with_idr_pic_id(1)
                .no_output_of_prior_pics(),
        ],
    );
    let mut dec = build_test_decoder();
    let out = decode_stream(&mut dec, &nals);
    // 重排窗口为 2: 第三张图像开始时 POC 0 已输出, POC 2 和 4 仍在等待
    assert_eq!(pocs(&out), vec![0, 0]);
    assert!(out[1].idr);
}

#[test]
fn test_frame_num_gap_inserts_non_existing_frames() {
    let cfg = SeqConfig {
        gaps_allowed: true,
        ..SeqConfig::default()
    };
    let nals = build_sequence(
        &cfg,
        &[SliceDesc::idr(0, 10), SliceDesc::p(1, 2), SliceDesc::p(4, 8)],
    );
    let mut dec = build_test_decoder();
    let mut out = Vec::new();
    for nal in &nals {
        feed(&mut dec, nal, &mut out);
    }
    let refs = dec.references();
    assert_eq!(refs.non_existing().count_ones(), 2, "应插入两个不存在帧");
    let mut gap_nums: Vec<i32> = iter_bits(refs.non_existing())
        .map(|s| refs.entry(s).frame_num)
        .collect();
    gap_nums.sort_unstable();
    assert_eq!(gap_nums, vec![2, 3]);
    assert_eq!(short_term_frame_nums(refs), vec![1, 4], "滑动窗口计入不存在帧");
    assert_marking_invariant(refs, 4);

    dec.flush();
    drain(&mut dec, &mut out);
    assert_eq!(pocs(&out), vec![0, 2, 8], "不存在帧不输出");
    assert!(out.iter().all(|f| !f.corrupt));
}

#[test]
fn test_long_gap_only_keeps_window() {
    let cfg = SeqConfig {
        gaps_allowed: true,
        ..SeqConfig::default()
    };
    let nals = build_sequence(&cfg, &[SliceDesc::idr(0, 10), SliceDesc::p(12, 8)]);
    let mut dec = build_test_decoder();
    let mut out = Vec::new();
    for nal in &nals {
        feed(&mut dec, nal, &mut out);
    }
    let refs = dec.references();
    assert_eq!(refs.count(), 4);
    assert_eq!(short_term_frame_nums(refs), vec![12]);
    let mut gap_nums: Vec<i32> = iter_bits(refs.non_existing())
        .map(|s| refs.entry(s).frame_num)
        .collect();
    gap_nums.sort_unstable();
    assert_eq!(gap_nums, vec![9, 10, 11], "只保留窗口内最新的不存在帧");
}
