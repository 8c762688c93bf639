use crate::poc::PocState;

use super::helpers::*;

#[test]
fn test_poc_type0_msb_wraps_forward() {
    let cfg = SeqConfig::default();
    let params = build_param_sets(&cfg);
    let mut state = PocState::default();

    let idr = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::idr(0, 1)));
    let n = state.compute(&idr);
    assert_eq!((n.frame_num, n.poc(), n.gap), (0, 0, 0));
    state.commit(&idr, &n, None);

    for (frame_num, lsb) in [(1, 100), (2, 200)] {
        let p = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(frame_num, lsb)));
        let n = state.compute(&p);
        assert_eq!(n.poc(), lsb as i32);
        state.commit(&p, &n, None);
    }

    // lsb 从 200 回绕到 4, PicOrderCntMsb 增加 256
    let p = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(3, 4)));
    let n = state.compute(&p);
    assert_eq!(n.poc(), 260, "lsb 回绕后 POC 应继续递增");

    // IDR 之后直接跳到大 lsb 时 Msb 减少
    let mut fresh = PocState::default();
    let first = fresh.compute(&idr);
    fresh.commit(&idr, &first, None);
    let back = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(1, 250)));
    assert_eq!(fresh.compute(&back).poc(), -6);
}

#[test]
fn test_compute_does_not_mutate_state() {
    let cfg = SeqConfig::default();
    let params = build_param_sets(&cfg);
    let mut state = PocState::default();
    let idr = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::idr(0, 1)));
    let n = state.compute(&idr);
    state.commit(&idr, &n, None);

    let p = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(1, 8)));
    let before = state;
    let a = state.compute(&p);
    let b = state.compute(&p);
    assert_eq!(a, b, "重复计算结果应一致");
    assert_eq!(state, before, "compute 不应修改状态");
}

#[test]
fn test_non_reference_picture_does_not_advance_state() {
    let cfg = SeqConfig::default();
    let params = build_param_sets(&cfg);
    let mut state = PocState::default();
    let idr = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::idr(0, 1)));
    let n = state.compute(&idr);
    state.commit(&idr, &n, None);

    let b = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(1, 2).non_ref()));
    let n = state.compute(&b);
    assert_eq!((n.frame_num, n.gap), (1, 0));
    state.commit(&b, &n, None);
    assert_eq!(state.prev_ref_frame_num(), 0, "非参考图像不更新 prevRefFrameNum");

    let p = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(1, 4)));
    assert_eq!(state.compute(&p).gap, 0, "非参考图像之后的同 frame_num 参考图像不是间隔");
}

#[test]
fn test_frame_num_gap_and_wrap() {
    let cfg = SeqConfig::default();
    let params = build_param_sets(&cfg);
    let mut state = PocState::default();
    let idr = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::idr(0, 1)));
    let n = state.compute(&idr);
    state.commit(&idr, &n, None);

    let p = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(3, 6)));
    let n = state.compute(&p);
    assert_eq!((n.frame_num, n.gap), (3, 2));

    // MaxFrameNum = 16, 从 15 回绕到 0 时绝对 FrameNum 继续递增
    state.commit_gap(15);
    let wrap = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(0, 6)));
    let n = state.compute(&wrap);
    assert_eq!((n.frame_num, n.gap), (16, 0));
}

#[test]
fn test_poc_type1_expected_counts() {
    let cfg = SeqConfig {
        poc_type: 1,
        ..SeqConfig::default()
    };
    let params = build_param_sets(&cfg);
    let mut state = PocState::default();
    let idr = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::idr(0, 1)));
    let n = state.compute(&idr);
    assert_eq!(n.poc(), 0);
    state.commit(&idr, &n, None);

    // 每个参考帧前进 offset_for_ref_frame[0] = 2
    let p = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(1, 0)));
    let n = state.compute(&p);
    assert_eq!(n.poc(), 2);
    state.commit(&p, &n, None);

    let b = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(2, 0).non_ref()));
    assert_eq!(state.compute(&b).poc(), 1, "非参考图像加上 offset_for_non_ref_pic");

    let sps = &b.sps;
    let gap = state.gap_frame(sps, 2);
    assert_eq!((gap.frame_num, gap.poc()), (3, 6));
}

#[test]
fn test_poc_type2_follows_decode_order() {
    let cfg = SeqConfig {
        poc_type: 2,
        ..SeqConfig::default()
    };
    let params = build_param_sets(&cfg);
    let mut state = PocState::default();
    let idr = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::idr(0, 0)));
    let n = state.compute(&idr);
    state.commit(&idr, &n, None);

    let p = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(1, 0)));
    let n = state.compute(&p);
    assert_eq!(n.poc(), 2);
    state.commit(&p, &n, None);

    let b = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(2, 0).non_ref()));
    assert_eq!(state.compute(&b).poc(), 3);

    state.reset();
    assert_eq!(state, PocState::default());
}

#[test]
fn test_mmco5_commit_rebases_prev_lsb() {
    let cfg = SeqConfig::default();
    let params = build_param_sets(&cfg);
    let mut state = PocState::default();
    let idr = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::idr(0, 1)));
    let n = state.compute(&idr);
    state.commit(&idr, &n, None);

    let p = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(1, 8)));
    let n = state.compute(&p);
    state.commit(&p, &n, Some(0));
    assert_eq!(state.prev_ref_frame_num(), 0);

    let next = parse_header(&params, build_slice_nal(&cfg, &SliceDesc::p(1, 4)));
    let n = state.compute(&next);
    assert_eq!((n.frame_num, n.poc()), (1, 4));
}
