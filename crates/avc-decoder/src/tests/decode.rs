use avc_core::AvcError;

use super::helpers::*;

/// 第 `mb_y` 行第 `mb_x` 列宏块左上角的亮度样本
fn mb_luma(frame: &crate::picture::Frame, mb_x: usize, mb_y: usize) -> u8 {
    let planes = frame.planes();
    planes.y[planes.luma_offset(mb_x, mb_y)]
}

#[test]
fn test_picture_split_into_two_slices() {
    let cfg = SeqConfig::default();
    let nals = build_sequence(
        &cfg,
        &[
            SliceDesc::idr(0, 40).part(0, 2),
            SliceDesc::idr(0, 40).part(2, 2),
            SliceDesc::p(1, 2).part(0, 1),
            SliceDesc::p(1, 2).part(1, 3),
        ],
    );
    let mut dec = build_test_decoder();
    let out = decode_stream(&mut dec, &nals);
    assert_eq!(pocs(&out), vec![0, 2], "多个切片属于同一张图像");
    for frame in &out {
        assert!(!frame.corrupt);
        for mb in 0..4 {
            assert_eq!(mb_luma(frame, mb % 2, mb / 2), 40, "宏块 {} 样本不一致", mb);
        }
    }
}

#[test]
fn test_missing_slice_is_concealed() {
    let cfg = SeqConfig::default();
    let nals = build_sequence(
        &cfg,
        &[
            SliceDesc::idr(0, 40).part(0, 2),
            // 第二个切片丢失, 下一张图像开始
            SliceDesc::intra(1, 2, 90),
            SliceDesc::p(2, 4).part(0, 1),
        ],
    );
    let mut dec = build_test_decoder();
    let out = decode_stream(&mut dec, &nals);
    assert_eq!(pocs(&out), vec![0, 2, 4]);

    let idr = &out[0];
    assert!(idr.corrupt, "缺少宏块的图像应标记为损坏");
    assert_eq!(mb_luma(idr, 0, 0), 40);
    assert_eq!(mb_luma(idr, 0, 1), 128, "没有参考时以中灰隐藏");

    assert!(!out[1].corrupt);

    let p = &out[2];
    assert!(p.corrupt);
    assert_eq!(mb_luma(p, 0, 0), 90, "P_Skip 复制参考");
    assert_eq!(mb_luma(p, 1, 1), 90, "缺失宏块从最近的参考复制");
}

#[test]
fn test_duplicate_slice_after_complete_picture_is_rejected() {
    let cfg = SeqConfig::default();
    let mut dec = build_test_decoder();
    let mut out = Vec::new();
    for nal in build_sequence(
        &cfg,
        &[
            SliceDesc::idr(0, 40).part(0, 2),
            SliceDesc::idr(0, 40).part(2, 2),
        ],
    ) {
        feed(&mut dec, &nal, &mut out);
    }
    let dup = build_slice_nal(&cfg, &SliceDesc::idr(0, 40).part(2, 2));
    let err = dec.decode_nal(&dup).expect_err("重复切片必须报错");
    assert!(matches!(err, AvcError::MalformedBitstream(_)));

    dec.flush();
    drain(&mut dec, &mut out);
    assert_eq!(out.len(), 1);
    assert!(!out[0].corrupt, "被拒绝的切片不影响已完成的图像");
}

#[test]
fn test_overlapping_slice_marks_picture_corrupt() {
    let cfg = SeqConfig::default();
    let mut dec = build_test_decoder();
    let mut out = Vec::new();
    for nal in build_sequence(&cfg, &[SliceDesc::idr(0, 40).part(0, 3)]) {
        feed(&mut dec, &nal, &mut out);
    }
    // 从宏块 1 开始的切片与已解码宏块重叠
    let overlap = build_slice_nal(&cfg, &SliceDesc::idr(0, 70).part(1, 3));
    let err = dec.decode_nal(&overlap).expect_err("重叠切片必须报错");
    assert!(matches!(err, AvcError::MalformedBitstream(_)));

    dec.flush();
    drain(&mut dec, &mut out);
    assert_eq!(out.len(), 1);
    assert!(out[0].corrupt);
    assert_eq!(mb_luma(&out[0], 1, 0), 40, "已解码的宏块保持不变");
}

#[test]
fn test_redundant_slices_are_skipped() {
    let cfg = SeqConfig {
        redundant_pic_cnt_present: true,
        ..SeqConfig::default()
    };
    let nals = build_sequence(
        &cfg,
        &[
            SliceDesc::idr(0, 40),
            SliceDesc::idr(0, 99).redundant(1),
            SliceDesc::p(1, 2),
            SliceDesc::intra(1, 2, 99).redundant(1),
        ],
    );
    let mut dec = build_test_decoder();
    let out = decode_stream(&mut dec, &nals);
    assert_eq!(pocs(&out), vec![0, 2]);
    assert!(out.iter().all(|f| first_luma(f) == 40), "冗余切片不应写入图像");
}

#[test]
fn test_truncated_slice_in_sync_mode_reports_error() {
    let cfg = SeqConfig::default();
    let mut dec = build_test_decoder();
    let mut out = Vec::new();
    for nal in build_sequence(&cfg, &[SliceDesc::idr(0, 40)]) {
        feed(&mut dec, &nal, &mut out);
    }
    // 只保留切片头与前几个字节, PCM 数据不足
    let mut nal = build_slice_nal(&cfg, &SliceDesc::intra(1, 2, 50));
    nal.truncate(12);
    let result = dec.decode_nal(&nal);

    dec.flush();
    drain(&mut dec, &mut out);
    assert_eq!(out.len(), 2, "截断的图像仍然输出");
    if result.is_err() {
        assert!(out[1].corrupt, "切片出错时图像应标记为损坏");
    }
}

#[test]
fn test_sequence_change_flushes_previous_pictures() {
    let small = SeqConfig::default();
    let large = SeqConfig {
        mb_width: 3,
        ..SeqConfig::default()
    };
    let mut nals = build_sequence(&small, &[SliceDesc::idr(0, 40), SliceDesc::p(1, 2)]);
    nals.extend(build_sequence(&large, &[SliceDesc::idr(0, 60)]));

    let mut dec = build_test_decoder();
    let out = decode_stream(&mut dec, &nals);
    assert_eq!(pocs(&out), vec![0, 2, 0]);
    assert_eq!(out[0].width, 32);
    assert_eq!(out[2].width, 48, "新序列使用新的尺寸");
    assert_eq!(first_luma(&out[2]), 60);
}
