//! H.264 解码器入口.
//!
//! 调用方按解码顺序送入已分隔的编码单元, 解码器在调用线程上完成切片头解析, 参考标记,
//! 槽位分配与输出调度, 切片数据作为任务交给工作线程 (或在同步模式下就地执行).
//!
//! # 图像生命周期
//! ```text
//! 第一个切片 ─> 分配槽位 ─> 参考标记 ─> 等待输出 ─┐
//!                 │                               ├─> 输出队列 ─> get_frame
//!               切片任务 ─> 隐藏/去块 ─> 完成 ────┘
//! ```
//! 输出按 POC 顺序进入队列, 队首图像完成后才能被取走.

use std::fmt::Write as _;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use avc_core::{AvcError, AvcResult, BitCache, BitCachePos};
use bytes::Bytes;
use log::{debug, warn};

use crate::config::DecoderConfig;
use crate::dpb::{DisplayInfo, PictureStart, PicturePool};
use crate::kernels::{NullKernels, ReconstructionKernels};
use crate::nal::{CodedUnit, NalUnitType};
use crate::parameter_sets::{DpbSizing, ParameterSets, Sps, parse_pps, parse_sps};
use crate::picture::{Frame, FrameHandle, PictureGeometry};
use crate::poc::{PictureNumbering, PocState};
use crate::refs::{
    DecRefPicMarking, ListParams, RefEntry, ReferenceSet, build_ref_pic_lists, iter_bits,
};
use crate::scheduler::{
    Shared, Task, close_picture, finish_picture, run_ready_tasks, worker_loop,
};
use crate::slice::{RefPicInfo, SliceHeader, SliceParams, parse_slice_header};

/// 正在接收切片的图像
struct CurrentPicture {
    slot: usize,
    /// 第一个切片的头部, 用于新图像检测
    header: SliceHeader,
    numbering: PictureNumbering,
    /// 标记之前的参考集合, 本图像所有切片的列表都由它构造
    refs_snapshot: ReferenceSet,
    slice_count: u16,
}

/// H.264 解码器
pub struct Decoder {
    /// 与工作线程共享的图像池与任务表
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    config: DecoderConfig,
    /// 参数集表
    params: ParameterSets,
    /// FrameNum 与 POC 状态
    poc: PocState,
    /// 参考帧集合
    refs: ReferenceSet,
    current: Option<CurrentPicture>,
    /// 当前序列的 DPB 规模
    sizing: Option<DpbSizing>,
}

impl Decoder {
    /// 使用不做像素运算的 [`NullKernels`] 创建解码器
    pub fn new(config: DecoderConfig) -> AvcResult<Self> {
        Self::with_kernels(config, Arc::new(NullKernels))
    }

    /// 使用指定的重建核创建解码器
    pub fn with_kernels(
        config: DecoderConfig,
        kernels: Arc<dyn ReconstructionKernels>,
    ) -> AvcResult<Self> {
        config.validate()?;
        let pool = PicturePool::new(config.plane_allocator());
        let worker_count = config.worker_count();
        let mut decoder = Self {
            shared: Arc::new(Shared::new(pool, kernels)),
            workers: Vec::with_capacity(worker_count),
            config,
            params: ParameterSets::new(),
            poc: PocState::default(),
            refs: ReferenceSet::new(),
            current: None,
            sizing: None,
        };
        for worker in 0..worker_count {
            let shared = Arc::clone(&decoder.shared);
            let handle = thread::Builder::new()
                .name(format!("avc-worker-{}", worker))
                .spawn(move || worker_loop(shared, worker))
                .map_err(|e| {
                    AvcError::ResourceExhausted(format!("H264: 创建工作线程失败, err={}", e))
                })?;
            decoder.workers.push(handle);
        }
        debug!(
            "H264: 解码器创建, workers={}, config={:?}",
            worker_count, decoder.config
        );
        Ok(decoder)
    }

    fn threaded(&self) -> bool {
        !self.workers.is_empty()
    }

    /// 当前参考帧集合
    pub fn references(&self) -> &ReferenceSet {
        &self.refs
    }

    /// 送入一个含头部字节的 NAL 单元
    pub fn decode_nal(&mut self, data: &[u8]) -> AvcResult<()> {
        let unit = CodedUnit::parse(Bytes::copy_from_slice(data))?;
        self.decode_unit(unit)
    }

    /// 送入一个编码单元
    ///
    /// 返回 `ResourceExhausted` 时参考帧, POC 与槽位分配都不变, 调用方取出或归还帧后
    /// 以同一单元重试.
    pub fn decode_unit(&mut self, unit: CodedUnit) -> AvcResult<()> {
        let mut slice = None;
        let result = match unit.nal_type() {
            NalUnitType::Slice | NalUnitType::SliceIdr => self.decode_slice_unit(&unit, &mut slice),
            NalUnitType::Sps => self.decode_sps(&unit),
            NalUnitType::Pps => self.decode_pps(&unit),
            NalUnitType::Sei
            | NalUnitType::Aud
            | NalUnitType::EndOfStream
            | NalUnitType::FillerData => Ok(()),
            NalUnitType::EndOfSequence => {
                self.flush();
                Ok(())
            }
            other => Err(AvcError::UnsupportedFeature(format!(
                "H264: 不支持的 NAL 类型, nal_type={}",
                other
            ))),
        };
        if let Err(err) = &result {
            debug!("H264: 编码单元未被接受, nal_type={}, err={}", unit.nal_type(), err);
        }
        self.log_unit(&unit, slice.as_ref(), &result);
        result
    }

    fn decode_sps(&mut self, unit: &CodedUnit) -> AvcResult<()> {
        let sps = parse_sps(&unit.payload)?;
        let id = sps.sps_id;
        if self.params.insert_sps(sps) {
            debug!("H264: SPS 内容变化, sps_id={}, 在下一张图像生效", id);
        }
        Ok(())
    }

    fn decode_pps(&mut self, unit: &CodedUnit) -> AvcResult<()> {
        let pps = parse_pps(&unit.payload)?;
        self.params.insert_pps(pps);
        Ok(())
    }

    // ============================================================
    // 切片
    // ============================================================

    fn decode_slice_unit(
        &mut self,
        unit: &CodedUnit,
        parsed: &mut Option<SliceHeader>,
    ) -> AvcResult<()> {
        let mut bc = BitCache::new(&unit.payload);
        let header = parse_slice_header(&mut bc, unit.header, &self.params)?;
        let start = bc.position();
        if self.config.log_callback.is_some() {
            *parsed = Some(header.clone());
        }
        if header.redundant_pic_cnt > 0 {
            debug!(
                "H264: 跳过冗余切片, redundant_pic_cnt={}",
                header.redundant_pic_cnt
            );
            return Ok(());
        }

        let new_picture = match &self.current {
            Some(cur) => header.first_mb == 0 || header.starts_new_picture(&cur.header),
            None => true,
        };
        if new_picture {
            self.start_picture(&header)?;
        }
        self.submit_slice(header, unit.payload.clone(), start)
    }

    /// 开始一张新图像: 分配槽位, 执行参考标记, 安排输出
    fn start_picture(&mut self, header: &SliceHeader) -> AvcResult<()> {
        self.shared.lock().pool.check_output_room()?;
        self.activate_sps(&header.sps)?;
        // 新图像的首个切片说明上一张图像已结束, 重试时结果相同
        self.close_current();
        let numbering = self.poc.compute(header);
        let sizing = self.sizing.unwrap_or_else(|| header.sps.dpb_sizing(None));
        let gap_frames = numbering.gap.min(sizing.max_num_ref_frames);
        self.reserve_slots(gap_frames, sizing.max_num_ref_frames)?;

        if numbering.gap > 0 {
            self.fill_frame_num_gap(&header.sps, &numbering, &sizing)?;
        }
        let slot = self.pick_free_slot()?;

        let refs_snapshot = self.refs.clone();
        let conceal_ref = conceal_candidate(&refs_snapshot);
        let entry = RefEntry {
            frame_num: numbering.frame_num,
            long_term_idx: 0,
            top_poc: numbering.top_poc,
            bottom_poc: numbering.bottom_poc,
        };
        let mut output_poc = numbering.poc();
        let mut mmco5_top_poc = None;
        if header.is_reference() {
            let outcome = if header.is_idr() {
                let long_term = header
                    .dec_ref_pic_marking
                    .as_ref()
                    .is_some_and(|m| m.long_term_reference_flag);
                self.refs.mark_idr(slot, entry, long_term)
            } else {
                let sliding = DecRefPicMarking::default();
                let marking = header.dec_ref_pic_marking.as_ref().unwrap_or(&sliding);
                self.refs
                    .apply_marking(slot, entry, marking, sizing.max_num_ref_frames)
            };
            if outcome.cleared_all {
                mmco5_top_poc = Some(numbering.top_poc - outcome.poc_rebase);
                output_poc -= outcome.poc_rebase;
            }
        }
        self.poc.commit(header, &numbering, mmco5_top_poc);

        let sps = &header.sps;
        let mut state = self.shared.lock();
        if header.is_idr() {
            let discard = header
                .dec_ref_pic_marking
                .as_ref()
                .is_some_and(|m| m.no_output_of_prior_pics);
            if discard {
                state.pool.discard_waiting();
            } else {
                state.pool.bump_all();
            }
        } else if mmco5_top_poc.is_some() {
            state.pool.bump_all();
        }

        state.pool.start_picture(
            slot,
            PictureStart {
                frame_num: if mmco5_top_poc.is_some() { 0 } else { numbering.frame_num },
                poc: output_poc,
                idr: header.is_idr(),
                non_existing: false,
                display: display_info(sps),
            },
        );
        if let Some(entry) = state.pool.slot_mut(slot) {
            entry.conceal_ref = conceal_ref;
        }
        state.pool.mark_for_output(slot);
        if !header.is_reference() {
            state.pool.bump_up_to(output_poc);
        }
        state.pool.bump_reorder(sizing.max_num_reorder_frames);
        debug!(
            "H264: 新图像, slot={}, type={}, frame_num={}, poc={}, refs={:#x}, to_output={:#x}, queued={}",
            slot,
            header.slice_type,
            numbering.frame_num,
            output_poc,
            self.refs.mask(),
            state.pool.to_output(),
            state.pool.queue_len()
        );
        drop(state);

        self.current = Some(CurrentPicture {
            slot,
            header: header.clone(),
            numbering,
            refs_snapshot,
            slice_count: 0,
        });
        Ok(())
    }

    /// 序列参数变化时排空并重新配置图像池
    fn activate_sps(&mut self, sps: &Arc<Sps>) -> AvcResult<()> {
        let geometry = PictureGeometry {
            mb_width: sps.mb_width(),
            mb_height: sps.mb_height(),
            chroma_array_type: sps.chroma_array_type(),
        };
        let sizing = sps.dpb_sizing(self.config.max_frame_buffering);
        let unchanged =
            self.sizing == Some(sizing) && self.shared.lock().pool.geometry() == geometry;
        if unchanged {
            return Ok(());
        }
        if geometry.mb_count() == 0 {
            return Err(AvcError::MalformedBitstream(format!(
                "H264: 图像尺寸为 0, sps_id={}",
                sps.sps_id
            )));
        }

        if self.sizing.is_some() {
            debug!("H264: 序列参数变化, 排空图像池, sps_id={}", sps.sps_id);
            self.flush();
        }
        self.shared
            .lock()
            .pool
            .configure(sizing.num_frame_buffers, geometry);
        self.sizing = Some(sizing);
        Ok(())
    }

    /// frame_num 间隔: 插入不存在的参考帧
    fn fill_frame_num_gap(
        &mut self,
        sps: &Sps,
        numbering: &PictureNumbering,
        sizing: &DpbSizing,
    ) -> AvcResult<()> {
        if !sps.gaps_in_frame_num_allowed {
            warn!(
                "H264: frame_num 不连续, prev={}, cur={}, gap={}",
                self.poc.prev_ref_frame_num(),
                numbering.frame_num,
                numbering.gap
            );
        }
        // 超出参考帧上限的部分会被滑动窗口立即淘汰, 只需推进 FrameNum
        let skipped = numbering.gap.saturating_sub(sizing.max_num_ref_frames);
        if skipped > 0 {
            self.poc
                .commit_gap(self.poc.prev_ref_frame_num() + skipped as i32);
        }
        for _ in skipped..numbering.gap {
            let gap = self.poc.gap_frame(sps, 1);
            let slot = self.pick_free_slot()?;
            self.shared.lock().pool.start_picture(
                slot,
                PictureStart {
                    frame_num: gap.frame_num,
                    poc: gap.poc(),
                    idr: false,
                    non_existing: true,
                    display: display_info(sps),
                },
            );
            self.refs.insert_gap_frame(
                slot,
                RefEntry {
                    frame_num: gap.frame_num,
                    long_term_idx: 0,
                    top_poc: gap.top_poc,
                    bottom_poc: gap.bottom_poc,
                },
                sizing.max_num_ref_frames,
            );
            self.poc.commit_gap(gap.frame_num);
        }
        debug!(
            "H264: 插入不存在帧, count={}, refs={:#x}",
            numbering.gap - skipped,
            self.refs.mask()
        );
        Ok(())
    }

    /// 开始新图像之前确认槽位足够, 不足时参考状态与 POC 状态保持不变
    ///
    /// `gap_frames` 为随后插入的不存在帧数. 只被解码中的图像暂时占用的槽位计为可用.
    fn reserve_slots(&self, gap_frames: u32, max_num_ref_frames: u32) -> AvcResult<()> {
        let mut state = self.shared.lock();
        let held = state.pool.output_busy();
        let free = state.pool.capacity_mask() & !(self.refs.mask() | held);
        let needed = self
            .refs
            .slots_for_gap(max_num_ref_frames, gap_frames, held);
        if free.count_ones() >= needed {
            return Ok(());
        }
        Err(self.pool_exhausted(&mut state.pool, needed))
    }

    /// 选择空闲槽位
    ///
    /// 多线程模式下, 槽位只是暂时被解码中的图像占用时等待其完成.
    fn pick_free_slot(&self) -> AvcResult<usize> {
        let mut state = self.shared.lock();
        loop {
            let stable = self.refs.mask() | state.pool.output_busy();
            let transient =
                state.pool.decoding() | state.pool.conceal_pinned() | state.tasks.slot_mask();
            let capacity = state.pool.capacity_mask();
            let free = capacity & !(stable | transient);
            if free != 0 {
                return Ok(free.trailing_zeros() as usize);
            }
            if self.threaded() && capacity & !stable != 0 {
                state = self.shared.wait(&self.shared.task_progress, state);
                continue;
            }
            return Err(self.pool_exhausted(&mut state.pool, 1));
        }
    }

    /// 图像池已满: 存在不再被参考的等待图像时, 按 POC 顺序输出直到其中一张入队
    ///
    /// 等待图像全部仍被参考时输出队列不变, 调用方归还借出的帧后重试.
    fn pool_exhausted(&self, pool: &mut PicturePool, needed: u32) -> AvcError {
        let referenced = self.refs.mask();
        if pool.to_output() & !referenced != 0 {
            while let Some(slot) = pool.bump() {
                if referenced & 1 << slot == 0 {
                    break;
                }
            }
        }
        AvcError::ResourceExhausted(format!(
            "H264: 图像池已满, capacity={}, needed={}, refs={:#x}, to_output={:#x}, queued={}, owned={:#x}",
            pool.capacity(),
            needed,
            referenced,
            pool.to_output(),
            pool.queue_len(),
            pool.owned()
        ))
    }

    /// 为当前图像提交一个切片任务
    fn submit_slice(
        &mut self,
        header: SliceHeader,
        payload: Bytes,
        start: BitCachePos,
    ) -> AvcResult<()> {
        let threaded = self.threaded();
        let geometry = self.shared.lock().pool.geometry();
        let Some(cur) = self.current.as_mut() else {
            return Err(AvcError::Internal("H264: 没有正在解码的图像".into()));
        };

        let intra = header.slice_type.is_intra();
        let num_active = if intra {
            [0, 0]
        } else if header.slice_type.is_b() {
            header.num_ref_idx_active
        } else {
            [header.num_ref_idx_active[0], 0]
        };
        let lists = build_ref_pic_lists(
            &cur.refs_snapshot,
            &ListParams {
                bipred: header.slice_type.is_b(),
                frame_num: cur.numbering.frame_num,
                poc: cur.numbering.poc(),
                log2_max_frame_num: header.sps.log2_max_frame_num,
                num_active,
                mods: [&header.ref_pic_list_mods[0], &header.ref_pic_list_mods[1]],
            },
        );
        let snapshot = &cur.refs_snapshot;
        let ref_info = [0, 1].map(|l| {
            lists
                .list(l)
                .iter()
                .map(|slot| {
                    slot.map(|s| RefPicInfo {
                        poc: snapshot.entry(s).poc(),
                        long_term: snapshot.long_term_only() & 1 << (s % 32) != 0,
                    })
                })
                .collect::<Vec<_>>()
        });
        let pps = &header.pps;
        let params = Arc::new(SliceParams {
            slice_type: header.slice_type,
            slice_num: cur.slice_count,
            first_mb: header.first_mb,
            slice_qp: header.slice_qp,
            cabac_init_mode: header.cabac_init_mode(),
            num_ref_idx_active: num_active,
            map_col_to_list0: lists.map_col_to_list0(),
            ref_info,
            ref_lists: lists,
            poc: cur.numbering.poc(),
            weighted_prediction: header.weighted_prediction.clone(),
            direct_spatial_mv_pred: header.direct_spatial_mv_pred,
            direct_8x8_inference: header.sps.direct_8x8_inference,
            deblock: header.deblock,
            chroma_qp_index_offset: [pps.chroma_qp_index_offset, pps.second_chroma_qp_index_offset],
            transform_8x8_mode: pps.transform_8x8_mode,
            constrained_intra_pred: pps.constrained_intra_pred,
            geometry,
        });
        cur.slice_count = cur.slice_count.wrapping_add(1);
        let slot = cur.slot;

        let direct = params.ref_lists.dependency_mask();
        let mut state = self.shared.lock();
        if state.pool.slot(slot).is_none_or(|s| s.closed) {
            return Err(AvcError::MalformedBitstream(format!(
                "H264: 图像已完整, 丢弃多余切片, first_mb={}",
                header.first_mb
            )));
        }
        let deps = state.pool.expand_deps(direct);
        if let Some(entry) = state.pool.slot_mut(slot) {
            entry.deps |= deps;
        }
        while !state.tasks.has_free() {
            if threaded {
                state = self.shared.wait(&self.shared.task_complete, state);
            } else {
                drop(state);
                run_ready_tasks(&self.shared);
                state = self.shared.lock();
            }
        }
        let incomplete = state.pool.decoding();
        let task = Task {
            slot,
            params,
            payload,
            start,
            deps,
        };
        state
            .tasks
            .submit(task, incomplete)
            .ok_or_else(|| AvcError::Internal("H264: 任务表已满".into()))?;
        drop(state);

        if threaded {
            self.shared.task_ready.notify_all();
            return Ok(());
        }
        match run_ready_tasks(&self.shared) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// 当前图像的全部切片已提交
    fn close_current(&mut self) {
        let Some(cur) = self.current.take() else {
            return;
        };
        let finalize = close_picture(&mut self.shared.lock(), cur.slot);
        if finalize {
            finish_picture(&self.shared, cur.slot);
        }
    }

    /// 等待全部任务与图像完成
    fn wait_idle(&self) {
        if !self.threaded() {
            run_ready_tasks(&self.shared);
            return;
        }
        let mut state = self.shared.lock();
        while !state.tasks.is_idle() || state.pool.decoding() != 0 {
            state = self.shared.wait(&self.shared.task_progress, state);
        }
    }

    // ============================================================
    // 输出
    // ============================================================

    /// 取出下一张可输出的帧, 不阻塞
    ///
    /// `borrow` 为 true 时槽位保持占用, 直到 [`Decoder::return_frame`].
    pub fn get_frame(&mut self, borrow: bool) -> Option<Frame> {
        let frame = self.shared.lock().pool.pop_output(borrow);
        if let Some(frame) = &frame {
            debug!(
                "H264: 取出帧, id={}, poc={}, borrowed={}, corrupt={}",
                frame.id(),
                frame.poc,
                frame.borrowed,
                frame.corrupt
            );
        }
        frame
    }

    /// 取出下一张帧, 队首图像仍在后台解码时等待其完成
    ///
    /// 队列为空或队首图像还在等待后续切片时返回 `None`.
    pub fn wait_frame(&mut self, borrow: bool) -> Option<Frame> {
        let mut state = self.shared.lock();
        loop {
            if let Some(frame) = state.pool.pop_output(borrow) {
                return Some(frame);
            }
            let head = state.pool.head_pending()?;
            if !state.pool.slot(head).is_some_and(|s| s.closed) {
                return None;
            }
            state = self.shared.wait(&self.shared.task_progress, state);
        }
    }

    /// 归还借出的帧
    pub fn return_frame(&mut self, handle: FrameHandle) -> AvcResult<()> {
        self.shared.lock().pool.return_frame(handle)
    }

    /// 结束当前序列: 完成全部图像, 全部送入输出队列, 清空参考状态
    ///
    /// 连续调用是安全的, 第二次调用不会产生新的输出.
    pub fn flush(&mut self) {
        self.close_current();
        self.wait_idle();
        let emitted = self.shared.lock().pool.bump_all();
        self.refs.clear();
        self.poc.reset();
        debug!("H264: flush 完成, emitted={}", emitted);
    }

    /// 丢弃全部等待输出与队列中的图像 (跳转), 借出的帧保持有效
    pub fn reset(&mut self) {
        self.close_current();
        self.wait_idle();
        self.shared.lock().pool.clear_output();
        self.refs.clear();
        self.poc.reset();
        debug!("H264: 解码器重置");
    }

    // ============================================================
    // 逐单元日志
    // ============================================================

    fn log_unit(&self, unit: &CodedUnit, slice: Option<&SliceHeader>, result: &AvcResult<()>) {
        let Some(callback) = &self.config.log_callback else {
            return;
        };
        let mut text = String::new();
        writeln!(text, "nal:").ok();
        writeln!(text, "  type: {}", unit.nal_type()).ok();
        writeln!(text, "  ref_idc: {}", unit.header.ref_idc).ok();
        writeln!(text, "  size: {}", unit.payload.len()).ok();
        if let Some(h) = slice {
            writeln!(text, "slice:").ok();
            writeln!(text, "  first_mb: {}", h.first_mb).ok();
            writeln!(text, "  slice_type: {}", h.slice_type).ok();
            writeln!(text, "  pps_id: {}", h.pps_id).ok();
            writeln!(text, "  frame_num: {}", h.frame_num).ok();
            writeln!(text, "  pic_order_cnt_lsb: {}", h.pic_order_cnt_lsb).ok();
            writeln!(text, "  slice_qp: {}", h.slice_qp).ok();
            writeln!(text, "  num_ref_idx_active: {:?}", h.num_ref_idx_active).ok();
            if let Some(m) = &h.dec_ref_pic_marking {
                writeln!(text, "  marking: {:?}", m).ok();
            }
        }
        {
            let state = self.shared.lock();
            writeln!(text, "dpb:").ok();
            writeln!(text, "  short_term: {:#x}", self.refs.short_term_only()).ok();
            writeln!(text, "  long_term: {:#x}", self.refs.long_term_only()).ok();
            writeln!(text, "  non_existing: {:#x}", self.refs.non_existing()).ok();
            writeln!(text, "  to_output: {:#x}", state.pool.to_output()).ok();
            writeln!(text, "  queued: {}", state.pool.queue_len()).ok();
            writeln!(text, "  decoding: {:#x}", state.pool.decoding()).ok();
        }
        if let Err(err) = result {
            writeln!(text, "error: {}", err).ok();
        }
        callback(&text);
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.task_ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("H264: 工作线程异常退出");
            }
        }
    }
}

/// 隐藏缺失宏块时使用的参考: FrameNum 最大的短期参考, 其次任一长期参考
fn conceal_candidate(refs: &ReferenceSet) -> Option<usize> {
    iter_bits(refs.short_term_only())
        .max_by_key(|&s| refs.entry(s).frame_num)
        .or_else(|| iter_bits(refs.long_term_only()).next())
}

/// 由 SPS 得到显示尺寸与以亮度采样计的裁剪
fn display_info(sps: &Sps) -> DisplayInfo {
    let (unit_x, unit_y) = if sps.chroma_array_type() == 0 { (1, 1) } else { (2, 2) };
    DisplayInfo {
        width: sps.width,
        height: sps.height,
        crop: [
            sps.crop[0] * unit_x,
            sps.crop[1] * unit_x,
            sps.crop[2] * unit_y,
            sps.crop[3] * unit_y,
        ],
    }
}
