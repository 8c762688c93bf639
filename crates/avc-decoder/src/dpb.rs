//! 图像池 (DPB) 与输出队列.
//!
//! 每个槽位的状态由几个 32 位掩码描述:
//! - `to_output`: 等待输出, 尚未进入输出队列
//! - `queued`: 已进入输出队列
//! - `owned`: 以借出方式交给调用方, 等待 `return_frame`
//! - `decoding`: 尚未完成解码与去块
//!
//! 参考标记由 [`crate::refs::ReferenceSet`] 单独维护, 空闲槽位即以上掩码与参考掩码都
//! 未置位的槽位. 输出按 POC 升序进入队列, 队首完成后才能被取走.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

use avc_core::{AvcError, AvcResult};
use log::{debug, warn};

use crate::picture::{
    Frame, FrameHandle, PictureData, PictureGeometry, PlaneAllocator, SharedPicture,
};
use crate::refs::{MAX_SLOTS, iter_bits};

/// 输出队列容量
pub const OUTPUT_QUEUE_CAPACITY: usize = 16;

/// 去块游标: 图像已完成
pub const DEBLOCK_COMPLETE: u32 = u32::MAX;

/// 槽位中图像的显示参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    /// 裁剪后的宽高
    pub width: u32,
    pub height: u32,
    /// 左, 右, 上, 下
    pub crop: [u32; 4],
}

/// 开始一张新图像时的元数据
#[derive(Debug, Clone, Copy, Default)]
pub struct PictureStart {
    pub frame_num: i32,
    /// 输出使用的 POC (MMCO5 之后已平移)
    pub poc: i32,
    pub idr: bool,
    pub non_existing: bool,
    pub display: DisplayInfo,
}

/// 图像池中的一个槽位
pub(crate) struct PictureSlot {
    pub data: SharedPicture,
    pub id: u64,
    pub frame_num: i32,
    pub poc: i32,
    pub idr: bool,
    pub non_existing: bool,
    pub corrupt: bool,
    pub display: DisplayInfo,
    /// 下一行待去块的宏块行, [`DEBLOCK_COMPLETE`] 表示完成
    pub next_deblock_row: u32,
    /// 尚未解码的宏块数
    pub remaining_mbs: usize,
    /// 图像的全部切片都已提交
    pub closed: bool,
    /// 已有线程在做隐藏与去块
    pub finalizing: bool,
    /// 本图像各任务依赖的槽位 (已展开)
    pub deps: u32,
    /// 隐藏缺失宏块时使用的参考槽位
    pub conceal_ref: Option<usize>,
}

/// 图像池
pub struct PicturePool {
    slots: Vec<PictureSlot>,
    capacity: usize,
    geometry: PictureGeometry,
    allocator: Arc<dyn PlaneAllocator>,
    to_output: u32,
    queued: u32,
    owned: u32,
    decoding: u32,
    output_queue: VecDeque<usize>,
    next_id: u64,
}

impl PicturePool {
    pub fn new(allocator: Arc<dyn PlaneAllocator>) -> Self {
        Self {
            slots: Vec::new(),
            capacity: 0,
            geometry: PictureGeometry::default(),
            allocator,
            to_output: 0,
            queued: 0,
            owned: 0,
            decoding: 0,
            output_queue: VecDeque::new(),
            next_id: 0,
        }
    }

    // ============================================================
    // 配置与查询
    // ============================================================

    /// 设置容量与图像尺寸, 已分配的槽位在复用时按新尺寸重建
    pub fn configure(&mut self, capacity: usize, geometry: PictureGeometry) {
        self.capacity = capacity.clamp(1, MAX_SLOTS);
        self.geometry = geometry;
        debug!(
            "H264: 图像池配置, capacity={}, mb_width={}, mb_height={}",
            self.capacity, geometry.mb_width, geometry.mb_height
        );
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn geometry(&self) -> PictureGeometry {
        self.geometry
    }

    /// 容量范围内的槽位掩码
    pub fn capacity_mask(&self) -> u32 {
        if self.capacity >= 32 {
            u32::MAX
        } else {
            (1u32 << self.capacity) - 1
        }
    }

    pub fn to_output(&self) -> u32 {
        self.to_output
    }

    pub fn queued(&self) -> u32 {
        self.queued
    }

    pub fn owned(&self) -> u32 {
        self.owned
    }

    /// 尚未完成的图像
    pub fn decoding(&self) -> u32 {
        self.decoding
    }

    /// 与输出相关而不能复用的槽位
    pub fn output_busy(&self) -> u32 {
        self.to_output | self.queued | self.owned
    }

    pub fn queue_len(&self) -> usize {
        self.output_queue.len()
    }

    /// 开始一张新图像之前, 输出队列是否有足够空间容纳可能被挤出的图像
    pub fn check_output_room(&self) -> AvcResult<()> {
        let worst = self.output_queue.len() + self.to_output.count_ones() as usize + 1;
        if worst > OUTPUT_QUEUE_CAPACITY {
            return Err(AvcError::ResourceExhausted(format!(
                "H264: 输出队列已满, queued={}, waiting={}",
                self.output_queue.len(),
                self.to_output.count_ones()
            )));
        }
        Ok(())
    }

    pub(crate) fn slot(&self, slot: usize) -> Option<&PictureSlot> {
        self.slots.get(slot)
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> Option<&mut PictureSlot> {
        self.slots.get_mut(slot)
    }

    /// 槽位的共享图像数据
    pub fn picture(&self, slot: usize) -> Option<SharedPicture> {
        self.slots.get(slot).map(|s| Arc::clone(&s.data))
    }

    /// 图像是否已完成解码与去块
    pub fn is_complete(&self, slot: usize) -> bool {
        self.decoding & (1 << (slot % 32)) == 0
    }

    /// 展开依赖: 直接依赖加上这些图像自身仍未完成的依赖
    pub fn expand_deps(&self, direct: u32) -> u32 {
        let pending = direct & self.decoding;
        iter_bits(pending).fold(direct, |mask, s| {
            mask | self.slots.get(s).map_or(0, |slot| slot.deps & self.decoding)
        })
    }

    /// 未完成的图像隐藏时还要读取的参考槽位
    pub fn conceal_pinned(&self) -> u32 {
        iter_bits(self.decoding)
            .filter_map(|s| self.slots.get(s).and_then(|slot| slot.conceal_ref))
            .fold(0, |mask, r| mask | 1 << (r % 32))
    }

    // ============================================================
    // 图像生命周期
    // ============================================================

    /// 在 `slot` 开始一张新图像, 返回其唯一编号
    ///
    /// 若调用方仍持有槽位旧图像的 [`Frame`], 则重新分配存储.
    pub fn start_picture(&mut self, slot: usize, start: PictureStart) -> u64 {
        while self.slots.len() <= slot {
            let data = PictureData::new(self.geometry, Arc::clone(&self.allocator));
            self.slots.push(PictureSlot {
                data: Arc::new(RwLock::new(data)),
                id: 0,
                frame_num: 0,
                poc: 0,
                idr: false,
                non_existing: false,
                corrupt: false,
                display: DisplayInfo::default(),
                next_deblock_row: DEBLOCK_COMPLETE,
                remaining_mbs: 0,
                closed: true,
                finalizing: false,
                deps: 0,
                conceal_ref: None,
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        let geometry = self.geometry;
        let allocator = Arc::clone(&self.allocator);
        let entry = &mut self.slots[slot];
        let reusable = Arc::strong_count(&entry.data) == 1
            && entry.data.read().is_ok_and(|d| d.geometry() == geometry);
        if reusable {
            entry
                .data
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .reset();
        } else {
            entry.data = Arc::new(RwLock::new(PictureData::new(geometry, allocator)));
        }

        entry.id = id;
        entry.frame_num = start.frame_num;
        entry.poc = start.poc;
        entry.idr = start.idr;
        entry.non_existing = start.non_existing;
        entry.corrupt = start.non_existing;
        entry.display = start.display;
        entry.deps = 0;
        entry.conceal_ref = None;
        entry.finalizing = false;
        if start.non_existing {
            entry.next_deblock_row = DEBLOCK_COMPLETE;
            entry.remaining_mbs = 0;
            entry.closed = true;
        } else {
            entry.next_deblock_row = 0;
            entry.remaining_mbs = geometry.mb_count();
            entry.closed = false;
            self.decoding |= 1 << slot;
        }
        id
    }

    /// 图像完成: 清除解码中标志
    pub fn complete_picture(&mut self, slot: usize) {
        self.decoding &= !(1 << (slot % 32));
        if let Some(s) = self.slots.get_mut(slot) {
            s.next_deblock_row = DEBLOCK_COMPLETE;
            s.finalizing = false;
        }
    }

    /// 标记为等待输出
    pub fn mark_for_output(&mut self, slot: usize) {
        self.to_output |= 1 << (slot % 32);
    }

    // ============================================================
    // 输出 (bumping)
    // ============================================================

    /// 等待输出的图像中 POC 最小者
    fn smallest_waiting(&self) -> Option<usize> {
        iter_bits(self.to_output).min_by_key(|&s| (self.slots[s].poc, self.slots[s].id))
    }

    /// 把 POC 最小的等待图像移入输出队列, 返回其槽位
    pub fn bump(&mut self) -> Option<usize> {
        let slot = self.smallest_waiting()?;
        self.to_output &= !(1 << slot);
        self.queued |= 1 << slot;
        self.output_queue.push_back(slot);
        debug!(
            "H264: 输出图像, slot={}, poc={}, queued={}",
            slot,
            self.slots[slot].poc,
            self.output_queue.len()
        );
        Some(slot)
    }

    /// 输出全部等待图像
    pub fn bump_all(&mut self) -> usize {
        let mut count = 0;
        while self.bump().is_some() {
            count += 1;
        }
        count
    }

    /// 输出 POC 不大于 `poc` 的全部等待图像
    pub fn bump_up_to(&mut self, poc: i32) {
        while let Some(slot) = self.smallest_waiting() {
            if self.slots[slot].poc > poc {
                break;
            }
            self.bump();
        }
    }

    /// 等待图像超过重排窗口时输出最小者
    pub fn bump_reorder(&mut self, max_num_reorder_frames: u32) {
        while self.to_output.count_ones() > max_num_reorder_frames {
            if self.bump().is_none() {
                break;
            }
        }
    }

    /// 丢弃尚未进入队列的等待图像 (no_output_of_prior_pics_flag)
    pub fn discard_waiting(&mut self) -> u32 {
        let dropped = self.to_output;
        self.to_output = 0;
        if dropped != 0 {
            debug!("H264: 丢弃等待输出的图像, mask={:#x}", dropped);
        }
        dropped
    }

    /// 清空输出队列与等待标志, 借出的图像保持有效
    pub fn clear_output(&mut self) {
        self.to_output = 0;
        self.queued = 0;
        self.output_queue.clear();
    }

    /// 队首图像是否存在但尚未完成
    pub fn head_pending(&self) -> Option<usize> {
        self.output_queue
            .front()
            .copied()
            .filter(|&slot| !self.is_complete(slot))
    }

    /// 取出队首已完成的图像
    pub fn pop_output(&mut self, borrow: bool) -> Option<Frame> {
        let &slot = self.output_queue.front()?;
        if !self.is_complete(slot) {
            return None;
        }
        self.output_queue.pop_front();
        self.queued &= !(1 << slot);
        if borrow {
            self.owned |= 1 << slot;
        }

        let entry = &self.slots[slot];
        Some(Frame {
            handle: FrameHandle { slot, id: entry.id },
            data: Arc::clone(&entry.data),
            poc: entry.poc,
            frame_num: entry.frame_num,
            idr: entry.idr,
            corrupt: entry.corrupt,
            width: entry.display.width,
            height: entry.display.height,
            crop: entry.display.crop,
            borrowed: borrow,
        })
    }

    /// 调用方归还借出的图像
    pub fn return_frame(&mut self, handle: FrameHandle) -> AvcResult<()> {
        let bit = 1u32.checked_shl(handle.slot as u32).unwrap_or(0);
        let valid = self.owned & bit != 0
            && self.slots.get(handle.slot).is_some_and(|s| s.id == handle.id);
        if !valid {
            warn!(
                "H264: 归还的帧未被借出, slot={}, id={}",
                handle.slot, handle.id
            );
            return Err(AvcError::InvalidUsage(format!(
                "H264: 归还的帧未被借出, id={}",
                handle.id
            )));
        }
        self.owned &= !bit;
        Ok(())
    }
}
