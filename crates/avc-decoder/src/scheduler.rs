//! 切片任务调度.
//!
//! 每个切片是一个任务, 状态依次为 pending -> ready -> running -> 完成. 任务依赖的槽位在
//! 创建时一次性展开为平坦掩码, 任一图像完成去块后用仍未完成的图像掩码重新计算就绪集合.
//!
//! 共享状态 (图像池标志与任务表) 由一把锁保护, 三个条件变量分别对应:
//! - `task_ready`: 有任务就绪或需要退出
//! - `task_progress`: 某图像的去块游标前进或图像完成
//! - `task_complete`: 任务表腾出了位置
//!
//! 工作线程数为 0 时, 提交任务的线程直接调用 [`run_ready_tasks`], 执行路径相同.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLockReadGuard};

use avc_core::{AvcError, BitCachePos};
use bytes::Bytes;
use log::{debug, warn};

use crate::dpb::PicturePool;
use crate::kernels::{RefPictures, ReconstructionKernels};
use crate::picture::{MbClass, PictureData, SharedPicture};
use crate::refs::iter_bits;
use crate::slice::{SliceOutcome, SliceParams, decode_slice};

/// 任务表容量
pub const MAX_TASKS: usize = 16;

/// 一个切片的解码任务
#[derive(Debug, Clone)]
pub struct Task {
    /// 目标图像槽位
    pub slot: usize,
    pub params: Arc<SliceParams>,
    /// 切片 NAL 的 RBSP
    pub payload: Bytes,
    /// 切片数据在 RBSP 中的起点
    pub start: BitCachePos,
    /// 依赖的槽位 (已展开)
    pub deps: u32,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
}

/// 固定容量的任务表
#[derive(Debug)]
pub struct TaskTable {
    tasks: Vec<Option<Task>>,
    pending: u16,
    ready: u16,
    running: u16,
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: vec![None; MAX_TASKS],
            pending: 0,
            ready: 0,
            running: 0,
        }
    }

    fn used(&self) -> u16 {
        self.pending | self.ready | self.running
    }

    /// 是否还有空位
    pub fn has_free(&self) -> bool {
        self.used().count_ones() < MAX_TASKS as u32
    }

    /// 没有任何任务
    pub fn is_idle(&self) -> bool {
        self.used() == 0
    }

    /// 加入任务, `incomplete` 为尚未完成的图像掩码
    ///
    /// 返回任务下标, 任务表已满时返回 `None`.
    pub fn submit(&mut self, task: Task, incomplete: u32) -> Option<usize> {
        let free = !self.used();
        if free == 0 {
            return None;
        }
        let index = free.trailing_zeros() as usize;
        let bit = 1u16 << index;
        if task.deps & incomplete == 0 {
            self.ready |= bit;
        } else {
            self.pending |= bit;
        }
        self.tasks[index] = Some(task);
        Some(index)
    }

    /// 重新计算就绪集合, 返回新就绪的任务掩码
    pub fn refresh(&mut self, incomplete: u32) -> u16 {
        let mut woken = 0u16;
        for index in iter_bits(u32::from(self.pending)) {
            let blocked = self.tasks[index]
                .as_ref()
                .is_some_and(|t| t.deps & incomplete != 0);
            if !blocked {
                woken |= 1 << index;
            }
        }
        self.pending &= !woken;
        self.ready |= woken;
        woken
    }

    /// 取出下标最小的就绪任务, 同一图像同时只运行一个任务
    pub fn take_ready(&mut self) -> Option<(usize, Task)> {
        let busy_slots = iter_bits(u32::from(self.running))
            .filter_map(|i| self.tasks[i].as_ref())
            .fold(0u32, |mask, t| mask | 1 << (t.slot % 32));
        let index = iter_bits(u32::from(self.ready)).find(|&i| {
            self.tasks[i]
                .as_ref()
                .is_some_and(|t| busy_slots & 1 << (t.slot % 32) == 0)
        })?;
        let task = self.tasks[index].clone()?;
        self.ready &= !(1 << index);
        self.running |= 1 << index;
        Some((index, task))
    }

    /// 任务完成, 释放位置
    pub fn finish(&mut self, index: usize) {
        let bit = !(1u16 << (index % MAX_TASKS));
        self.pending &= bit;
        self.ready &= bit;
        self.running &= bit;
        if let Some(entry) = self.tasks.get_mut(index) {
            *entry = None;
        }
    }

    /// 任务状态, 空位返回 `None`
    pub fn state(&self, index: usize) -> Option<TaskState> {
        let bit = 1u16.checked_shl(index as u32)?;
        if self.pending & bit != 0 {
            Some(TaskState::Pending)
        } else if self.ready & bit != 0 {
            Some(TaskState::Ready)
        } else if self.running & bit != 0 {
            Some(TaskState::Running)
        } else {
            None
        }
    }

    /// 以 `slot` 为目标的未完成任务数
    pub fn tasks_for(&self, slot: usize) -> usize {
        iter_bits(u32::from(self.used()))
            .filter(|&i| self.tasks[i].as_ref().is_some_and(|t| t.slot == slot))
            .count()
    }

    /// 所有任务的目标与依赖槽位, 这些槽位不能被复用
    pub fn slot_mask(&self) -> u32 {
        iter_bits(u32::from(self.used()))
            .filter_map(|i| self.tasks[i].as_ref())
            .fold(0u32, |mask, t| mask | t.deps | 1 << (t.slot % 32))
    }
}

// ============================================================
// 共享状态
// ============================================================

/// 锁内状态
pub(crate) struct State {
    pub pool: PicturePool,
    pub tasks: TaskTable,
    pub shutdown: bool,
}

/// 解码器与工作线程共享的部分
pub(crate) struct Shared {
    state: Mutex<State>,
    pub task_ready: Condvar,
    pub task_progress: Condvar,
    pub task_complete: Condvar,
    pub kernels: Arc<dyn ReconstructionKernels>,
}

impl Shared {
    pub fn new(pool: PicturePool, kernels: Arc<dyn ReconstructionKernels>) -> Self {
        Self {
            state: Mutex::new(State {
                pool,
                tasks: TaskTable::new(),
                shutdown: false,
            }),
            task_ready: Condvar::new(),
            task_progress: Condvar::new(),
            task_complete: Condvar::new(),
            kernels,
        }
    }

    /// 加锁, 锁中毒时继续使用内部状态
    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 在条件变量上等待
    pub fn wait<'a>(&self, cond: &Condvar, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

/// 工作线程执行一个任务所需的数据, 在锁内准备
struct Job {
    index: usize,
    task: Task,
    target: Option<SharedPicture>,
    /// 列表中出现的参考图像, 按槽位去重
    refs: Vec<(usize, SharedPicture)>,
}

impl Job {
    fn prepare(pool: &PicturePool, index: usize, task: Task) -> Self {
        let target = pool.picture(task.slot);
        let refs = iter_bits(task.params.ref_lists.dependency_mask())
            .filter_map(|slot| pool.picture(slot).map(|p| (slot, p)))
            .collect();
        Self {
            index,
            task,
            target,
            refs,
        }
    }

    /// 无锁执行: 目标图像持写锁, 参考图像持读锁
    fn run(&self, kernels: &dyn ReconstructionKernels) -> SliceOutcome {
        let Some(target) = &self.target else {
            return SliceOutcome {
                decoded: 0,
                error: Some(AvcError::Internal(format!(
                    "H264: 任务目标槽位不存在, slot={}",
                    self.task.slot
                ))),
            };
        };
        let guards: Vec<(usize, RwLockReadGuard<'_, PictureData>)> = self
            .refs
            .iter()
            .map(|(slot, pic)| (*slot, pic.read().unwrap_or_else(PoisonError::into_inner)))
            .collect();
        let lists = &self.task.params.ref_lists;
        let refs = RefPictures::new(
            lists.l0.iter().map(|&s| lookup(&guards, s)).collect(),
            lists.l1.iter().map(|&s| lookup(&guards, s)).collect(),
        );
        let mut pic = target.write().unwrap_or_else(PoisonError::into_inner);
        decode_slice(
            &self.task.params,
            &self.task.payload,
            self.task.start,
            &mut pic,
            &refs,
            kernels,
        )
    }
}

fn lookup<'a>(
    guards: &'a [(usize, RwLockReadGuard<'_, PictureData>)],
    slot: Option<usize>,
) -> Option<&'a PictureData> {
    let slot = slot?;
    guards
        .iter()
        .find(|(s, _)| *s == slot)
        .map(|(_, guard)| &**guard)
}

/// 记录任务结果, 返回是否应由当前线程完成该图像
fn complete_task(state: &mut State, job: &Job, outcome: &SliceOutcome) -> bool {
    state.tasks.finish(job.index);
    let slot = job.task.slot;
    let tasks_left = state.tasks.tasks_for(slot);
    let complete = state.pool.is_complete(slot);
    let Some(entry) = state.pool.slot_mut(slot) else {
        return false;
    };
    entry.remaining_mbs = entry.remaining_mbs.saturating_sub(outcome.decoded);
    if let Some(err) = &outcome.error {
        entry.corrupt = true;
        warn!(
            "H264: 切片解码失败, slot={}, slice={}, err={}",
            slot, job.task.params.slice_num, err
        );
    }
    if entry.remaining_mbs == 0 {
        entry.closed = true;
    }
    let finalize = entry.closed && !entry.finalizing && tasks_left == 0 && !complete;
    if finalize {
        entry.finalizing = true;
    }
    finalize
}

/// 图像的全部切片已提交, 返回是否应由调用线程完成该图像
pub(crate) fn close_picture(state: &mut State, slot: usize) -> bool {
    let tasks_left = state.tasks.tasks_for(slot);
    let complete = state.pool.is_complete(slot);
    let Some(entry) = state.pool.slot_mut(slot) else {
        return false;
    };
    entry.closed = true;
    let finalize = !entry.finalizing && tasks_left == 0 && !complete;
    if finalize {
        entry.finalizing = true;
    }
    finalize
}

/// 隐藏缺失的宏块并逐行去块, 然后把图像标记为完成
pub(crate) fn finish_picture(shared: &Shared, slot: usize) {
    let (target, reference, geometry) = {
        let state = shared.lock();
        let reference = state
            .pool
            .slot(slot)
            .and_then(|s| s.conceal_ref)
            .and_then(|r| state.pool.picture(r));
        (state.pool.picture(slot), reference, state.pool.geometry())
    };

    let mut concealed = 0usize;
    if let Some(target) = &target {
        let mut pic = target.write().unwrap_or_else(PoisonError::into_inner);
        // 图像完整时不读取隐藏参考
        if pic.missing_mbs() > 0 {
            let reference = reference
                .as_ref()
                .map(|r| r.read().unwrap_or_else(PoisonError::into_inner));
            let width = geometry.mb_width.max(1);
            for addr in 0..pic.mbs.len() {
                if pic.mbs[addr].is_decoded() {
                    continue;
                }
                shared
                    .kernels
                    .conceal_mb(addr % width, addr / width, reference.as_deref(), &mut pic);
                pic.mbs[addr].class = MbClass::Concealed;
                concealed += 1;
            }
        }

        for row in 0..geometry.mb_height {
            shared.kernels.deblock_row(row, &mut pic);
            let mut state = shared.lock();
            if let Some(entry) = state.pool.slot_mut(slot) {
                entry.next_deblock_row = row as u32 + 1;
            }
            drop(state);
            shared.task_progress.notify_all();
        }
    }

    let mut state = shared.lock();
    if concealed > 0 {
        if let Some(entry) = state.pool.slot_mut(slot) {
            entry.corrupt = true;
        }
        warn!("H264: 图像不完整, 已隐藏缺失宏块, slot={}, count={}", slot, concealed);
    }
    state.pool.complete_picture(slot);
    let incomplete = state.pool.decoding();
    let woken = state.tasks.refresh(incomplete);
    debug!(
        "H264: 图像完成, slot={}, woken={:#x}, decoding={:#x}",
        slot, woken, incomplete
    );
    drop(state);
    shared.task_ready.notify_all();
    shared.task_progress.notify_all();
}

/// 在调用线程上执行全部就绪任务, 返回遇到的第一个切片错误
pub(crate) fn run_ready_tasks(shared: &Shared) -> Option<AvcError> {
    let mut first_error = None;
    loop {
        let job = {
            let mut state = shared.lock();
            let Some((index, task)) = state.tasks.take_ready() else {
                break;
            };
            Job::prepare(&state.pool, index, task)
        };
        let outcome = job.run(shared.kernels.as_ref());
        let finalize = complete_task(&mut shared.lock(), &job, &outcome);
        shared.task_complete.notify_all();
        if finalize {
            finish_picture(shared, job.task.slot);
        }
        if first_error.is_none() {
            first_error = outcome.error;
        }
    }
    first_error
}

/// 工作线程主循环
pub(crate) fn worker_loop(shared: Arc<Shared>, worker: usize) {
    debug!("H264: 工作线程启动, worker={}", worker);
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some((index, task)) = state.tasks.take_ready() else {
            state = shared.wait(&shared.task_ready, state);
            continue;
        };
        let job = Job::prepare(&state.pool, index, task);
        drop(state);

        let outcome = job.run(shared.kernels.as_ref());

        state = shared.lock();
        let finalize = complete_task(&mut state, &job, &outcome);
        shared.task_complete.notify_all();
        if finalize {
            drop(state);
            finish_picture(&shared, job.task.slot);
            state = shared.lock();
        }
    }
    debug!("H264: 工作线程退出, worker={}", worker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::PictureGeometry;
    use crate::refs::RefPicLists;
    use crate::slice::{DeblockParams, SliceType, WeightedPrediction};

    fn params(slot_refs: &[usize]) -> Arc<SliceParams> {
        Arc::new(SliceParams {
            slice_type: SliceType::P,
            slice_num: 0,
            first_mb: 0,
            slice_qp: 26,
            cabac_init_mode: 0,
            num_ref_idx_active: [slot_refs.len() as u32, 0],
            ref_lists: RefPicLists {
                l0: slot_refs.iter().copied().map(Some).collect(),
                l1: Vec::new(),
            },
            ref_info: [Vec::new(), Vec::new()],
            map_col_to_list0: [None; 32],
            poc: 0,
            weighted_prediction: WeightedPrediction::Default,
            direct_spatial_mv_pred: false,
            direct_8x8_inference: true,
            deblock: DeblockParams::default(),
            chroma_qp_index_offset: [0, 0],
            transform_8x8_mode: false,
            constrained_intra_pred: false,
            geometry: PictureGeometry {
                mb_width: 1,
                mb_height: 1,
                chroma_array_type: 1,
            },
        })
    }

    fn task(slot: usize, deps: u32) -> Task {
        Task {
            slot,
            params: params(&[]),
            payload: Bytes::new(),
            start: avc_core::BitCache::new(&[]).position(),
            deps,
        }
    }

    #[test]
    fn test_task_waits_for_dependency_slot() {
        let mut table = TaskTable::new();
        let index = table.submit(task(0, 1 << 3), 1 << 3).expect("任务表应有空位");
        assert_eq!(table.state(index), Some(TaskState::Pending));
        assert!(table.take_ready().is_none(), "依赖未完成时不能运行");

        table.refresh(1 << 3);
        assert_eq!(table.state(index), Some(TaskState::Pending), "槽位 3 未完成时保持 pending");

        let woken = table.refresh(0);
        assert_eq!(woken, 1 << index);
        assert_eq!(table.state(index), Some(TaskState::Ready));
        let (taken, t) = table.take_ready().expect("应有就绪任务");
        assert_eq!(taken, index);
        assert_eq!(t.slot, 0);
        assert_eq!(table.state(index), Some(TaskState::Running));
        table.finish(index);
        assert!(table.is_idle());
    }

    #[test]
    fn test_unrelated_completion_does_not_wake() {
        let mut table = TaskTable::new();
        let index = table.submit(task(0, 1 << 3), (1 << 3) | (1 << 5)).unwrap();
        table.refresh(1 << 3);
        assert_eq!(table.state(index), Some(TaskState::Pending));
    }

    #[test]
    fn test_same_picture_tasks_run_in_order() {
        let mut table = TaskTable::new();
        let first = table.submit(task(1, 0), 0).unwrap();
        let second = table.submit(task(1, 0), 0).unwrap();
        let other = table.submit(task(2, 0), 0).unwrap();
        assert_eq!(table.take_ready().map(|(i, _)| i), Some(first));
        assert_eq!(
            table.take_ready().map(|(i, _)| i),
            Some(other),
            "同一图像的第二个切片必须等第一个完成"
        );
        table.finish(first);
        assert_eq!(table.take_ready().map(|(i, _)| i), Some(second));
    }

    #[test]
    fn test_table_capacity_and_slot_mask() {
        let mut table = TaskTable::new();
        for _ in 0..MAX_TASKS {
            assert!(table.submit(task(4, 0b11), 0).is_some());
        }
        assert!(!table.has_free());
        assert!(table.submit(task(4, 0), 0).is_none(), "任务表满时拒绝提交");
        assert_eq!(table.slot_mask(), 0b1_0011);
        assert_eq!(table.tasks_for(4), MAX_TASKS);
        assert_eq!(table.tasks_for(0), 0);
    }

    #[test]
    fn test_job_resolves_reference_guards() {
        use crate::picture::HeapAllocator;
        let mut pool = PicturePool::new(Arc::new(HeapAllocator));
        pool.configure(4, params(&[]).geometry);
        for slot in 0..3 {
            pool.start_picture(slot, Default::default());
        }
        let mut t = task(2, 0);
        t.params = params(&[1, 0, 1]);
        let job = Job::prepare(&pool, 0, t);
        assert_eq!(job.refs.len(), 2, "重复出现的参考只加锁一次");
        assert!(job.target.is_some());
    }

    #[test]
    fn test_complete_picture_finishes_while_reference_locked() {
        use crate::kernels::NullKernels;
        use crate::picture::HeapAllocator;
        use std::sync::mpsc;
        use std::time::Duration;

        let mut pool = PicturePool::new(Arc::new(HeapAllocator));
        pool.configure(2, params(&[]).geometry);
        pool.start_picture(0, Default::default());
        pool.start_picture(1, Default::default());
        if let Some(entry) = pool.slot_mut(1) {
            entry.conceal_ref = Some(0);
        }
        let target = pool.picture(1).expect("槽位 1 应有图像");
        for mb in target.write().expect("图像锁").mbs.iter_mut() {
            mb.class = MbClass::Skip;
        }
        let reference = pool.picture(0).expect("槽位 0 应有图像");
        let shared = Arc::new(Shared::new(pool, Arc::new(NullKernels)));

        // 参考图像正被其他任务写入
        let held = reference.write().expect("参考图像锁");
        let (tx, rx) = mpsc::channel();
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                finish_picture(&shared, 1);
                let _ = tx.send(());
            })
        };
        let finished = rx.recv_timeout(Duration::from_secs(5)).is_ok();
        drop(held);
        worker.join().expect("收尾线程不应 panic");
        assert!(finished, "没有缺失宏块时收尾不应等待隐藏参考");

        let state = shared.lock();
        assert!(state.pool.is_complete(1));
        assert!(!state.pool.slot(1).is_some_and(|s| s.corrupt), "完整图像不应标记损坏");
    }
}
