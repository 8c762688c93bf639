//! 图像缓冲区与输出帧.
//!
//! 每个图像池槽位持有一个 `Arc<RwLock<PictureData>>`:
//! - 解码期间由唯一的工作线程以写锁独占
//! - 完成后作为参考被多个线程以读锁共享
//! - 交给调用方的 [`Frame`] 克隆同一个 `Arc`, 槽位复用时若仍被持有则重新分配

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use crate::slice::DeblockParams;

/// 采样平面存储分配器
pub trait PlaneAllocator: Send + Sync {
    /// 分配 `len` 字节的平面存储
    fn allocate(&self, len: usize) -> Vec<u8>;

    /// 归还平面存储
    fn release(&self, buf: Vec<u8>) {
        drop(buf);
    }
}

/// 使用全局堆的默认分配器
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl PlaneAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> Vec<u8> {
        vec![0u8; len]
    }
}

/// 图像尺寸 (宏块对齐)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PictureGeometry {
    pub mb_width: usize,
    pub mb_height: usize,
    /// 0 为单色, 1 为 4:2:0
    pub chroma_array_type: u32,
}

impl PictureGeometry {
    /// 宏块总数
    pub fn mb_count(&self) -> usize {
        self.mb_width * self.mb_height
    }

    /// 亮度宽度
    pub fn width(&self) -> usize {
        self.mb_width * 16
    }

    /// 亮度高度
    pub fn height(&self) -> usize {
        self.mb_height * 16
    }

    /// 色度平面尺寸, 单色为 (0, 0)
    pub fn chroma_size(&self) -> (usize, usize) {
        if self.chroma_array_type == 0 {
            (0, 0)
        } else {
            (self.width() / 2, self.height() / 2)
        }
    }
}

/// Y/Cb/Cr 采样平面 (步长等于宽度)
pub struct Planes {
    pub geometry: PictureGeometry,
    pub y: Vec<u8>,
    pub cb: Vec<u8>,
    pub cr: Vec<u8>,
}

impl Planes {
    /// 亮度步长
    pub fn stride_y(&self) -> usize {
        self.geometry.width()
    }

    /// 色度步长
    pub fn stride_c(&self) -> usize {
        self.geometry.chroma_size().0
    }

    /// 宏块左上角亮度采样的偏移
    pub fn luma_offset(&self, mb_x: usize, mb_y: usize) -> usize {
        mb_y * 16 * self.stride_y() + mb_x * 16
    }

    /// 宏块左上角色度采样的偏移
    pub fn chroma_offset(&self, mb_x: usize, mb_y: usize) -> usize {
        mb_y * 8 * self.stride_c() + mb_x * 8
    }

    /// 以 `value` 填充一个宏块
    pub fn fill_mb(&mut self, mb_x: usize, mb_y: usize, value: u8) {
        let (stride_y, stride_c) = (self.stride_y(), self.stride_c());
        let luma = self.luma_offset(mb_x, mb_y);
        fill_block(&mut self.y, stride_y, luma, 16, value);
        if stride_c > 0 {
            let chroma = self.chroma_offset(mb_x, mb_y);
            fill_block(&mut self.cb, stride_c, chroma, 8, value);
            fill_block(&mut self.cr, stride_c, chroma, 8, value);
        }
    }

    /// 从同尺寸的 `src` 复制一个宏块, 尺寸不一致时不做任何事
    pub fn copy_mb_from(&mut self, src: &Planes, mb_x: usize, mb_y: usize) {
        if src.geometry != self.geometry {
            return;
        }
        let (stride_y, stride_c) = (self.stride_y(), self.stride_c());
        let luma = self.luma_offset(mb_x, mb_y);
        copy_block(&mut self.y, &src.y, stride_y, luma, 16);
        if stride_c > 0 {
            let chroma = self.chroma_offset(mb_x, mb_y);
            copy_block(&mut self.cb, &src.cb, stride_c, chroma, 8);
            copy_block(&mut self.cr, &src.cr, stride_c, chroma, 8);
        }
    }

    /// 写入 I_PCM 采样: 256 个亮度, 然后按光栅顺序的 Cb 与 Cr
    pub fn write_pcm(&mut self, mb_x: usize, mb_y: usize, samples: &[u8]) {
        let (stride_y, stride_c) = (self.stride_y(), self.stride_c());
        let luma = self.luma_offset(mb_x, mb_y);
        for (row, src) in samples.chunks(16).take(16).enumerate() {
            let at = luma + row * stride_y;
            self.y[at..at + src.len()].copy_from_slice(src);
        }
        if stride_c == 0 || samples.len() < 256 + 128 {
            return;
        }
        let chroma = self.chroma_offset(mb_x, mb_y);
        for (plane, part) in [&mut self.cb, &mut self.cr]
            .into_iter()
            .zip(samples[256..].chunks(64))
        {
            for (row, src) in part.chunks(8).enumerate() {
                let at = chroma + row * stride_c;
                plane[at..at + src.len()].copy_from_slice(src);
            }
        }
    }
}

fn fill_block(plane: &mut [u8], stride: usize, at: usize, size: usize, value: u8) {
    for row in 0..size {
        let start = at + row * stride;
        if let Some(line) = plane.get_mut(start..start + size) {
            line.fill(value);
        }
    }
}

fn copy_block(dst: &mut [u8], src: &[u8], stride: usize, at: usize, size: usize) {
    for row in 0..size {
        let start = at + row * stride;
        if let (Some(d), Some(s)) = (dst.get_mut(start..start + size), src.get(start..start + size)) {
            d.copy_from_slice(s);
        }
    }
}

impl fmt::Debug for Planes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Planes")
            .field("geometry", &self.geometry)
            .field("y_len", &self.y.len())
            .field("c_len", &self.cb.len())
            .finish()
    }
}

/// 宏块类别, 供去块与邻居推导使用
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MbClass {
    /// 尚未解码
    #[default]
    Missing,
    /// 数据缺失, 已由隐藏填充
    Concealed,
    Intra,
    Pcm,
    Inter,
    Skip,
}

/// 每个宏块保存的元数据
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbInfo {
    pub class: MbClass,
    /// QP_Y
    pub qp: u8,
    /// 低 4 位亮度, 高 2 位色度
    pub cbp: u8,
    pub transform_8x8: bool,
    /// 所属切片在图像内的序号
    pub slice_num: u16,
    /// 4x4 亮度块的非零系数标志 (光栅顺序)
    pub nonzero_4x4: u16,
    /// 所属切片的去块参数
    pub deblock: DeblockParams,
}

impl MbInfo {
    /// 是否已解码
    pub fn is_decoded(&self) -> bool {
        self.class != MbClass::Missing
    }
}

/// 一个槽位的采样数据与宏块元数据
pub struct PictureData {
    pub planes: Planes,
    pub mbs: Vec<MbInfo>,
    allocator: Arc<dyn PlaneAllocator>,
}

impl PictureData {
    /// 按尺寸分配, 采样初始化为中灰
    pub fn new(geometry: PictureGeometry, allocator: Arc<dyn PlaneAllocator>) -> Self {
        let luma_len = geometry.width() * geometry.height();
        let (cw, ch) = geometry.chroma_size();
        let mut planes = Planes {
            geometry,
            y: allocator.allocate(luma_len),
            cb: allocator.allocate(cw * ch),
            cr: allocator.allocate(cw * ch),
        };
        planes.y.resize(luma_len, 0);
        planes.cb.resize(cw * ch, 0);
        planes.cr.resize(cw * ch, 0);
        let mut data = Self {
            planes,
            mbs: vec![MbInfo::default(); geometry.mb_count()],
            allocator,
        };
        data.reset();
        data
    }

    /// 重新开始一张新图像
    pub fn reset(&mut self) {
        self.planes.y.fill(128);
        self.planes.cb.fill(128);
        self.planes.cr.fill(128);
        self.mbs.fill(MbInfo::default());
    }

    /// 尺寸
    pub fn geometry(&self) -> PictureGeometry {
        self.planes.geometry
    }

    /// 尚未解码的宏块数
    pub fn missing_mbs(&self) -> usize {
        self.mbs.iter().filter(|mb| !mb.is_decoded()).count()
    }
}

impl Drop for PictureData {
    fn drop(&mut self) {
        self.allocator.release(std::mem::take(&mut self.planes.y));
        self.allocator.release(std::mem::take(&mut self.planes.cb));
        self.allocator.release(std::mem::take(&mut self.planes.cr));
    }
}

impl fmt::Debug for PictureData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PictureData")
            .field("planes", &self.planes)
            .field("missing_mbs", &self.missing_mbs())
            .finish()
    }
}

/// 槽位共享的图像数据
pub type SharedPicture = Arc<RwLock<PictureData>>;

/// 调用方归还借出帧时使用的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    pub(crate) slot: usize,
    pub(crate) id: u64,
}

impl FrameHandle {
    /// 图像的唯一递增编号
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// 输出帧
#[derive(Clone)]
pub struct Frame {
    pub(crate) handle: FrameHandle,
    pub(crate) data: SharedPicture,
    /// PicOrderCnt
    pub poc: i32,
    /// 绝对 FrameNum
    pub frame_num: i32,
    /// 是否为 IDR 图像
    pub idr: bool,
    /// 解码过程中出现错误或有宏块被隐藏
    pub corrupt: bool,
    /// 显示宽高 (已裁剪)
    pub width: u32,
    pub height: u32,
    /// 裁剪偏移: 左, 右, 上, 下 (亮度采样)
    pub crop: [u32; 4],
    /// 是否为借出帧, 需要 `return_frame`
    pub borrowed: bool,
}

impl Frame {
    /// 归还句柄
    pub fn handle(&self) -> FrameHandle {
        self.handle
    }

    /// 图像唯一编号 (按解码顺序递增)
    pub fn id(&self) -> u64 {
        self.handle.id
    }

    /// 读取采样平面
    pub fn planes(&self) -> PlanesRef<'_> {
        PlanesRef {
            guard: self.data.read().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.handle.id)
            .field("poc", &self.poc)
            .field("frame_num", &self.frame_num)
            .field("corrupt", &self.corrupt)
            .field("borrowed", &self.borrowed)
            .finish()
    }
}

/// [`Frame::planes`] 返回的只读视图
pub struct PlanesRef<'a> {
    guard: RwLockReadGuard<'a, PictureData>,
}

impl Deref for PlanesRef<'_> {
    type Target = Planes;

    fn deref(&self) -> &Planes {
        &self.guard.planes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAllocator {
        allocated: AtomicUsize,
        released: AtomicUsize,
    }

    impl PlaneAllocator for CountingAllocator {
        fn allocate(&self, len: usize) -> Vec<u8> {
            self.allocated.fetch_add(1, Ordering::SeqCst);
            Vec::with_capacity(len)
        }

        fn release(&self, _buf: Vec<u8>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_picture_layout() {
        let geometry = PictureGeometry {
            mb_width: 2,
            mb_height: 3,
            chroma_array_type: 1,
        };
        let pic = PictureData::new(geometry, Arc::new(HeapAllocator));
        assert_eq!(pic.planes.y.len(), 32 * 48);
        assert_eq!(pic.planes.cb.len(), 16 * 24);
        assert_eq!(pic.planes.luma_offset(1, 2), 2 * 16 * 32 + 16);
        assert_eq!(pic.planes.chroma_offset(1, 1), 8 * 16 + 8);
        assert!(pic.planes.y.iter().all(|&v| v == 128), "新图像应初始化为中灰");
        assert_eq!(pic.missing_mbs(), 6);
    }

    #[test]
    fn test_monochrome_has_no_chroma() {
        let geometry = PictureGeometry {
            mb_width: 1,
            mb_height: 1,
            chroma_array_type: 0,
        };
        let pic = PictureData::new(geometry, Arc::new(HeapAllocator));
        assert!(pic.planes.cb.is_empty());
        assert_eq!(pic.planes.stride_c(), 0);
    }

    #[test]
    fn test_pcm_and_copy_touch_only_one_macroblock() {
        let geometry = PictureGeometry {
            mb_width: 2,
            mb_height: 1,
            chroma_array_type: 1,
        };
        let mut src = PictureData::new(geometry, Arc::new(HeapAllocator));
        let samples: Vec<u8> = (0..384).map(|i| (i % 251) as u8).collect();
        src.planes.write_pcm(1, 0, &samples);
        assert_eq!(src.planes.y[16], 0);
        assert_eq!(src.planes.y[32 + 16], 16, "第二行应从第 16 个采样开始");
        assert_eq!(src.planes.cb[8], samples[256]);
        assert_eq!(src.planes.cr[8], samples[320]);
        assert_eq!(src.planes.y[0], 128, "相邻宏块不应被改写");

        let mut dst = PictureData::new(geometry, Arc::new(HeapAllocator));
        dst.planes.copy_mb_from(&src.planes, 1, 0);
        assert_eq!(dst.planes.y, src.planes.y);
        dst.planes.fill_mb(1, 0, 7);
        assert_eq!(dst.planes.cr[16 * 7 + 15], 7);
        assert_eq!(dst.planes.cr[0], 128);
    }

    #[test]
    fn test_custom_allocator_sees_release() {
        let alloc = Arc::new(CountingAllocator::default());
        let geometry = PictureGeometry {
            mb_width: 1,
            mb_height: 1,
            chroma_array_type: 1,
        };
        let pic = PictureData::new(geometry, alloc.clone());
        assert_eq!(pic.planes.y.len(), 256, "分配器返回的容量应被补齐为长度");
        drop(pic);
        assert_eq!(alloc.allocated.load(Ordering::SeqCst), 3);
        assert_eq!(alloc.released.load(Ordering::SeqCst), 3);
    }
}
