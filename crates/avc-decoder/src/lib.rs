//! # avc-decoder
//!
//! H.264/AVC 解码控制平面: CABAC 熵解码, 参考帧管理, DPB 输出调度与切片任务调度.
//!
//! 预测, 反变换与去块等像素运算通过 [`ReconstructionKernels`] 注入, 默认的 [`NullKernels`]
//! 只复制 I_PCM 采样和参考宏块.
//!
//! ## 支持范围
//!
//! - CABAC, 帧编码 (frame_mbs_only), 4:2:0 与单色, 8 位采样
//! - I/P/B 切片, 长短期参考, MMCO 与 frame_num 间隔
//! - 0 个或多个工作线程
//!
//! ## 使用示例
//!
//! ```rust
//! use avc_decoder::{Decoder, DecoderConfig};
//!
//! let mut decoder = Decoder::new(DecoderConfig::new().synchronous()).unwrap();
//! // 按解码顺序送入 NAL 单元
//! // decoder.decode_nal(&nal)?;
//! decoder.flush();
//! while let Some(frame) = decoder.get_frame(false) {
//!     println!("poc={}", frame.poc);
//! }
//! ```

pub mod cabac;
pub mod config;
pub mod decoder;
pub mod dpb;
pub mod kernels;
pub mod nal;
pub mod parameter_sets;
pub mod picture;
pub mod poc;
pub mod refs;
pub mod scheduler;
pub mod slice;

#[cfg(test)]
mod tests;

// 重导出常用类型
pub use cabac::{ArithmeticDecoder, CabacEncoder};
pub use config::{DecoderConfig, LogCallback};
pub use decoder::Decoder;
pub use kernels::{NullKernels, ReconstructionKernels, RefPictures, SliceContext};
pub use nal::{CodedUnit, NalHeader, NalUnitType, split_annex_b};
pub use parameter_sets::{Pps, Sps};
pub use picture::{Frame, FrameHandle, HeapAllocator, PictureData, PlaneAllocator, Planes};
pub use refs::ReferenceSet;
