//! # avc-engine
//!
//! 纯 Rust 实现的 H.264/AVC 解码控制核心.
//!
//! 本 crate 负责比特流之上的全部状态管理:
//! - **熵解码**: CABAC 算术解码与宏块语法元素
//! - **参考管理**: 滑动窗口, MMCO 与参考列表构建
//! - **输出调度**: DPB 槽位分配与按 POC 顺序输出
//! - **任务调度**: 切片级多线程解码与依赖跟踪
//!
//! 像素重建 (预测, 反变换, 去块) 通过 [`decoder::ReconstructionKernels`] 注入.
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use avc_engine::decoder::{Decoder, DecoderConfig, split_annex_b};
//!
//! # fn main() -> avc_engine::core::AvcResult<()> {
//! let stream: Vec<u8> = std::fs::read("input.264").unwrap_or_default();
//! let mut decoder = Decoder::new(DecoderConfig::new())?;
//! for unit in split_annex_b(stream) {
//!     decoder.decode_unit(unit)?;
//!     while let Some(frame) = decoder.get_frame(false) {
//!         println!("poc={} {}x{}", frame.poc, frame.width, frame.height);
//!     }
//! }
//! decoder.flush();
//! while let Some(frame) = decoder.wait_frame(false) {
//!     println!("poc={}", frame.poc);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `avc-core` | 错误类型与比特流读写 |
//! | `avc-decoder` | 解码控制平面 |

/// 错误类型与比特流读写
pub use avc_core as core;

/// 解码控制平面
pub use avc_decoder as decoder;

/// 日志系统
pub mod logging;

/// 获取版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
