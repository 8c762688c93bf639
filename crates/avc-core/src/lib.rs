//! # avc-core
//!
//! H.264/AVC 解码控制平面的基础设施: 统一错误类型和比特流读写工具.

pub mod bitcache;
pub mod bitwriter;
pub mod error;

// 重导出常用类型
pub use bitcache::{BitCache, BitCachePos};
pub use bitwriter::BitWriter;
pub use error::{AvcError, AvcResult};
